//! Empty-directory tracking
//!
//! git does not record empty directories, so every empty directory under a
//! mirrored target gets a `.gitkeep` sentinel.

use anyhow::{Context, Result};
use std::fs;
use std::path::Path;
use tracing::{debug, info};
use walkdir::{DirEntry, WalkDir};

use crate::config::{to_under_mirror, Target};
use crate::exclude::is_excluded;

/// Sentinel file name placed in otherwise empty directories
pub const SENTINEL_FILE: &str = ".gitkeep";

/// Place a sentinel in every empty, non-excluded directory under the targets.
///
/// Returns the number of sentinels created. Existing sentinels and non-empty
/// directories are left untouched, so repeated calls converge.
pub fn track_empty_dirs<S: AsRef<str>>(
    mirror: &Path,
    targets: &[Target],
    excludes: &[S],
) -> Result<usize> {
    let mut created = 0;

    for target in targets {
        let root = to_under_mirror(mirror, target.rel());
        if !root.is_dir() {
            debug!("Skipping {}: not a directory in the mirror", root.display());
            continue;
        }

        let walker = WalkDir::new(&root)
            .follow_links(false)
            .into_iter()
            .filter_entry(|entry| keep_entry(entry, mirror, excludes));

        for entry in walker {
            let entry = entry.with_context(|| format!("Failed to walk {}", root.display()))?;
            if !entry.file_type().is_dir() {
                continue;
            }

            let dir = entry.path();
            let mut children = fs::read_dir(dir)
                .with_context(|| format!("Failed to list {}", dir.display()))?;
            if children.next().is_some() {
                continue;
            }

            let sentinel = dir.join(SENTINEL_FILE);
            fs::File::create(&sentinel)
                .with_context(|| format!("Failed to create {}", sentinel.display()))?;
            debug!("Tracked empty directory {}", dir.display());
            created += 1;
        }
    }

    if created > 0 {
        info!("Placed {} {} sentinel(s)", created, SENTINEL_FILE);
    }
    Ok(created)
}

/// Prune git metadata and excluded subtrees
fn keep_entry<S: AsRef<str>>(entry: &DirEntry, mirror: &Path, excludes: &[S]) -> bool {
    if entry.file_name() == ".git" {
        return false;
    }
    match entry.path().strip_prefix(mirror) {
        Ok(rel) => !is_excluded(&rel.to_string_lossy(), excludes),
        Err(_) => true,
    }
}
