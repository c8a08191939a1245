//! Migration & Linking Engine
//!
//! Moves every configured target from its live location under the base
//! directory into the mirror and leaves a symbolic link behind:
//!
//! ```text
//! <base>/<target>  ->  <mirror>/<target>
//! ```
//!
//! Every step is safe to re-run. A source is only deleted after its contents
//! were copied or moved successfully, so an interrupted pass can at worst
//! leave a duplicate behind, never lose data.

use anyhow::{Context, Result};
use filetime::FileTime;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

use crate::config::{to_abs_under_base, to_under_mirror, Target};

/// What happened to a symlink location
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymlinkChange {
    /// The link already pointed at the mirror
    Unchanged,
    /// A wrong link, file or directory was replaced
    Replaced,
    /// Nothing existed at the location
    Created,
}

/// How a directory's contents reached the mirror
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyMethod {
    Rsync,
    Manual { copied: usize, skipped: usize },
}

/// Action taken for one target
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkAction {
    AlreadyLinked,
    Relinked,
    MigratedDirectory { method: CopyMethod },
    MigratedFile { moved: bool },
    CreatedPlaceholder { directory: bool },
}

/// Result of migrating one target
#[derive(Debug, Clone)]
pub struct LinkOutcome {
    pub target: Target,
    pub source: PathBuf,
    pub destination: PathBuf,
    pub action: LinkAction,
}

/// Migration engine
#[derive(Debug, Clone)]
pub struct Linker {
    prefer_rsync: bool,
}

impl Default for Linker {
    fn default() -> Self {
        Self { prefer_rsync: true }
    }
}

impl Linker {
    /// Always use the built-in recursive copy
    pub fn without_rsync() -> Self {
        Self { prefer_rsync: false }
    }

    /// Migrate every target and link it; the first failure aborts the pass
    pub fn migrate_and_link(
        &self,
        base: &Path,
        mirror: &Path,
        targets: &[Target],
    ) -> Result<Vec<LinkOutcome>> {
        targets
            .iter()
            .map(|target| self.migrate_target(base, mirror, target))
            .collect()
    }

    fn migrate_target(&self, base: &Path, mirror: &Path, target: &Target) -> Result<LinkOutcome> {
        let source = to_abs_under_base(base, target.rel());
        let destination = to_under_mirror(mirror, target.rel());
        info!(
            "Processing target {}: {} -> {}",
            target,
            source.display(),
            destination.display()
        );

        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let action = match fs::symlink_metadata(&source) {
            Ok(meta) if meta.file_type().is_symlink() => {
                match ensure_symlink(&source, &destination)? {
                    SymlinkChange::Unchanged => LinkAction::AlreadyLinked,
                    _ => LinkAction::Relinked,
                }
            }
            Ok(meta) if meta.is_dir() => {
                info!("{} is a directory, migrating", source.display());
                fs::create_dir_all(&destination)
                    .with_context(|| format!("Failed to create {}", destination.display()))?;

                let method = self.copy_tree(&source, &destination)?;

                info!("Removing original directory {}", source.display());
                fs::remove_dir_all(&source)
                    .with_context(|| format!("Failed to remove {}", source.display()))?;

                ensure_symlink(&source, &destination)?;
                LinkAction::MigratedDirectory { method }
            }
            Ok(_) => {
                info!("{} is a file, migrating", source.display());
                let moved = if exists_no_follow(&destination) {
                    fs::remove_file(&source)
                        .with_context(|| format!("Failed to remove {}", source.display()))?;
                    false
                } else {
                    move_file(&source, &destination)?;
                    true
                };

                ensure_symlink(&source, &destination)?;
                LinkAction::MigratedFile { moved }
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                let directory = target.is_dir_like();
                if directory {
                    info!("{} does not exist, creating empty directory", source.display());
                    fs::create_dir_all(&destination)
                        .with_context(|| format!("Failed to create {}", destination.display()))?;
                } else if !exists_no_follow(&destination) {
                    info!("{} does not exist, creating empty file", source.display());
                    fs::File::create(&destination)
                        .with_context(|| format!("Failed to create {}", destination.display()))?;
                }

                ensure_symlink(&source, &destination)?;
                LinkAction::CreatedPlaceholder { directory }
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to inspect {}", source.display()));
            }
        };

        Ok(LinkOutcome {
            target: target.clone(),
            source,
            destination,
            action,
        })
    }

    /// Copy a directory's contents, preferring rsync
    fn copy_tree(&self, source: &Path, destination: &Path) -> Result<CopyMethod> {
        if self.prefer_rsync && rsync(source, destination) {
            return Ok(CopyMethod::Rsync);
        }

        let (copied, skipped) = copy_tree_manual(source, destination)?;
        debug!(
            "Copied {} entries from {} ({} already present)",
            copied,
            source.display(),
            skipped
        );
        Ok(CopyMethod::Manual { copied, skipped })
    }
}

/// Migrate targets with the default engine
pub fn migrate_and_link(base: &Path, mirror: &Path, targets: &[Target]) -> Result<Vec<LinkOutcome>> {
    Linker::default().migrate_and_link(base, mirror, targets)
}

/// Make `src` a symlink to `dst`, replacing whatever is there.
///
/// A real directory at `src` is removed recursively, so callers must have
/// migrated its contents first.
pub fn ensure_symlink(src: &Path, dst: &Path) -> Result<SymlinkChange> {
    if let Some(parent) = src.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }

    let change = match fs::symlink_metadata(src) {
        Ok(meta) if meta.file_type().is_symlink() => {
            let current = fs::read_link(src)
                .with_context(|| format!("Failed to read link {}", src.display()))?;
            if current == dst {
                debug!("Symlink already correct: {} -> {}", src.display(), dst.display());
                return Ok(SymlinkChange::Unchanged);
            }
            info!(
                "Updating symlink {}: {} -> {}",
                src.display(),
                current.display(),
                dst.display()
            );
            fs::remove_file(src).with_context(|| format!("Failed to remove {}", src.display()))?;
            SymlinkChange::Replaced
        }
        Ok(meta) if meta.is_dir() => {
            info!("Removing existing directory {}", src.display());
            fs::remove_dir_all(src)
                .with_context(|| format!("Failed to remove {}", src.display()))?;
            SymlinkChange::Replaced
        }
        Ok(_) => {
            info!("Removing existing file {}", src.display());
            fs::remove_file(src).with_context(|| format!("Failed to remove {}", src.display()))?;
            SymlinkChange::Replaced
        }
        Err(e) if e.kind() == ErrorKind::NotFound => SymlinkChange::Created,
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to inspect {}", src.display()));
        }
    };

    if let Err(e) = create_symlink(dst, src) {
        error!("Failed to create symlink {} -> {}: {}", src.display(), dst.display(), e);
        return Err(e).with_context(|| {
            format!("Failed to create symlink {} -> {}", src.display(), dst.display())
        });
    }

    info!("Symlink created: {} -> {}", src.display(), dst.display());
    Ok(change)
}

/// Create mirror locations up front so later walks never hit a missing path
pub fn precreate_dirlike(mirror: &Path, targets: &[Target]) -> Result<()> {
    for target in targets {
        let destination = to_under_mirror(mirror, target.rel());
        let dir = if target.is_dir_like() {
            destination.as_path()
        } else {
            match destination.parent() {
                Some(parent) => parent,
                None => continue,
            }
        };
        fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;
    }
    Ok(())
}

fn exists_no_follow(path: &Path) -> bool {
    fs::symlink_metadata(path).is_ok()
}

#[cfg(unix)]
fn create_symlink(original: &Path, link: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(original, link)
}

#[cfg(windows)]
fn create_symlink(original: &Path, link: &Path) -> std::io::Result<()> {
    if original.is_dir() {
        std::os::windows::fs::symlink_dir(original, link)
    } else {
        std::os::windows::fs::symlink_file(original, link)
    }
}

/// Run `rsync -a src/ dst/`; false when rsync is missing or fails
fn rsync(source: &Path, destination: &Path) -> bool {
    let output = Command::new("rsync")
        .arg("-a")
        .arg(format!("{}/", source.display()))
        .arg(format!("{}/", destination.display()))
        .output();

    match output {
        Ok(output) if output.status.success() => true,
        Ok(output) => {
            warn!(
                "rsync failed for {}, falling back to manual copy: {}",
                source.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            );
            false
        }
        Err(e) if e.kind() == ErrorKind::NotFound => false,
        Err(e) => {
            warn!("Failed to run rsync, falling back to manual copy: {}", e);
            false
        }
    }
}

/// Recursive copy that never overwrites existing destination entries.
///
/// Returns `(copied, skipped)` counts of non-directory entries.
fn copy_tree_manual(source: &Path, destination: &Path) -> Result<(usize, usize)> {
    let mut copied = 0;
    let mut skipped = 0;

    for entry in WalkDir::new(source).follow_links(false) {
        let entry = entry.with_context(|| format!("Failed to walk {}", source.display()))?;
        let rel = entry.path().strip_prefix(source)?;
        let target = destination.join(rel);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            fs::create_dir_all(&target)
                .with_context(|| format!("Failed to create {}", target.display()))?;
            continue;
        }

        if exists_no_follow(&target) {
            skipped += 1;
            continue;
        }

        if file_type.is_symlink() {
            let link = fs::read_link(entry.path())
                .with_context(|| format!("Failed to read link {}", entry.path().display()))?;
            create_symlink(&link, &target)
                .with_context(|| format!("Failed to recreate link {}", target.display()))?;
        } else {
            copy_file_preserving_times(entry.path(), &target)?;
        }
        copied += 1;
    }

    Ok((copied, skipped))
}

fn copy_file_preserving_times(source: &Path, destination: &Path) -> Result<()> {
    fs::copy(source, destination).with_context(|| {
        format!("Failed to copy {} to {}", source.display(), destination.display())
    })?;

    let meta = fs::metadata(source)
        .with_context(|| format!("Failed to read metadata of {}", source.display()))?;
    filetime::set_file_times(
        destination,
        FileTime::from_last_access_time(&meta),
        FileTime::from_last_modification_time(&meta),
    )
    .with_context(|| format!("Failed to set times on {}", destination.display()))?;

    Ok(())
}

/// Rename, falling back to copy + remove across filesystems
fn move_file(source: &Path, destination: &Path) -> Result<()> {
    if fs::rename(source, destination).is_ok() {
        return Ok(());
    }

    copy_file_preserving_times(source, destination)?;
    fs::remove_file(source).with_context(|| format!("Failed to remove {}", source.display()))?;
    Ok(())
}
