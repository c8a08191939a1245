//! Exclusion prefixes for mirrored paths
//!
//! Exclusions are mirror-relative prefixes. They keep subtrees out of
//! empty-directory tracking and, through the repository-local
//! `.git/info/exclude` file, out of commits.

use anyhow::{Context, Result};
use std::collections::HashSet;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::info;

fn strip_edges(path: &str) -> &str {
    path.trim_matches(|c| c == '.' || c == '/')
}

/// True when `rel_path` equals an exclusion or lies beneath one
pub fn is_excluded<S: AsRef<str>>(rel_path: &str, excludes: &[S]) -> bool {
    let rel = strip_edges(rel_path);
    excludes.iter().any(|exclude| {
        let exclude = strip_edges(exclude.as_ref());
        !exclude.is_empty()
            && (rel == exclude
                || rel
                    .strip_prefix(exclude)
                    .is_some_and(|rest| rest.starts_with('/')))
    })
}

/// Path of the private ignore file inside the mirror's git metadata
pub fn private_exclude_path(mirror: &Path) -> PathBuf {
    mirror.join(".git").join("info").join("exclude")
}

/// Append exclusions missing from `.git/info/exclude`.
///
/// Returns the number of lines added. Callers treat a failure as non-fatal.
pub fn sync_private_exclude<S: AsRef<str>>(mirror: &Path, excludes: &[S]) -> Result<usize> {
    let path = private_exclude_path(mirror);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }

    let raw = match std::fs::read(&path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to read {}", path.display()));
        }
    };
    let existing: HashSet<String> = String::from_utf8_lossy(&raw)
        .lines()
        .map(str::to_string)
        .collect();

    let mut seen = HashSet::new();
    let to_add: Vec<&str> = excludes
        .iter()
        .map(|exclude| exclude.as_ref().trim())
        .filter(|exclude| !exclude.is_empty())
        .filter(|exclude| !existing.contains(*exclude) && seen.insert(*exclude))
        .collect();

    if to_add.is_empty() {
        return Ok(0);
    }

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("Failed to open {}", path.display()))?;

    // Keep appended entries on their own lines
    if !raw.is_empty() && !raw.ends_with(b"\n") {
        writeln!(file)?;
    }

    for exclude in &to_add {
        writeln!(file, "{}", exclude)
            .with_context(|| format!("Failed to write {}", path.display()))?;
    }

    info!("Updated git info/exclude with {} entries", to_add.len());
    Ok(to_add.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;
    use tempfile::TempDir;

    #[test]
    fn test_exact_and_prefix_matches() {
        let excludes = ["saves/cache", "logs"];

        assert!(is_excluded("saves/cache", &excludes));
        assert!(is_excluded("saves/cache/tmp/a.bin", &excludes));
        assert!(is_excluded("./logs/", &excludes));
        assert!(is_excluded("logs/2024", &excludes));

        assert!(!is_excluded("saves", &excludes));
        assert!(!is_excluded("saves/cache2", &excludes));
        assert!(!is_excluded("catalogs", &excludes));
    }

    #[test]
    fn test_disjoint_prefix_does_not_match() {
        assert!(!is_excluded("database", &["data"]));
        assert!(is_excluded("data/db", &["data"]));
    }

    #[test]
    fn test_entries_are_normalized() {
        assert!(is_excluded("saves/tmp/x", &["/saves/tmp/"]));
        assert!(!is_excluded("anything", &["", "/"]));
        let none: [&str; 0] = [];
        assert!(!is_excluded("saves", &none));
    }

    #[quickcheck]
    fn prop_path_under_exclusion_is_excluded(segments: Vec<String>, tail: String) -> bool {
        let prefix: Vec<String> = segments
            .iter()
            .map(|s| s.chars().filter(|c| c.is_ascii_alphanumeric()).collect::<String>())
            .filter(|s| !s.is_empty())
            .collect();
        if prefix.is_empty() {
            return true;
        }
        let exclude = prefix.join("/");
        let tail: String = tail.chars().filter(|c| c.is_ascii_alphanumeric()).collect();

        let exact = is_excluded(&exclude, &[exclude.as_str()]);
        let nested = tail.is_empty() || is_excluded(&format!("{}/{}", exclude, tail), &[exclude.as_str()]);
        let sibling = tail.is_empty() || !is_excluded(&format!("{}{}", exclude, tail), &[exclude.as_str()]);

        exact && nested && sibling
    }

    #[test]
    fn test_sync_private_exclude_appends_missing_entries() {
        let temp_dir = TempDir::new().unwrap();
        let mirror = temp_dir.path();

        let added = sync_private_exclude(mirror, &["saves/cache", "logs", "logs", " "]).unwrap();
        assert_eq!(added, 2);

        let added = sync_private_exclude(mirror, &["logs", "tmp"]).unwrap();
        assert_eq!(added, 1);

        let content = std::fs::read_to_string(private_exclude_path(mirror)).unwrap();
        assert_eq!(content, "saves/cache\nlogs\ntmp\n");
    }

    #[test]
    fn test_sync_private_exclude_keeps_existing_content() {
        let temp_dir = TempDir::new().unwrap();
        let path = private_exclude_path(temp_dir.path());
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "# git ls-files --others --exclude-from=.git/info/exclude\n*.swp").unwrap();

        let added = sync_private_exclude(temp_dir.path(), &["*.swp", "cache"]).unwrap();
        assert_eq!(added, 1);

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.ends_with("*.swp\ncache\n"));
    }
}
