//! Subtree re-enumeration for events that carry the rescan signal

use std::path::{Path, PathBuf};
use tracing::debug;

/// Every entry under `path`, including `path` itself, in walk order.
///
/// Unreadable entries are skipped; symlinks are not followed.
pub fn rescan_subtree(path: impl AsRef<Path>) -> Vec<PathBuf> {
    let path = path.as_ref();
    let entries: Vec<PathBuf> = walkdir::WalkDir::new(path)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
        .map(|entry| entry.into_path())
        .collect();
    debug!("Rescanned {} entries under {:?}", entries.len(), path);
    entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    #[test]
    fn test_rescan_lists_whole_subtree() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("a/b")).unwrap();
        std::fs::write(dir.path().join("a/b/file.txt"), "x").unwrap();
        std::fs::write(dir.path().join("top.txt"), "y").unwrap();

        let entries = rescan_subtree(dir.path());

        assert_eq!(
            entries,
            vec![
                dir.path().to_path_buf(),
                dir.path().join("a"),
                dir.path().join("a/b"),
                dir.path().join("a/b/file.txt"),
                dir.path().join("top.txt"),
            ]
        );
    }

    #[test]
    fn test_rescan_of_missing_path_is_empty() {
        let dir = tempdir().unwrap();
        assert!(rescan_subtree(dir.path().join("missing")).is_empty());
    }
}
