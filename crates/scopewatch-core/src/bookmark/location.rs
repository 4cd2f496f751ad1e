//! Canonical identity of filesystem locations

use crate::error::{BookmarkError, Error, Result};
use std::path::{Component, Path, PathBuf};

/// Normalize a location into its canonical form.
///
/// Expands a leading `~`, resolves symlinks for the longest existing prefix and
/// lexically cleans the remainder, so a location need not exist yet.
pub fn canonical_location(path: &Path) -> Result<PathBuf> {
    if path.as_os_str().is_empty() {
        return Err(Error::Bookmark(BookmarkError::InvalidPath(
            "empty path".to_string(),
        )));
    }

    let expanded = expand_home(path);

    if expanded.exists() {
        return expanded.canonicalize().map_err(|e| {
            Error::Bookmark(BookmarkError::InvalidPath(format!(
                "Failed to canonicalize path {:?}: {}",
                expanded, e
            )))
        });
    }

    // Canonicalize the deepest existing ancestor and re-append the rest.
    // This keeps /tmp -> /private/tmp style symlinks consistent.
    let mut current = expanded.as_path();
    let mut remaining = Vec::new();

    while !current.exists() {
        match (current.parent(), current.file_name()) {
            (Some(parent), Some(name)) => {
                remaining.push(name.to_owned());
                current = parent;
            }
            _ => break,
        }
    }

    let mut result = if current.exists() {
        current
            .canonicalize()
            .unwrap_or_else(|_| current.to_path_buf())
    } else {
        current.to_path_buf()
    };
    for part in remaining.into_iter().rev() {
        result.push(part);
    }

    Ok(clean_path(&result))
}

fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => match dirs::home_dir() {
            Some(home) => home.join(rest),
            None => path.to_path_buf(),
        },
        Err(_) => path.to_path_buf(),
    }
}

/// Clean a path without requiring it to exist
fn clean_path(path: &Path) -> PathBuf {
    let mut components = Vec::new();

    for component in path.components() {
        match component {
            Component::ParentDir => {
                components.pop();
            }
            Component::CurDir => {}
            c => components.push(c),
        }
    }

    components.iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    #[test]
    fn test_existing_path_is_canonicalized() {
        let dir = tempdir().unwrap();
        let nested = dir.path().join("sub");
        std::fs::create_dir(&nested).unwrap();

        let dotted = dir.path().join("sub/../sub/.");
        assert_eq!(
            canonical_location(&dotted).unwrap(),
            nested.canonicalize().unwrap()
        );
    }

    #[test]
    fn test_missing_path_keeps_canonical_base() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("a/b/../c.txt");

        let expected = dir.path().canonicalize().unwrap().join("a/c.txt");
        assert_eq!(canonical_location(&missing).unwrap(), expected);
    }

    #[test]
    fn test_empty_path_is_invalid() {
        assert!(canonical_location(Path::new("")).is_err());
    }

    #[test]
    fn test_home_is_expanded() {
        if let Some(home) = dirs::home_dir() {
            let location = canonical_location(Path::new("~/scopewatch-missing-entry")).unwrap();
            assert!(location.ends_with("scopewatch-missing-entry"));
            assert!(location.starts_with(home.canonicalize().unwrap_or(home)));
        }
    }
}
