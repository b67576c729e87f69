//! Filesystem helpers shared by the loop and the store lifecycle

use std::collections::BTreeSet;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::error::{BuildError, Result};

/// Remove a file. Returns `false` if it did not exist.
pub fn remove_file_if_exists(path: &Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(BuildError::io(path, e)),
    }
}

/// Remove a directory tree. No error if it is absent.
pub fn delete_recursively(path: &Path) -> Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(BuildError::io(path, e)),
    }
}

/// Remove each directory that became empty, walking up towards `stop_at`
/// (exclusive). Directories outside `stop_at` are left alone.
pub fn prune_empty_dirs(dirs: &BTreeSet<PathBuf>, stop_at: &Path) -> Result<usize> {
    let mut removed = 0;
    // deepest first, so a parent sees its children already gone
    for dir in dirs.iter().rev() {
        let mut current = Some(dir.as_path());
        while let Some(candidate) = current {
            if candidate == stop_at || !candidate.starts_with(stop_at) {
                break;
            }
            let is_empty = match fs::read_dir(candidate) {
                Ok(mut entries) => entries.next().is_none(),
                Err(e) if e.kind() == ErrorKind::NotFound => false,
                Err(e) => return Err(BuildError::io(candidate, e)),
            };
            if !is_empty {
                break;
            }
            fs::remove_dir(candidate).map_err(|e| BuildError::io(candidate, e))?;
            removed += 1;
            current = candidate.parent();
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remove_file_if_exists() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("A.class");
        fs::write(&file, b"x").unwrap();

        assert!(remove_file_if_exists(&file).unwrap());
        assert!(!remove_file_if_exists(&file).unwrap());
    }

    #[test]
    fn test_prune_stops_at_root_and_non_empty_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("classes");
        let deep = root.join("a").join("b");
        let kept = root.join("a").join("c");
        fs::create_dir_all(&deep).unwrap();
        fs::create_dir_all(&kept).unwrap();
        fs::write(kept.join("C.class"), b"x").unwrap();

        let removed = prune_empty_dirs(&BTreeSet::from([deep.clone()]), &root).unwrap();
        assert_eq!(removed, 1);
        assert!(!deep.exists());
        assert!(root.join("a").exists());
        assert!(root.exists());
    }

    #[test]
    fn test_delete_recursively_ignores_absence() {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("lib-jps-data");
        delete_recursively(&data).unwrap();

        fs::create_dir_all(data.join("nested")).unwrap();
        delete_recursively(&data).unwrap();
        assert!(!data.exists());
    }
}
