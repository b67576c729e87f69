//! Digest Change Detector
//!
//! Compares the digests of the current input set against the persisted
//! descriptor table. Pure: no filesystem access.

use std::collections::HashMap;
use std::path::PathBuf;

use crate::digest::Digest;
use crate::provider::SourceDescriptor;

/// A source that left the input set, with the outputs it last produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemovedFileInfo {
    pub source_file: PathBuf,
    pub outputs: Vec<PathBuf>,
}

/// Files to recompile and files to clean up, both ordered by path
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    pub changed_files: Vec<PathBuf>,
    pub deleted_files: Vec<RemovedFileInfo>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.changed_files.is_empty() && self.deleted_files.is_empty()
    }

    /// Number of files an incremental build would have to touch
    pub fn effort(&self) -> usize {
        self.changed_files.len() + self.deleted_files.len()
    }
}

pub fn compute_change_set(
    current: &HashMap<PathBuf, Digest>,
    stored: &HashMap<PathBuf, SourceDescriptor>,
) -> ChangeSet {
    let mut changed_files: Vec<PathBuf> = current
        .iter()
        .filter(|(path, digest)| match stored.get(*path) {
            Some(descriptor) => descriptor.digest != **digest,
            None => true, // New file
        })
        .map(|(path, _)| path.clone())
        .collect();
    changed_files.sort();

    let mut deleted_files: Vec<RemovedFileInfo> = stored
        .values()
        .filter(|descriptor| !current.contains_key(&descriptor.source))
        .map(|descriptor| RemovedFileInfo {
            source_file: descriptor.source.clone(),
            outputs: descriptor.outputs.clone(),
        })
        .collect();
    deleted_files.sort_by(|a, b| a.source_file.cmp(&b.source_file));

    ChangeSet {
        changed_files,
        deleted_files,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(path: &str, content: &[u8], outputs: &[&str]) -> SourceDescriptor {
        SourceDescriptor {
            source: PathBuf::from(path),
            digest: Digest::of(content),
            outputs: outputs.iter().map(PathBuf::from).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_unchanged_digests_produce_empty_change_set() {
        let current = HashMap::from([
            (PathBuf::from("/w/A.kt"), Digest::of(b"a")),
            (PathBuf::from("/w/B.kt"), Digest::of(b"b")),
        ]);
        let stored = HashMap::from([
            (PathBuf::from("/w/A.kt"), descriptor("/w/A.kt", b"a", &["/o/A.class"])),
            (PathBuf::from("/w/B.kt"), descriptor("/w/B.kt", b"b", &["/o/B.class"])),
        ]);

        let changes = compute_change_set(&current, &stored);
        assert!(changes.is_empty());
        assert_eq!(changes.effort(), 0);
    }

    #[test]
    fn test_changed_new_and_deleted() {
        let current = HashMap::from([
            (PathBuf::from("/w/C.kt"), Digest::of(b"c")),
            (PathBuf::from("/w/A.kt"), Digest::of(b"a2")),
            (PathBuf::from("/w/B.kt"), Digest::of(b"b")),
        ]);
        let stored = HashMap::from([
            (PathBuf::from("/w/A.kt"), descriptor("/w/A.kt", b"a", &[])),
            (PathBuf::from("/w/B.kt"), descriptor("/w/B.kt", b"b", &[])),
            (PathBuf::from("/w/D.kt"), descriptor("/w/D.kt", b"d", &["/o/D.class", "/o/D$1.class"])),
        ]);

        let changes = compute_change_set(&current, &stored);
        assert_eq!(
            changes.changed_files,
            vec![PathBuf::from("/w/A.kt"), PathBuf::from("/w/C.kt")]
        );
        assert_eq!(changes.deleted_files.len(), 1);
        assert_eq!(changes.deleted_files[0].source_file, PathBuf::from("/w/D.kt"));
        assert_eq!(changes.deleted_files[0].outputs.len(), 2);
        assert_eq!(changes.effort(), 3);
    }
}
