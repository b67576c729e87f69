//! Path relativizer
//!
//! The store holds paths relative to the request base directory (sources) or
//! to the class output directory (outputs), so the cache survives the sandbox
//! moving between invocations.

use std::collections::BTreeSet;
use std::path::{Component, Path, PathBuf};
use std::sync::{Mutex, PoisonError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathKind {
    Source,
    Output,
}

pub struct PathRelativizer {
    base_dir: PathBuf,
    class_out_dir: PathBuf,
    unhandled: Mutex<BTreeSet<String>>,
}

impl PathRelativizer {
    pub fn new(base_dir: impl AsRef<Path>, class_out_dir: impl AsRef<Path>) -> Self {
        Self {
            base_dir: normalize_path(base_dir.as_ref()),
            class_out_dir: normalize_path(class_out_dir.as_ref()),
            unhandled: Mutex::new(BTreeSet::new()),
        }
    }

    fn root(&self, kind: PathKind) -> &Path {
        match kind {
            PathKind::Source => &self.base_dir,
            PathKind::Output => &self.class_out_dir,
        }
    }

    /// Relative `/`-separated form. Paths outside the root are kept absolute
    /// and remembered for the end-of-build report.
    pub fn to_relative(&self, path: &Path, kind: PathKind) -> String {
        match path.strip_prefix(self.root(kind)) {
            Ok(relative) => relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/"),
            Err(_) => {
                let absolute = path.to_string_lossy().to_string();
                self.unhandled
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(absolute.clone());
                absolute
            }
        }
    }

    pub fn to_absolute(&self, relative: &str, kind: PathKind) -> PathBuf {
        let path = Path::new(relative);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root(kind).join(path)
        }
    }

    /// Paths that could not be made relative during this build
    pub fn unhandled_paths(&self) -> Vec<String> {
        self.unhandled
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }
}

/// Lexically resolve `.` and `..` without touching the filesystem
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !normalized.pop() {
                    normalized.push(component);
                }
            }
            other => normalized.push(other),
        }
    }
    normalized
}
