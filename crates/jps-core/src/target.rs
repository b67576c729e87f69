//! Module build target and its build-root index

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};

/// The single module compiled by one invocation
#[derive(Debug, Clone)]
pub struct ModuleTarget {
    name: String,
    sources: Vec<PathBuf>,
    class_out_dir: PathBuf,
}

impl ModuleTarget {
    pub fn new(name: impl Into<String>, mut sources: Vec<PathBuf>, class_out_dir: impl Into<PathBuf>) -> Self {
        sources.sort();
        sources.dedup();
        Self {
            name: name.into(),
            sources,
            class_out_dir: class_out_dir.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Sources of the target, ordered by path
    pub fn sources(&self) -> &[PathBuf] {
        &self.sources
    }

    pub fn class_out_dir(&self) -> &Path {
        &self.class_out_dir
    }

    pub fn contains(&self, source: &Path) -> bool {
        self.sources.binary_search_by(|s| s.as_path().cmp(source)).is_ok()
    }
}

/// Directory a source file was found under
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceRoot {
    pub dir: PathBuf,
}

/// Maps every source of the target to its root descriptor
#[derive(Debug, Default)]
pub struct BuildRootIndex {
    file_to_root: HashMap<PathBuf, SourceRoot>,
}

impl BuildRootIndex {
    pub fn new(target: &ModuleTarget) -> Self {
        let file_to_root = target
            .sources()
            .iter()
            .map(|source| {
                let dir = source.parent().map(Path::to_path_buf).unwrap_or_default();
                (source.clone(), SourceRoot { dir })
            })
            .collect();
        Self { file_to_root }
    }

    pub fn root_of(&self, file: &Path) -> Option<&SourceRoot> {
        self.file_to_root.get(file)
    }

    pub fn roots(&self) -> BTreeSet<&SourceRoot> {
        self.file_to_root.values().collect()
    }
}
