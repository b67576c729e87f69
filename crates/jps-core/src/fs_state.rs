//! Per-build dirty file bookkeeping
//!
//! Two deltas are tracked: files to compile in the current round and files
//! already scheduled for the next one. Stages and the mappings push work into
//! the next round; the build loop promotes it when a round starts.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::target::{BuildRootIndex, ModuleTarget, SourceRoot};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompilationRound {
    Current,
    Next,
}

#[derive(Debug, Default)]
pub struct FsState {
    current: BTreeMap<PathBuf, SourceRoot>,
    next: BTreeMap<PathBuf, SourceRoot>,
}

impl FsState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_dirty(&mut self, file: &Path, root: &SourceRoot, round: CompilationRound) {
        let delta = match round {
            CompilationRound::Current => &mut self.current,
            CompilationRound::Next => &mut self.next,
        };
        delta.insert(file.to_path_buf(), root.clone());
    }

    /// Schedule every source of the target
    pub fn mark_all_dirty(&mut self, target: &ModuleTarget, index: &BuildRootIndex, round: CompilationRound) {
        for source in target.sources() {
            if let Some(root) = index.root_of(source) {
                self.mark_dirty(source, root, round);
            }
        }
    }

    pub fn is_dirty(&self, file: &Path) -> bool {
        self.current.contains_key(file)
    }

    /// Promote next-round work into the current round
    pub fn before_next_round(&mut self) {
        let next = std::mem::take(&mut self.next);
        self.current.extend(next);
    }

    /// Files to compile in the current round, ordered by path
    pub fn files_to_recompile(&self) -> impl Iterator<Item = (&PathBuf, &SourceRoot)> {
        self.current.iter()
    }

    pub fn current_len(&self) -> usize {
        self.current.len()
    }

    pub fn has_next_round_work(&self) -> bool {
        !self.next.is_empty()
    }

    /// Forget everything scheduled so far
    pub fn clear_round_marks(&mut self) {
        self.current.clear();
        self.next.clear();
    }

    /// Close the current round, returning the files it compiled
    pub fn complete_round(&mut self) -> Vec<PathBuf> {
        std::mem::take(&mut self.current).into_keys().collect()
    }

    pub fn has_unprocessed_changes(&self) -> bool {
        !self.current.is_empty() || !self.next.is_empty()
    }
}
