//! Stage contract for compiler front ends and class processors

use std::path::PathBuf;

use crate::context::CompileContext;
use crate::error::Result;
use crate::target::SourceRoot;

/// Execution order of stages inside a round
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StageCategory {
    SourceGenerator,
    SourceInstrumenter,
    SourceProcessor,
    Translator,
    OverwritingTranslator,
    ClassInstrumenter,
    ClassPostProcessor,
}

/// What a stage reports after processing the dirty files
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageSignal {
    NothingDone,
    Done,
    AdditionalPassRequired,
    ChunkRebuildRequired,
    Abort,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirtyFile {
    pub path: PathBuf,
    pub root: SourceRoot,
}

/// Snapshot of the files to compile in the current round, ordered by path
#[derive(Debug, Clone, Default)]
pub struct DirtyFiles {
    files: Vec<DirtyFile>,
}

impl DirtyFiles {
    pub fn new(files: Vec<DirtyFile>) -> Self {
        Self { files }
    }

    pub fn iter(&self) -> impl Iterator<Item = &DirtyFile> {
        self.files.iter()
    }

    pub fn paths(&self) -> impl Iterator<Item = &PathBuf> {
        self.files.iter().map(|f| &f.path)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

/// A compiler stage. Lifecycle per build:
/// `build_started`, `chunk_build_started`, `build` once per round,
/// `chunk_build_finished`, `build_finished`.
pub trait Stage: Send {
    fn name(&self) -> &str;

    fn category(&self) -> StageCategory;

    fn build_started(&mut self, _ctx: &mut CompileContext<'_>) -> Result<()> {
        Ok(())
    }

    fn chunk_build_started(&mut self, _ctx: &mut CompileContext<'_>) -> Result<()> {
        Ok(())
    }

    fn build(&mut self, ctx: &mut CompileContext<'_>, dirty: &DirtyFiles) -> Result<StageSignal>;

    fn chunk_build_finished(&mut self, _ctx: &mut CompileContext<'_>) {}

    fn build_finished(&mut self, _ctx: &mut CompileContext<'_>) {}
}

/// Order stages by category, keeping the configured order within a category
pub fn sort_stages(stages: &mut [Box<dyn Stage>]) {
    stages.sort_by_key(|stage| stage.category());
}
