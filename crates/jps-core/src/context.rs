//! Compile context handed to stages
//!
//! Borrows the project model and the build data provider for the duration of
//! one build loop, and owns the per-build dirty file state and output buffers.

use std::path::Path;
use std::sync::Arc;

use crate::cancel::CancelToken;
use crate::config::WorkerConfig;
use crate::fs_state::{CompilationRound, FsState};
use crate::log::RequestLog;
use crate::mappings::Mappings;
use crate::output::OutputConsumer;
use crate::provider::BuildDataProvider;
use crate::relativizer::PathRelativizer;
use crate::target::{BuildRootIndex, ModuleTarget};

/// In-memory project model bound to an open store
pub struct ProjectDescriptor {
    pub target: ModuleTarget,
    pub root_index: BuildRootIndex,
    pub mappings: Mappings,
    pub relativizer: Arc<PathRelativizer>,
}

pub struct CompileContext<'a> {
    project: &'a mut ProjectDescriptor,
    data: &'a mut BuildDataProvider,
    fs: FsState,
    consumer: OutputConsumer,
    log: &'a RequestLog,
    cancel: &'a CancelToken,
    config: &'a WorkerConfig,
}

impl<'a> CompileContext<'a> {
    pub fn new(
        project: &'a mut ProjectDescriptor,
        data: &'a mut BuildDataProvider,
        log: &'a RequestLog,
        cancel: &'a CancelToken,
        config: &'a WorkerConfig,
    ) -> Self {
        let consumer = OutputConsumer::new(project.target.name());
        Self {
            project,
            data,
            fs: FsState::new(),
            consumer,
            log,
            cancel,
            config,
        }
    }

    pub fn target(&self) -> &ModuleTarget {
        &self.project.target
    }

    pub fn root_index(&self) -> &BuildRootIndex {
        &self.project.root_index
    }

    pub fn relativizer(&self) -> &PathRelativizer {
        &self.project.relativizer
    }

    pub fn mappings_mut(&mut self) -> &mut Mappings {
        &mut self.project.mappings
    }

    pub fn data(&self) -> &BuildDataProvider {
        &*self.data
    }

    pub fn data_mut(&mut self) -> &mut BuildDataProvider {
        &mut *self.data
    }

    pub fn fs(&self) -> &FsState {
        &self.fs
    }

    pub fn fs_mut(&mut self) -> &mut FsState {
        &mut self.fs
    }

    pub fn consumer(&self) -> &OutputConsumer {
        &self.consumer
    }

    pub fn consumer_mut(&mut self) -> &mut OutputConsumer {
        &mut self.consumer
    }

    pub fn log(&self) -> &'a RequestLog {
        self.log
    }

    pub fn cancel(&self) -> &'a CancelToken {
        self.cancel
    }

    pub fn config(&self) -> &'a WorkerConfig {
        self.config
    }

    /// Schedule a source of the target for a later round. Unknown files are ignored.
    pub fn mark_dirty(&mut self, file: &Path, round: CompilationRound) -> bool {
        match self.project.root_index.root_of(file) {
            Some(root) => {
                self.fs.mark_dirty(file, root, round);
                true
            }
            None => false,
        }
    }

    /// Schedule every source of the target
    pub fn mark_all_dirty(&mut self, round: CompilationRound) {
        self.fs
            .mark_all_dirty(&self.project.target, &self.project.root_index, round);
    }

    /// Commit the round's buffered outputs into the build data provider
    pub(crate) fn commit_outputs(&mut self) -> crate::error::Result<()> {
        self.consumer.commit(&mut *self.data)
    }
}
