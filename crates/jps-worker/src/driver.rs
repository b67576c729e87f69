//! Driver - one build invocation, end to end
//!
//! Resolves the output layout, decides between incremental and full rebuild,
//! runs the build attempt and, when the cache turns out to be unusable,
//! retries exactly once from scratch.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use jps_core::files::delete_recursively;
use jps_core::store::CACHE_DB_FILE_NAME;
use jps_core::{
    check_is_full_rebuild_required, load_build_state, sort_stages, BuildDataProvider, BuildError,
    CancelToken, CompileContext, Digest, LoadStateResult, LoopOutcome, ModuleTarget,
    PathRelativizer, RebuildReason, RequestLog, Stage, StorageInitializer, TargetBuilder,
    TargetConfigurationDigestContainer, WorkerConfig,
};

use crate::error::{Result, WorkerError};
use crate::finalize::{post_build, FinalizeInput};

/// Creates a fresh stage list for every build attempt
pub trait StageFactory: Send + Sync {
    fn create_stages(&self) -> Vec<Box<dyn Stage>>;
}

impl<F> StageFactory for F
where
    F: Fn() -> Vec<Box<dyn Stage>> + Send + Sync,
{
    fn create_stages(&self) -> Vec<Box<dyn Stage>> {
        self()
    }
}

/// A resolved build request: absolute paths, digests filled in
#[derive(Debug, Clone)]
pub struct BuildInvocation {
    pub base_dir: PathBuf,
    pub module_name: String,
    pub sources: HashMap<PathBuf, Digest>,
    /// Classpath entries relative to `base_dir`
    pub dependencies: BTreeMap<String, Digest>,
    pub kotlinc_args: Vec<String>,
    pub javac_args: Vec<String>,
    pub out_jar: PathBuf,
    pub abi_jar: Option<PathBuf>,
}

/// `<prefix>-classes` and `<prefix>-jps-data` next to the output archive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLayout {
    pub prefix: String,
    pub class_out_dir: PathBuf,
    pub data_dir: PathBuf,
}

impl OutputLayout {
    pub fn resolve(out_jar: &Path) -> Result<Self> {
        let file_name = out_jar
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| WorkerError::InvalidRequest(format!("bad output path {}", out_jar.display())))?;
        let prefix = file_name.strip_suffix(".jar").unwrap_or(file_name);
        if prefix.is_empty() {
            return Err(WorkerError::InvalidRequest(format!(
                "bad output path {}",
                out_jar.display()
            )));
        }
        let out_dir = out_jar.parent().unwrap_or_else(|| Path::new(""));
        Ok(Self {
            prefix: prefix.to_string(),
            class_out_dir: out_dir.join(format!("{prefix}-classes")),
            data_dir: out_dir.join(format!("{prefix}-jps-data")),
        })
    }

    pub fn cache_db_file(&self) -> PathBuf {
        self.data_dir.join(CACHE_DB_FILE_NAME)
    }
}

/// Build the module. Returns the exit code: 0 on success, 1 if errors were
/// reported.
pub async fn build_using_jps(
    invocation: &BuildInvocation,
    stages: &dyn StageFactory,
    config: &WorkerConfig,
    log: &Arc<RequestLog>,
    cancel: &CancelToken,
) -> Result<i32> {
    let layout = OutputLayout::resolve(&invocation.out_jar)?;
    let relativizer = Arc::new(PathRelativizer::new(&invocation.base_dir, &layout.class_out_dir));
    let target_digests = TargetConfigurationDigestContainer::compute(
        &invocation.module_name,
        &invocation.kotlinc_args,
        &invocation.javac_args,
        &invocation.dependencies,
    );
    let target = ModuleTarget::new(
        invocation.module_name.clone(),
        invocation.sources.keys().cloned().collect(),
        &layout.class_out_dir,
    );

    // state and class output are only usable together
    let mut is_rebuild = false;
    if !layout.data_dir.exists() {
        delete_recursively(&layout.class_out_dir)?;
        is_rebuild = true;
    } else if !layout.class_out_dir.exists() {
        log.info(format!(
            "{} does not exist, discarding {}",
            layout.class_out_dir.display(),
            layout.data_dir.display()
        ));
        delete_recursively(&layout.data_dir)?;
        is_rebuild = true;
    }

    let mut state = if is_rebuild {
        None
    } else {
        load_build_state(
            &layout.cache_db_file(),
            &relativizer,
            &invocation.sources,
            &target_digests,
            log,
        )
    };

    let mut rebuilt_due_to_configuration = false;
    if let Some(loaded) = &state {
        let source_count = invocation.sources.len();
        if check_is_full_rebuild_required(loaded, log, &relativizer, source_count, config.rebuild_threshold) {
            rebuilt_due_to_configuration = loaded
                .rebuild_requested
                .as_ref()
                .is_some_and(RebuildReason::is_configuration_change);
            delete_recursively(&layout.data_dir)?;
            delete_recursively(&layout.class_out_dir)?;
            is_rebuild = true;
            state = None;
        }
    }

    let data = match state.as_mut() {
        Some(loaded) => BuildDataProvider::from_loaded(invocation.sources.clone(), std::mem::take(&mut loaded.map)),
        None => BuildDataProvider::initial(invocation.sources.clone()),
    };

    let session = BuildSession {
        invocation,
        layout,
        target,
        relativizer,
        target_digests,
        rebuilt_due_to_configuration,
        stages,
        config,
        log,
        cancel,
    };

    match session.init_and_build(is_rebuild, data, state.as_ref()).await? {
        LoopOutcome::Completed(exit_code) => Ok(exit_code),
        LoopOutcome::RebuildRequested(_) => {
            log.reset_state();
            let data = BuildDataProvider::empty(invocation.sources.clone());
            match session.init_and_build(true, data, None).await? {
                LoopOutcome::Completed(exit_code) => Ok(exit_code),
                LoopOutcome::RebuildRequested(reason) => Err(BuildError::RebuildLoop(reason).into()),
            }
        }
    }
}

struct BuildSession<'a> {
    invocation: &'a BuildInvocation,
    layout: OutputLayout,
    target: ModuleTarget,
    relativizer: Arc<PathRelativizer>,
    target_digests: TargetConfigurationDigestContainer,
    rebuilt_due_to_configuration: bool,
    stages: &'a dyn StageFactory,
    config: &'a WorkerConfig,
    log: &'a Arc<RequestLog>,
    cancel: &'a CancelToken,
}

impl BuildSession<'_> {
    /// One attempt. The store is closed when it returns, whatever the outcome.
    async fn init_and_build(
        &self,
        is_rebuild: bool,
        data: BuildDataProvider,
        state: Option<&LoadStateResult>,
    ) -> Result<LoopOutcome> {
        let log = self.log;
        if log.is_debug_enabled() {
            log.info(format!("build (is_rebuild={is_rebuild})"));
        }

        let mut storage = StorageInitializer::new(&self.layout.data_dir, &self.layout.class_out_dir);
        if is_rebuild {
            storage.clear_and_init(log, self.cancel)?;
        } else {
            storage.init(log, self.cancel)?;
        }

        let result = self.build_target(&mut storage, data, state).await;
        storage.close(log);
        result
    }

    async fn build_target(
        &self,
        storage: &mut StorageInitializer,
        mut data: BuildDataProvider,
        mut state: Option<&LoadStateResult>,
    ) -> Result<LoopOutcome> {
        let log = self.log;
        let mut project = storage.create_project_descriptor(
            log,
            &self.target,
            &self.relativizer,
            self.config.dependency_graph_enabled,
            self.cancel,
        )?;

        // a cleared store took the class output with it, so nothing loaded
        // before the clear may describe this build
        if storage.was_cleared() && state.is_some() {
            log.info("cache storage was cleared, discarding loaded build state");
            data = BuildDataProvider::empty(self.invocation.sources.clone());
            state = None;
        }

        let mut stages = self.stages.create_stages();
        sort_stages(&mut stages);

        let (outcome, has_unprocessed_changes) = {
            let mut ctx = CompileContext::new(&mut project, &mut data, log, self.cancel, self.config);
            let outcome = TargetBuilder::new(storage.is_clean_build()).build(&mut ctx, &mut stages, state)?;
            (outcome, ctx.fs().has_unprocessed_changes())
        };

        match outcome {
            LoopOutcome::Completed(0) => {}
            LoopOutcome::RebuildRequested(reason) => {
                log.info(format!("rebuild requested: {reason}"));
                return Ok(LoopOutcome::RebuildRequested(reason));
            }
            other => return Ok(other),
        }

        let input = FinalizeInput {
            db: storage.storage()?.db()?.clone(),
            descriptors: data.final_list(),
            relativizer: Arc::clone(&self.relativizer),
            target_digests: self.target_digests,
            mapping_writes: project.mappings.pending_writes(),
            target_name: self.target.name().to_string(),
            out_jar: self.invocation.out_jar.clone(),
            abi_jar: self.invocation.abi_jar.clone(),
            class_out_dir: self.layout.class_out_dir.clone(),
            rebuilt_due_to_configuration: self.rebuilt_due_to_configuration,
            has_unprocessed_changes,
        };
        drop(project);

        if let Err(e) = post_build(input, Arc::clone(log), self.cancel).await {
            log.warn(format!(
                "post build failed, discarding {} and {}",
                self.layout.data_dir.display(),
                self.layout.class_out_dir.display()
            ));
            storage.close(log);
            if let Err(clear_error) = storage.clear_storage() {
                log.warn(format!("cannot discard build state: {clear_error}"));
            }
            return Err(e);
        }
        Ok(LoopOutcome::Completed(0))
    }
}
