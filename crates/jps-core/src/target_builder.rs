//! Target Build Loop
//!
//! Runs the sorted stage list over the dirty files of the module, round after
//! round, until neither a stage nor the cross-round mappings ask for more.
//! - Many-to-one outputs pull every producer into the round
//! - Outputs of deleted and recompiled sources are removed from disk
//! - One chunk rebuild per incremental build, later requests are only logged
//! - Cache failures become `LoopOutcome::RebuildRequested`

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use crate::change::RemovedFileInfo;
use crate::context::CompileContext;
use crate::error::{BuildError, Result};
use crate::files::{prune_empty_dirs, remove_file_if_exists};
use crate::fs_state::CompilationRound;
use crate::log::{BuildMessage, MessageKind, RequestLog};
use crate::relativizer::PathKind;
use crate::stage::{DirtyFile, DirtyFiles, Stage, StageCategory, StageSignal};
use crate::state::LoadStateResult;

/// Result of one build attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopOutcome {
    Completed(i32),
    /// The cache cannot be trusted; the driver retries from scratch
    RebuildRequested(String),
}

#[derive(Debug, Default, Clone, Copy)]
struct StageStatistics {
    elapsed: Duration,
    processed: usize,
}

#[derive(Debug, Default)]
struct RoundOutcome {
    done_something: bool,
    next_pass: bool,
    restarted: bool,
}

pub struct TargetBuilder {
    is_clean_build: bool,
    chunk_rebuild_done: bool,
    statistics: BTreeMap<String, StageStatistics>,
}

impl TargetBuilder {
    pub fn new(is_clean_build: bool) -> Self {
        Self {
            is_clean_build,
            chunk_rebuild_done: false,
            statistics: BTreeMap::new(),
        }
    }

    /// Build the target. `stages` must already be sorted by category.
    pub fn build(
        &mut self,
        ctx: &mut CompileContext<'_>,
        stages: &mut [Box<dyn Stage>],
        state: Option<&LoadStateResult>,
    ) -> Result<LoopOutcome> {
        let log = ctx.log();
        match self.run_build(ctx, stages, state) {
            Ok(()) => {
                self.report_statistics(log);
                Ok(LoopOutcome::Completed(exit_code(log)))
            }
            Err(BuildError::StopBuild(message)) => {
                if let Some(message) = message.filter(|m| !m.is_empty()) {
                    log.process_message(BuildMessage::new(MessageKind::Progress, message));
                }
                Ok(LoopOutcome::Completed(exit_code(log)))
            }
            Err(e) if e.requests_rebuild() => {
                log.warn(format!(
                    "Internal caches are corrupted or have outdated format, forcing project rebuild: {e}"
                ));
                Ok(LoopOutcome::RebuildRequested(e.to_string()))
            }
            Err(e) => Err(e),
        }
    }

    fn run_build(
        &mut self,
        ctx: &mut CompileContext<'_>,
        stages: &mut [Box<dyn Stage>],
        state: Option<&LoadStateResult>,
    ) -> Result<()> {
        for stage in stages.iter_mut() {
            stage.build_started(ctx)?;
        }
        let result = self.build_target(ctx, stages, state);
        for stage in stages.iter_mut() {
            stage.build_finished(ctx);
        }
        result
    }

    fn build_target(
        &mut self,
        ctx: &mut CompileContext<'_>,
        stages: &mut [Box<dyn Stage>],
        state: Option<&LoadStateResult>,
    ) -> Result<()> {
        let mut done_something = false;
        match state {
            Some(state) if !self.is_clean_build => {
                for file in &state.changes.changed_files {
                    if !ctx.mark_dirty(file, CompilationRound::Current) {
                        ctx.log()
                            .debug(format!("{} is not a source of the target", file.display()));
                    }
                }

                if !state.changes.deleted_files.is_empty() {
                    done_something =
                        delete_outputs_associated_with_deleted_paths(ctx, &state.changes.deleted_files)?;
                }
            }
            _ => init_fs_state_for_clean_build(ctx),
        }

        if self.run_stages(ctx, stages)? {
            done_something = true;
        }

        if done_something {
            ctx.data_mut().mark_up_to_date();
        }
        Ok(())
    }

    /// Returns whether any stage did something
    fn run_stages(&mut self, ctx: &mut CompileContext<'_>, stages: &mut [Box<dyn Stage>]) -> Result<bool> {
        for stage in stages.iter_mut() {
            stage.chunk_build_started(ctx)?;
        }

        let result = self.run_rounds(ctx, stages);
        let finished = finish_chunk(ctx, stages);
        let done_something = result?;
        finished?;
        Ok(done_something)
    }

    fn run_rounds(&mut self, ctx: &mut CompileContext<'_>, stages: &mut [Box<dyn Stage>]) -> Result<bool> {
        let mut done_something = false;
        loop {
            ctx.fs_mut().before_next_round();
            ctx.cancel().check()?;

            if !self.is_clean_build {
                complete_recompiled_sources_set(ctx);
                clean_outputs(ctx)?;
            }

            let dirty = dirty_files(ctx);
            let round = self.run_round(ctx, stages, &dirty);
            ctx.consumer_mut().set_current_stage(None);
            let mut round = round?;
            done_something |= round.done_something;

            if !round.restarted && complete_round(ctx)? {
                round.next_pass = true;
            }
            if !round.next_pass && !ctx.fs().has_next_round_work() {
                return Ok(done_something);
            }
        }
    }

    fn run_round(
        &mut self,
        ctx: &mut CompileContext<'_>,
        stages: &mut [Box<dyn Stage>],
        dirty: &DirtyFiles,
    ) -> Result<RoundOutcome> {
        let log = ctx.log();
        let mut outcome = RoundOutcome::default();
        let mut instrumented_classes_saved = false;

        for stage in stages.iter_mut() {
            let name = stage.name().to_string();
            if stage.category() == StageCategory::ClassPostProcessor && !instrumented_classes_saved {
                instrumented_classes_saved = true;
                ctx.consumer_mut().save_instrumented_classes()?;
            }

            ctx.consumer_mut().set_current_stage(Some(name.as_str()));
            let processed_before = ctx.consumer().processed_source_count(&name);
            let start = Instant::now();
            let signal = stage.build(ctx, dirty);
            let processed = ctx.consumer().processed_source_count(&name) - processed_before;
            self.store_statistics(&name, start.elapsed(), processed);
            let signal = signal?;

            if signal != StageSignal::NothingDone {
                outcome.done_something = true;
            }
            if signal == StageSignal::Abort {
                return Err(BuildError::StopBuild(Some(format!(
                    "Stage {name} requested build stop"
                ))));
            }

            ctx.cancel().check()?;

            match signal {
                StageSignal::AdditionalPassRequired => outcome.next_pass = true,
                StageSignal::ChunkRebuildRequired if !self.chunk_rebuild_done && !self.is_clean_build => {
                    notify_chunk_rebuild_requested(ctx, &name);
                    self.chunk_rebuild_done = true;
                    ctx.fs_mut().clear_round_marks();
                    ctx.mark_all_dirty(CompilationRound::Next);
                    ctx.consumer_mut().clear();
                    ctx.mappings_mut().discard_round();
                    outcome.next_pass = true;
                    outcome.restarted = true;
                    break;
                }
                StageSignal::ChunkRebuildRequired => {
                    log.debug(format!("Stage {name} requested second chunk rebuild"));
                }
                _ => {}
            }
        }
        Ok(outcome)
    }

    fn store_statistics(&mut self, stage: &str, elapsed: Duration, processed: usize) {
        let statistics = self.statistics.entry(stage.to_string()).or_default();
        statistics.elapsed += elapsed;
        statistics.processed += processed;
    }

    fn report_statistics(&self, log: &RequestLog) {
        for (stage, statistics) in &self.statistics {
            let per_file = if statistics.processed == 0 {
                String::new()
            } else {
                format!(
                    " ({} ms per file)",
                    statistics.elapsed.as_millis() / statistics.processed as u128
                )
            };
            log.info(format!(
                "Build duration: {stage} took {:?}; {} sources processed{per_file}",
                statistics.elapsed, statistics.processed
            ));
        }
    }
}

fn exit_code(log: &RequestLog) -> i32 {
    if log.has_errors() {
        1
    } else {
        0
    }
}

fn init_fs_state_for_clean_build(ctx: &mut CompileContext<'_>) {
    ctx.mark_all_dirty(CompilationRound::Current);
    let sources = ctx.target().sources().to_vec();
    for source in &sources {
        ctx.data_mut().mark_changed(source);
    }
}

fn dirty_files(ctx: &CompileContext<'_>) -> DirtyFiles {
    DirtyFiles::new(
        ctx.fs()
            .files_to_recompile()
            .map(|(path, root)| DirtyFile {
                path: path.clone(),
                root: root.clone(),
            })
            .collect(),
    )
}

/// Pull every source that shares an output with a dirty source into the
/// current round, transitively
fn complete_recompiled_sources_set(ctx: &mut CompileContext<'_>) {
    let mut worklist: Vec<PathBuf> = ctx.fs().files_to_recompile().map(|(p, _)| p.clone()).collect();
    let mut seen: HashSet<PathBuf> = worklist.iter().cloned().collect();
    let mut added = Vec::new();

    while let Some(file) = worklist.pop() {
        let outputs = ctx.data().outputs(&file).to_vec();
        if outputs.is_empty() {
            continue;
        }
        for other in ctx.data().find_affected_sources(&[outputs]) {
            if seen.insert(other.clone()) && ctx.data().is_present(&other) {
                worklist.push(other.clone());
                added.push(other);
            }
        }
    }

    let mut marked = 0;
    for file in &added {
        if ctx.mark_dirty(file, CompilationRound::Current) {
            marked += 1;
        }
    }
    if marked > 0 {
        ctx.log().info(format!(
            "{marked} sources share outputs with changed sources and will be recompiled"
        ));
    }
}

/// Delete recorded outputs of the sources about to be recompiled
fn clean_outputs(ctx: &mut CompileContext<'_>) -> Result<()> {
    let dirty: Vec<PathBuf> = ctx.fs().files_to_recompile().map(|(p, _)| p.clone()).collect();
    let class_out_dir = ctx.target().class_out_dir().to_path_buf();
    let mut dirs = BTreeSet::new();
    let mut deleted = 0;

    for file in &dirty {
        for output in ctx.data_mut().clear_outputs(file) {
            if remove_file_if_exists(&output)? {
                deleted += 1;
                if let Some(parent) = output.parent() {
                    dirs.insert(parent.to_path_buf());
                }
            }
        }
        ctx.data_mut().mark_changed(file);
    }

    prune_empty_dirs(&dirs, &class_out_dir)?;
    if deleted > 0 {
        ctx.log().info(format!(
            "Cleaned {deleted} outputs of {} changed sources",
            dirty.len()
        ));
    }
    Ok(())
}

/// Remove outputs of sources that left the input set and forget them.
/// Co-producers of their outputs and users of their symbols become dirty.
fn delete_outputs_associated_with_deleted_paths(
    ctx: &mut CompileContext<'_>,
    deleted_files: &[RemovedFileInfo],
) -> Result<bool> {
    let log = ctx.log();
    let class_out_dir = ctx.target().class_out_dir().to_path_buf();
    let mut dirs = BTreeSet::new();
    let mut affected = BTreeSet::new();
    let mut done_something = false;

    for item in deleted_files {
        let mut deleted_outputs = Vec::new();
        for output in &item.outputs {
            if remove_file_if_exists(output)? {
                if let Some(parent) = output.parent() {
                    dirs.insert(parent.to_path_buf());
                }
                deleted_outputs.push(ctx.relativizer().to_relative(output, PathKind::Output));
            }
            if let Some(producers) = ctx.data().producers_of(output) {
                affected.extend(producers.iter().filter(|p| **p != item.source_file).cloned());
            }
        }
        if !deleted_outputs.is_empty() {
            done_something = true;
            log.info(format!("Deleted files: {deleted_outputs:?}"));
        }

        ctx.data_mut().remove_source(&item.source_file);
        affected.extend(ctx.mappings_mut().remove_source(&item.source_file)?);
    }

    for file in &affected {
        if ctx.data().is_present(file) && ctx.mark_dirty(file, CompilationRound::Current) {
            ctx.data_mut().mark_changed(file);
        }
    }

    prune_empty_dirs(&dirs, &class_out_dir)?;
    Ok(done_something)
}

/// Fold the round into the provider and the mappings. Returns whether the
/// mappings scheduled more files.
fn complete_round(ctx: &mut CompileContext<'_>) -> Result<bool> {
    ctx.commit_outputs()?;
    let compiled = ctx.fs_mut().complete_round();
    let affected = ctx.mappings_mut().on_round_completion(&compiled)?;

    let mut more = 0;
    for file in &affected {
        if ctx.data().is_present(file) && ctx.mark_dirty(file, CompilationRound::Next) {
            more += 1;
        }
    }
    if more > 0 {
        ctx.log()
            .info(format!("{more} more sources affected by ABI changes, scheduling another round"));
    }
    Ok(more > 0)
}

fn notify_chunk_rebuild_requested(ctx: &CompileContext<'_>, stage: &str) {
    ctx.log().process_message(BuildMessage::new(
        MessageKind::JpsInfo,
        format!(
            "Stage \"{stage}\" requested rebuild of module chunk \"{}\"",
            ctx.target().name()
        ),
    ));
}

fn finish_chunk(ctx: &mut CompileContext<'_>, stages: &mut [Box<dyn Stage>]) -> Result<()> {
    let log = ctx.log();
    let saved = ctx.consumer_mut().save_instrumented_classes();
    ctx.consumer_mut().fire_file_generated_events(log);
    ctx.consumer_mut().clear();
    for stage in stages.iter_mut() {
        stage.chunk_build_finished(ctx);
    }
    if log.has_errors() {
        log.process_message(BuildMessage::new(
            MessageKind::JpsInfo,
            format!("Errors occurred while compiling module {}", ctx.target().name()),
        ));
    }
    saved.map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancelToken;
    use crate::change::compute_change_set;
    use crate::config::WorkerConfig;
    use crate::context::ProjectDescriptor;
    use crate::digest::Digest;
    use crate::mappings::{Mappings, MAPPINGS_TREE};
    use crate::output::CompiledClass;
    use crate::provider::{BuildDataProvider, SourceDescriptor};
    use crate::relativizer::PathRelativizer;
    use crate::stage::sort_stages;
    use crate::target::{BuildRootIndex, ModuleTarget};
    use std::collections::HashMap;
    use std::path::Path;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    struct FnStage<F> {
        name: &'static str,
        category: StageCategory,
        action: F,
    }

    impl<F> Stage for FnStage<F>
    where
        F: FnMut(&mut CompileContext<'_>, &DirtyFiles) -> Result<StageSignal> + Send,
    {
        fn name(&self) -> &str {
            self.name
        }

        fn category(&self) -> StageCategory {
            self.category
        }

        fn build(&mut self, ctx: &mut CompileContext<'_>, dirty: &DirtyFiles) -> Result<StageSignal> {
            (self.action)(ctx, dirty)
        }
    }

    fn stage<F>(name: &'static str, category: StageCategory, action: F) -> Box<dyn Stage>
    where
        F: FnMut(&mut CompileContext<'_>, &DirtyFiles) -> Result<StageSignal> + Send + 'static,
    {
        Box::new(FnStage {
            name,
            category,
            action,
        })
    }

    type Calls = Arc<Mutex<Vec<Vec<String>>>>;

    fn names(dirty: &DirtyFiles) -> Vec<String> {
        dirty
            .paths()
            .filter_map(|p| p.file_name())
            .map(|n| n.to_string_lossy().to_string())
            .collect()
    }

    fn stem(path: &Path) -> String {
        path.file_stem().unwrap().to_string_lossy().to_string()
    }

    fn class_path(class_out_dir: &Path, stem: &str) -> PathBuf {
        class_out_dir.join(stem.to_lowercase()).join(format!("{stem}.class"))
    }

    fn inner_class_path(class_out_dir: &Path, stem: &str) -> PathBuf {
        class_out_dir.join(stem.to_lowercase()).join(format!("{stem}$Inner.class"))
    }

    /// Compiles every dirty file into two classes
    fn compiler(calls: Calls) -> Box<dyn Stage> {
        stage("compiler", StageCategory::Translator, move |ctx, dirty| {
            calls.lock().unwrap().push(names(dirty));
            if dirty.is_empty() {
                return Ok(StageSignal::NothingDone);
            }
            for file in dirty.paths() {
                let stem = stem(file);
                let class = class_path(ctx.target().class_out_dir(), &stem);
                let inner = inner_class_path(ctx.target().class_out_dir(), &stem);
                let consumer = ctx.consumer_mut();
                consumer.register_compiled_class(&[file.clone()], CompiledClass::new(class, stem.clone().into_bytes()));
                consumer.register_compiled_class(&[file.clone()], CompiledClass::new(inner, vec![0]));
            }
            Ok(StageSignal::Done)
        })
    }

    struct Harness {
        dir: tempfile::TempDir,
        class_out_dir: PathBuf,
        project: ProjectDescriptor,
        data: BuildDataProvider,
        log: RequestLog,
        cancel: CancelToken,
        config: WorkerConfig,
    }

    impl Harness {
        fn new(files: &[&str]) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let class_out_dir = dir.path().join("lib-classes");
            let sources: Vec<PathBuf> = files.iter().map(|f| dir.path().join("src").join(f)).collect();
            let digests = sources
                .iter()
                .map(|s| (s.clone(), Digest::of(s.to_string_lossy().as_bytes())))
                .collect();

            let db = sled::Config::new().temporary(true).open().unwrap();
            let relativizer = Arc::new(PathRelativizer::new(dir.path(), &class_out_dir));
            let target = ModuleTarget::new("lib", sources, &class_out_dir);
            let project = ProjectDescriptor {
                root_index: BuildRootIndex::new(&target),
                target,
                mappings: Mappings::new(db.open_tree(MAPPINGS_TREE).unwrap(), Arc::clone(&relativizer), true),
                relativizer,
            };
            Self {
                dir,
                class_out_dir,
                project,
                data: BuildDataProvider::initial(digests),
                log: RequestLog::new(true),
                cancel: CancelToken::new(),
                config: WorkerConfig::default(),
            }
        }

        fn source(&self, name: &str) -> PathBuf {
            self.dir.path().join("src").join(name)
        }

        fn class(&self, stem: &str) -> PathBuf {
            class_path(&self.class_out_dir, stem)
        }

        fn run(
            &mut self,
            is_clean_build: bool,
            stages: &mut [Box<dyn Stage>],
            state: Option<&LoadStateResult>,
        ) -> Result<LoopOutcome> {
            sort_stages(stages);
            let mut ctx = CompileContext::new(&mut self.project, &mut self.data, &self.log, &self.cancel, &self.config);
            TargetBuilder::new(is_clean_build).build(&mut ctx, stages, state)
        }

        /// Simulate the next invocation: `changed` get new digests,
        /// `deleted` leave the input set
        fn next_build(&mut self, changed: &[&str], deleted: &[&str]) -> LoadStateResult {
            let stored: HashMap<PathBuf, SourceDescriptor> = self
                .data
                .final_list()
                .into_iter()
                .map(|d| (d.source.clone(), d))
                .collect();
            let mut actual: HashMap<PathBuf, Digest> =
                stored.iter().map(|(p, d)| (p.clone(), d.digest.clone())).collect();
            for name in changed {
                actual.insert(self.source(name), Digest::of(format!("{name} changed").as_bytes()));
            }
            for name in deleted {
                actual.remove(&self.source(name));
            }

            self.project.target = ModuleTarget::new("lib", actual.keys().cloned().collect(), &self.class_out_dir);
            self.project.root_index = BuildRootIndex::new(&self.project.target);
            let changes = compute_change_set(&actual, &stored);
            self.data = BuildDataProvider::from_loaded(actual, stored.clone());
            LoadStateResult {
                map: stored,
                rebuild_requested: None,
                changes,
            }
        }
    }

    #[test]
    fn test_clean_build_compiles_everything() {
        let mut h = Harness::new(&["A.kt", "B.kt"]);
        let calls = Calls::default();
        let outcome = h.run(true, &mut [compiler(calls.clone())], None).unwrap();

        assert_eq!(outcome, LoopOutcome::Completed(0));
        assert_eq!(*calls.lock().unwrap(), vec![vec!["A.kt", "B.kt"]]);
        assert_eq!(std::fs::read(h.class("A")).unwrap(), b"A");
        let a = h.source("A.kt");
        assert_eq!(h.data.outputs(&a).len(), 2);
        assert!(h.data.final_list().iter().all(|d| !d.is_changed));
        assert!(h.log.output().contains("Build duration: compiler took"));
    }

    #[test]
    fn test_unchanged_inputs_do_nothing() {
        let mut h = Harness::new(&["A.kt", "B.kt"]);
        let calls = Calls::default();
        h.run(true, &mut [compiler(calls.clone())], None).unwrap();
        let before = h.data.final_list();

        let state = h.next_build(&[], &[]);
        assert!(state.changes.is_empty());
        let outcome = h.run(false, &mut [compiler(calls.clone())], Some(&state)).unwrap();

        assert_eq!(outcome, LoopOutcome::Completed(0));
        assert_eq!(calls.lock().unwrap()[1], Vec::<String>::new());
        assert_eq!(h.data.final_list(), before);
        assert!(h.class("B").exists());
    }

    #[test]
    fn test_changed_file_is_recompiled_alone() {
        let mut h = Harness::new(&["A.kt", "B.kt", "C.kt"]);
        let calls = Calls::default();
        h.run(true, &mut [compiler(calls.clone())], None).unwrap();

        let state = h.next_build(&["B.kt"], &[]);
        h.run(false, &mut [compiler(calls.clone())], Some(&state)).unwrap();

        assert_eq!(calls.lock().unwrap()[1], vec!["B.kt"]);
        let b = h.source("B.kt");
        assert_eq!(h.data.descriptor(&b).unwrap().digest, Digest::of(b"B.kt changed"));
        assert!(h.class("B").exists());
    }

    #[test]
    fn test_chunk_rebuild_is_applied_once() {
        let mut h = Harness::new(&["A.kt", "B.kt", "C.kt"]);
        let calls = Calls::default();
        h.run(true, &mut [compiler(calls.clone())], None).unwrap();

        let state = h.next_build(&["A.kt"], &[]);
        let requests = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&requests);
        let mut stages = vec![
            compiler(calls.clone()),
            stage("rebuilder", StageCategory::ClassInstrumenter, move |_, dirty| {
                if dirty.is_empty() {
                    return Ok(StageSignal::NothingDone);
                }
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(StageSignal::ChunkRebuildRequired)
            }),
        ];
        let outcome = h.run(false, &mut stages, Some(&state)).unwrap();

        assert_eq!(outcome, LoopOutcome::Completed(0));
        assert_eq!(requests.load(Ordering::SeqCst), 2);
        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[1], vec!["A.kt"]);
        assert_eq!(calls[2], vec!["A.kt", "B.kt", "C.kt"]);

        let output = h.log.output();
        assert_eq!(output.matches("requested rebuild of module chunk").count(), 1);
        assert!(output.contains("Stage rebuilder requested second chunk rebuild"));
        assert!(h.class("C").exists());
    }

    #[test]
    fn test_chunk_rebuild_is_ignored_on_clean_build() {
        let mut h = Harness::new(&["A.kt"]);
        let calls = Calls::default();
        let mut stages = vec![
            compiler(calls.clone()),
            stage("rebuilder", StageCategory::ClassInstrumenter, |_, _| {
                Ok(StageSignal::ChunkRebuildRequired)
            }),
        ];
        h.run(true, &mut stages, None).unwrap();
        assert_eq!(calls.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_deleted_source_outputs_are_removed_and_dirs_pruned() {
        let mut h = Harness::new(&["A.kt", "B.kt"]);
        let calls = Calls::default();
        h.run(true, &mut [compiler(calls.clone())], None).unwrap();
        let b_class = h.class("B");
        let b_inner = inner_class_path(&h.class_out_dir, "B");
        assert!(b_class.exists() && b_inner.exists());

        let state = h.next_build(&[], &["B.kt"]);
        assert_eq!(state.changes.deleted_files.len(), 1);
        let outcome = h.run(false, &mut [compiler(calls.clone())], Some(&state)).unwrap();

        assert_eq!(outcome, LoopOutcome::Completed(0));
        assert!(!b_class.exists());
        assert!(!b_inner.exists());
        assert!(!h.class_out_dir.join("b").exists());
        assert!(h.class("A").exists());
        assert!(h.data.descriptor(&h.source("B.kt")).is_none());
        assert!(h.log.output().contains("Deleted files"));

        let state = h.next_build(&[], &[]);
        assert!(state.changes.is_empty());
    }

    #[test]
    fn test_shared_output_recompiles_all_producers() {
        let mut h = Harness::new(&["A.kt", "B.kt", "C.kt"]);
        let generator = || {
            stage("generator", StageCategory::SourceProcessor, |ctx, dirty| {
                let shared = ctx.target().class_out_dir().join("Shared.class");
                for file in dirty.paths().filter(|p| !p.ends_with("C.kt")) {
                    ctx.consumer_mut().register_output(&[file.clone()], shared.clone());
                }
                Ok(StageSignal::Done)
            })
        };
        let calls = Calls::default();
        h.run(true, &mut [generator(), compiler(calls.clone())], None).unwrap();

        let state = h.next_build(&["A.kt"], &[]);
        h.run(false, &mut [generator(), compiler(calls.clone())], Some(&state)).unwrap();

        assert_eq!(calls.lock().unwrap()[1], vec!["A.kt", "B.kt"]);
        assert!(h.log.output().contains("1 sources share outputs"));
    }

    #[test]
    fn test_class_post_processor_sees_saved_classes() {
        let mut h = Harness::new(&["A.kt", "B.kt"]);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let observed = Arc::clone(&seen);
        let mut stages = vec![
            stage("post", StageCategory::ClassPostProcessor, move |ctx, dirty| {
                for file in dirty.paths() {
                    let class = class_path(ctx.target().class_out_dir(), &stem(file));
                    observed.lock().unwrap().push(class.exists());
                }
                Ok(StageSignal::NothingDone)
            }),
            compiler(Calls::default()),
        ];
        h.run(true, &mut stages, None).unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![true, true]);
    }

    #[test]
    fn test_abort_stops_build() {
        let mut h = Harness::new(&["A.kt"]);
        let mut stages = vec![stage("checker", StageCategory::SourceProcessor, |_, _| Ok(StageSignal::Abort))];
        let outcome = h.run(true, &mut stages, None).unwrap();
        assert_eq!(outcome, LoopOutcome::Completed(0));
        assert!(h.log.output().contains("Stage checker requested build stop"));
    }

    #[test]
    fn test_abort_after_error_fails() {
        let mut h = Harness::new(&["A.kt"]);
        let mut stages = vec![stage("checker", StageCategory::SourceProcessor, |ctx, _| {
            ctx.log()
                .process_message(BuildMessage::new(MessageKind::Error, "unresolved reference: foo"));
            Ok(StageSignal::Abort)
        })];
        let outcome = h.run(true, &mut stages, None).unwrap();
        assert_eq!(outcome, LoopOutcome::Completed(1));
        assert!(h.log.output().contains("Errors occurred while compiling module lib"));
    }

    #[test]
    fn test_io_error_requests_rebuild() {
        let mut h = Harness::new(&["A.kt"]);
        let mut stages = vec![stage("compiler", StageCategory::Translator, |_, _| {
            Err(BuildError::io(
                Path::new("/w/cache"),
                std::io::Error::new(std::io::ErrorKind::Other, "disk failure"),
            ))
        })];
        let outcome = h.run(true, &mut stages, None).unwrap();
        assert!(matches!(outcome, LoopOutcome::RebuildRequested(_)));
    }

    #[test]
    fn test_stage_failure_propagates() {
        let mut h = Harness::new(&["A.kt"]);
        let mut stages = vec![stage("compiler", StageCategory::Translator, |_, _| {
            Err(BuildError::Stage {
                stage: "compiler".to_string(),
                message: "internal compiler error".to_string(),
            })
        })];
        assert!(matches!(h.run(true, &mut stages, None), Err(BuildError::Stage { .. })));
    }

    #[test]
    fn test_cancelled_build_unwinds() {
        let mut h = Harness::new(&["A.kt"]);
        h.cancel.cancel();
        let calls = Calls::default();
        let result = h.run(true, &mut [compiler(calls.clone())], None);
        assert!(matches!(result, Err(BuildError::Cancelled)));
        assert!(calls.lock().unwrap().is_empty());
    }

    #[test]
    fn test_additional_pass_runs_another_round() {
        let mut h = Harness::new(&["A.kt", "B.kt"]);
        let calls = Calls::default();
        let mut first = true;
        let mut stages = vec![
            stage("generator", StageCategory::SourceGenerator, move |ctx, _| {
                if std::mem::take(&mut first) {
                    let b = ctx.target().sources()[1].clone();
                    ctx.mark_dirty(&b, CompilationRound::Next);
                    return Ok(StageSignal::AdditionalPassRequired);
                }
                Ok(StageSignal::NothingDone)
            }),
            compiler(calls.clone()),
        ];
        h.run(true, &mut stages, None).unwrap();
        assert_eq!(*calls.lock().unwrap(), vec![vec!["A.kt", "B.kt"], vec!["B.kt"]]);
    }

    #[test]
    fn test_abi_change_schedules_users() {
        let mut h = Harness::new(&["A.kt", "B.kt"]);
        let abi = Arc::new(AtomicU64::new(1));
        let kotlin = |calls: Calls, abi: Arc<AtomicU64>| {
            let mut compile = compiler(calls);
            stage("kotlin", StageCategory::Translator, move |ctx, dirty| {
                for file in dirty.paths() {
                    if file.ends_with("A.kt") {
                        ctx.mappings_mut().provide(file, "A", abi.load(Ordering::SeqCst));
                    } else {
                        ctx.mappings_mut().use_symbol(file, "A");
                    }
                }
                compile.build(ctx, dirty)
            })
        };
        let calls = Calls::default();
        h.run(true, &mut [kotlin(calls.clone(), Arc::clone(&abi))], None).unwrap();

        abi.store(2, Ordering::SeqCst);
        let state = h.next_build(&["A.kt"], &[]);
        h.run(false, &mut [kotlin(calls.clone(), Arc::clone(&abi))], Some(&state)).unwrap();

        assert_eq!(
            *calls.lock().unwrap(),
            vec![vec!["A.kt", "B.kt"], vec!["A.kt"], vec!["B.kt"]]
        );
        assert!(h.log.output().contains("affected by ABI changes"));
    }
}
