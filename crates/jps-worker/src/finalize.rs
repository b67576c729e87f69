//! Post-Build Finalizer
//!
//! Runs the end-of-build tasks concurrently on the blocking pool:
//! - persist the build state, descriptors and mappings in one transaction
//! - delete stale classloader index files
//! - pack the output archive and the ABI archive
//! - report configuration rebuilds and unprocessed changes
//!
//! All tasks share a child cancellation scope. The first failure cancels the
//! others; persistence checks the scope right before it commits.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use jps_core::files::remove_file_if_exists;
use jps_core::mappings::MappingWrite;
use jps_core::{
    save_build_state, BuildMessage, CancelToken, MessageKind, PathRelativizer, RequestLog,
    SourceDescriptor, TargetConfigurationDigestContainer,
};
use tokio::task::JoinSet;
use tracing::{debug, info};

use crate::error::{Result, WorkerError};
use crate::jar::package_to_jar;

/// Classloader index files that go stale whenever the class output changes
pub const STALE_INDEX_FILES: [&str; 2] = ["classpath.index", ".unmodified"];

/// Everything the finalizer needs, detached from the build loop
pub struct FinalizeInput {
    pub db: sled::Db,
    pub descriptors: Vec<SourceDescriptor>,
    pub relativizer: Arc<PathRelativizer>,
    pub target_digests: TargetConfigurationDigestContainer,
    pub mapping_writes: Vec<MappingWrite>,
    pub target_name: String,
    pub out_jar: PathBuf,
    pub abi_jar: Option<PathBuf>,
    pub class_out_dir: PathBuf,
    pub rebuilt_due_to_configuration: bool,
    pub has_unprocessed_changes: bool,
}

pub async fn post_build(input: FinalizeInput, log: Arc<RequestLog>, cancel: &CancelToken) -> Result<()> {
    let scope = cancel.child();
    let descriptors = Arc::new(input.descriptors);
    let relativizer = input.relativizer;
    let mut tasks: JoinSet<(&'static str, Result<()>)> = JoinSet::new();

    {
        let scope = scope.clone();
        let db = input.db;
        let descriptors = Arc::clone(&descriptors);
        let relativizer = Arc::clone(&relativizer);
        let target_digests = input.target_digests;
        let mapping_writes = input.mapping_writes;
        tasks.spawn_blocking(move || {
            let result = save_build_state(
                &db,
                &descriptors,
                &relativizer,
                &target_digests,
                &mapping_writes,
                &scope,
            );
            ("save caches", result.map_err(WorkerError::from))
        });
    }

    {
        let scope = scope.clone();
        let class_out_dir = input.class_out_dir.clone();
        tasks.spawn_blocking(move || {
            let result = (|| -> Result<()> {
                for name in STALE_INDEX_FILES {
                    scope.check()?;
                    remove_file_if_exists(&class_out_dir.join(name))?;
                }
                Ok(())
            })();
            ("delete classpath index", result)
        });
    }

    {
        let scope = scope.clone();
        let log = Arc::clone(&log);
        let descriptors = Arc::clone(&descriptors);
        let out_jar = input.out_jar;
        let abi_jar = input.abi_jar;
        let class_out_dir = input.class_out_dir;
        tasks.spawn_blocking(move || {
            let result = scope.check().map_err(WorkerError::from).and_then(|()| {
                log.measure_time("pack and abi", || {
                    package_to_jar(&out_jar, abi_jar.as_deref(), &descriptors, &class_out_dir, &log)
                })
            });
            ("create output JAR and ABI JAR", result)
        });
    }

    {
        let log = Arc::clone(&log);
        let target_name = input.target_name;
        let rebuilt = input.rebuilt_due_to_configuration;
        let unprocessed = input.has_unprocessed_changes;
        tasks.spawn_blocking(move || {
            if rebuilt {
                log.process_message(BuildMessage::new(
                    MessageKind::Info,
                    format!("'{target_name}' was fully rebuilt due to project configuration changes"),
                ));
            }
            if unprocessed {
                log.info("some file system changes were not processed by this build");
            }
            ("report build state", Ok(()))
        });
    }

    let start = Instant::now();
    let mut first_error = None;
    while let Some(joined) = tasks.join_next().await {
        let (task, result) = match joined {
            Ok(outcome) => outcome,
            Err(e) => (
                "finalize",
                Err(WorkerError::Task {
                    task: "finalize".to_string(),
                    message: e.to_string(),
                }),
            ),
        };
        match result {
            Ok(()) => debug!(task, "finalize task completed"),
            Err(e) => {
                log.warn(format!("{task} failed: {e}"));
                if first_error.is_none() {
                    scope.cancel();
                    first_error = Some(e);
                }
            }
        }
    }

    for path in relativizer.unhandled_paths() {
        log.warn(format!("path cannot be made relative and is stored as is: {path}"));
    }

    info!(elapsed = ?start.elapsed(), "post build finished");
    first_error.map_or(Ok(()), Err)
}
