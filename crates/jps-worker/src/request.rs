//! Work request entry point
//!
//! Turns a deserialized work request into a `BuildInvocation`, runs it and
//! folds every outcome, fatal errors included, into a `WorkResponse`.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use jps_core::{hash_files, CancelToken, Digest, RequestLog, WorkerConfig};
use serde::{Deserialize, Serialize};

use crate::driver::{build_using_jps, BuildInvocation, StageFactory};
use crate::error::{Result, WorkerError};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Input {
    /// Relative to the worker base directory
    pub path: String,
    /// Empty when the caller did not hash the file
    #[serde(default)]
    pub digest: Digest,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuildFlags {
    pub out: String,
    #[serde(default)]
    pub abi_out: Option<String>,
    #[serde(default)]
    pub module_name: Option<String>,
    #[serde(default)]
    pub kotlinc_args: Vec<String>,
    #[serde(default)]
    pub javac_args: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkRequest {
    pub arguments: BuildFlags,
    #[serde(default)]
    pub inputs: Vec<Input>,
    /// Anything above zero turns on debug lines in the response output
    #[serde(default)]
    pub verbosity: i32,
    #[serde(default)]
    pub request_id: i32,
}

impl WorkRequest {
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| WorkerError::InvalidRequest(e.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkResponse {
    pub exit_code: i32,
    pub output: String,
    pub request_id: i32,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum InputKind {
    Source,
    Dependency,
}

fn input_kind(path: &str) -> Option<InputKind> {
    if path.ends_with(".kt") || path.ends_with(".java") {
        Some(InputKind::Source)
    } else if path.ends_with(".jar") {
        Some(InputKind::Dependency)
    } else {
        None
    }
}

/// Resolve paths against `base_dir` and fill in missing digests
pub fn resolve_invocation(request: &WorkRequest, base_dir: &Path) -> Result<BuildInvocation> {
    let flags = &request.arguments;
    if flags.out.is_empty() {
        return Err(WorkerError::InvalidRequest("no output archive given".to_string()));
    }
    let out_jar = base_dir.join(&flags.out);
    let module_name = match &flags.module_name {
        Some(name) => name.clone(),
        None => out_jar
            .file_stem()
            .and_then(|s| s.to_str())
            .map(str::to_string)
            .ok_or_else(|| WorkerError::InvalidRequest(format!("bad output path {}", flags.out)))?,
    };

    let mut known = Vec::new();
    let mut unhashed = Vec::new();
    for input in &request.inputs {
        let Some(kind) = input_kind(&input.path) else {
            continue;
        };
        let path = base_dir.join(&input.path);
        if input.digest.is_empty() {
            unhashed.push((kind, input.path.as_str(), path));
        } else {
            known.push((kind, input.path.as_str(), path, input.digest.clone()));
        }
    }

    let paths: Vec<PathBuf> = unhashed.iter().map(|(_, _, path)| path.clone()).collect();
    let digests = hash_files(&paths)?;
    known.extend(
        unhashed
            .into_iter()
            .zip(digests)
            .map(|((kind, relative, path), digest)| (kind, relative, path, digest)),
    );

    let mut sources = HashMap::new();
    let mut dependencies = BTreeMap::new();
    for (kind, relative, path, digest) in known {
        match kind {
            InputKind::Source => {
                sources.insert(path, digest);
            }
            InputKind::Dependency => {
                dependencies.insert(relative.replace('\\', "/"), digest);
            }
        }
    }

    Ok(BuildInvocation {
        base_dir: base_dir.to_path_buf(),
        module_name,
        sources,
        dependencies,
        kotlinc_args: flags.kotlinc_args.clone(),
        javac_args: flags.javac_args.clone(),
        out_jar,
        abi_jar: flags.abi_out.as_ref().map(|abi| base_dir.join(abi)),
    })
}

/// Execute one work request. Never fails: errors end up in the output with
/// exit code 1.
pub async fn execute(
    request: &WorkRequest,
    base_dir: &Path,
    stages: &dyn StageFactory,
    config: &WorkerConfig,
    cancel: &CancelToken,
) -> WorkResponse {
    let log = Arc::new(RequestLog::new(request.verbosity > 0));
    let exit_code = match run(request, base_dir, stages, config, &log, cancel).await {
        Ok(exit_code) => exit_code,
        Err(e) => {
            log.error(format!("{e:?}"));
            1
        }
    };
    WorkResponse {
        exit_code,
        output: log.output(),
        request_id: request.request_id,
    }
}

async fn run(
    request: &WorkRequest,
    base_dir: &Path,
    stages: &dyn StageFactory,
    config: &WorkerConfig,
    log: &Arc<RequestLog>,
    cancel: &CancelToken,
) -> anyhow::Result<i32> {
    let invocation = resolve_invocation(request, base_dir).context("cannot resolve work request")?;
    let exit_code = build_using_jps(&invocation, stages, config, log, cancel)
        .await
        .with_context(|| format!("cannot build module {}", invocation.module_name))?;
    Ok(exit_code)
}
