//! Worker errors

use jps_core::BuildError;

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error(transparent)]
    Build(#[from] BuildError),

    #[error("cannot write archive {path}: {source}")]
    Archive {
        path: String,
        source: zip::result::ZipError,
    },

    #[error("output {0} is recorded in the build state but does not exist")]
    MissingOutput(String),

    #[error("finalize task {task} failed: {message}")]
    Task { task: String, message: String },

    #[error("invalid work request: {0}")]
    InvalidRequest(String),
}

pub type Result<T, E = WorkerError> = std::result::Result<T, E>;
