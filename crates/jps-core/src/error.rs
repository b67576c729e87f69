//! Build errors and their classification
//!
//! Errors that mean "the cache can no longer be trusted" are turned into a
//! rebuild request by the target loop instead of failing the build.

use std::path::Path;

/// Errors produced while loading state, running stages or persisting results
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    /// A filesystem operation failed.
    #[error("cannot access {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    /// The transactional store reported an error.
    #[error("cache storage error: {0}")]
    Store(#[from] sled::Error),

    /// Persisted data is unreadable or inconsistent.
    #[error("internal caches are corrupted or have outdated format: {0}")]
    Corrupted(String),

    /// A persisted record could not be (de)serialized.
    #[error("cannot process build state: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A stage intentionally halted the build. Not necessarily an error.
    #[error("build stopped")]
    StopBuild(Option<String>),

    /// A stage failed for a reason unrelated to the cache.
    #[error("stage {stage} failed: {message}")]
    Stage { stage: String, message: String },

    /// The request was canceled.
    #[error("build canceled")]
    Cancelled,

    /// The cache was reported unusable again after a full rebuild.
    #[error("rebuild requested again after a full rebuild: {0}")]
    RebuildLoop(String),
}

impl BuildError {
    pub fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.display().to_string(),
            source,
        }
    }

    /// Whether this error means the cache must be discarded and the target rebuilt.
    pub fn requests_rebuild(&self) -> bool {
        matches!(
            self,
            Self::Io { .. } | Self::Store(_) | Self::Corrupted(_) | Self::Serialization(_)
        )
    }
}

pub type Result<T, E = BuildError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_errors_request_rebuild() {
        let io = BuildError::io(Path::new("a.class"), std::io::Error::other("disk"));
        assert!(io.requests_rebuild());
        assert!(BuildError::Corrupted("bad".into()).requests_rebuild());
    }

    #[test]
    fn test_control_flow_errors_do_not_request_rebuild() {
        assert!(!BuildError::Cancelled.requests_rebuild());
        assert!(!BuildError::StopBuild(None).requests_rebuild());
        let stage = BuildError::Stage {
            stage: "kotlin".into(),
            message: "boom".into(),
        };
        assert!(!stage.requests_rebuild());
    }
}
