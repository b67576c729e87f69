//! Worker configuration
//!
//! Settings the surrounding platform used to keep in process-wide properties
//! are collected here and passed into the driver explicitly. Stored as JSON.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{BuildError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Fraction of source files that may change before an incremental build
    /// is abandoned in favor of a full rebuild
    pub rebuild_threshold: f64,
    /// Thread budget offered to heavy compiler stages
    pub parallel_compile_threads: usize,
    /// Recompile users of symbols whose ABI changed
    pub dependency_graph_enabled: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            rebuild_threshold: 0.5,
            parallel_compile_threads: std::thread::available_parallelism()
                .map(|p| p.get())
                .unwrap_or(4),
            dependency_graph_enabled: true,
        }
    }
}

/// Load config from disk, falling back to defaults when the file is absent
pub fn load_config(path: &Path) -> Result<WorkerConfig> {
    if !path.exists() {
        return Ok(WorkerConfig::default());
    }

    let content = std::fs::read_to_string(path).map_err(|e| BuildError::io(path, e))?;
    let config: WorkerConfig = serde_json::from_str(&content)?;
    Ok(config)
}

/// Save config to disk
pub fn save_config(path: &Path, config: &WorkerConfig) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| BuildError::io(parent, e))?;
    }

    let content = serde_json::to_string_pretty(config)?;
    std::fs::write(path, content).map_err(|e| BuildError::io(path, e))?;

    tracing::info!("Config saved to {:?}", path);
    Ok(())
}
