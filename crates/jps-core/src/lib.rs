//! JPS Core - incremental build orchestration for a JVM compiler worker
//!
//! Features:
//! - Digest-based change detection (no timestamps)
//! - Build state persisted in a transactional `sled` store
//! - Full rebuild policy with a configurable threshold
//! - Multi-round stage pipeline with many-to-one output tracking
//! - Cross-round symbol mappings for ABI-driven recompilation
//! - Cooperative cancellation via explicit tokens

pub mod cancel;
pub mod change;
pub mod config;
pub mod context;
pub mod digest;
pub mod error;
pub mod files;
pub mod fs_state;
pub mod log;
pub mod mappings;
pub mod output;
pub mod policy;
pub mod provider;
pub mod relativizer;
pub mod stage;
pub mod state;
pub mod store;
pub mod target;
pub mod target_builder;

pub use cancel::CancelToken;
pub use change::{compute_change_set, ChangeSet, RemovedFileInfo};
pub use config::{load_config, save_config, WorkerConfig};
pub use context::{CompileContext, ProjectDescriptor};
pub use digest::{hash_files, Digest};
pub use error::{BuildError, Result};
pub use fs_state::CompilationRound;
pub use log::{BuildMessage, MessageKind, RequestLog};
pub use output::{CompiledClass, OutputConsumer};
pub use policy::check_is_full_rebuild_required;
pub use provider::{BuildDataProvider, SourceDescriptor};
pub use relativizer::{PathKind, PathRelativizer};
pub use stage::{sort_stages, DirtyFile, DirtyFiles, Stage, StageCategory, StageSignal};
pub use state::{
    load_build_state, save_build_state, LoadStateResult, RebuildReason,
    TargetConfigurationDigestContainer, TargetConfigurationDigestProperty,
};
pub use store::{StorageInitializer, StorageManager, CACHE_DB_FILE_NAME};
pub use target::{ModuleTarget, SourceRoot};
pub use target_builder::{LoopOutcome, TargetBuilder};
