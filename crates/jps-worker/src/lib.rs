//! JPS Worker - drives incremental builds of one JVM module per request
//!
//! Features:
//! - Work requests with caller-supplied or computed digests
//! - Directory-pair check between build state and class output
//! - One bounded retry from scratch when the cache is unusable
//! - Concurrent post-build persistence and archive packaging
//! - Reproducible output and ABI archives

pub mod abi;
pub mod driver;
pub mod error;
pub mod finalize;
pub mod jar;
pub mod request;

pub use driver::{build_using_jps, BuildInvocation, OutputLayout, StageFactory};
pub use error::{Result, WorkerError};
pub use finalize::{post_build, FinalizeInput};
pub use jar::package_to_jar;
pub use request::{execute, resolve_invocation, BuildFlags, Input, WorkRequest, WorkResponse};
