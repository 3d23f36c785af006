//! Workflow runtimes: per-run event loops, step state machines and the
//! process-wide registry that makes live runtimes reachable for stop/retry.

pub mod cache;
mod event;
mod registry;
mod runloop;
mod step;

use std::sync::Arc;

use futures::future::BoxFuture;

pub use cache::{CacheQuery, CacheRecord};
pub use event::{JobUpdate, RunUpdate, WorkflowEvent};
pub use registry::RuntimeRegistry;
pub use runloop::{RuntimeDeps, Workflow};
pub use step::{Step, StepContext, StepState};

use crate::error::Result;
use crate::storage::RunCacheRow;

pub type UpdateRunFn = Arc<dyn Fn(RunUpdate) -> BoxFuture<'static, bool> + Send + Sync>;
pub type LogCacheFn = Arc<dyn Fn(CacheRecord) -> BoxFuture<'static, Result<String>> + Send + Sync>;
pub type ListCacheFn =
    Arc<dyn Fn(CacheQuery) -> BoxFuture<'static, Result<Vec<RunCacheRow>>> + Send + Sync>;

/// Capabilities a runtime needs from its controller.
///
/// The runtime surfaces every transition through these and owns no
/// persistence of its own.
#[derive(Clone)]
pub struct WorkflowCallbacks {
    /// Persist the run's status and runtime view; returns false when the
    /// update was rejected.
    pub update_run: UpdateRunFn,
    /// Record a completed step in the cache; returns the cache entry id.
    pub log_cache: LogCacheFn,
    /// Look up cache entries for a fingerprint.
    pub list_cache: ListCacheFn,
}

impl WorkflowCallbacks {
    /// Callbacks that accept everything and cache nothing.
    pub fn noop() -> Self {
        WorkflowCallbacks {
            update_run: Arc::new(|_| Box::pin(async { true })),
            log_cache: Arc::new(|_| Box::pin(async { Ok("cch-000000".to_string()) })),
            list_cache: Arc::new(|_| Box::pin(async { Ok(Vec::new()) })),
        }
    }
}
