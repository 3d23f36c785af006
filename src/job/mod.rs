//! Job backend abstraction.
//!
//! The runtime submits each step as one external job through a narrow
//! interface; backends report lifecycle changes only by sending events into
//! the runtime's channel, never by touching runtime state.

mod local;
#[cfg(test)]
pub(crate) mod mock;

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::runtime::WorkflowEvent;

pub use local::LocalBackend;

/// Everything a backend needs to place one step's job.
#[derive(Debug, Clone, Default)]
pub struct JobSpec {
    pub run_id: String,
    pub step_name: String,
    /// Fully-resolved command line; no `{{ ... }}` references remain.
    pub command: String,
    /// Container image for the job.
    pub image: String,
    pub env: BTreeMap<String, String>,
    pub parameters: BTreeMap<String, String>,
    pub input_artifacts: BTreeMap<String, String>,
    pub output_artifacts: BTreeMap<String, String>,
}

/// The placement backend the core delegates to.
#[async_trait]
pub trait JobBackend: Send + Sync {
    /// Submit a job. Lifecycle updates for the returned job id are delivered
    /// on `events`; the submitting runtime owns the receiving end.
    async fn submit(&self, spec: JobSpec, events: mpsc::Sender<WorkflowEvent>) -> Result<String>;

    /// Request termination of a previously-submitted job. The terminal
    /// `terminated` observation arrives through the event channel.
    async fn terminate(&self, job_id: &str) -> Result<()>;
}
