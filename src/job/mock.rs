//! Scriptable backend for runtime tests.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};

use super::{JobBackend, JobSpec};
use crate::error::Result;
use crate::runtime::{JobUpdate, WorkflowEvent};
use crate::storage::JobStatus;

/// What the mock does with a submitted step.
#[derive(Debug, Clone, Copy)]
pub(crate) enum MockOutcome {
    /// Report running, then the given terminal status.
    Finish(JobStatus),
    /// Report running and stay in flight until terminated.
    Hold,
}

struct TrackedJob {
    run_id: String,
    step_name: String,
    events: mpsc::Sender<WorkflowEvent>,
}

/// In-memory backend with per-step scripted outcomes.
///
/// Steps without a configured outcome succeed immediately.
#[derive(Clone, Default)]
pub(crate) struct MockBackend {
    outcomes: Arc<Mutex<HashMap<String, MockOutcome>>>,
    jobs: Arc<Mutex<HashMap<String, TrackedJob>>>,
    counter: Arc<Mutex<u64>>,
}

impl MockBackend {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) async fn set_outcome(&self, step_name: &str, outcome: MockOutcome) {
        self.outcomes
            .lock()
            .await
            .insert(step_name.to_string(), outcome);
    }
}

#[async_trait::async_trait]
impl JobBackend for MockBackend {
    async fn submit(&self, spec: JobSpec, events: mpsc::Sender<WorkflowEvent>) -> Result<String> {
        let job_id = {
            let mut counter = self.counter.lock().await;
            *counter += 1;
            format!("mock-job-{:03}", *counter)
        };
        let outcome = self
            .outcomes
            .lock()
            .await
            .get(&spec.step_name)
            .copied()
            .unwrap_or(MockOutcome::Finish(JobStatus::Succeeded));

        self.jobs.lock().await.insert(
            job_id.clone(),
            TrackedJob {
                run_id: spec.run_id.clone(),
                step_name: spec.step_name.clone(),
                events: events.clone(),
            },
        );

        let run_id = spec.run_id.clone();
        let step_name = spec.step_name.clone();
        let id = job_id.clone();
        tokio::spawn(async move {
            let running =
                JobUpdate::new(&run_id, &step_name, JobStatus::Running, &id).started_now();
            let _ = events.send(WorkflowEvent::JobUpdate(running)).await;
            if let MockOutcome::Finish(status) = outcome {
                let done = JobUpdate::new(&run_id, &step_name, status, &id).ended_now();
                let _ = events.send(WorkflowEvent::JobUpdate(done)).await;
            }
        });

        Ok(job_id)
    }

    async fn terminate(&self, job_id: &str) -> Result<()> {
        if let Some(job) = self.jobs.lock().await.remove(job_id) {
            let update =
                JobUpdate::new(&job.run_id, &job.step_name, JobStatus::Terminated, job_id)
                    .ended_now();
            let _ = job.events.send(WorkflowEvent::JobUpdate(update)).await;
        }
        Ok(())
    }
}
