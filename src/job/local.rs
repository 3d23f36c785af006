//! Single-node job backend running step commands as local processes.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;

use tokio::process::Command;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, warn};
use uuid::Uuid;

use super::{JobBackend, JobSpec};
use crate::error::{Error, Result};
use crate::runtime::{JobUpdate, WorkflowEvent};
use crate::storage::JobStatus;

/// Runs each job as `sh -c <command>` on the local host.
///
/// Suitable for single-node deployments and demos; cluster placement is a
/// different implementation of the same trait.
#[derive(Clone, Default)]
pub struct LocalBackend {
    jobs: Arc<Mutex<HashMap<String, oneshot::Sender<()>>>>,
}

impl LocalBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl JobBackend for LocalBackend {
    async fn submit(&self, spec: JobSpec, events: mpsc::Sender<WorkflowEvent>) -> Result<String> {
        let job_id = format!("job-{}", Uuid::new_v4().simple());

        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg(&spec.command)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        for (key, value) in spec.env.iter().chain(spec.parameters.iter()) {
            command.env(key, value);
        }

        let mut child = command.spawn().map_err(|e| {
            Error::Internal(format!(
                "failed to spawn job for step[{}]: {}",
                spec.step_name, e
            ))
        })?;

        let (kill_tx, mut kill_rx) = oneshot::channel();
        self.jobs.lock().await.insert(job_id.clone(), kill_tx);

        let jobs = self.jobs.clone();
        let id = job_id.clone();
        let run_id = spec.run_id.clone();
        let step_name = spec.step_name.clone();
        tokio::spawn(async move {
            let running = JobUpdate::new(&run_id, &step_name, JobStatus::Running, &id).started_now();
            if events.send(WorkflowEvent::JobUpdate(running)).await.is_err() {
                debug!(job_id = %id, "runtime gone before job started");
            }

            let update = tokio::select! {
                status = child.wait() => match status {
                    Ok(code) if code.success() => {
                        JobUpdate::new(&run_id, &step_name, JobStatus::Succeeded, &id).ended_now()
                    }
                    Ok(code) => JobUpdate::new(&run_id, &step_name, JobStatus::Failed, &id)
                        .ended_now()
                        .with_message(format!("job exited with {}", code)),
                    Err(e) => JobUpdate::new(&run_id, &step_name, JobStatus::Failed, &id)
                        .ended_now()
                        .with_message(format!("failed to wait for job: {}", e)),
                },
                _ = &mut kill_rx => {
                    if let Err(e) = child.kill().await {
                        warn!(job_id = %id, "failed to kill job process: {}", e);
                    }
                    JobUpdate::new(&run_id, &step_name, JobStatus::Terminated, &id)
                        .ended_now()
                        .with_message("job terminated on request")
                }
            };

            jobs.lock().await.remove(&id);
            if events.send(WorkflowEvent::JobUpdate(update)).await.is_err() {
                debug!(job_id = %id, "runtime gone before job finished");
            }
        });

        Ok(job_id)
    }

    async fn terminate(&self, job_id: &str) -> Result<()> {
        match self.jobs.lock().await.remove(job_id) {
            Some(kill) => {
                // The watcher emits the terminal event once the process dies.
                let _ = kill.send(());
                Ok(())
            }
            None => Err(Error::Internal(format!(
                "job[{}] is not tracked by the local backend",
                job_id
            ))),
        }
    }
}
