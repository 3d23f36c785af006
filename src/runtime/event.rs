//! Events flowing from job backends into a workflow runtime.

use chrono::{DateTime, Utc};

use crate::storage::{JobStatus, RunStatus, RuntimeView};

/// An event delivered on a runtime's channel.
///
/// Backends never mutate runtime state directly; every observation arrives
/// here and is applied by the runtime's single consumer.
#[derive(Debug, Clone)]
pub enum WorkflowEvent {
    JobUpdate(JobUpdate),
}

/// A job lifecycle observation for one step.
#[derive(Debug, Clone)]
pub struct JobUpdate {
    pub run_id: String,
    pub step_name: String,
    pub status: JobStatus,
    pub job_id: String,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub message: String,
}

impl JobUpdate {
    pub fn new(run_id: &str, step_name: &str, status: JobStatus, job_id: &str) -> Self {
        JobUpdate {
            run_id: run_id.to_string(),
            step_name: step_name.to_string(),
            status,
            job_id: job_id.to_string(),
            start_time: None,
            end_time: None,
            message: String::new(),
        }
    }

    pub fn started_now(mut self) -> Self {
        self.start_time = Some(Utc::now());
        self
    }

    pub fn ended_now(mut self) -> Self {
        self.end_time = Some(Utc::now());
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }
}

/// State pushed to the run controller after every runtime transition.
#[derive(Debug, Clone)]
pub struct RunUpdate {
    pub run_id: String,
    pub status: RunStatus,
    pub runtime_view: RuntimeView,
    pub message: String,
}
