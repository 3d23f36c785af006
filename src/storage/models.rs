//! Storage models: persisted runs, job views and their wire statuses.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::workflow::WorkflowSource;

/// Run status, as persisted and served on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Initiating,
    Pending,
    Running,
    Terminating,
    Succeeded,
    Failed,
    Terminated,
}

impl RunStatus {
    /// Final statuses never change again.
    pub fn is_final(self) -> bool {
        matches!(
            self,
            RunStatus::Succeeded | RunStatus::Failed | RunStatus::Terminated
        )
    }

    /// Statuses eligible for resume at process startup.
    pub const ACTIVE: [RunStatus; 4] = [
        RunStatus::Initiating,
        RunStatus::Pending,
        RunStatus::Running,
        RunStatus::Terminating,
    ];
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunStatus::Initiating => "initiating",
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Terminating => "terminating",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
            RunStatus::Terminated => "terminated",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "initiating" => Ok(RunStatus::Initiating),
            "pending" => Ok(RunStatus::Pending),
            "running" => Ok(RunStatus::Running),
            "terminating" => Ok(RunStatus::Terminating),
            "succeeded" => Ok(RunStatus::Succeeded),
            "failed" => Ok(RunStatus::Failed),
            "terminated" => Ok(RunStatus::Terminated),
            other => Err(format!("unknown run status: {}", other)),
        }
    }
}

/// External job status reported by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Terminated,
    Terminating,
    Cancelled,
    Skipped,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded
                | JobStatus::Failed
                | JobStatus::Terminated
                | JobStatus::Cancelled
                | JobStatus::Skipped
        )
    }

    /// Succeeded or served from cache.
    pub fn is_successful(self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Skipped)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Terminated => "terminated",
            JobStatus::Terminating => "terminating",
            JobStatus::Cancelled => "cancelled",
            JobStatus::Skipped => "skipped",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "succeeded" => Ok(JobStatus::Succeeded),
            "failed" => Ok(JobStatus::Failed),
            "terminated" => Ok(JobStatus::Terminated),
            "terminating" => Ok(JobStatus::Terminating),
            "cancelled" => Ok(JobStatus::Cancelled),
            "skipped" => Ok(JobStatus::Skipped),
            other => Err(format!("unknown job status: {}", other)),
        }
    }
}

/// Persisted snapshot of one step's external job.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobView {
    #[serde(default)]
    pub job_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<JobStatus>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,

    /// Run this step's result was reused from, when served from cache.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_run_id: Option<String>,
}

/// Step name -> job view, persisted on the run record.
pub type RuntimeView = BTreeMap<String, JobView>;

/// One execution instance of a workflow source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    /// Database primary key; backs the opaque pagination marker.
    #[serde(skip)]
    pub pk: i64,

    pub id: String,
    pub name: String,

    /// Source identifier: yaml hash, pipeline id or yaml path.
    pub source: String,

    pub user_name: String,
    pub fs_name: String,
    pub fs_id: String,

    #[serde(default)]
    pub description: String,

    /// Optional entry step restricting the DAG.
    #[serde(default)]
    pub entry: String,

    /// Request-level parameter overrides.
    #[serde(default)]
    pub parameters: BTreeMap<String, serde_json::Value>,

    /// The effective YAML text this run executes.
    pub run_yaml: String,

    /// Parsed source; reconstructed from `run_yaml`, never persisted.
    #[serde(skip)]
    pub workflow_source: Option<WorkflowSource>,

    #[serde(default)]
    pub runtime_view: RuntimeView,

    /// Resolved image URL once preparation finished.
    #[serde(default)]
    pub image_url: String,

    /// Last error text, if any.
    #[serde(default)]
    pub message: String,

    pub status: RunStatus,

    pub create_time: DateTime<Utc>,

    /// When the run last left `initiating`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activate_time: Option<DateTime<Utc>>,

    pub update_time: DateTime<Utc>,
}

/// Listing projection of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunBrief {
    pub run_id: String,
    pub name: String,
    pub source: String,
    pub user_name: String,
    pub fs_name: String,
    pub message: String,
    pub status: RunStatus,
    pub create_time: DateTime<Utc>,
    pub activate_time: Option<DateTime<Utc>>,
}

impl From<&Run> for RunBrief {
    fn from(run: &Run) -> Self {
        RunBrief {
            run_id: run.id.clone(),
            name: run.name.clone(),
            source: run.source.clone(),
            user_name: run.user_name.clone(),
            fs_name: run.fs_name.clone(),
            message: run.message.clone(),
            status: run.status,
            create_time: run.create_time,
            activate_time: run.activate_time,
        }
    }
}

/// A stored pipeline: a named, reusable workflow YAML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pipeline {
    #[serde(skip)]
    pub pk: i64,
    pub id: String,
    pub name: String,
    pub user_name: String,
    pub pipeline_yaml: String,
    pub create_time: DateTime<Utc>,
}

/// One recorded cache entry for a completed step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunCacheRow {
    #[serde(skip)]
    pub pk: i64,
    pub id: String,
    pub fingerprint: String,
    pub run_id: String,
    pub step_name: String,
    pub fs_id: String,
    /// Source identifier of the producing run.
    pub source: String,
    /// Seconds of validity; negative means never expires.
    pub expired_time: i64,
    pub create_time: DateTime<Utc>,
}

impl RunCacheRow {
    /// Whether the entry is still valid at `now`.
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        if self.expired_time < 0 {
            return true;
        }
        now.signed_duration_since(self.create_time).num_seconds() <= self.expired_time
    }
}

/// Filters for listing runs.
#[derive(Debug, Clone, Default)]
pub struct RunQuery {
    /// Exclusive lower bound on pk, decoded from the pagination marker.
    pub pk_marker: i64,
    pub max_keys: usize,
    pub user_filter: Vec<String>,
    pub fs_filter: Vec<String>,
    pub run_filter: Vec<String>,
    pub name_filter: Vec<String>,
}
