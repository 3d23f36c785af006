//! Per-step state machine.
//!
//! Each DAG node owns one external job handle and progresses
//! `Created -> Pending -> Submitted -> Running -> terminal`. Terminal states
//! are sticky; regressive job observations are dropped silently.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::cache::{step_fingerprint, CacheQuery, CacheRecord};
use super::event::{JobUpdate, WorkflowEvent};
use super::WorkflowCallbacks;
use crate::error::{Error, Result};
use crate::fs::FsClient;
use crate::job::{JobBackend, JobSpec};
use crate::storage::{JobStatus, JobView};
use crate::workflow::{resolve_refs, ResolveContext, StepOutputs, StepSpec, SysVars};

/// Lifecycle states of one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepState {
    Created,
    Pending,
    Submitted,
    Running,
    Terminating,
    Succeeded,
    Failed,
    Terminated,
    Cancelled,
    Skipped,
}

impl StepState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StepState::Succeeded
                | StepState::Failed
                | StepState::Terminated
                | StepState::Cancelled
                | StepState::Skipped
        )
    }

    /// Succeeded outright or served from cache.
    pub fn is_successful(self) -> bool {
        matches!(self, StepState::Succeeded | StepState::Skipped)
    }

    /// Monotonic ordering used to reject out-of-order job observations.
    fn rank(self) -> u8 {
        match self {
            StepState::Created => 0,
            StepState::Pending => 1,
            StepState::Submitted => 2,
            StepState::Running => 3,
            StepState::Terminating => 4,
            _ => 5,
        }
    }

    fn from_job_status(status: JobStatus) -> StepState {
        match status {
            JobStatus::Pending => StepState::Pending,
            JobStatus::Running => StepState::Running,
            JobStatus::Succeeded => StepState::Succeeded,
            JobStatus::Failed => StepState::Failed,
            JobStatus::Terminated => StepState::Terminated,
            JobStatus::Terminating => StepState::Terminating,
            JobStatus::Cancelled => StepState::Cancelled,
            JobStatus::Skipped => StepState::Skipped,
        }
    }

    pub fn to_job_status(self) -> Option<JobStatus> {
        match self {
            StepState::Created => None,
            StepState::Pending | StepState::Submitted => Some(JobStatus::Pending),
            StepState::Running => Some(JobStatus::Running),
            StepState::Terminating => Some(JobStatus::Terminating),
            StepState::Succeeded => Some(JobStatus::Succeeded),
            StepState::Failed => Some(JobStatus::Failed),
            StepState::Terminated => Some(JobStatus::Terminated),
            StepState::Cancelled => Some(JobStatus::Cancelled),
            StepState::Skipped => Some(JobStatus::Skipped),
        }
    }
}

/// Shared context a step needs to submit its job.
pub struct StepContext {
    pub sys: SysVars,
    /// Resolved outputs of the step's transitive dependencies.
    pub upstream: HashMap<String, StepOutputs>,
    /// The step's own resolved parameters and output artifacts.
    pub own: StepOutputs,
    pub backend: Arc<dyn JobBackend>,
    pub fs: Arc<dyn FsClient>,
    pub events: mpsc::Sender<WorkflowEvent>,
    pub callbacks: WorkflowCallbacks,
    pub fs_id: String,
    /// Source identifier of the run, used as the cache scope.
    pub source: String,
    /// Workflow-level image; per-step docker_env overrides it.
    pub default_image: String,
}

/// One node of the running DAG.
pub struct Step {
    pub name: String,
    pub spec: StepSpec,
    pub state: StepState,
    pub job_id: String,
    pub submitted: bool,
    pub cached: bool,
    pub cache_run_id: Option<String>,
    pub fingerprint: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub message: String,
}

impl Step {
    pub fn new(name: impl Into<String>, spec: StepSpec) -> Self {
        Step {
            name: name.into(),
            spec,
            state: StepState::Created,
            job_id: String::new(),
            submitted: false,
            cached: false,
            cache_run_id: None,
            fingerprint: None,
            start_time: None,
            end_time: None,
            message: String::new(),
        }
    }

    /// Succeeded outright or served from cache.
    pub fn done(&self) -> bool {
        self.state.is_successful()
    }

    /// True iff the step is still `Created` and every dependency is done.
    pub fn ready(&self, steps: &std::collections::BTreeMap<String, Step>) -> bool {
        if self.state != StepState::Created {
            return false;
        }
        self.spec
            .deps
            .iter()
            .all(|dep| steps.get(dep).map(Step::done).unwrap_or(false))
    }

    /// Persisted snapshot of this step's job.
    pub fn job_view(&self) -> JobView {
        JobView {
            job_id: self.job_id.clone(),
            status: self.state.to_job_status(),
            start_time: self.start_time,
            end_time: self.end_time,
            cache_run_id: self.cache_run_id.clone(),
        }
    }

    /// Submit this step's job, consulting the cache first.
    ///
    /// Failures do not propagate: the step lands in `Failed` with the error
    /// recorded, and the runtime observes that like any other terminal state.
    pub async fn start(&mut self, ctx: &StepContext) {
        debug_assert_eq!(self.state, StepState::Created);

        let spec = match self.build_job_spec(ctx) {
            Ok(spec) => spec,
            Err(e) => {
                self.fail_local(format!("failed to resolve step[{}]: {}", self.name, e));
                return;
            }
        };

        if self.spec.cache.enable {
            match self.consult_cache(ctx, &spec).await {
                Ok(Some(cached_run_id)) => {
                    self.state = StepState::Skipped;
                    self.cached = true;
                    self.cache_run_id = Some(cached_run_id);
                    self.end_time = Some(Utc::now());
                    return;
                }
                Ok(None) => {}
                Err(e) => {
                    // A broken cache lookup degrades to a normal submission.
                    warn!(step = %self.name, "cache lookup failed: {}", e);
                }
            }
        }

        self.state = StepState::Pending;
        match ctx.backend.submit(spec, ctx.events.clone()).await {
            Ok(job_id) => {
                self.job_id = job_id;
                self.submitted = true;
                if self.state.rank() < StepState::Submitted.rank() {
                    self.state = StepState::Submitted;
                }
            }
            Err(e) => {
                self.fail_local(format!("failed to submit step[{}]: {}", self.name, e));
            }
        }
    }

    /// Request termination; unsubmitted steps are cancelled outright.
    pub async fn stop(&mut self, backend: &Arc<dyn JobBackend>) {
        if self.state.is_terminal() || self.state == StepState::Terminating {
            return;
        }
        if !self.submitted || self.job_id.is_empty() {
            self.state = StepState::Cancelled;
            self.end_time = Some(Utc::now());
            return;
        }
        if let Err(e) = backend.terminate(&self.job_id).await {
            warn!(step = %self.name, job_id = %self.job_id, "terminate failed: {}", e);
        }
        self.state = StepState::Terminating;
    }

    /// Reconcile a job observation; regressive transitions are dropped.
    pub fn on_job_event(&mut self, update: &JobUpdate) {
        let next = StepState::from_job_status(update.status);
        if self.state.is_terminal() {
            debug!(
                step = %self.name,
                "dropping job update [{}], step already terminal",
                update.status
            );
            return;
        }
        if next.rank() <= self.state.rank() && next != self.state {
            debug!(
                step = %self.name,
                "dropping out-of-order job update [{}]",
                update.status
            );
            return;
        }
        self.state = next;
        if !update.job_id.is_empty() {
            self.job_id = update.job_id.clone();
        }
        if update.start_time.is_some() {
            self.start_time = update.start_time;
        }
        if update.end_time.is_some() {
            self.end_time = update.end_time;
        }
        if !update.message.is_empty() {
            self.message = update.message.clone();
        }
    }

    /// Restore the step from a persisted job view for restart.
    ///
    /// A prior `Running`/`Terminating` view means the source run was not
    /// cleanly stopped; retrying it is refused.
    pub fn restore(&mut self, view: &JobView) -> Result<()> {
        match view.status {
            Some(JobStatus::Succeeded) => {
                self.state = StepState::Succeeded;
                self.job_id = view.job_id.clone();
                self.submitted = true;
                self.start_time = view.start_time;
                self.end_time = view.end_time;
            }
            Some(JobStatus::Skipped) => {
                self.state = StepState::Skipped;
                self.job_id = view.job_id.clone();
                self.submitted = true;
                self.cached = true;
                self.cache_run_id = view.cache_run_id.clone();
                self.end_time = view.end_time;
            }
            Some(status @ (JobStatus::Running | JobStatus::Terminating)) => {
                return Err(Error::ActionNotAllowed(format!(
                    "step[{}] has invalid status[{}], the prior run was not cleanly stopped",
                    self.name, status
                )));
            }
            // Anything else is re-queued from scratch.
            _ => self.reset(),
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.state = StepState::Created;
        self.job_id.clear();
        self.submitted = false;
        self.cached = false;
        self.cache_run_id = None;
        self.fingerprint = None;
        self.start_time = None;
        self.end_time = None;
        self.message.clear();
    }

    fn fail_local(&mut self, message: String) {
        warn!(step = %self.name, "{}", message);
        self.state = StepState::Failed;
        self.message = message;
        self.end_time = Some(Utc::now());
    }

    /// Resolve command, env and artifacts into a concrete job spec.
    fn build_job_spec(&self, ctx: &StepContext) -> Result<JobSpec> {
        // Input artifacts resolve first, against upstream outputs only, and
        // then become visible to the step's own command and env.
        let input_ctx = ResolveContext {
            sys: &ctx.sys,
            step_name: &self.name,
            upstream: &ctx.upstream,
            own: None,
        };
        let mut input_artifacts = std::collections::BTreeMap::new();
        for (key, value) in &self.spec.artifacts.input {
            input_artifacts.insert(
                key.clone(),
                resolve_refs(value, &input_ctx, "inputArtifacts")?,
            );
        }

        let mut own = ctx.own.clone();
        for (key, value) in &input_artifacts {
            own.artifacts
                .entry(key.clone())
                .or_insert_with(|| value.clone());
        }
        let resolve_ctx = ResolveContext {
            sys: &ctx.sys,
            step_name: &self.name,
            upstream: &ctx.upstream,
            own: Some(&own),
        };

        let command = resolve_refs(&self.spec.command, &resolve_ctx, "command")?;
        let mut env = std::collections::BTreeMap::new();
        for (key, value) in &self.spec.env {
            env.insert(key.clone(), resolve_refs(value, &resolve_ctx, "env")?);
        }
        // Jobs see the run's system variables in their environment.
        env.insert("PF_RUN_ID".to_string(), ctx.sys.run_id.clone());
        env.insert("PF_FS_ID".to_string(), ctx.sys.fs_id.clone());
        env.insert("PF_FS_NAME".to_string(), ctx.sys.fs_name.clone());
        env.insert("PF_USER_NAME".to_string(), ctx.sys.user_name.clone());
        env.insert("PF_STEP_NAME".to_string(), self.name.clone());

        let image = if self.spec.docker_env.is_empty() {
            ctx.default_image.clone()
        } else {
            self.spec.docker_env.clone()
        };

        Ok(JobSpec {
            run_id: ctx.sys.run_id.clone(),
            step_name: self.name.clone(),
            command,
            image,
            env,
            parameters: ctx.own.parameters.clone(),
            input_artifacts,
            output_artifacts: ctx.own.artifacts.clone(),
        })
    }

    /// Fingerprint the step and ask the cache collaborator for a prior run.
    async fn consult_cache(
        &mut self,
        ctx: &StepContext,
        spec: &JobSpec,
    ) -> Result<Option<String>> {
        let fingerprint = step_fingerprint(
            &ctx.fs,
            &ctx.fs_id,
            &spec.command,
            &spec.parameters,
            &spec.input_artifacts,
            &self.spec.cache.fs_scope,
        )
        .await?;
        self.fingerprint = Some(fingerprint.clone());

        let query = CacheQuery {
            fingerprint,
            fs_id: ctx.fs_id.clone(),
            step_name: self.name.clone(),
            source: ctx.source.clone(),
        };
        let rows = (ctx.callbacks.list_cache)(query).await?;
        let now = Utc::now();
        Ok(rows
            .into_iter()
            .find(|row| row.is_valid_at(now))
            .map(|row| row.run_id))
    }

    /// The record offered to the cache collaborator after success.
    pub fn cache_record(&self, ctx: &StepContext) -> Option<CacheRecord> {
        if !self.spec.cache.enable || self.cached {
            return None;
        }
        let fingerprint = self.fingerprint.clone()?;
        Some(CacheRecord {
            fingerprint,
            run_id: ctx.sys.run_id.clone(),
            step_name: self.name.clone(),
            fs_id: ctx.fs_id.clone(),
            source: ctx.source.clone(),
            expired_time: self.spec.cache.max_expired_time,
        })
    }
}
