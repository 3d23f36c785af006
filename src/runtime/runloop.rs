//! The per-run event loop.
//!
//! One logical consumer pulls events from the run's channel and applies all
//! step and runtime mutations, so no step state is ever touched from two
//! places. Job backends run concurrently but communicate only by sending
//! events.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use super::event::{JobUpdate, RunUpdate, WorkflowEvent};
use super::step::{Step, StepContext, StepState};
use super::WorkflowCallbacks;
use crate::error::Result;
use crate::fs::FsClient;
use crate::job::JobBackend;
use crate::storage::{RunStatus, RuntimeView};
use crate::workflow::{BaseWorkflow, ExtraInfo, StepOutputs, SysVars, WorkflowSource};

/// Capacity of the per-run event channel; senders block when it is full.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// External collaborators a runtime delegates to.
#[derive(Clone)]
pub struct RuntimeDeps {
    pub backend: Arc<dyn JobBackend>,
    pub fs: Arc<dyn FsClient>,
}

/// A validated workflow bound to one run, with its live runtime.
///
/// Cloning is cheap and shares the runtime; the registry holds one clone so
/// stop/retry requests can reach it.
#[derive(Clone)]
pub struct Workflow {
    pub run_id: String,
    pub name: String,
    base: Arc<BaseWorkflow>,
    runtime: Arc<Mutex<WorkflowRuntime>>,
    events: mpsc::Sender<WorkflowEvent>,
    receiver: Arc<Mutex<Option<mpsc::Receiver<WorkflowEvent>>>>,
    stop_requested: Arc<AtomicBool>,
}

impl Workflow {
    /// Validate the source and build the runtime for `run_id`.
    pub fn new(
        source: WorkflowSource,
        run_id: impl Into<String>,
        entry: impl Into<String>,
        params: Option<BTreeMap<String, serde_json::Value>>,
        extra: Option<ExtraInfo>,
        callbacks: WorkflowCallbacks,
        deps: RuntimeDeps,
    ) -> Result<Workflow> {
        let run_id = run_id.into();
        let mut base = BaseWorkflow::new(source, run_id.clone(), entry, params, extra);
        base.validate()?;

        let run_steps = base.run_steps()?;
        let resolved = base.resolve_outputs()?;
        let trans = BaseWorkflow::transitive_deps(&run_steps);
        let steps: BTreeMap<String, Step> = run_steps
            .iter()
            .map(|(name, spec)| (name.clone(), Step::new(name.clone(), spec.clone())))
            .collect();

        let (events, receiver) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let stop_requested = Arc::new(AtomicBool::new(false));
        let runtime = WorkflowRuntime {
            run_id: run_id.clone(),
            status: RunStatus::Initiating,
            steps,
            resolved,
            trans,
            sys: base.sys_vars(),
            fs_id: base.extra.fs_id.clone(),
            source: base.extra.source.clone(),
            default_image: base.source.docker_env.clone(),
            backend: deps.backend,
            fs: deps.fs,
            callbacks,
            events: events.clone(),
            stop_requested: stop_requested.clone(),
            failure_observed: false,
            message: String::new(),
            start_time: None,
            end_time: None,
        };

        Ok(Workflow {
            run_id,
            name: base.name.clone(),
            base: Arc::new(base),
            runtime: Arc::new(Mutex::new(runtime)),
            events,
            receiver: Arc::new(Mutex::new(Some(receiver))),
            stop_requested,
        })
    }

    /// The validated, override-applied workflow source.
    pub fn base(&self) -> &BaseWorkflow {
        &self.base
    }

    /// Start the workflow and drive it to a final status.
    ///
    /// Returns once every step is terminal; callers that should not block
    /// spawn this onto a task.
    pub async fn start(&self) {
        {
            let mut rt = self.runtime.lock().await;
            rt.status = RunStatus::Pending;
            rt.start_time = Some(Utc::now());
            info!(run_id = %self.run_id, "starting workflow");
            rt.scan_and_start().await;
            rt.persist().await;
            if rt.all_terminal() {
                rt.finalize().await;
                return;
            }
        }
        self.run_event_loop().await;
    }

    /// Resume a run whose steps were restored via [`Workflow::set_runtime_view`].
    ///
    /// Steps restored as succeeded are never resubmitted; reset steps are
    /// admitted for scheduling as their dependencies allow.
    pub async fn restart(&self) {
        {
            let mut rt = self.runtime.lock().await;
            rt.status = RunStatus::Pending;
            rt.start_time = Some(Utc::now());
            info!(run_id = %self.run_id, "restarting workflow");
            rt.scan_and_start().await;
            rt.persist().await;
            if rt.all_terminal() {
                rt.finalize().await;
                return;
            }
        }
        self.run_event_loop().await;
    }

    /// Load a persisted runtime view before restart.
    ///
    /// Fails when any step was left `running`/`terminating`: the source run
    /// was not cleanly stopped and must not be retried.
    pub async fn set_runtime_view(&self, view: &RuntimeView) -> Result<()> {
        let mut rt = self.runtime.lock().await;
        for (name, step) in rt.steps.iter_mut() {
            if let Some(job_view) = view.get(name) {
                step.restore(job_view)?;
            }
        }
        Ok(())
    }

    /// Request cooperative termination.
    ///
    /// New step admissions cease immediately; the event loop drains until
    /// every in-flight job reports terminal.
    pub async fn stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
        let mut rt = self.runtime.lock().await;
        if rt.status.is_final() {
            return;
        }
        info!(run_id = %self.run_id, "stopping workflow");
        rt.status = RunStatus::Terminating;
        rt.stop_all().await;
        rt.persist().await;
        if rt.all_terminal() {
            rt.finalize().await;
        }
    }

    /// Current aggregate status.
    pub async fn status(&self) -> RunStatus {
        self.runtime.lock().await.status
    }

    /// Current persisted view of every step.
    pub async fn runtime_view(&self) -> RuntimeView {
        self.runtime.lock().await.runtime_view()
    }

    /// Number of steps in the effective DAG.
    pub async fn step_count(&self) -> usize {
        self.runtime.lock().await.steps.len()
    }

    async fn run_event_loop(&self) {
        let mut receiver = match self.receiver.lock().await.take() {
            Some(receiver) => receiver,
            // Another caller already drives this runtime.
            None => return,
        };
        while let Some(event) = receiver.recv().await {
            let WorkflowEvent::JobUpdate(update) = event;
            let mut rt = self.runtime.lock().await;
            rt.handle_job_update(update).await;
            if rt.status.is_final() {
                break;
            }
        }
        *self.receiver.lock().await = Some(receiver);
    }
}

/// Mutable state of one run, owned by its single event consumer.
struct WorkflowRuntime {
    run_id: String,
    status: RunStatus,
    steps: BTreeMap<String, Step>,
    /// Concrete parameter/artifact values per step, fixed after validation.
    resolved: HashMap<String, StepOutputs>,
    trans: HashMap<String, HashSet<String>>,
    sys: SysVars,
    fs_id: String,
    source: String,
    default_image: String,
    backend: Arc<dyn JobBackend>,
    fs: Arc<dyn FsClient>,
    callbacks: WorkflowCallbacks,
    events: mpsc::Sender<WorkflowEvent>,
    stop_requested: Arc<AtomicBool>,
    failure_observed: bool,
    message: String,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
}

impl WorkflowRuntime {
    fn step_context(&self, step_name: &str) -> StepContext {
        let upstream = self
            .trans
            .get(step_name)
            .map(|deps| {
                deps.iter()
                    .filter_map(|d| self.resolved.get(d).map(|o| (d.clone(), o.clone())))
                    .collect()
            })
            .unwrap_or_default();
        StepContext {
            sys: self.sys.clone(),
            upstream,
            own: self.resolved.get(step_name).cloned().unwrap_or_default(),
            backend: self.backend.clone(),
            fs: self.fs.clone(),
            events: self.events.clone(),
            callbacks: self.callbacks.clone(),
            fs_id: self.fs_id.clone(),
            source: self.source.clone(),
            default_image: self.default_image.clone(),
        }
    }

    /// Start every step whose dependencies are satisfied.
    ///
    /// Cache hits skip steps synchronously, which can release further
    /// dependents, so the scan repeats until it admits nothing new.
    async fn scan_and_start(&mut self) {
        if self.stop_requested.load(Ordering::SeqCst) || self.failure_observed {
            return;
        }
        loop {
            let ready: Vec<String> = self
                .steps
                .values()
                .filter(|s| s.ready(&self.steps))
                .map(|s| s.name.clone())
                .collect();
            if ready.is_empty() {
                return;
            }
            for name in ready {
                let ctx = self.step_context(&name);
                let step = self.steps.get_mut(&name).expect("ready step exists");
                step.start(&ctx).await;
                match step.state {
                    StepState::Skipped => {
                        info!(run_id = %self.run_id, step = %name, "step served from cache");
                    }
                    StepState::Failed => {
                        self.failure_observed = true;
                        if self.message.is_empty() {
                            self.message = step.message.clone();
                        }
                        self.cancel_unstarted();
                        return;
                    }
                    _ => {
                        if self.status == RunStatus::Pending {
                            self.status = RunStatus::Running;
                        }
                    }
                }
            }
        }
    }

    async fn handle_job_update(&mut self, update: JobUpdate) {
        let Some(step) = self.steps.get_mut(&update.step_name) else {
            warn!(run_id = %self.run_id, step = %update.step_name, "job update for unknown step");
            return;
        };
        let before = step.state;
        step.on_job_event(&update);
        let after = step.state;
        if before == after {
            return;
        }
        debug!(
            run_id = %self.run_id,
            step = %update.step_name,
            "step transition {:?} -> {:?}", before, after
        );

        if after == StepState::Failed {
            self.failure_observed = true;
            if self.message.is_empty() {
                self.message = format!(
                    "step[{}] failed: {}",
                    update.step_name,
                    self.steps[&update.step_name].message
                );
            }
        }

        if after == StepState::Succeeded {
            let ctx = self.step_context(&update.step_name);
            let record = self
                .steps
                .get(&update.step_name)
                .and_then(|s| s.cache_record(&ctx));
            if let Some(record) = record {
                if let Err(e) = (self.callbacks.log_cache)(record).await {
                    warn!(run_id = %self.run_id, step = %update.step_name, "cache record failed: {}", e);
                }
            }
        }

        if self.failure_observed || self.stop_requested.load(Ordering::SeqCst) {
            self.cancel_unstarted();
        } else {
            self.scan_and_start().await;
        }

        self.persist().await;
        if self.all_terminal() {
            self.finalize().await;
        }
    }

    /// Steps that never submitted cannot run anymore once admission stops.
    fn cancel_unstarted(&mut self) {
        for step in self.steps.values_mut() {
            if step.state == StepState::Created {
                step.state = StepState::Cancelled;
                step.end_time = Some(Utc::now());
            }
        }
    }

    async fn stop_all(&mut self) {
        let names: Vec<String> = self.steps.keys().cloned().collect();
        for name in names {
            let backend = self.backend.clone();
            let step = self.steps.get_mut(&name).expect("step exists");
            step.stop(&backend).await;
        }
    }

    fn all_terminal(&self) -> bool {
        self.steps.values().all(|s| s.state.is_terminal())
    }

    fn runtime_view(&self) -> RuntimeView {
        self.steps
            .iter()
            .map(|(name, step)| (name.clone(), step.job_view()))
            .collect()
    }

    async fn persist(&mut self) {
        let update = RunUpdate {
            run_id: self.run_id.clone(),
            status: self.status,
            runtime_view: self.runtime_view(),
            message: self.message.clone(),
        };
        if !(self.callbacks.update_run)(update).await {
            warn!(run_id = %self.run_id, "run update rejected by controller");
        }
    }

    /// Compute the aggregate final status once every step is terminal.
    async fn finalize(&mut self) {
        if self.status.is_final() {
            return;
        }
        let any_failed = self
            .steps
            .values()
            .any(|s| s.state == StepState::Failed);
        let all_done = self.steps.values().all(Step::done);
        self.status = if any_failed {
            RunStatus::Failed
        } else if all_done {
            RunStatus::Succeeded
        } else {
            // Explicit stop dominates; cancelled-only runs end the same way.
            RunStatus::Terminated
        };
        self.end_time = Some(Utc::now());
        info!(run_id = %self.run_id, status = %self.status, "workflow finished");
        self.persist().await;
    }
}
