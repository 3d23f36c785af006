//! The run controller: binds create/stop/retry/delete requests to persisted
//! run records and live workflow runtimes.

use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};

use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::Utc;
use regex_lite::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument, warn};

use super::marker;
use crate::config::FsConfig;
use crate::error::{Error, Result};
use crate::fs::{self, FsClient};
use crate::image::{ImageHandler, ImagePrepCallback, ImagePrepRequest};
use crate::job::JobBackend;
use crate::runtime::{
    RunUpdate, RuntimeDeps, RuntimeRegistry, Workflow, WorkflowCallbacks,
};
use crate::storage::{
    JobStatus, JobView, Run, RunBrief, RunPatch, RunQuery, RunStatus, SqliteStorage,
};
use crate::workflow::{parse_workflow_source, ExtraInfo, WorkflowSource};

/// The user every request acts as.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub user_name: String,
}

pub const ROOT_USER: &str = "root";

pub fn is_root(user_name: &str) -> bool {
    user_name == ROOT_USER
}

fn run_name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,127}$").expect("valid regex"))
}

/// Request to create one run.
///
/// The workflow source comes from exactly one of three places, by priority:
/// inline base64 yaml, a stored pipeline id, or a yaml path on the run's
/// filesystem (default `./run.yaml`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateRunRequest {
    pub fs_name: String,
    /// Only honored for the root user, acting on another user's filesystem.
    #[serde(default)]
    pub user_name: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, rename = "desc")]
    pub description: String,
    #[serde(default)]
    pub entry: String,
    #[serde(default)]
    pub parameters: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub docker_env: String,
    /// Base64-encoded yaml; survives clients that mangle raw yaml.
    #[serde(default)]
    pub run_yaml_raw: String,
    #[serde(default)]
    pub pipeline_id: String,
    #[serde(default)]
    pub run_yaml_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateRunResponse {
    pub run_id: String,
}

#[derive(Debug, Clone, Default)]
pub struct ListRunRequest {
    pub marker: Option<String>,
    pub max_keys: usize,
    pub user_filter: Vec<String>,
    pub fs_filter: Vec<String>,
    pub run_filter: Vec<String>,
    pub name_filter: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListRunResponse {
    pub run_list: Vec<RunBrief>,
    pub next_marker: Option<String>,
    pub is_truncated: bool,
    pub max_keys: usize,
}

const DEFAULT_LIST_MAX_KEYS: usize = 50;

/// Orchestrates the run lifecycle against its collaborators.
#[derive(Clone)]
pub struct RunController {
    storage: SqliteStorage,
    registry: RuntimeRegistry,
    fs: Arc<dyn FsClient>,
    images: Arc<dyn ImageHandler>,
    backend: Arc<dyn JobBackend>,
    fs_config: FsConfig,
}

impl RunController {
    pub fn new(
        storage: SqliteStorage,
        registry: RuntimeRegistry,
        fs: Arc<dyn FsClient>,
        images: Arc<dyn ImageHandler>,
        backend: Arc<dyn JobBackend>,
        fs_config: FsConfig,
    ) -> Self {
        RunController {
            storage,
            registry,
            fs,
            images,
            backend,
            fs_config,
        }
    }

    /// Validate the request, persist a run and start it once its image is
    /// ready. Validation failures leave no run row behind.
    #[instrument(name = "run.create", skip(self, ctx, req), fields(user = %ctx.user_name))]
    pub async fn create_run(
        &self,
        ctx: &RequestContext,
        req: &CreateRunRequest,
    ) -> Result<CreateRunResponse> {
        // Root may act on behalf of another user's filesystem.
        let fs_owner = if is_root(&ctx.user_name) && !req.user_name.is_empty() {
            req.user_name.clone()
        } else {
            ctx.user_name.clone()
        };
        let fs_id = fs::fs_id(&fs_owner, &req.fs_name);

        let (wfs, source, run_yaml) = self.build_workflow_source(ctx, req, &fs_id).await?;
        if !wfs.name.is_empty() && !run_name_pattern().is_match(&wfs.name) {
            return Err(Error::InvalidNamePattern(format!(
                "run name[{}] is illegal, expected [A-Za-z_][A-Za-z0-9_]*",
                wfs.name
            )));
        }

        let now = Utc::now();
        let mut run = Run {
            pk: 0,
            id: String::new(),
            name: wfs.name.clone(),
            source,
            user_name: ctx.user_name.clone(),
            fs_name: req.fs_name.clone(),
            fs_id,
            description: req.description.clone(),
            entry: req.entry.clone(),
            parameters: req.parameters.clone(),
            run_yaml,
            workflow_source: Some(wfs),
            runtime_view: Default::default(),
            image_url: String::new(),
            message: String::new(),
            status: RunStatus::Initiating,
            create_time: now,
            activate_time: None,
            update_time: now,
        };

        // Full validation before anything is persisted. The run id is still
        // empty, so this instance never lands in the registry.
        self.build_workflow(&run, false)?;

        let run_id = self.storage.create_run(&mut run).await?;
        info!(run_id = %run_id, "run created");

        if let Err(e) = self.handle_image_and_start(run, false).await {
            // The failure is already recorded on the run; creation succeeded.
            error!(run_id = %run_id, "starting run failed: {}", e);
        }
        Ok(CreateRunResponse { run_id })
    }

    /// Fetch one run; non-root users only see their own.
    pub async fn get_run(&self, ctx: &RequestContext, run_id: &str) -> Result<Run> {
        let run = self.storage.get_run(run_id).await?;
        if !is_root(&ctx.user_name) && ctx.user_name != run.user_name {
            return Err(Error::AccessDenied(format!(
                "user[{}] has no access to run[{}]",
                ctx.user_name, run_id
            )));
        }
        Ok(run)
    }

    /// List runs with an opaque, encrypted pagination marker.
    pub async fn list_runs(
        &self,
        ctx: &RequestContext,
        req: &ListRunRequest,
    ) -> Result<ListRunResponse> {
        let pk_marker = match req.marker.as_deref() {
            Some(marker) if !marker.is_empty() => marker::decrypt_pk(marker)?,
            _ => 0,
        };
        let max_keys = if req.max_keys == 0 {
            DEFAULT_LIST_MAX_KEYS
        } else {
            req.max_keys
        };
        // Normal users list only their own runs.
        let user_filter = if is_root(&ctx.user_name) {
            req.user_filter.clone()
        } else {
            vec![ctx.user_name.clone()]
        };

        let runs = self
            .storage
            .list_runs(&RunQuery {
                pk_marker,
                max_keys,
                user_filter,
                fs_filter: req.fs_filter.clone(),
                run_filter: req.run_filter.clone(),
                name_filter: req.name_filter.clone(),
            })
            .await?;

        let mut response = ListRunResponse {
            run_list: runs.iter().map(RunBrief::from).collect(),
            next_marker: None,
            is_truncated: false,
            max_keys,
        };
        if let Some(last) = runs.last() {
            if last.pk != self.storage.get_last_run_pk().await? {
                response.next_marker = Some(marker::encrypt_pk(last.pk)?);
                response.is_truncated = true;
            }
        }
        Ok(response)
    }

    /// Request cooperative termination of a live run.
    #[instrument(name = "run.stop", skip(self, ctx))]
    pub async fn stop_run(&self, ctx: &RequestContext, run_id: &str) -> Result<()> {
        let run = self.get_run(ctx, run_id).await?;
        if run.status == RunStatus::Terminating || run.status.is_final() {
            return Err(Error::ActionNotAllowed(format!(
                "cannot stop run[{}] in status[{}]",
                run_id, run.status
            )));
        }
        let workflow = match self.registry.get(run_id) {
            Some(workflow) => workflow,
            None if run.status == RunStatus::Initiating => {
                // Image preparation is still in flight, so no runtime exists
                // to signal. Terminate the record directly; the preparation
                // callback observes the terminal status and never starts
                // the workflow.
                self.storage
                    .update_run_status(
                        run_id,
                        RunStatus::Terminated,
                        Some("run stopped before its runtime started".to_string()),
                    )
                    .await?;
                info!(run_id = %run_id, "run stopped during image preparation");
                return Ok(());
            }
            None => {
                return Err(Error::Internal(format!(
                    "runtime for run[{}] is lost",
                    run_id
                )))
            }
        };
        self.storage
            .update_run_status(run_id, RunStatus::Terminating, None)
            .await?;
        workflow.stop().await;
        debug!(run_id = %run_id, "stop requested");
        Ok(())
    }

    /// Retry a failed or terminated run by resetting its steps and
    /// restarting the workflow.
    #[instrument(name = "run.retry", skip(self, ctx))]
    pub async fn retry_run(&self, ctx: &RequestContext, run_id: &str) -> Result<()> {
        let mut run = self.get_run(ctx, run_id).await?;
        if !matches!(run.status, RunStatus::Failed | RunStatus::Terminated) {
            return Err(Error::ActionNotAllowed(format!(
                "run[{}] has status[{}], only failed or terminated runs can retry",
                run_id, run.status
            )));
        }
        self.reset_run_steps(&mut run).await?;
        self.resume_run(run).await
    }

    /// Delete a run in final status; the runtime is assumed discarded.
    pub async fn delete_run(&self, ctx: &RequestContext, run_id: &str) -> Result<()> {
        let run = self.get_run(ctx, run_id).await?;
        if !run.status.is_final() {
            return Err(Error::ActionNotAllowed(format!(
                "run[{}] is in status[{}], only final runs can be deleted",
                run_id, run.status
            )));
        }
        self.storage.delete_run(run_id).await
    }

    /// Reconstruct and resume every non-final run at process startup.
    ///
    /// Resume runs asynchronously; one failing run is logged and skipped,
    /// never aborting the sweep.
    pub async fn init_and_resume(&self) -> Result<()> {
        let runs = self.storage.list_runs_by_status(&RunStatus::ACTIVE).await?;
        if runs.is_empty() {
            info!("no active runs to resume");
            return Ok(());
        }
        info!(count = runs.len(), "resuming active runs");
        let controller = self.clone();
        tokio::spawn(async move {
            for run in runs {
                let run_id = run.id.clone();
                debug!(run_id = %run_id, status = %run.status, "resuming run");
                if let Err(e) = controller.resume_run(run).await {
                    warn!(run_id = %run_id, "resume failed, skipped: {}", e);
                }
            }
        });
        Ok(())
    }

    // ----- internals -----

    /// Assemble the workflow source with fixed priority:
    /// inline base64 > pipeline id > filesystem yaml path.
    async fn build_workflow_source(
        &self,
        ctx: &RequestContext,
        req: &CreateRunRequest,
        fs_id: &str,
    ) -> Result<(WorkflowSource, String, String)> {
        let (run_yaml, source) = if !req.run_yaml_raw.is_empty() {
            let decoded = STANDARD.decode(&req.run_yaml_raw).map_err(|e| {
                Error::Validation(format!("decoding runYamlRaw failed: {}", e))
            })?;
            let yaml = String::from_utf8(decoded)
                .map_err(|e| Error::Validation(format!("runYamlRaw is not utf-8: {}", e)))?;
            let digest = md5::compute(yaml.as_bytes());
            (yaml, format!("{:x}", digest))
        } else if !req.pipeline_id.is_empty() {
            let pipeline = self.storage.get_pipeline(&req.pipeline_id).await?;
            if !is_root(&ctx.user_name) && pipeline.user_name != ctx.user_name {
                return Err(Error::AccessDenied(format!(
                    "user[{}] has no access to pipeline[{}]",
                    ctx.user_name, req.pipeline_id
                )));
            }
            (pipeline.pipeline_yaml, pipeline.id)
        } else {
            let path = if req.run_yaml_path.is_empty() {
                self.fs_config.default_run_yaml_path.clone()
            } else {
                req.run_yaml_path.clone()
            };
            let bytes = self.fs.read_file(fs_id, &path).await?;
            let yaml = String::from_utf8(bytes)
                .map_err(|e| Error::Validation(format!("run yaml is not utf-8: {}", e)))?;
            (yaml, path)
        };

        let mut wfs = parse_workflow_source(&run_yaml)?;
        if !req.name.is_empty() {
            wfs.name = req.name.clone();
        }
        if !req.docker_env.is_empty() {
            wfs.docker_env = req.docker_env.clone();
        }
        Ok((wfs, source, run_yaml))
    }

    /// Re-derive the parsed source from the persisted yaml text.
    fn source_from_run(&self, run: &Run) -> Result<WorkflowSource> {
        let mut wfs = parse_workflow_source(&run.run_yaml)?;
        if !run.name.is_empty() {
            wfs.name = run.name.clone();
        }
        if !run.image_url.is_empty() {
            wfs.docker_env = run.image_url.clone();
        }
        Ok(wfs)
    }

    /// Build (and optionally register) the workflow for a run.
    fn build_workflow(&self, run: &Run, register: bool) -> Result<Workflow> {
        let source = run.workflow_source.clone().ok_or_else(|| {
            Error::Internal(format!("run[{}] is missing its parsed source", run.id))
        })?;
        let extra = ExtraInfo {
            source: run.source.clone(),
            fs_id: run.fs_id.clone(),
            fs_name: run.fs_name.clone(),
            user_name: run.user_name.clone(),
        };
        let workflow = Workflow::new(
            source,
            run.id.clone(),
            run.entry.clone(),
            Some(run.parameters.clone()),
            Some(extra),
            self.workflow_callbacks(),
            RuntimeDeps {
                backend: self.backend.clone(),
                fs: self.fs.clone(),
            },
        )?;
        if register && !run.id.is_empty() {
            self.registry.insert(&run.id, workflow.clone());
        }
        Ok(workflow)
    }

    /// Capabilities the runtime calls back into: persistence and the cache.
    fn workflow_callbacks(&self) -> WorkflowCallbacks {
        let update_storage = self.storage.clone();
        let log_storage = self.storage.clone();
        let list_storage = self.storage.clone();
        WorkflowCallbacks {
            update_run: Arc::new(move |update: RunUpdate| {
                let storage = update_storage.clone();
                Box::pin(async move {
                    let patch = RunPatch {
                        status: Some(update.status),
                        message: if update.message.is_empty() {
                            None
                        } else {
                            Some(update.message)
                        },
                        runtime_view: Some(update.runtime_view),
                        image_url: None,
                        touch_activate_time: true,
                    };
                    match storage.update_run(&update.run_id, patch).await {
                        Ok(()) => true,
                        Err(e) => {
                            error!(run_id = %update.run_id, "persisting run update failed: {}", e);
                            false
                        }
                    }
                })
            }),
            log_cache: Arc::new(move |record| {
                let storage = log_storage.clone();
                Box::pin(async move { storage.create_run_cache(&record).await })
            }),
            list_cache: Arc::new(move |query| {
                let storage = list_storage.clone();
                Box::pin(async move { storage.list_run_caches(&query).await })
            }),
        }
    }

    /// Gate on image preparation, then start or restart the workflow.
    ///
    /// `run.workflow_source` must be populated before calling.
    async fn handle_image_and_start(&self, run: Run, is_resume: bool) -> Result<()> {
        let image = run
            .workflow_source
            .as_ref()
            .map(|s| s.docker_env.clone())
            .unwrap_or_default();

        if !self.images.needs_prep(&image) {
            let workflow = match self.build_workflow(&run, true) {
                Ok(workflow) => workflow,
                Err(e) => {
                    self.mark_run_failed(&run.id, &e).await;
                    return Err(e);
                }
            };
            if is_resume {
                if let Err(e) = workflow.set_runtime_view(&run.runtime_view).await {
                    self.mark_run_failed(&run.id, &e).await;
                    return Err(e);
                }
                tokio::spawn(async move { workflow.restart().await });
            } else {
                tokio::spawn(async move { workflow.start().await });
            }
            return self
                .storage
                .update_run(
                    &run.id,
                    RunPatch {
                        status: Some(RunStatus::Pending),
                        image_url: Some(image),
                        touch_activate_time: true,
                        ..Default::default()
                    },
                )
                .await;
        }

        let known_image_ids = match self.storage.list_image_ids_by_fs_id(&run.fs_id).await {
            Ok(ids) => ids,
            Err(e) => {
                self.mark_run_failed(&run.id, &e).await;
                return Err(e);
            }
        };
        let controller = self.clone();
        let run_id = run.id.clone();
        let callback: ImagePrepCallback = Box::new(move |result| {
            tokio::spawn(async move {
                controller.on_image_prepared(run_id, result, is_resume).await;
            });
        });
        let request = ImagePrepRequest {
            image,
            run_id: run.id.clone(),
            fs_id: run.fs_id.clone(),
            fs_host: self.fs_config.server_host.clone(),
            fs_port: self.fs_config.server_port,
            known_image_ids,
        };
        if let Err(e) = self.images.prepare_image(request, callback).await {
            self.mark_run_failed(&run.id, &e).await;
            return Err(e);
        }
        Ok(())
    }

    async fn on_image_prepared(&self, run_id: String, result: Result<String>, is_resume: bool) {
        let image_url = match result {
            Ok(image_url) => image_url,
            Err(e) => {
                warn!(run_id = %run_id, "image preparation failed: {}", e);
                self.mark_run_failed(&run_id, &e).await;
                return;
            }
        };
        let mut run = match self.storage.get_run(&run_id).await {
            Ok(run) => run,
            Err(e) => {
                error!(run_id = %run_id, "loading run after image prep failed: {}", e);
                return;
            }
        };
        // The run may have been stopped while its image was being prepared.
        if run.status == RunStatus::Terminating || run.status.is_final() {
            info!(
                run_id = %run_id,
                status = %run.status,
                "image ready for a run that is no longer startable"
            );
            return;
        }
        if let Err(e) = self
            .storage
            .update_run(
                &run_id,
                RunPatch {
                    image_url: Some(image_url.clone()),
                    ..Default::default()
                },
            )
            .await
        {
            error!(run_id = %run_id, "persisting image url failed: {}", e);
            return;
        }
        run.image_url = image_url;
        match self.source_from_run(&run) {
            Ok(source) => {
                run.workflow_source = Some(source);
                let fut: std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send>> =
                    Box::pin(self.handle_image_and_start(run, is_resume));
                if let Err(e) = fut.await {
                    error!(run_id = %run_id, "starting run after image prep failed: {}", e);
                }
            }
            Err(e) => self.mark_run_failed(&run_id, &e).await,
        }
    }

    /// Clear job state of reset-eligible steps; a step left running or
    /// terminating means the prior run was not cleanly stopped.
    async fn reset_run_steps(&self, run: &mut Run) -> Result<()> {
        for (step_name, view) in run.runtime_view.iter_mut() {
            match view.status {
                Some(JobStatus::Cancelled | JobStatus::Failed | JobStatus::Terminated) => {
                    *view = JobView::default();
                }
                Some(status @ (JobStatus::Running | JobStatus::Terminating)) => {
                    return Err(Error::ActionNotAllowed(format!(
                        "step[{}] has invalid status[{}], failed to retry run[{}]",
                        step_name, status, run.id
                    )));
                }
                _ => {}
            }
        }
        self.storage
            .update_run(
                &run.id,
                RunPatch {
                    runtime_view: Some(run.runtime_view.clone()),
                    ..Default::default()
                },
            )
            .await
    }

    async fn resume_run(&self, mut run: Run) -> Result<()> {
        let source = self.source_from_run(&run)?;
        run.workflow_source = Some(source);
        self.handle_image_and_start(run, true).await
    }

    async fn mark_run_failed(&self, run_id: &str, err: &Error) {
        if run_id.is_empty() {
            return;
        }
        if let Err(e) = self
            .storage
            .update_run_status(run_id, RunStatus::Failed, Some(err.to_string()))
            .await
        {
            error!(run_id = %run_id, "marking run failed failed: {}", e);
        }
    }
}
