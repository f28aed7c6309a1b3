//! Workflow engine: runs the ordered deployment pipeline for one run.
//!
//! Each step attempt is persisted in the [`RunStore`] before the engine
//! moves on. On (re)execution the engine reloads the run, reuses the
//! memoized output of every succeeded step and continues from the first
//! step that has not settled, counting earlier attempts against the
//! step's budget.
//!
//! Steps run strictly in order within one run. Independent runs share only
//! the injected collaborators in [`EngineDeps`].

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::builder::ArtifactBuilder;
use crate::error::{PipelineError, Result};
use crate::model::{
    BuildProgressEvent, DeploymentRequest, Notification, NotifyStatus, RemoteProjectHandle,
    RemoteServiceHandle, RunStatus, Source, StepOutcome, StepResult, WorkflowRun,
};
use crate::notifier::Notifier;
use crate::platform::DeploymentClient;
use crate::runid::RunId;
use crate::source::SourceAcquirer;
use crate::store::RunStore;

/// Failure reason recorded for cancelled runs.
pub const CANCELLED: &str = "cancelled";

// ─── Policy ──────────────────────────────────────────────────────────────────

/// Exponential backoff between attempts of one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
}

impl Backoff {
    pub const NONE: Backoff = Backoff {
        initial: Duration::ZERO,
        max: Duration::ZERO,
    };

    /// Delay after the given (1-based) failed attempt.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial.saturating_mul(factor).min(self.max)
    }
}

/// Attempt budget and backoff for a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff {
                initial: Duration::from_secs(1),
                max: Duration::from_secs(30),
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub retry: RetryPolicy,
    /// Suspension before the deployment logs are read.
    pub monitor_delay: Duration,
    /// Per-attempt deadline for platform RPCs and webhooks.
    pub rpc_timeout: Duration,
    /// Per-attempt deadline for clone, build and push.
    pub build_timeout: Duration,
    /// Registry images are pushed to.
    pub registry: String,
    /// Post a `failure` webhook when a run fails.
    pub notify_on_failure: bool,
    pub max_concurrent_builds: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            monitor_delay: Duration::from_secs(30),
            rpc_timeout: Duration::from_secs(30),
            build_timeout: Duration::from_secs(900),
            registry: "docker.io".to_string(),
            notify_on_failure: true,
            max_concurrent_builds: 2,
        }
    }
}

/// Collaborators injected at construction.
#[derive(Clone)]
pub struct EngineDeps {
    pub client: Arc<dyn DeploymentClient>,
    pub builder: Arc<dyn ArtifactBuilder>,
    pub notifier: Arc<dyn Notifier>,
    pub acquirer: Arc<dyn SourceAcquirer>,
    pub store: Arc<RunStore>,
}

// ─── Steps ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Step {
    AcquireSource,
    BuildImage,
    PushImage,
    CreateProject,
    DeployService,
    MonitorDeployment,
    Notify,
}

impl Step {
    pub fn name(self) -> &'static str {
        match self {
            Step::AcquireSource => "acquire-source",
            Step::BuildImage => "build-image",
            Step::PushImage => "push-image",
            Step::CreateProject => "create-project",
            Step::DeployService => "deploy-service",
            Step::MonitorDeployment => "monitor-deployment",
            Step::Notify => "notify",
        }
    }

    /// Whether exhausting this step fails the run.
    pub fn gating(self) -> bool {
        !matches!(self, Step::MonitorDeployment | Step::Notify)
    }

    fn uses_build_slot(self) -> bool {
        matches!(self, Step::BuildImage | Step::PushImage)
    }
}

const IMAGE_WORKFLOW: &[Step] = &[
    Step::CreateProject,
    Step::DeployService,
    Step::MonitorDeployment,
    Step::Notify,
];

const DIRECTORY_WORKFLOW: &[Step] = &[
    Step::BuildImage,
    Step::PushImage,
    Step::CreateProject,
    Step::DeployService,
    Step::MonitorDeployment,
    Step::Notify,
];

const REPOSITORY_WORKFLOW: &[Step] = &[
    Step::AcquireSource,
    Step::BuildImage,
    Step::PushImage,
    Step::CreateProject,
    Step::DeployService,
    Step::MonitorDeployment,
    Step::Notify,
];

/// Declared step order for a request's source.
pub fn workflow_for(source: &Source) -> &'static [Step] {
    match source {
        Source::Image { .. } => IMAGE_WORKFLOW,
        Source::Directory { .. } => DIRECTORY_WORKFLOW,
        Source::Repository { .. } => REPOSITORY_WORKFLOW,
    }
}

/// Outputs of settled predecessors, rebuilt from memoized step results.
#[derive(Debug, Default)]
struct StepContext {
    project_dir: Option<PathBuf>,
    built_image: Option<String>,
    pushed_image: Option<String>,
    project: Option<RemoteProjectHandle>,
    service: Option<RemoteServiceHandle>,
}

impl StepContext {
    fn absorb(&mut self, step: Step, value: &Value) -> Result<()> {
        fn parse<T: DeserializeOwned>(v: &Value) -> Result<T> {
            Ok(serde_json::from_value(v.clone())?)
        }
        match step {
            Step::AcquireSource => self.project_dir = Some(parse(value)?),
            Step::BuildImage => self.built_image = Some(parse(value)?),
            Step::PushImage => self.pushed_image = Some(parse(value)?),
            Step::CreateProject => self.project = Some(parse(value)?),
            Step::DeployService => self.service = Some(parse(value)?),
            Step::MonitorDeployment | Step::Notify => {}
        }
        Ok(())
    }

    /// Best-effort rebuild from whatever succeeded so far.
    fn recovered(run: &WorkflowRun) -> Self {
        let mut ctx = StepContext::default();
        for step in workflow_for(&run.request.source) {
            if let Some(value) = run.success_of(step.name()) {
                let _ = ctx.absorb(*step, value);
            }
        }
        ctx
    }

    fn project_dir(&self, source: &Source) -> Result<PathBuf> {
        match source {
            Source::Directory { path } => Ok(path.clone()),
            _ => self.project_dir.clone().ok_or_else(|| missing(Step::AcquireSource)),
        }
    }

    fn deployable_image<'a>(&'a self, source: &'a Source) -> Result<&'a str> {
        match source {
            Source::Image { image_ref } => Ok(image_ref),
            _ => self.pushed_image.as_deref().ok_or_else(|| missing(Step::PushImage)),
        }
    }
}

fn missing(step: Step) -> PipelineError {
    PipelineError::validation(format!("no output recorded for step {}", step.name()))
}

enum StepEnd {
    Succeeded(Value),
    Failed(String),
    Cancelled,
}

// ─── Engine ──────────────────────────────────────────────────────────────────

pub struct WorkflowEngine {
    deps: EngineDeps,
    config: EngineConfig,
    build_slots: Semaphore,
    progress: Option<mpsc::Sender<BuildProgressEvent>>,
    tokens: Mutex<HashMap<RunId, CancellationToken>>,
    active: Mutex<HashSet<RunId>>,
}

/// Removes a run from the active set when its execution ends.
struct ActiveGuard<'a> {
    engine: &'a WorkflowEngine,
    run_id: RunId,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        lock(&self.engine.active).remove(&self.run_id);
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl WorkflowEngine {
    pub fn new(deps: EngineDeps, config: EngineConfig) -> Self {
        let slots = config.max_concurrent_builds.max(1);
        Self {
            deps,
            config,
            build_slots: Semaphore::new(slots),
            progress: None,
            tokens: Mutex::new(HashMap::new()),
            active: Mutex::new(HashSet::new()),
        }
    }

    /// Forward build output lines to `tx` in addition to the log.
    pub fn with_progress(mut self, tx: mpsc::Sender<BuildProgressEvent>) -> Self {
        self.progress = Some(tx);
        self
    }

    pub fn store(&self) -> &Arc<RunStore> {
        &self.deps.store
    }

    pub fn client(&self) -> &Arc<dyn DeploymentClient> {
        &self.deps.client
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn token_for(&self, run_id: &RunId) -> CancellationToken {
        lock(&self.tokens)
            .entry(run_id.clone())
            .or_insert_with(CancellationToken::new)
            .clone()
    }

    /// Request cancellation. Returns `false` if the run already ended.
    ///
    /// A pending run is failed directly. A running run observes the
    /// cancellation before its next step; an in-flight step finishes first.
    pub fn cancel(&self, run_id: &RunId) -> Result<bool> {
        let run = self
            .deps
            .store
            .load(run_id)?
            .ok_or_else(|| PipelineError::UnknownRun(run_id.to_string()))?;
        if run.status.is_terminal() {
            return Ok(false);
        }

        self.token_for(run_id).cancel();
        if run.status == RunStatus::Pending && !lock(&self.active).contains(run_id) {
            let changed = self
                .deps
                .store
                .set_status(run_id, RunStatus::Failed, Some(CANCELLED))?;
            lock(&self.tokens).remove(run_id);
            info!(run_id = %run_id, "pending run cancelled");
            return Ok(changed);
        }
        info!(run_id = %run_id, "cancellation requested");
        Ok(true)
    }

    /// Execute (or resume) a run until it reaches a terminal status.
    ///
    /// A run that is already terminal, or already executing in this
    /// process, is returned as stored.
    pub async fn execute(&self, run_id: &RunId) -> Result<WorkflowRun> {
        let mut run = self
            .deps
            .store
            .load(run_id)?
            .ok_or_else(|| PipelineError::UnknownRun(run_id.to_string()))?;
        if run.status.is_terminal() {
            debug!(run_id = %run_id, status = %run.status, "run already terminal, nothing to do");
            return Ok(run);
        }

        if !lock(&self.active).insert(run_id.clone()) {
            debug!(run_id = %run_id, "run already executing");
            return Ok(run);
        }
        let _guard = ActiveGuard {
            engine: self,
            run_id: run_id.clone(),
        };

        let token = self.token_for(run_id);
        let result = self.drive(&mut run, &token).await;
        lock(&self.tokens).remove(run_id);
        match result {
            Ok(()) => Ok(run),
            Err(e) => {
                self.abandon(&mut run, &e).await;
                Err(e)
            }
        }
    }

    /// The run could not be driven to an end (store unwritable, corrupt
    /// memo). Mark it failed if the store still accepts that, and tell the
    /// submitter.
    async fn abandon(&self, run: &mut WorkflowRun, cause: &PipelineError) {
        let reason = format!("internal error: {cause}");
        error!(run_id = %run.run_id, error = %cause, "run aborted");
        if let Err(e) = self
            .deps
            .store
            .set_status(&run.run_id, RunStatus::Failed, Some(&reason))
        {
            warn!(run_id = %run.run_id, error = %e, "could not record aborted run");
        }
        run.status = RunStatus::Failed;
        run.failure = Some(reason);
        if self.config.notify_on_failure {
            self.notify_failure(run, &StepContext::recovered(run)).await;
        }
    }

    async fn drive(&self, run: &mut WorkflowRun, token: &CancellationToken) -> Result<()> {
        let run_id = run.run_id.clone();
        if !self.deps.store.set_status(&run_id, RunStatus::Running, None)? {
            // Became terminal between load and start (e.g. cancelled).
            if let Some(stored) = self.deps.store.load(&run_id)? {
                *run = stored;
            }
            return Ok(());
        }
        run.status = RunStatus::Running;
        info!(run_id = %run_id, project = %run.request.project_name, "run started");

        let mut ctx = StepContext::default();
        let mut failure: Option<String> = None;

        for &step in workflow_for(&run.request.source) {
            if let Some(value) = run.success_of(step.name()) {
                debug!(run_id = %run_id, step = step.name(), "reusing memoized output");
                let value = value.clone();
                if let Err(e) = ctx.absorb(step, &value) {
                    failure = Some(e.to_string());
                    break;
                }
                continue;
            }
            if let Some(reason) = self.settled_failure(run, step) {
                if step.gating() {
                    failure = Some(reason);
                    break;
                }
                continue;
            }
            if token.is_cancelled() {
                failure = Some(CANCELLED.to_string());
                break;
            }

            match self.run_step(run, step, &ctx, token).await? {
                StepEnd::Succeeded(value) => {
                    if let Err(e) = ctx.absorb(step, &value) {
                        failure = Some(e.to_string());
                        break;
                    }
                }
                StepEnd::Failed(reason) if step.gating() => {
                    failure = Some(reason);
                    break;
                }
                StepEnd::Failed(reason) => {
                    warn!(run_id = %run_id, step = step.name(), error = %reason, "non-gating step failed, continuing");
                }
                StepEnd::Cancelled => {
                    failure = Some(CANCELLED.to_string());
                    break;
                }
            }
        }

        let status = if failure.is_some() {
            RunStatus::Failed
        } else {
            RunStatus::Succeeded
        };
        self.deps
            .store
            .set_status(&run_id, status, failure.as_deref())?;
        run.status = status;
        run.failure = failure;

        match &run.failure {
            None => info!(run_id = %run_id, "run succeeded"),
            Some(reason) => {
                error!(run_id = %run_id, reason = %reason, "run failed");
                if self.config.notify_on_failure {
                    self.notify_failure(run, &ctx).await;
                }
            }
        }
        Ok(())
    }

    /// Reason a step ended without success in an earlier execution, if it did.
    fn settled_failure(&self, run: &WorkflowRun, step: Step) -> Option<String> {
        let reason = match run.last_outcome_of(step.name())? {
            StepOutcome::Success(_) => return None,
            StepOutcome::Fatal(e) => e,
            StepOutcome::Retryable(e) => {
                if run.attempts_of(step.name()) < self.config.retry.max_attempts {
                    return None;
                }
                e
            }
        };
        Some(reason.clone())
    }

    fn timeout_for(&self, step: Step) -> Duration {
        match step {
            Step::AcquireSource | Step::BuildImage | Step::PushImage => self.config.build_timeout,
            _ => self.config.rpc_timeout,
        }
    }

    async fn run_step(
        &self,
        run: &mut WorkflowRun,
        step: Step,
        ctx: &StepContext,
        token: &CancellationToken,
    ) -> Result<StepEnd> {
        let policy = self.config.retry;
        let timeout = self.timeout_for(step);
        let mut attempt = run.attempts_of(step.name());

        if step == Step::MonitorDeployment && attempt == 0 {
            debug!(run_id = %run.run_id, delay = ?self.config.monitor_delay, "waiting before reading deployment logs");
            tokio::select! {
                () = token.cancelled() => return Ok(StepEnd::Cancelled),
                () = tokio::time::sleep(self.config.monitor_delay) => {}
            }
        }

        loop {
            attempt += 1;
            let started_at = Utc::now();
            let result = {
                let _slot = if step.uses_build_slot() {
                    Some(self.build_slots.acquire().await.map_err(|_| {
                        PipelineError::Cancelled("build slots closed".to_string())
                    })?)
                } else {
                    None
                };
                tokio::time::timeout(timeout, self.attempt(step, &run.request, ctx)).await
            };

            let outcome = match result {
                Ok(Ok(value)) => StepOutcome::Success(value),
                Ok(Err(e)) if e.is_retryable() => StepOutcome::Retryable(e.to_string()),
                Ok(Err(e)) => StepOutcome::Fatal(e.to_string()),
                Err(_) if attempt < policy.max_attempts => {
                    StepOutcome::Retryable(PipelineError::Timeout(timeout).to_string())
                }
                Err(_) => StepOutcome::Fatal(PipelineError::Timeout(timeout).to_string()),
            };

            let record = StepResult {
                name: step.name().to_string(),
                attempt,
                outcome: outcome.clone(),
                started_at,
                ended_at: Utc::now(),
            };
            self.deps.store.append_step(&run.run_id, &record)?;
            run.steps.push(record);

            match outcome {
                StepOutcome::Success(value) => {
                    info!(run_id = %run.run_id, step = step.name(), attempt, "step succeeded");
                    return Ok(StepEnd::Succeeded(value));
                }
                StepOutcome::Fatal(e) => {
                    warn!(run_id = %run.run_id, step = step.name(), attempt, error = %e, "step failed fatally");
                    return Ok(StepEnd::Failed(e));
                }
                StepOutcome::Retryable(e) => {
                    if attempt >= policy.max_attempts {
                        warn!(run_id = %run.run_id, step = step.name(), attempt, error = %e, "attempt budget exhausted");
                        return Ok(StepEnd::Failed(e));
                    }
                    let delay = policy.backoff.delay(attempt);
                    warn!(run_id = %run.run_id, step = step.name(), attempt, error = %e, ?delay, "step failed, retrying");
                    tokio::select! {
                        () = token.cancelled() => return Ok(StepEnd::Cancelled),
                        () = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// One attempt of one step. Inputs are the request and the outputs of
    /// settled predecessors.
    async fn attempt(&self, step: Step, req: &DeploymentRequest, ctx: &StepContext) -> Result<Value> {
        match step {
            Step::AcquireSource => {
                let Source::Repository { url } = &req.source else {
                    return Err(PipelineError::validation("acquire-source needs a repository url"));
                };
                let dir = self.deps.acquirer.clone_repository(url).await?;
                Ok(json!(dir.to_string_lossy()))
            }
            Step::BuildImage => {
                let dir = ctx.project_dir(&req.source)?;
                let image = req.image_name();
                self.deps
                    .builder
                    .build_image(
                        &dir,
                        &image,
                        req.container_definition.as_deref(),
                        self.progress.clone(),
                    )
                    .await?;
                Ok(json!(image))
            }
            Step::PushImage => {
                let image = ctx.built_image.as_deref().ok_or_else(|| missing(Step::BuildImage))?;
                let pushed = self.deps.builder.push_image(image, &self.config.registry).await?;
                Ok(json!(pushed))
            }
            Step::CreateProject => {
                let project = self.deps.client.create_project(&req.project_name).await?;
                Ok(json!(project))
            }
            Step::DeployService => {
                let project = ctx.project.as_ref().ok_or_else(|| missing(Step::CreateProject))?;
                let image = ctx.deployable_image(&req.source)?;
                let service = self
                    .deps
                    .client
                    .deploy_service(project, image, &req.env_vars)
                    .await?;
                Ok(json!(service))
            }
            Step::MonitorDeployment => {
                let service = ctx.service.as_ref().ok_or_else(|| missing(Step::DeployService))?;
                let logs = self.deps.client.get_deployment_logs(service).await?;
                for entry in &logs {
                    debug!(service = %service, timestamp = %entry.timestamp, "{}", entry.message);
                }
                Ok(json!({ "entries": logs.len(), "logs": logs }))
            }
            Step::Notify => {
                let notification = Notification {
                    status: NotifyStatus::Success,
                    deployment_id: ctx.service.as_ref().map(|s| s.0.clone()),
                    project_id: ctx.project.as_ref().map(|p| p.0.clone()),
                };
                self.deps.notifier.notify(&req.notify_url, &notification).await?;
                Ok(json!({ "status": "success" }))
            }
        }
    }

    /// Best effort; logged, never recorded as a step.
    async fn notify_failure(&self, run: &WorkflowRun, ctx: &StepContext) {
        let notification = Notification {
            status: NotifyStatus::Failure,
            deployment_id: ctx.service.as_ref().map(|s| s.0.clone()),
            project_id: ctx.project.as_ref().map(|p| p.0.clone()),
        };
        let sent = tokio::time::timeout(
            self.config.rpc_timeout,
            self.deps.notifier.notify(&run.request.notify_url, &notification),
        )
        .await;
        match sent {
            Ok(Ok(())) => info!(run_id = %run.run_id, "failure webhook delivered"),
            Ok(Err(e)) => warn!(run_id = %run.run_id, error = %e, "failure webhook not delivered"),
            Err(_) => warn!(run_id = %run.run_id, "failure webhook timed out"),
        }
    }
}
