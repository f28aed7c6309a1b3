//! Fakes for the engine's collaborators, shared by the integration tests.
#![allow(dead_code)]

use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use url::Url;

use launchpad::builder::ArtifactBuilder;
use launchpad::engine::{Backoff, EngineConfig, EngineDeps, RetryPolicy, WorkflowEngine};
use launchpad::error::{PipelineError, Result};
use launchpad::generate::{CompletionOptions, TextGenerator};
use launchpad::model::{
    BuildProgressEvent, DeploymentRequest, LogEntry, Notification, OutputStream, RemoteProjectHandle,
    RemoteServiceHandle, RunStatus, Source, WorkflowRun,
};
use launchpad::notifier::Notifier;
use launchpad::platform::DeploymentClient;
use launchpad::runid::RunId;
use launchpad::source::{SourceAcquirer, UploadedFile};
use launchpad::store::RunStore;

const ALWAYS: u32 = u32::MAX;

/// Call counter with scripted failures.
pub struct Script {
    calls: AtomicU32,
    failures_left: AtomicU32,
    error: fn() -> PipelineError,
    hang: bool,
}

impl Script {
    pub fn ok() -> Self {
        Self::failing(0, || PipelineError::remote(500, "unused"))
    }

    /// Fail the first `n` calls with `error`.
    pub fn failing(n: u32, error: fn() -> PipelineError) -> Self {
        Self {
            calls: AtomicU32::new(0),
            failures_left: AtomicU32::new(n),
            error,
            hang: false,
        }
    }

    pub fn always(error: fn() -> PipelineError) -> Self {
        Self::failing(ALWAYS, error)
    }

    /// Never complete.
    pub fn hanging() -> Self {
        Self {
            hang: true,
            ..Self::ok()
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    async fn hit(&self) -> Result<u32> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.hang {
            std::future::pending::<()>().await;
        }
        let failed = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| match left {
                0 => None,
                ALWAYS => Some(ALWAYS),
                left => Some(left - 1),
            })
            .is_ok();
        if failed { Err((self.error)()) } else { Ok(n) }
    }
}

pub fn transient() -> PipelineError {
    PipelineError::remote(502, "bad gateway")
}

pub fn invalid() -> PipelineError {
    PipelineError::validation("malformed request")
}

// ─── Platform ────────────────────────────────────────────────────────────────

pub struct FakePlatform {
    pub create: Script,
    pub deploy: Script,
    pub logs: Script,
    pub deployed_images: Mutex<Vec<String>>,
}

impl Default for FakePlatform {
    fn default() -> Self {
        Self {
            create: Script::ok(),
            deploy: Script::ok(),
            logs: Script::ok(),
            deployed_images: Mutex::default(),
        }
    }
}

#[async_trait]
impl DeploymentClient for FakePlatform {
    async fn create_project(&self, _name: &str) -> Result<RemoteProjectHandle> {
        let n = self.create.hit().await?;
        Ok(RemoteProjectHandle(format!("prj-{n}")))
    }

    async fn deploy_service(
        &self,
        _project: &RemoteProjectHandle,
        image_ref: &str,
        _env_vars: &BTreeMap<String, String>,
    ) -> Result<RemoteServiceHandle> {
        let n = self.deploy.hit().await?;
        self.deployed_images.lock().unwrap().push(image_ref.to_string());
        Ok(RemoteServiceHandle(format!("svc-{n}")))
    }

    async fn get_deployment_logs(&self, _service: &RemoteServiceHandle) -> Result<Vec<LogEntry>> {
        self.logs.hit().await?;
        Ok(vec![LogEntry {
            message: "listening on 3000".into(),
            timestamp: "2026-01-01T00:00:00Z".into(),
        }])
    }
}

// ─── Builder ─────────────────────────────────────────────────────────────────

pub struct FakeBuilder {
    pub build: Script,
    pub push: Script,
    pub builds: Mutex<Vec<(PathBuf, String, Option<String>)>>,
    /// How long each build holds its slot.
    pub build_time: Duration,
    pub in_flight: AtomicU32,
    pub peak: AtomicU32,
}

impl Default for FakeBuilder {
    fn default() -> Self {
        Self {
            build: Script::ok(),
            push: Script::ok(),
            builds: Mutex::default(),
            build_time: Duration::ZERO,
            in_flight: AtomicU32::new(0),
            peak: AtomicU32::new(0),
        }
    }
}

impl FakeBuilder {
    /// Most builds that ever ran at the same time.
    pub fn peak_concurrency(&self) -> u32 {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ArtifactBuilder for FakeBuilder {
    async fn build_image(
        &self,
        project_dir: &Path,
        image: &str,
        definition: Option<&str>,
        progress: Option<mpsc::Sender<BuildProgressEvent>>,
    ) -> Result<()> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.build_time).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        self.build.hit().await?;
        if let Some(tx) = progress {
            tx.send(BuildProgressEvent {
                image: image.to_string(),
                stream: OutputStream::Stdout,
                line: format!("Successfully tagged {image}"),
            })
            .await
            .ok();
        }
        self.builds.lock().unwrap().push((
            project_dir.to_path_buf(),
            image.to_string(),
            definition.map(str::to_string),
        ));
        Ok(())
    }

    async fn push_image(&self, image: &str, registry: &str) -> Result<String> {
        self.push.hit().await?;
        Ok(launchpad::builder::registry_ref(image, registry))
    }

    async fn run_container(&self, _image: &str, _port: u16) -> Result<String> {
        Ok("container-1".into())
    }
}

// ─── Notifier ────────────────────────────────────────────────────────────────

pub struct FakeNotifier {
    pub script: Script,
    pub delivered: Mutex<Vec<(Url, Notification)>>,
}

impl Default for FakeNotifier {
    fn default() -> Self {
        Self {
            script: Script::ok(),
            delivered: Mutex::default(),
        }
    }
}

impl FakeNotifier {
    pub fn delivered(&self) -> Vec<Notification> {
        self.delivered
            .lock()
            .unwrap()
            .iter()
            .map(|(_, n)| n.clone())
            .collect()
    }
}

#[async_trait]
impl Notifier for FakeNotifier {
    async fn notify(&self, url: &Url, notification: &Notification) -> Result<()> {
        self.script.hit().await?;
        self.delivered
            .lock()
            .unwrap()
            .push((url.clone(), notification.clone()));
        Ok(())
    }
}

// ─── Source ──────────────────────────────────────────────────────────────────

pub struct FakeAcquirer {
    pub dir: PathBuf,
    pub clones: Script,
}

impl FakeAcquirer {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            clones: Script::ok(),
        }
    }
}

#[async_trait]
impl SourceAcquirer for FakeAcquirer {
    async fn clone_repository(&self, _url: &str) -> Result<PathBuf> {
        self.clones.hit().await?;
        Ok(self.dir.clone())
    }

    async fn accept_upload(&self, files: Vec<UploadedFile>) -> Result<PathBuf> {
        for f in files {
            std::fs::write(self.dir.join(&f.name), &f.bytes)?;
        }
        Ok(self.dir.clone())
    }
}

// ─── Generator ───────────────────────────────────────────────────────────────

/// Replays canned completions in order; fails once they run out.
#[derive(Default)]
pub struct CannedGenerator {
    replies: Mutex<VecDeque<String>>,
    pub prompts: Mutex<Vec<String>>,
}

impl CannedGenerator {
    pub fn new(replies: &[&str]) -> Self {
        Self {
            replies: Mutex::new(replies.iter().map(|r| r.to_string()).collect()),
            prompts: Mutex::default(),
        }
    }
}

#[async_trait]
impl TextGenerator for CannedGenerator {
    async fn complete(&self, prompt: &str, _options: &CompletionOptions) -> Result<String> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| PipelineError::remote(500, "no canned reply left"))
    }
}

// ─── Harness ─────────────────────────────────────────────────────────────────

pub struct Harness {
    pub platform: Arc<FakePlatform>,
    pub builder: Arc<FakeBuilder>,
    pub notifier: Arc<FakeNotifier>,
    pub acquirer: Arc<FakeAcquirer>,
    pub store: Arc<RunStore>,
    pub engine: Arc<WorkflowEngine>,
    pub workdir: tempfile::TempDir,
}

pub fn fast_config() -> EngineConfig {
    EngineConfig {
        retry: RetryPolicy {
            max_attempts: 3,
            backoff: Backoff::NONE,
        },
        monitor_delay: Duration::ZERO,
        rpc_timeout: Duration::from_secs(5),
        build_timeout: Duration::from_secs(5),
        ..EngineConfig::default()
    }
}

impl Harness {
    pub fn new() -> Self {
        Self::with(FakePlatform::default(), FakeBuilder::default(), FakeNotifier::default(), fast_config())
    }

    pub fn with(
        platform: FakePlatform,
        builder: FakeBuilder,
        notifier: FakeNotifier,
        config: EngineConfig,
    ) -> Self {
        Self::with_store(platform, builder, notifier, config, RunStore::in_memory().unwrap())
    }

    pub fn with_store(
        platform: FakePlatform,
        builder: FakeBuilder,
        notifier: FakeNotifier,
        config: EngineConfig,
        store: RunStore,
    ) -> Self {
        let workdir = tempfile::tempdir().unwrap();
        let platform = Arc::new(platform);
        let builder = Arc::new(builder);
        let notifier = Arc::new(notifier);
        let acquirer = Arc::new(FakeAcquirer::new(workdir.path()));
        let store = Arc::new(store);
        let deps = EngineDeps {
            client: platform.clone(),
            builder: builder.clone(),
            notifier: notifier.clone(),
            acquirer: acquirer.clone(),
            store: store.clone(),
        };
        let engine = Arc::new(WorkflowEngine::new(deps, config));
        Self {
            platform,
            builder,
            notifier,
            acquirer,
            store,
            engine,
            workdir,
        }
    }

    /// Persist a pending run for `request` without executing it.
    pub fn accept(&self, request: &DeploymentRequest) -> RunId {
        let id = RunId::generate();
        assert!(self.store.insert_run(&id, request).unwrap());
        id
    }

    pub fn deps(&self) -> EngineDeps {
        EngineDeps {
            client: self.platform.clone(),
            builder: self.builder.clone(),
            notifier: self.notifier.clone(),
            acquirer: self.acquirer.clone(),
            store: self.store.clone(),
        }
    }

    pub async fn run(&self, request: &DeploymentRequest) -> WorkflowRun {
        let id = self.accept(request);
        self.engine.execute(&id).await.unwrap()
    }
}

pub fn image_request() -> DeploymentRequest {
    DeploymentRequest {
        project_name: "demo".into(),
        source: Source::Image {
            image_ref: "demo:latest".into(),
        },
        container_definition: None,
        env_vars: BTreeMap::new(),
        notify_url: Url::parse("http://x/hook").unwrap(),
    }
}

/// Step names with consecutive retries collapsed.
pub fn step_names(run: &WorkflowRun) -> Vec<String> {
    let mut names: Vec<String> = run.steps.iter().map(|s| s.name.clone()).collect();
    names.dedup();
    names
}

/// Poll the store until the run is terminal.
pub async fn wait_terminal(store: &RunStore, id: &RunId) -> WorkflowRun {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        if let Some(run) = store.load(id).unwrap() {
            if run.status.is_terminal() {
                return run;
            }
        }
        assert!(tokio::time::Instant::now() < deadline, "run {id} never finished");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub fn assert_status(run: &WorkflowRun, status: RunStatus) {
    assert_eq!(run.status, status, "run failure: {:?}, steps: {:?}", run.failure, run.steps);
}
