//! launchpad server.
//!
//! Accepts deploy requests over HTTP, runs each one through the
//! deployment pipeline, and serves plan/config/doc generation.
//!
//! Environment: `RAILWAY_API_TOKEN` for the platform, `GROQ_API_KEY` for
//! generation (optional), `LAUNCHPAD_LOG_JSON=1` for JSON logs.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use launchpad::analyzer::ManifestAnalyzer;
use launchpad::builder::DockerCli;
use launchpad::config::ServerConfig;
use launchpad::engine::{EngineDeps, WorkflowEngine};
use launchpad::generate::{LlmClient, TextGenerator};
use launchpad::http::{self, AppState};
use launchpad::notifier::WebhookNotifier;
use launchpad::platform::RailwayClient;
use launchpad::queue::DeploymentRequestQueue;
use launchpad::source::LocalSourceAcquirer;
use launchpad::store::RunStore;

#[tokio::main]
async fn main() -> Result<()> {
    let json_logs = std::env::var("LAUNCHPAD_LOG_JSON").unwrap_or_default() == "1";
    let filter = EnvFilter::from_default_env().add_directive("launchpad=info".parse()?);
    if json_logs {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let config = ServerConfig::parse();

    tokio::fs::create_dir_all(&config.workspace_dir)
        .await
        .with_context(|| format!("creating {}", config.workspace_dir.display()))?;
    if let Some(parent) = config.db_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    if config.platform_token.is_empty() {
        tracing::warn!("RAILWAY_API_TOKEN is not set; platform calls will be rejected");
    }
    let generator: Option<Arc<dyn TextGenerator>> = match config.llm_api_key {
        Some(ref key) if !key.is_empty() => Some(Arc::new(
            LlmClient::new(key.clone())
                .with_endpoint(&config.llm_url)
                .with_model(&config.model),
        )),
        _ => {
            tracing::warn!("GROQ_API_KEY is not set; generation endpoints are disabled");
            None
        }
    };

    let store = Arc::new(
        RunStore::open(&config.db_path)
            .with_context(|| format!("opening run store {}", config.db_path.display()))?,
    );
    let acquirer = Arc::new(LocalSourceAcquirer::new(
        config.workspace_dir.clone(),
        config.build_timeout(),
    ));
    let deps = EngineDeps {
        client: Arc::new(RailwayClient::new(
            config.platform_url.clone(),
            config.platform_token.clone(),
            config.rpc_timeout(),
        )),
        builder: Arc::new(DockerCli::new(config.docker_host.clone())),
        notifier: Arc::new(WebhookNotifier::new(config.rpc_timeout())),
        acquirer: acquirer.clone(),
        store,
    };
    let engine = Arc::new(WorkflowEngine::new(deps, config.engine_config()));

    let shutdown = CancellationToken::new();
    let (queue, dispatcher) =
        DeploymentRequestQueue::start(engine, config.max_concurrent_runs, shutdown.clone());
    let resumed = queue.resume_pending()?;
    tracing::info!(resumed, "run queue ready");

    let state = Arc::new(AppState {
        queue,
        generator,
        analyzer: Arc::new(ManifestAnalyzer),
        acquirer,
        workspace_dir: config.workspace_dir.clone(),
    });

    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("binding {}", config.listen_addr))?;

    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("shutdown requested");
                signal.cancel();
            }
            Err(e) => tracing::warn!(error = %e, "cannot listen for ctrl-c"),
        }
    });

    http::serve(listener, state, shutdown).await?;
    dispatcher.await?;
    Ok(())
}
