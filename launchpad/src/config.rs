use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::engine::{Backoff, EngineConfig, RetryPolicy};
use crate::generate::llm::{DEFAULT_LLM_URL, DEFAULT_MODEL};
use crate::platform::DEFAULT_PLATFORM_URL;

#[derive(Parser, Debug, Clone)]
#[command(name = "launchpad", about = "Source-to-deployment pipeline server")]
pub struct ServerConfig {
    /// HTTP listen address
    #[arg(long, env = "LAUNCHPAD_LISTEN_ADDR", default_value = "127.0.0.1:3001")]
    pub listen_addr: String,

    /// Run database path
    #[arg(long, env = "LAUNCHPAD_DB_PATH", default_value = "/tmp/launchpad/launchpad.db")]
    pub db_path: PathBuf,

    /// Directory uploads and clones are placed in
    #[arg(long, env = "LAUNCHPAD_WORKSPACE_DIR", default_value = "/tmp/launchpad/uploads")]
    pub workspace_dir: PathBuf,

    /// Deployment platform GraphQL endpoint
    #[arg(long, env = "RAILWAY_API_URL", default_value = DEFAULT_PLATFORM_URL)]
    pub platform_url: String,

    /// Deployment platform API token
    #[arg(long, env = "RAILWAY_API_TOKEN", default_value = "", hide_env_values = true)]
    pub platform_token: String,

    /// Chat-completions endpoint
    #[arg(long, env = "LLM_API_URL", default_value = DEFAULT_LLM_URL)]
    pub llm_url: String,

    /// Chat-completions API key. Generation endpoints are disabled without it.
    #[arg(long, env = "GROQ_API_KEY", hide_env_values = true)]
    pub llm_api_key: Option<String>,

    /// Model used for plans, configs and docs
    #[arg(long, env = "LLM_MODEL", default_value = DEFAULT_MODEL)]
    pub model: String,

    /// Registry built images are pushed to
    #[arg(long, env = "LAUNCHPAD_REGISTRY", default_value = "docker.io")]
    pub registry: String,

    /// Docker daemon address (docker CLI default if unset)
    #[arg(long, env = "DOCKER_HOST")]
    pub docker_host: Option<String>,

    /// Attempts per pipeline step
    #[arg(long, default_value_t = 3)]
    pub max_attempts: u32,

    /// Initial backoff between step attempts, in milliseconds
    #[arg(long, default_value_t = 1000)]
    pub backoff_ms: u64,

    /// Wait before reading deployment logs, in seconds
    #[arg(long, default_value_t = 30)]
    pub monitor_delay_secs: u64,

    /// Per-attempt timeout for platform calls and webhooks, in seconds
    #[arg(long, default_value_t = 30)]
    pub rpc_timeout_secs: u64,

    /// Per-attempt timeout for clone, build and push, in seconds
    #[arg(long, default_value_t = 900)]
    pub build_timeout_secs: u64,

    /// Concurrent image builds and pushes
    #[arg(long, default_value_t = 2)]
    pub max_concurrent_builds: usize,

    /// Concurrent pipeline runs
    #[arg(long, default_value_t = 16)]
    pub max_concurrent_runs: usize,

    /// Post a failure webhook when a run fails
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub notify_on_failure: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:3001".to_string(),
            db_path: PathBuf::from("/tmp/launchpad/launchpad.db"),
            workspace_dir: PathBuf::from("/tmp/launchpad/uploads"),
            platform_url: DEFAULT_PLATFORM_URL.to_string(),
            platform_token: String::new(),
            llm_url: DEFAULT_LLM_URL.to_string(),
            llm_api_key: None,
            model: DEFAULT_MODEL.to_string(),
            registry: "docker.io".to_string(),
            docker_host: None,
            max_attempts: 3,
            backoff_ms: 1000,
            monitor_delay_secs: 30,
            rpc_timeout_secs: 30,
            build_timeout_secs: 900,
            max_concurrent_builds: 2,
            max_concurrent_runs: 16,
            notify_on_failure: true,
        }
    }
}

impl ServerConfig {
    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_secs(self.rpc_timeout_secs)
    }

    pub fn build_timeout(&self) -> Duration {
        Duration::from_secs(self.build_timeout_secs)
    }

    pub fn engine_config(&self) -> EngineConfig {
        let initial = Duration::from_millis(self.backoff_ms);
        EngineConfig {
            retry: RetryPolicy {
                max_attempts: self.max_attempts.max(1),
                backoff: Backoff {
                    initial,
                    max: initial.saturating_mul(30),
                },
            },
            monitor_delay: Duration::from_secs(self.monitor_delay_secs),
            rpc_timeout: self.rpc_timeout(),
            build_timeout: self.build_timeout(),
            registry: self.registry.clone(),
            notify_on_failure: self.notify_on_failure,
            max_concurrent_builds: self.max_concurrent_builds,
        }
    }
}
