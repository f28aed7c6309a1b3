//! Error taxonomy for the deployment pipeline.
//!
//! Every failure the engine can observe maps onto one [`PipelineError`]
//! variant, and every variant has a fixed [`ErrorClass`] that decides
//! whether the engine retries it.

use std::time::Duration;

use thiserror::Error;

/// Whether a failed step may be attempted again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Transient; retried up to the step's attempt budget.
    Retryable,
    /// Never retried; fails the step (and a gating step fails the run).
    Fatal,
}

/// Errors produced by the pipeline and its collaborators.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Bad or missing request fields.
    #[error("invalid request: {0}")]
    Validation(String),

    /// The deployment platform rejected an RPC or answered with garbage.
    #[error("platform API error {status}: {body}")]
    RemoteApi { status: u16, body: String },

    /// The build daemon reported a failed build.
    #[error("build of {image} failed (exit {exit_code}): {}", log_tail.last().map(String::as_str).unwrap_or("no output"))]
    Build {
        image: String,
        exit_code: i32,
        /// Last lines emitted by the build, oldest first.
        log_tail: Vec<String>,
    },

    /// Pushing an image to the registry failed.
    #[error("push of {image} to {registry} failed: {message}")]
    Push {
        image: String,
        registry: String,
        message: String,
    },

    /// The text generator returned content we could not parse.
    #[error("unparseable generator output: {0}")]
    GenerationFormat(String),

    /// Webhook delivery failed.
    #[error("webhook delivery failed: {0}")]
    Notify(String),

    /// Run cancelled by an operator or a deadline.
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// A caller-supplied deadline elapsed.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// Source acquisition rejected its input (e.g. archive path traversal).
    #[error("source rejected: {0}")]
    Source(String),

    /// No run with this tracking id.
    #[error("unknown run: {0}")]
    UnknownRun(String),

    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

impl PipelineError {
    /// Retry classification used by the engine.
    pub fn class(&self) -> ErrorClass {
        match self {
            PipelineError::Validation(_)
            | PipelineError::GenerationFormat(_)
            | PipelineError::Cancelled(_)
            | PipelineError::Source(_)
            | PipelineError::UnknownRun(_)
            | PipelineError::Serde(_) => ErrorClass::Fatal,
            PipelineError::RemoteApi { .. }
            | PipelineError::Build { .. }
            | PipelineError::Push { .. }
            | PipelineError::Notify(_)
            | PipelineError::Timeout(_)
            | PipelineError::Store(_)
            | PipelineError::Io(_)
            | PipelineError::Http(_) => ErrorClass::Retryable,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Retryable
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        PipelineError::Validation(msg.into())
    }

    pub fn remote(status: u16, body: impl Into<String>) -> Self {
        PipelineError::RemoteApi {
            status,
            body: body.into(),
        }
    }
}

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;
