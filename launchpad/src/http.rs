//! HTTP surface: planning, config/doc generation, uploads, deploy and
//! status endpoints.
//!
//! Handlers are thin. Deploys go through the [`DeploymentRequestQueue`];
//! generation goes through the optional [`TextGenerator`] and answers 503
//! when none is configured.

use std::collections::BTreeMap;
use std::path::{Path as FsPath, PathBuf};
use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, Multipart, Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use url::Url;

use crate::analyzer::ProjectAnalyzer;
use crate::error::PipelineError;
use crate::generate::{self, TextGenerator};
use crate::model::{DeploymentRequest, RemoteServiceHandle, Source};
use crate::queue::DeploymentRequestQueue;
use crate::runid::RunId;
use crate::source::{SourceAcquirer, UploadedFile};

const MAX_BODY_BYTES: usize = 100 * 1024 * 1024;

pub struct AppState {
    pub queue: DeploymentRequestQueue,
    /// `None` when no completion API key is configured.
    pub generator: Option<Arc<dyn TextGenerator>>,
    pub analyzer: Arc<dyn ProjectAnalyzer>,
    pub acquirer: Arc<dyn SourceAcquirer>,
    /// Client-supplied project paths must resolve inside this directory.
    pub workspace_dir: PathBuf,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/deployment/plan", post(generate_plan))
        .route("/api/deployment/generate-plan", post(generate_plan))
        .route("/api/deployment/generate-configs", post(generate_configs))
        .route("/api/deployment/deploy", post(deploy))
        .route("/api/deployment/{id}/cancel", post(cancel))
        .route("/api/status/{id}", get(run_status))
        .route("/api/status/{id}/logs", get(deployment_logs))
        .route("/api/upload/upload-code", post(upload_code))
        .route("/api/upload/clone-github", post(clone_github))
        .route("/api/docs/generate-readme", post(generate_readme))
        .route("/api/docs/generate-api-docs", post(generate_api_docs))
        .route(
            "/api/docs/generate-architecture-diagram",
            post(generate_architecture_diagram),
        )
        .route("/api/docs/generate-all", post(generate_all_docs))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve until `shutdown` fires.
pub async fn serve(
    listener: tokio::net::TcpListener,
    state: Arc<AppState>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let addr = listener.local_addr()?;
    tracing::info!("HTTP API listening on {addr}");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

// ─── Errors ──────────────────────────────────────────────────────────────────

/// Error response: status code plus `{"error": "..."}`.
#[derive(Debug)]
pub struct ApiError(StatusCode, String);

impl ApiError {
    fn bad_request(msg: impl Into<String>) -> Self {
        ApiError(StatusCode::BAD_REQUEST, msg.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.0.is_server_error() {
            tracing::error!(status = %self.0, "{}", self.1);
        }
        (self.0, Json(json!({ "error": self.1 }))).into_response()
    }
}

impl From<PipelineError> for ApiError {
    fn from(e: PipelineError) -> Self {
        let status = match e {
            PipelineError::Validation(_) | PipelineError::Source(_) => StatusCode::BAD_REQUEST,
            PipelineError::GenerationFormat(_) => StatusCode::BAD_GATEWAY,
            PipelineError::UnknownRun(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        ApiError(status, e.to_string())
    }
}

type ApiResult = Result<Json<Value>, ApiError>;

impl AppState {
    fn generator(&self) -> Result<&dyn TextGenerator, ApiError> {
        self.generator.as_deref().ok_or_else(|| {
            ApiError(
                StatusCode::SERVICE_UNAVAILABLE,
                "GROQ_API_KEY is not configured".to_string(),
            )
        })
    }

    /// Resolve a client-supplied project path, refusing anything outside
    /// the workspace directory.
    async fn workspace_path(&self, raw: &str) -> Result<PathBuf, ApiError> {
        let root = tokio::fs::canonicalize(&self.workspace_dir)
            .await
            .map_err(|e| ApiError(StatusCode::INTERNAL_SERVER_ERROR, format!("workspace: {e}")))?;
        let path = tokio::fs::canonicalize(raw)
            .await
            .map_err(|_| ApiError::bad_request(format!("project path {raw:?} does not exist")))?;
        if !path.starts_with(&root) {
            return Err(ApiError::bad_request(format!(
                "project path {raw:?} is outside the workspace"
            )));
        }
        Ok(path)
    }
}

// ─── Handlers ────────────────────────────────────────────────────────────────

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

#[derive(Debug, Deserialize)]
struct PlanBody {
    #[serde(default)]
    request: String,
}

async fn generate_plan(State(state): State<Arc<AppState>>, Json(body): Json<PlanBody>) -> ApiResult {
    if body.request.trim().is_empty() {
        return Err(ApiError::bad_request("Request text is required"));
    }
    let plan = generate::plan_deployment(state.generator()?, &body.request).await?;
    Ok(Json(json!({ "success": true, "plan": plan })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConfigsBody {
    #[serde(default)]
    framework: String,
    #[serde(default)]
    project_details: Value,
    #[serde(default)]
    code_analysis: Value,
}

async fn generate_configs(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ConfigsBody>,
) -> ApiResult {
    if body.framework.trim().is_empty() {
        return Err(ApiError::bad_request("Framework is required"));
    }
    let mut details = match body.project_details {
        Value::Object(map) => map,
        _ => serde_json::Map::new(),
    };
    let service_name = details
        .get("serviceName")
        .and_then(Value::as_str)
        .unwrap_or("my-app")
        .to_string();
    details.insert("codeAnalysis".to_string(), body.code_analysis.clone());

    let configs = generate::generate_configs(
        state.generator()?,
        &body.framework,
        &Value::Object(details),
        &service_name,
    )
    .await?;

    let mut out = serde_json::to_value(&configs).map_err(PipelineError::from)?;
    if let Some(path) = body.code_analysis.get("projectPath") {
        out["codePath"] = path.clone();
    }
    Ok(Json(json!({ "success": true, "configs": out })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeployBody {
    #[serde(default)]
    project_name: String,
    dockerfile: Option<String>,
    container_definition: Option<String>,
    #[serde(default)]
    env_vars: BTreeMap<String, String>,
    webhook_url: Option<String>,
    image_ref: Option<String>,
    uploaded_code_path: Option<String>,
    github_url: Option<String>,
}

async fn deploy(State(state): State<Arc<AppState>>, Json(body): Json<DeployBody>) -> ApiResult {
    let source = if let Some(image_ref) = body.image_ref {
        Source::Image { image_ref }
    } else if let Some(ref raw) = body.uploaded_code_path {
        Source::Directory {
            path: state.workspace_path(raw).await?,
        }
    } else if let Some(url) = body.github_url {
        Source::Repository { url }
    } else {
        return Err(ApiError::bad_request(
            "Either imageRef, uploadedCodePath or githubUrl is required",
        ));
    };

    let raw_hook = body
        .webhook_url
        .ok_or_else(|| ApiError::bad_request("webhookUrl is required"))?;
    let notify_url = Url::parse(&raw_hook)
        .map_err(|e| ApiError::bad_request(format!("invalid webhookUrl: {e}")))?;

    let request = DeploymentRequest {
        project_name: body.project_name,
        source,
        container_definition: body.container_definition.or(body.dockerfile),
        env_vars: body.env_vars,
        notify_url,
    };
    let tracking_id = state.queue.submit(request)?;
    Ok(Json(json!({
        "success": true,
        "message": "Deployment started",
        "trackingId": tracking_id,
    })))
}

async fn cancel(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> ApiResult {
    let cancelled = state.queue.cancel(&RunId::from(id))?;
    Ok(Json(json!({ "success": true, "cancelled": cancelled })))
}

async fn run_status(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> ApiResult {
    let run_id = RunId::from(id);
    let run = state
        .queue
        .engine()
        .store()
        .load(&run_id)?
        .ok_or_else(|| PipelineError::UnknownRun(run_id.to_string()))?;
    Ok(Json(json!({ "success": true, "run": run })))
}

async fn deployment_logs(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> ApiResult {
    let logs = state
        .queue
        .engine()
        .client()
        .get_deployment_logs(&RemoteServiceHandle(id))
        .await?;
    Ok(Json(json!({ "success": true, "logs": logs })))
}

async fn analyzed(state: &AppState, dir: &FsPath) -> ApiResult {
    let analysis = state.analyzer.analyze(dir).await?;
    let project_id = dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    Ok(Json(json!({
        "success": true,
        "projectId": project_id,
        "projectPath": dir.to_string_lossy(),
        "analysis": analysis,
    })))
}

async fn upload_code(State(state): State<Arc<AppState>>, mut multipart: Multipart) -> ApiResult {
    let mut files = Vec::new();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(format!("Multipart error: {e}")))?
    {
        let Some(name) = field.file_name().map(str::to_string) else {
            continue;
        };
        let bytes = field
            .bytes()
            .await
            .map_err(|e| ApiError::bad_request(format!("File read error: {e}")))?;
        files.push(UploadedFile {
            name,
            bytes: bytes.to_vec(),
        });
    }
    if files.is_empty() {
        return Err(ApiError::bad_request("No files uploaded"));
    }
    tracing::info!(count = files.len(), "received upload");

    let dir = state.acquirer.accept_upload(files).await?;
    analyzed(&state, &dir).await
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CloneBody {
    #[serde(default)]
    github_url: String,
}

async fn clone_github(State(state): State<Arc<AppState>>, Json(body): Json<CloneBody>) -> ApiResult {
    if body.github_url.trim().is_empty() {
        return Err(ApiError::bad_request("GitHub URL is required"));
    }
    let dir = state.acquirer.clone_repository(body.github_url.trim()).await?;
    analyzed(&state, &dir).await
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DocsBody {
    project_details: Option<Value>,
    code_analysis: Option<Value>,
    project_path: Option<String>,
}

/// Project details and code analysis for doc generation. Analyzes
/// `projectPath` when no analysis was supplied; analysis failure is not fatal.
async fn docs_inputs(state: &AppState, body: DocsBody) -> Result<(Value, Value), ApiError> {
    let details = body
        .project_details
        .filter(|d| !d.is_null())
        .ok_or_else(|| ApiError::bad_request("Project details are required"))?;

    let analysis = match (body.code_analysis, body.project_path) {
        (Some(analysis), _) => analysis,
        (None, Some(raw)) => {
            let dir = state.workspace_path(&raw).await?;
            match state.analyzer.analyze(&dir).await {
                Ok(descriptor) => serde_json::to_value(descriptor).map_err(PipelineError::from)?,
                Err(e) => {
                    tracing::warn!(error = %e, "could not analyze project, proceeding without analysis");
                    json!({})
                }
            }
        }
        (None, None) => json!({}),
    };
    Ok((details, analysis))
}

async fn generate_readme(State(state): State<Arc<AppState>>, Json(body): Json<DocsBody>) -> ApiResult {
    let (details, analysis) = docs_inputs(&state, body).await?;
    let readme = generate::generate_readme(state.generator()?, &details, &analysis).await?;
    Ok(Json(json!({ "success": true, "readme": readme })))
}

async fn generate_api_docs(State(state): State<Arc<AppState>>, Json(body): Json<DocsBody>) -> ApiResult {
    let (details, analysis) = docs_inputs(&state, body).await?;
    let api_docs = generate::generate_api_docs(state.generator()?, &details, &analysis).await?;
    Ok(Json(json!({ "success": true, "apiDocs": api_docs })))
}

async fn generate_architecture_diagram(
    State(state): State<Arc<AppState>>,
    Json(body): Json<DocsBody>,
) -> ApiResult {
    let (details, analysis) = docs_inputs(&state, body).await?;
    let diagram =
        generate::generate_architecture_diagram(state.generator()?, &details, &analysis).await?;
    Ok(Json(json!({ "success": true, "diagram": diagram, "format": "mermaid" })))
}

async fn generate_all_docs(State(state): State<Arc<AppState>>, Json(body): Json<DocsBody>) -> ApiResult {
    let (details, analysis) = docs_inputs(&state, body).await?;
    let docs = generate::generate_all(state.generator()?, &details, &analysis).await?;
    Ok(Json(json!({
        "success": true,
        "documentation": {
            "readme": docs.readme,
            "apiDocs": docs.api_docs,
            "architectureDiagram": docs.architecture_diagram,
            "format": "mermaid",
        },
    })))
}
