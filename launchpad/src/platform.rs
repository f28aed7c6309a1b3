//! Deployment platform RPC client.
//!
//! Thin typed wrapper over the platform's GraphQL query/mutation API.
//! Every call is a single request: no retry and no caching here, the
//! workflow engine owns the retry policy.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};

use crate::error::{PipelineError, Result};
use crate::model::{LogEntry, RemoteProjectHandle, RemoteServiceHandle};

pub const DEFAULT_PLATFORM_URL: &str = "https://backboard.railway.app/graphql";

/// Operations the engine needs from the deployment platform.
#[async_trait]
pub trait DeploymentClient: Send + Sync {
    async fn create_project(&self, name: &str) -> Result<RemoteProjectHandle>;

    async fn deploy_service(
        &self,
        project: &RemoteProjectHandle,
        image_ref: &str,
        env_vars: &BTreeMap<String, String>,
    ) -> Result<RemoteServiceHandle>;

    /// Deployment log lines, oldest first.
    async fn get_deployment_logs(&self, service: &RemoteServiceHandle) -> Result<Vec<LogEntry>>;
}

const CREATE_PROJECT: &str = r#"
mutation CreateProject($name: String!) {
  projectCreate(input: { name: $name }) {
    id
    name
  }
}"#;

const DEPLOY_SERVICE: &str = r#"
mutation DeployService($projectId: String!, $source: ServiceSourceInput!, $variables: EnvironmentVariables) {
  serviceCreate(input: { projectId: $projectId, source: $source, variables: $variables }) {
    id
    name
  }
}"#;

const DEPLOYMENT_LOGS: &str = r#"
query GetLogs($deploymentId: String!) {
  deployment(id: $deploymentId) {
    logs {
      message
      timestamp
    }
  }
}"#;

#[derive(Debug, Deserialize)]
struct GraphQlResponse<T> {
    data: Option<T>,
    #[serde(default)]
    errors: Vec<GraphQlError>,
}

#[derive(Debug, Deserialize)]
struct GraphQlError {
    message: String,
}

#[derive(Debug, Deserialize)]
struct Created {
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProjectCreateData {
    project_create: Created,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServiceCreateData {
    service_create: Created,
}

#[derive(Debug, Deserialize)]
struct DeploymentData {
    deployment: Option<DeploymentLogs>,
}

#[derive(Debug, Deserialize)]
struct DeploymentLogs {
    #[serde(default)]
    logs: Vec<LogEntry>,
}

/// Railway GraphQL client. Cheap to clone; shares one connection pool.
#[derive(Clone)]
pub struct RailwayClient {
    endpoint: String,
    token: String,
    timeout: Duration,
    http: reqwest::Client,
}

impl RailwayClient {
    pub fn new(endpoint: impl Into<String>, token: impl Into<String>, timeout: Duration) -> Self {
        Self {
            endpoint: endpoint.into(),
            token: token.into(),
            timeout,
            http: reqwest::Client::new(),
        }
    }

    async fn request<T: DeserializeOwned>(&self, query: &str, variables: Value) -> Result<T> {
        let resp = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.token)
            .timeout(self.timeout)
            .json(&json!({ "query": query, "variables": variables }))
            .send()
            .await
            .map_err(|e| transport_error(e, self.timeout))?;

        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| transport_error(e, self.timeout))?;
        if !status.is_success() {
            tracing::warn!(status = status.as_u16(), "platform API returned error status");
            return Err(PipelineError::remote(status.as_u16(), body));
        }

        let parsed: GraphQlResponse<T> = serde_json::from_str(&body)
            .map_err(|e| PipelineError::remote(status.as_u16(), format!("malformed response ({e}): {body}")))?;
        if !parsed.errors.is_empty() {
            let messages: Vec<&str> = parsed.errors.iter().map(|e| e.message.as_str()).collect();
            return Err(PipelineError::remote(status.as_u16(), messages.join("; ")));
        }
        parsed
            .data
            .ok_or_else(|| PipelineError::remote(status.as_u16(), format!("response without data: {body}")))
    }
}

fn transport_error(e: reqwest::Error, timeout: Duration) -> PipelineError {
    if e.is_timeout() {
        PipelineError::Timeout(timeout)
    } else {
        PipelineError::Http(e)
    }
}

#[async_trait]
impl DeploymentClient for RailwayClient {
    async fn create_project(&self, name: &str) -> Result<RemoteProjectHandle> {
        let data: ProjectCreateData = self.request(CREATE_PROJECT, json!({ "name": name })).await?;
        tracing::info!(project = %name, project_id = %data.project_create.id, "platform project created");
        Ok(RemoteProjectHandle(data.project_create.id))
    }

    async fn deploy_service(
        &self,
        project: &RemoteProjectHandle,
        image_ref: &str,
        env_vars: &BTreeMap<String, String>,
    ) -> Result<RemoteServiceHandle> {
        let variables = json!({
            "projectId": project.0,
            "source": { "image": image_ref },
            "variables": env_vars,
        });
        let data: ServiceCreateData = self.request(DEPLOY_SERVICE, variables).await?;
        tracing::info!(
            project_id = %project,
            service_id = %data.service_create.id,
            image = %image_ref,
            "platform service deployed"
        );
        Ok(RemoteServiceHandle(data.service_create.id))
    }

    async fn get_deployment_logs(&self, service: &RemoteServiceHandle) -> Result<Vec<LogEntry>> {
        let data: DeploymentData = self
            .request(DEPLOYMENT_LOGS, json!({ "deploymentId": service.0 }))
            .await?;
        match data.deployment {
            Some(d) => Ok(d.logs),
            None => Err(PipelineError::remote(404, format!("unknown deployment {service}"))),
        }
    }
}
