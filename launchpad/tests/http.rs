//! HTTP API end to end: router on a real socket, fakes behind the engine.

mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use common::{CannedGenerator, Harness};
use launchpad::analyzer::ManifestAnalyzer;
use launchpad::generate::TextGenerator;
use launchpad::http::{AppState, router};
use launchpad::queue::DeploymentRequestQueue;

struct Api {
    base: String,
    http: reqwest::Client,
    harness: Harness,
    shutdown: CancellationToken,
}

impl Drop for Api {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl Api {
    async fn start(generator: Option<Arc<dyn TextGenerator>>) -> Self {
        let harness = Harness::new();
        let shutdown = CancellationToken::new();
        let (queue, _dispatcher) =
            DeploymentRequestQueue::start(harness.engine.clone(), 2, shutdown.clone());
        let state = Arc::new(AppState {
            queue,
            generator,
            analyzer: Arc::new(ManifestAnalyzer),
            acquirer: harness.acquirer.clone(),
            workspace_dir: harness.workdir.path().to_path_buf(),
        });

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let stop = shutdown.clone();
        tokio::spawn(async move {
            axum::serve(listener, router(state))
                .with_graceful_shutdown(async move { stop.cancelled().await })
                .await
                .unwrap();
        });

        Self {
            base: format!("http://{addr}"),
            http: reqwest::Client::new(),
            harness,
            shutdown,
        }
    }

    async fn post(&self, path: &str, body: Value) -> (u16, Value) {
        let resp = self
            .http
            .post(format!("{}{path}", self.base))
            .json(&body)
            .send()
            .await
            .unwrap();
        let status = resp.status().as_u16();
        (status, resp.json().await.unwrap())
    }

    async fn get(&self, path: &str) -> (u16, Value) {
        let resp = self
            .http
            .get(format!("{}{path}", self.base))
            .send()
            .await
            .unwrap();
        let status = resp.status().as_u16();
        (status, resp.json().await.unwrap())
    }

    /// Poll the status endpoint until the run is terminal.
    async fn wait_for(&self, tracking_id: &str) -> Value {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let (status, body) = self.get(&format!("/api/status/{tracking_id}")).await;
            assert_eq!(status, 200, "{body}");
            let run_status = body["run"]["status"].as_str().unwrap_or_default().to_string();
            if matches!(run_status.as_str(), "succeeded" | "failed") {
                return body["run"].clone();
            }
            assert!(tokio::time::Instant::now() < deadline, "run never finished: {body}");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

#[tokio::test]
async fn health() {
    let api = Api::start(None).await;
    let (status, body) = api.get("/api/health").await;
    assert_eq!(status, 200);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn deploy_image_then_poll_status() {
    let api = Api::start(None).await;
    let (status, body) = api
        .post(
            "/api/deployment/deploy",
            json!({
                "projectName": "demo",
                "imageRef": "demo:latest",
                "envVars": {"PORT": "3000"},
                "webhookUrl": "http://hooks.local/done",
            }),
        )
        .await;
    assert_eq!(status, 200, "{body}");
    assert_eq!(body["success"], true);
    assert_eq!(body["message"], "Deployment started");
    let tracking_id = body["trackingId"].as_str().unwrap().to_string();

    let run = api.wait_for(&tracking_id).await;
    assert_eq!(run["status"], "succeeded", "{run}");
    assert_eq!(api.harness.notifier.delivered().len(), 1);

    let (status, body) = api.get("/api/status/svc-1/logs").await;
    assert_eq!(status, 200);
    assert_eq!(body["logs"][0]["message"], "listening on 3000");
}

#[tokio::test]
async fn deploy_uploaded_directory_builds_and_pushes() {
    let api = Api::start(None).await;
    let dir = api.harness.workdir.path().join("upload-1");
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("package.json"), r#"{"dependencies":{"express":"4"}}"#).unwrap();

    let (status, body) = api
        .post(
            "/api/deployment/deploy",
            json!({
                "projectName": "shop",
                "uploadedCodePath": dir.to_string_lossy(),
                "dockerfile": "FROM node:18-alpine",
                "webhookUrl": "http://hooks.local/done",
            }),
        )
        .await;
    assert_eq!(status, 200, "{body}");
    let run = api.wait_for(body["trackingId"].as_str().unwrap()).await;
    assert_eq!(run["status"], "succeeded", "{run}");

    let builds = api.harness.builder.builds.lock().unwrap().clone();
    assert_eq!(builds.len(), 1);
    assert_eq!(builds[0].2.as_deref(), Some("FROM node:18-alpine"));
    assert_eq!(
        api.harness.platform.deployed_images.lock().unwrap().clone(),
        vec!["docker.io/shop:latest".to_string()]
    );
}

#[tokio::test]
async fn deploy_rejects_bad_requests() {
    let api = Api::start(None).await;

    let (status, body) = api
        .post(
            "/api/deployment/deploy",
            json!({"projectName": "demo", "webhookUrl": "http://hooks.local/done"}),
        )
        .await;
    assert_eq!(status, 400);
    assert!(body["error"].as_str().unwrap().contains("imageRef"));

    let (status, _) = api
        .post(
            "/api/deployment/deploy",
            json!({"projectName": "demo", "imageRef": "demo:latest"}),
        )
        .await;
    assert_eq!(status, 400);

    let (status, _) = api
        .post(
            "/api/deployment/deploy",
            json!({"projectName": "no spaces allowed", "imageRef": "demo:latest", "webhookUrl": "http://h/x"}),
        )
        .await;
    assert_eq!(status, 400);

    let outside = tempfile::tempdir().unwrap();
    let (status, body) = api
        .post(
            "/api/deployment/deploy",
            json!({
                "projectName": "demo",
                "uploadedCodePath": outside.path().to_string_lossy(),
                "webhookUrl": "http://hooks.local/done",
            }),
        )
        .await;
    assert_eq!(status, 400);
    assert!(body["error"].as_str().unwrap().contains("outside the workspace"));
}

#[tokio::test]
async fn unknown_run_is_404() {
    let api = Api::start(None).await;
    let (status, body) = api.get("/api/status/does-not-exist").await;
    assert_eq!(status, 404);
    assert!(body["error"].as_str().unwrap().contains("does-not-exist"));

    let (status, _) = api.post("/api/deployment/does-not-exist/cancel", json!({})).await;
    assert_eq!(status, 404);
}

#[tokio::test]
async fn cancelling_a_finished_run_is_a_no_op() {
    let api = Api::start(None).await;
    let (_, body) = api
        .post(
            "/api/deployment/deploy",
            json!({"projectName": "demo", "imageRef": "demo:latest", "webhookUrl": "http://h/x"}),
        )
        .await;
    let tracking_id = body["trackingId"].as_str().unwrap().to_string();
    api.wait_for(&tracking_id).await;

    let (status, body) = api
        .post(&format!("/api/deployment/{tracking_id}/cancel"), json!({}))
        .await;
    assert_eq!(status, 200);
    assert_eq!(body["cancelled"], false);
}

#[tokio::test]
async fn generation_without_a_key_is_unavailable() {
    let api = Api::start(None).await;
    let (status, body) = api
        .post("/api/deployment/generate-plan", json!({"request": "deploy my app"}))
        .await;
    assert_eq!(status, 503);
    assert!(body["error"].as_str().unwrap().contains("GROQ_API_KEY"));
}

#[tokio::test]
async fn plan_requires_request_text() {
    let api = Api::start(Some(Arc::new(CannedGenerator::default()))).await;
    let (status, body) = api.post("/api/deployment/generate-plan", json!({})).await;
    assert_eq!(status, 400);
    assert_eq!(body["error"], "Request text is required");
}

#[tokio::test]
async fn plan_from_generator() {
    let reply = r#"Sure! {"framework":"nextjs","deploymentTarget":"railway","steps":[{"step":1,"action":"deploy","description":"Deploy to platform"}],"requirements":["docker"],"estimatedTime":"5-10 minutes"}"#;
    let api = Api::start(Some(Arc::new(CannedGenerator::new(&[reply])))).await;
    let (status, body) = api
        .post("/api/deployment/plan", json!({"request": "deploy my next.js app"}))
        .await;
    assert_eq!(status, 200, "{body}");
    assert_eq!(body["success"], true);
    assert_eq!(body["plan"]["framework"], "nextjs");
    assert_eq!(body["plan"]["steps"][0]["action"], "deploy");
}

#[tokio::test]
async fn prose_plan_is_a_bad_gateway() {
    let api = Api::start(Some(Arc::new(CannedGenerator::new(&[
        "I would suggest deploying to railway.",
    ]))))
    .await;
    let (status, _) = api
        .post("/api/deployment/generate-plan", json!({"request": "deploy"}))
        .await;
    assert_eq!(status, 502);
}

#[tokio::test]
async fn readme_requires_project_details() {
    let api = Api::start(Some(Arc::new(CannedGenerator::new(&["# Demo"])))).await;
    let (status, body) = api.post("/api/docs/generate-readme", json!({})).await;
    assert_eq!(status, 400);
    assert_eq!(body["error"], "Project details are required");

    let (status, body) = api
        .post(
            "/api/docs/generate-readme",
            json!({"projectDetails": {"name": "demo"}, "codeAnalysis": {"framework": "node"}}),
        )
        .await;
    assert_eq!(status, 200, "{body}");
    assert_eq!(body["readme"], "# Demo");
}

#[tokio::test]
async fn upload_code_returns_analysis() {
    let api = Api::start(None).await;
    let form = reqwest::multipart::Form::new()
        .part(
            "files",
            reqwest::multipart::Part::bytes(br#"{"dependencies":{"next":"14","react":"18"}}"#.to_vec())
                .file_name("package.json"),
        )
        .part(
            "files",
            reqwest::multipart::Part::bytes(b"console.log(1)".to_vec()).file_name("index.js"),
        );
    let resp = api
        .http
        .post(format!("{}/api/upload/upload-code", api.base))
        .multipart(form)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["success"], true);
    assert_eq!(body["analysis"]["framework"], "nextjs");
    let files = body["analysis"]["files"].as_array().unwrap();
    assert!(files.contains(&json!("index.js")));
}

#[tokio::test]
async fn upload_without_files_is_rejected() {
    let api = Api::start(None).await;
    let form = reqwest::multipart::Form::new().text("note", "no files here");
    let resp = api
        .http
        .post(format!("{}/api/upload/upload-code", api.base))
        .multipart(form)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "No files uploaded");
}

#[tokio::test]
async fn clone_requires_url() {
    let api = Api::start(None).await;
    let (status, body) = api.post("/api/upload/clone-github", json!({})).await;
    assert_eq!(status, 400);
    assert_eq!(body["error"], "GitHub URL is required");
}
