//! Free-text deploy request → structured plan.

use serde::{Deserialize, Serialize};

use super::{CompletionOptions, TextGenerator, extract_json};
use crate::error::{PipelineError, Result};

const PLANNER_SYSTEM: &str = "You are a deployment planner expert. Analyze deployment requests \
and create structured plans. Always respond with ONLY valid JSON, no markdown, no code blocks, \
no extra text.";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentPlan {
    pub framework: String,
    pub deployment_target: String,
    #[serde(default)]
    pub steps: Vec<PlanStep>,
    #[serde(default)]
    pub requirements: Vec<String>,
    #[serde(default)]
    pub estimated_time: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    pub step: u32,
    pub action: String,
    pub description: String,
}

pub async fn plan_deployment(generator: &dyn TextGenerator, request: &str) -> Result<DeploymentPlan> {
    let request = request.trim();
    if request.is_empty() {
        return Err(PipelineError::validation("request cannot be empty"));
    }
    tracing::info!(request, "planning deployment");

    let prompt = format!(
        r#"Analyze this deployment request and create a structured plan:

"{request}"

Return ONLY a JSON object with this exact structure:
{{
  "framework": "nextjs|react|node|python|vue|angular",
  "deploymentTarget": "railway|vercel|docker|aws|heroku",
  "steps": [
    {{"step": 1, "action": "analyze_project", "description": "Analyze project structure and dependencies"}},
    {{"step": 2, "action": "generate_dockerfile", "description": "Generate optimized Dockerfile for production"}},
    {{"step": 3, "action": "setup_ci_cd", "description": "Configure CI/CD pipeline"}},
    {{"step": 4, "action": "deploy", "description": "Deploy to platform"}}
  ],
  "requirements": ["docker", "cli-tools", "git"],
  "estimatedTime": "5-10 minutes"
}}

Base your response on the user's request. Return ONLY the JSON, nothing else."#
    );

    let options = CompletionOptions::new(0.3, 1000).with_system(PLANNER_SYSTEM);
    let reply = generator.complete(&prompt, &options).await?;
    let plan: DeploymentPlan = extract_json(&reply)?;
    tracing::info!(framework = %plan.framework, steps = plan.steps.len(), "plan ready");
    Ok(plan)
}
