//! Text generation: deployment plans, config files and documentation.
//!
//! Everything model-produced passes through [`strip_code_fences`] or
//! [`extract_json`] before anyone else sees it.

pub mod configs;
pub mod docs;
pub mod llm;
pub mod plan;

use serde::de::DeserializeOwned;

use crate::error::{PipelineError, Result};

pub use configs::{GeneratedConfigs, generate_ci_workflow, generate_configs, generate_dockerfile, railway_config};
pub use docs::{GeneratedDocs, generate_all, generate_api_docs, generate_architecture_diagram, generate_readme};
pub use llm::{CompletionOptions, LlmClient, TextGenerator};
pub use plan::{DeploymentPlan, PlanStep, plan_deployment};

/// Remove a leading ```` ```lang ```` line and a trailing ```` ``` ````.
pub fn strip_code_fences(text: &str) -> String {
    let mut body = text.trim();
    if body.starts_with("```") {
        body = match body.find('\n') {
            Some(nl) => &body[nl + 1..],
            None => "",
        };
    }
    if let Some(stripped) = body.trim_end().strip_suffix("```") {
        body = stripped;
    }
    body.trim().to_string()
}

/// Parse the outermost `{...}` object of a model reply.
pub fn extract_json<T: DeserializeOwned>(text: &str) -> Result<T> {
    let body = strip_code_fences(text);
    let (Some(start), Some(end)) = (body.find('{'), body.rfind('}')) else {
        return Err(PipelineError::GenerationFormat(format!(
            "no JSON object in reply: {}",
            preview(&body)
        )));
    };
    if end < start {
        return Err(PipelineError::GenerationFormat(format!(
            "no JSON object in reply: {}",
            preview(&body)
        )));
    }
    serde_json::from_str(&body[start..=end])
        .map_err(|e| PipelineError::GenerationFormat(format!("{e}: {}", preview(&body))))
}

fn preview(text: &str) -> String {
    text.chars().take(120).collect()
}
