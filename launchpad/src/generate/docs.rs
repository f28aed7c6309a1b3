//! Project documentation: README, API reference, architecture diagram.

use serde::Serialize;
use serde_json::Value;

use super::{CompletionOptions, TextGenerator, strip_code_fences};
use crate::error::Result;

const MERMAID_DIRECTIVES: &[&str] = &[
    "graph",
    "flowchart",
    "sequencediagram",
    "classdiagram",
    "statediagram",
    "erdiagram",
    "gantt",
    "pie",
    "gitgraph",
    "journey",
];

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedDocs {
    pub readme: String,
    pub api_docs: String,
    pub architecture_diagram: String,
}

fn framework_of(details: &Value) -> &str {
    details
        .get("framework")
        .and_then(Value::as_str)
        .unwrap_or("web")
}

fn context_block(details: &Value, analysis: &Value) -> Result<String> {
    Ok(format!(
        "Project Details:\n{}\n\nCode Analysis:\n{}",
        serde_json::to_string_pretty(details)?,
        serde_json::to_string_pretty(analysis)?
    ))
}

pub async fn generate_readme(
    generator: &dyn TextGenerator,
    details: &Value,
    analysis: &Value,
) -> Result<String> {
    let framework = framework_of(details);
    tracing::info!(framework, "generating README");
    let prompt = format!(
        "Generate a comprehensive, professional README.md file for a {framework} application.\n\n\
         {}\n\n\
         The README should include: project title and description, features list, tech stack, \
         prerequisites, installation instructions, configuration steps, usage examples, \
         API endpoints (if applicable), project structure, contributing guidelines, license \
         information and credits.\n\
         Return ONLY the README content in markdown format, no code blocks, no explanations.",
        context_block(details, analysis)?
    );
    let reply = generator
        .complete(&prompt, &CompletionOptions::new(0.4, 3000))
        .await?;
    Ok(strip_code_fences(&reply))
}

pub async fn generate_api_docs(
    generator: &dyn TextGenerator,
    details: &Value,
    analysis: &Value,
) -> Result<String> {
    let framework = framework_of(details);
    tracing::info!(framework, "generating API docs");
    let prompt = format!(
        "Generate comprehensive API documentation for a {framework} application.\n\n\
         {}\n\n\
         Cover the API overview and base URL, authentication, every endpoint (method, path, \
         description, parameters, response format with status codes, example requests and \
         responses), error handling, rate limiting and versioning.\n\
         Format it as markdown with code blocks for examples.\n\
         Return ONLY the API documentation content, no code block wrapper, no explanations.",
        context_block(details, analysis)?
    );
    let reply = generator
        .complete(&prompt, &CompletionOptions::new(0.3, 3000))
        .await?;
    Ok(strip_code_fences(&reply))
}

pub async fn generate_architecture_diagram(
    generator: &dyn TextGenerator,
    details: &Value,
    analysis: &Value,
) -> Result<String> {
    let framework = framework_of(details);
    tracing::info!(framework, "generating architecture diagram");
    let prompt = format!(
        "Generate a Mermaid architecture diagram for a {framework} application.\n\n\
         {}\n\n\
         Show system components, data flow between them, external services and APIs, \
         deployment infrastructure and the technology stack.\n\
         Use Mermaid syntax (graph TB, flowchart TD, etc.) with proper labels.\n\
         Return ONLY the Mermaid diagram code, no markdown code blocks, no explanations.",
        context_block(details, analysis)?
    );
    let reply = generator
        .complete(&prompt, &CompletionOptions::new(0.3, 2000))
        .await?;
    Ok(ensure_mermaid_directive(&strip_code_fences(&reply)))
}

fn ensure_mermaid_directive(diagram: &str) -> String {
    let lower = diagram.to_ascii_lowercase();
    if MERMAID_DIRECTIVES.iter().any(|d| lower.starts_with(d)) {
        diagram.to_string()
    } else {
        format!("flowchart TD\n{diagram}")
    }
}

/// README, API docs and diagram, generated concurrently.
pub async fn generate_all(
    generator: &dyn TextGenerator,
    details: &Value,
    analysis: &Value,
) -> Result<GeneratedDocs> {
    let (readme, api_docs, architecture_diagram) = tokio::try_join!(
        generate_readme(generator, details, analysis),
        generate_api_docs(generator, details, analysis),
        generate_architecture_diagram(generator, details, analysis),
    )?;
    Ok(GeneratedDocs {
        readme,
        api_docs,
        architecture_diagram,
    })
}
