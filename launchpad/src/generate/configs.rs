//! Deployment config files: Dockerfile, CI workflow, platform config.

use serde::Serialize;
use serde_json::{Value, json};

use super::{CompletionOptions, TextGenerator, strip_code_fences};
use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedConfigs {
    pub dockerfile: String,
    pub github_actions: String,
    pub railway_config: String,
}

pub async fn generate_dockerfile(
    generator: &dyn TextGenerator,
    framework: &str,
    details: &Value,
) -> Result<String> {
    tracing::info!(framework, "generating Dockerfile");
    let details = serde_json::to_string_pretty(details)?;
    let prompt = format!(
        "Generate a production-ready Dockerfile for a {framework} application.\n\n\
         Project Details:\n{details}\n\n\
         Return ONLY the Dockerfile content, no explanations, no markdown code blocks."
    );
    let reply = generator
        .complete(&prompt, &CompletionOptions::new(0.3, 1500))
        .await?;
    Ok(strip_code_fences(&reply))
}

pub async fn generate_ci_workflow(generator: &dyn TextGenerator, framework: &str) -> Result<String> {
    tracing::info!(framework, "generating CI workflow");
    let prompt = format!(
        "Generate a GitHub Actions workflow YAML for deploying a {framework} app to Railway.\n\n\
         Include:\n- Build step\n- Docker image creation\n- Railway deployment\n\
         - Environment variable handling\n\n\
         Return ONLY the YAML content, no markdown code blocks."
    );
    let reply = generator
        .complete(&prompt, &CompletionOptions::new(0.3, 1500))
        .await?;
    Ok(strip_code_fences(&reply))
}

/// Static platform config; nothing generated.
pub fn railway_config(service_name: &str) -> String {
    let config = json!({
        "build": {
            "builder": "DOCKERFILE",
            "dockerfilePath": "Dockerfile"
        },
        "deploy": {
            "startCommand": "npm start",
            "restartPolicyType": "ON_FAILURE",
            "restartPolicyMaxRetries": 10
        },
        "service": {
            "name": service_name
        }
    });
    serde_json::to_string_pretty(&config).unwrap_or_else(|_| config.to_string())
}

/// All three config files for one project.
pub async fn generate_configs(
    generator: &dyn TextGenerator,
    framework: &str,
    details: &Value,
    service_name: &str,
) -> Result<GeneratedConfigs> {
    let (dockerfile, github_actions) = tokio::try_join!(
        generate_dockerfile(generator, framework, details),
        generate_ci_workflow(generator, framework),
    )?;
    Ok(GeneratedConfigs {
        dockerfile,
        github_actions,
        railway_config: railway_config(service_name),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generate::fake::Scripted;

    #[test]
    fn railway_config_names_the_service() {
        let v: Value = serde_json::from_str(&railway_config("demo")).unwrap();
        assert_eq!(v["service"]["name"], "demo");
        assert_eq!(v["build"]["builder"], "DOCKERFILE");
        assert_eq!(v["deploy"]["restartPolicyMaxRetries"], 10);
    }

    #[tokio::test]
    async fn dockerfile_loses_its_fences() {
        let llm = Scripted::new(&["```dockerfile\nFROM node:20-alpine\nCMD [\"npm\", \"start\"]\n```"]);
        let out = generate_dockerfile(&llm, "node", &json!({"port": 3000}))
            .await
            .unwrap();
        assert!(out.starts_with("FROM node:20-alpine"));
        assert!(!out.contains("```"));
        let prompts = llm.prompts.lock().unwrap();
        assert!(prompts[0].0.contains("\"port\": 3000"));
    }
}
