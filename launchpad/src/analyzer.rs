//! Static project inspection.
//!
//! Looks at manifest files only; nothing is executed.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::Result;
use crate::model::ProjectDescriptor;

/// Directories never included in file listings.
const SKIPPED_DIRS: &[&str] = &["node_modules", ".git", "dist", "build", "target"];

#[async_trait]
pub trait ProjectAnalyzer: Send + Sync {
    async fn analyze(&self, path: &Path) -> Result<ProjectDescriptor>;
}

/// Detects the framework from `package.json`, `requirements.txt` and an
/// existing `Dockerfile`.
#[derive(Debug, Clone, Default)]
pub struct ManifestAnalyzer;

#[derive(Debug, Default, Deserialize)]
struct PackageJson {
    #[serde(default)]
    dependencies: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    scripts: BTreeMap<String, String>,
}

#[async_trait]
impl ProjectAnalyzer for ManifestAnalyzer {
    async fn analyze(&self, path: &Path) -> Result<ProjectDescriptor> {
        let root = path.to_path_buf();
        let descriptor = tokio::task::spawn_blocking(move || analyze_sync(&root))
            .await
            .map_err(std::io::Error::other)??;
        tracing::info!(
            path = %path.display(),
            framework = %descriptor.framework,
            files = descriptor.files.len(),
            "project analyzed"
        );
        Ok(descriptor)
    }
}

fn analyze_sync(root: &Path) -> Result<ProjectDescriptor> {
    let mut d = ProjectDescriptor::default();

    match std::fs::read_to_string(root.join("package.json")) {
        Ok(raw) => match serde_json::from_str::<PackageJson>(&raw) {
            Ok(pkg) => apply_package_json(&mut d, pkg),
            Err(e) => tracing::warn!(error = %e, "package.json is not valid JSON, ignoring"),
        },
        Err(_) => tracing::debug!("no package.json"),
    }

    if root.join("requirements.txt").is_file() {
        d.framework = "python".to_string();
        d.package_manager = "pip".to_string();
        d.start_command = Some("python app.py".to_string());
    }

    d.has_container_definition = root.join("Dockerfile").is_file();
    d.files = list_files(root)?;
    Ok(d)
}

fn apply_package_json(d: &mut ProjectDescriptor, pkg: PackageJson) {
    let has = |name: &str| pkg.dependencies.contains_key(name);
    let npm_build = Some("npm run build".to_string());
    let npm_start = Some("npm start".to_string());

    if has("next") {
        d.framework = "nextjs".to_string();
        d.build_command = npm_build;
        d.start_command = npm_start;
    } else if has("react") {
        d.framework = "react".to_string();
        d.build_command = npm_build;
        d.start_command = npm_start;
    } else if has("express") {
        d.framework = "node".to_string();
        d.start_command = Some("node server.js".to_string());
    } else if has("vue") {
        d.framework = "vue".to_string();
        d.build_command = npm_build;
    }
    d.dependencies = pkg.dependencies.keys().cloned().collect();

    let start = pkg.scripts.get("start").or_else(|| pkg.scripts.get("dev"));
    if let Some(port) = start.and_then(|s| port_from_script(s)) {
        d.port = port;
    }
    d.scripts = pkg.scripts;
}

/// `PORT=8080 node server.js` → 8080.
fn port_from_script(script: &str) -> Option<u16> {
    let rest = &script[script.find("PORT=")? + "PORT=".len()..];
    let digits: String = rest.chars().take_while(char::is_ascii_digit).collect();
    digits.parse().ok()
}

/// Relative paths of all files under `root`, sorted.
pub fn list_files(root: &Path) -> Result<Vec<String>> {
    fn walk(dir: &Path, root: &Path, out: &mut Vec<String>) -> std::io::Result<()> {
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let path: PathBuf = entry.path();
            if entry.file_type()?.is_dir() {
                let name = entry.file_name();
                if SKIPPED_DIRS.iter().any(|s| name == *s) {
                    continue;
                }
                walk(&path, root, out)?;
            } else if let Ok(rel) = path.strip_prefix(root) {
                out.push(rel.to_string_lossy().replace('\\', "/"));
            }
        }
        Ok(())
    }

    let mut files = Vec::new();
    walk(root, root, &mut files)?;
    files.sort();
    Ok(files)
}
