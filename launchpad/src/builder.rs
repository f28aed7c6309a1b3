//! Container image builds, pushes and local runs.
//!
//! [`DockerCli`] drives the docker CLI: the CLI packs the project
//! directory into a build context and hands it to the daemon, and we
//! consume its output line by line as [`BuildProgressEvent`]s.

use std::collections::VecDeque;
use std::path::Path;
use std::process::{ExitStatus, Stdio};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;

use crate::error::{PipelineError, Result};
use crate::model::{BuildProgressEvent, OutputStream};

/// Lines kept for build failure diagnostics.
const LOG_TAIL_LINES: usize = 20;

pub const CONTAINER_DEFINITION_FILE: &str = "Dockerfile";

#[async_trait]
pub trait ArtifactBuilder: Send + Sync {
    /// Build `image` from `project_dir`. When `definition` is given it is
    /// written to the project's Dockerfile first.
    async fn build_image(
        &self,
        project_dir: &Path,
        image: &str,
        definition: Option<&str>,
        progress: Option<mpsc::Sender<BuildProgressEvent>>,
    ) -> Result<()>;

    /// Push a built image; returns the reference the registry serves it as.
    async fn push_image(&self, image: &str, registry: &str) -> Result<String>;

    /// Start a container for local verification; returns its id.
    async fn run_container(&self, image: &str, port: u16) -> Result<String>;
}

/// Docker CLI backed builder. Holds only the daemon address, so one
/// instance is shared by every run.
#[derive(Debug, Clone, Default)]
pub struct DockerCli {
    /// Daemon address passed as `-H`; the CLI default when `None`.
    docker_host: Option<String>,
}

impl DockerCli {
    pub fn new(docker_host: Option<String>) -> Self {
        Self { docker_host }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new("docker");
        if let Some(ref host) = self.docker_host {
            cmd.arg("-H").arg(host);
        }
        cmd.kill_on_drop(true);
        cmd
    }
}

/// Reference an image is pushed under.
pub fn registry_ref(image: &str, registry: &str) -> String {
    let registry = registry.trim_end_matches('/');
    if registry.is_empty() {
        image.to_string()
    } else {
        format!("{registry}/{image}")
    }
}

/// Run `cmd`, forwarding every output line, and return the exit status
/// together with the last [`LOG_TAIL_LINES`] lines.
async fn run_streaming(
    mut cmd: Command,
    image: &str,
    progress: Option<&mpsc::Sender<BuildProgressEvent>>,
) -> Result<(ExitStatus, Vec<String>)> {
    let mut child = cmd.stdout(Stdio::piped()).stderr(Stdio::piped()).spawn()?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| std::io::Error::other("child stdout not captured"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| std::io::Error::other("child stderr not captured"))?;

    let mut out = BufReader::new(stdout);
    let mut err = BufReader::new(stderr);
    let (mut out_buf, mut err_buf) = (Vec::new(), Vec::new());
    let (mut out_done, mut err_done) = (false, false);
    let mut tail: VecDeque<String> = VecDeque::with_capacity(LOG_TAIL_LINES);

    while !(out_done && err_done) {
        // Partial reads stay in the buffer when the other branch wins.
        let (stream, n) = tokio::select! {
            n = out.read_until(b'\n', &mut out_buf), if !out_done => (OutputStream::Stdout, n?),
            n = err.read_until(b'\n', &mut err_buf), if !err_done => (OutputStream::Stderr, n?),
        };
        let (buf, done) = match stream {
            OutputStream::Stdout => (&mut out_buf, &mut out_done),
            OutputStream::Stderr => (&mut err_buf, &mut err_done),
        };
        if n == 0 {
            *done = true;
            if buf.is_empty() {
                continue;
            }
        } else if buf.last() != Some(&b'\n') {
            continue;
        }

        let line = String::from_utf8_lossy(&buf[..]).trim_end().to_string();
        buf.clear();
        if line.is_empty() {
            continue;
        }
        tracing::debug!(target: "launchpad::builder", image, "{line}");
        if tail.len() == LOG_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line.clone());
        if let Some(tx) = progress {
            // A slow consumer drops lines.
            let _ = tx.try_send(BuildProgressEvent {
                image: image.to_string(),
                stream,
                line,
            });
        }
    }

    let status = child.wait().await?;
    Ok((status, tail.into()))
}

#[async_trait]
impl ArtifactBuilder for DockerCli {
    async fn build_image(
        &self,
        project_dir: &Path,
        image: &str,
        definition: Option<&str>,
        progress: Option<mpsc::Sender<BuildProgressEvent>>,
    ) -> Result<()> {
        tracing::info!(image, dir = %project_dir.display(), "building image");

        if let Some(definition) = definition {
            tokio::fs::write(project_dir.join(CONTAINER_DEFINITION_FILE), definition).await?;
        }

        let mut cmd = self.command();
        cmd.args(["build", "-t", image, "-f", CONTAINER_DEFINITION_FILE, "."])
            .current_dir(project_dir);
        let (status, log_tail) = run_streaming(cmd, image, progress.as_ref()).await?;

        if !status.success() {
            return Err(PipelineError::Build {
                image: image.to_string(),
                exit_code: status.code().unwrap_or(-1),
                log_tail,
            });
        }
        tracing::info!(image, "image built");
        Ok(())
    }

    async fn push_image(&self, image: &str, registry: &str) -> Result<String> {
        let target = registry_ref(image, registry);
        tracing::info!(image, registry, target = %target, "pushing image");

        let push_error = |message: String| PipelineError::Push {
            image: image.to_string(),
            registry: registry.to_string(),
            message,
        };

        if target != image {
            let output = self.command().args(["tag", image, &target]).output().await?;
            if !output.status.success() {
                return Err(push_error(String::from_utf8_lossy(&output.stderr).trim().to_string()));
            }
        }

        let mut cmd = self.command();
        cmd.args(["push", &target]);
        let (status, log_tail) = run_streaming(cmd, image, None).await?;
        if !status.success() {
            return Err(push_error(log_tail.join("\n")));
        }
        tracing::info!(target = %target, "image pushed");
        Ok(target)
    }

    async fn run_container(&self, image: &str, port: u16) -> Result<String> {
        let binding = format!("{port}:{port}");
        let output = self
            .command()
            .args(["run", "-d", "-p", &binding, image])
            .output()
            .await?;
        if !output.status.success() {
            return Err(PipelineError::Build {
                image: image.to_string(),
                exit_code: output.status.code().unwrap_or(-1),
                log_tail: String::from_utf8_lossy(&output.stderr)
                    .lines()
                    .map(str::to_string)
                    .collect(),
            });
        }
        let id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        tracing::info!(image, container = %id, port, "container started");
        Ok(id)
    }
}
