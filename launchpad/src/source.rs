//! Getting project sources onto local disk.
//!
//! Uploads (single files, `.zip` or `.tar` archives) and repository
//! clones each land in a fresh directory under the workspace root.

use std::io::Cursor;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use crate::error::{PipelineError, Result};
use crate::runid;

/// One uploaded file as received from the client.
#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub name: String,
    pub bytes: Vec<u8>,
}

#[async_trait]
pub trait SourceAcquirer: Send + Sync {
    /// Clone a repository; returns the checkout directory.
    async fn clone_repository(&self, url: &str) -> Result<PathBuf>;

    /// Materialize uploaded files, extracting `.zip` and `.tar` archives
    /// in place.
    async fn accept_upload(&self, files: Vec<UploadedFile>) -> Result<PathBuf>;
}

/// Filesystem + git implementation rooted at a workspace directory.
#[derive(Debug, Clone)]
pub struct LocalSourceAcquirer {
    root: PathBuf,
    clone_timeout: Duration,
}

impl LocalSourceAcquirer {
    pub fn new(root: impl Into<PathBuf>, clone_timeout: Duration) -> Self {
        Self {
            root: root.into(),
            clone_timeout,
        }
    }

    async fn fresh_dir(&self, prefix: &str) -> Result<PathBuf> {
        let dir = self.root.join(runid::with_prefix(prefix));
        tokio::fs::create_dir_all(&dir).await?;
        Ok(dir)
    }
}

#[async_trait]
impl SourceAcquirer for LocalSourceAcquirer {
    async fn clone_repository(&self, url: &str) -> Result<PathBuf> {
        check_repository_url(url)?;
        let dir = self.fresh_dir("github").await?;
        tracing::info!(%url, dir = %dir.display(), "cloning repository");

        let output = tokio::time::timeout(
            self.clone_timeout,
            Command::new("git")
                .args(["clone", "--depth", "1", "--", url])
                .arg(&dir)
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| PipelineError::Timeout(self.clone_timeout))??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let _ = tokio::fs::remove_dir_all(&dir).await;
            return Err(PipelineError::Io(std::io::Error::other(format!(
                "git clone {url} failed: {}",
                stderr.trim()
            ))));
        }
        Ok(dir)
    }

    async fn accept_upload(&self, files: Vec<UploadedFile>) -> Result<PathBuf> {
        if files.is_empty() {
            return Err(PipelineError::validation("no files uploaded"));
        }
        let dir = self.fresh_dir("project").await?;

        for file in files {
            let extract: Option<fn(&[u8], &Path) -> Result<usize>> = match archive_kind(&file.name) {
                Some(ArchiveKind::Zip) => Some(extract_zip),
                Some(ArchiveKind::Tar) => Some(extract_tar),
                None => None,
            };
            if let Some(extract) = extract {
                let dest = dir.clone();
                let name = file.name.clone();
                let extracted = tokio::task::spawn_blocking(move || extract(&file.bytes, &dest))
                    .await
                    .map_err(std::io::Error::other)??;
                tracing::info!(archive = %name, entries = extracted, "archive extracted");
            } else {
                let Some(base) = Path::new(&file.name).file_name() else {
                    return Err(PipelineError::Source(format!("invalid file name {:?}", file.name)));
                };
                tokio::fs::write(dir.join(base), &file.bytes).await?;
            }
        }
        Ok(dir)
    }
}

/// Only remote http(s) and ssh (`git@`) repositories may be cloned; local
/// paths and `file://` urls are refused.
pub fn check_repository_url(url: &str) -> Result<()> {
    let remote = ["https://", "http://", "git@"]
        .iter()
        .any(|scheme| url.starts_with(scheme));
    if !remote {
        return Err(PipelineError::validation(format!("unsupported repository url: {url}")));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArchiveKind {
    Zip,
    Tar,
}

fn archive_kind(name: &str) -> Option<ArchiveKind> {
    let lower = name.to_ascii_lowercase();
    if lower.ends_with(".zip") {
        Some(ArchiveKind::Zip)
    } else if lower.ends_with(".tar") {
        Some(ArchiveKind::Tar)
    } else {
        None
    }
}

/// A relative path that stays inside its root.
fn is_contained(path: &Path) -> bool {
    path.components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

/// Extract a tar archive into `dest`. Any entry that would escape `dest`
/// rejects the whole archive; link entries are skipped.
pub fn extract_tar(bytes: &[u8], dest: &Path) -> Result<usize> {
    // First pass validates every entry so nothing is written for a
    // malicious archive.
    let mut archive = tar::Archive::new(Cursor::new(bytes));
    for entry in archive.entries()? {
        let entry = entry?;
        let path = entry.path()?;
        if !is_contained(&path) {
            return Err(PipelineError::Source(format!(
                "archive entry escapes target directory: {}",
                path.display()
            )));
        }
    }

    let mut archive = tar::Archive::new(Cursor::new(bytes));
    let mut count = 0;
    for entry in archive.entries()? {
        let mut entry = entry?;
        let kind = entry.header().entry_type();
        if kind.is_symlink() || kind.is_hard_link() {
            tracing::warn!(path = %entry.path()?.display(), "skipping link entry");
            continue;
        }
        if entry.unpack_in(dest)? {
            count += 1;
        }
    }
    Ok(count)
}

/// Extract a zip archive into `dest`. Same rules as [`extract_tar`]: an
/// entry without a contained path rejects the whole archive before anything
/// is written, and symlinks are skipped.
pub fn extract_zip(bytes: &[u8], dest: &Path) -> Result<usize> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).map_err(zip_error)?;

    for i in 0..archive.len() {
        let entry = archive.by_index_raw(i).map_err(zip_error)?;
        if entry.enclosed_name().is_none() {
            return Err(PipelineError::Source(format!(
                "archive entry escapes target directory: {}",
                entry.name()
            )));
        }
    }

    let mut count = 0;
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i).map_err(zip_error)?;
        let Some(rel) = entry.enclosed_name() else {
            continue;
        };
        let target = dest.join(rel);
        if entry.is_dir() {
            std::fs::create_dir_all(&target)?;
            continue;
        }
        if entry.unix_mode().is_some_and(|mode| mode & 0o170000 == 0o120000) {
            tracing::warn!(path = %entry.name(), "skipping link entry");
            continue;
        }
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out = std::fs::File::create(&target)?;
        std::io::copy(&mut entry, &mut out)?;
        count += 1;
    }
    Ok(count)
}

fn zip_error(e: zip::result::ZipError) -> PipelineError {
    PipelineError::Source(format!("invalid zip archive: {e}"))
}
