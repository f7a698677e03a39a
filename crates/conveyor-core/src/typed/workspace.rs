//! Per-task working areas and artifact distribution.
//!
//! # Layout
//! - working area: `<workspace_root>/<task_id>/`
//! - distributed artifacts: `<publish_root>/<content_id>/<task_id>/<name>`
//!
//! Both are keyed by task id, so sibling tasks of one content (a
//! publication and its reductions, or two reductions) never share a file.
//! Distribution writes to a temporary name inside the task's directory and
//! renames it into place.
//!
//! # Path safety
//! `content_id` becomes a directory name. `check_content_id` rejects
//! anything that could leave `publish_root`; pipelines call it while
//! validating and `distribute` calls it again before touching the disk.

use std::io;
use std::path::{Path, PathBuf};

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::domain::{RunError, TaskId};

/// Lowercase hex sha256 of `bytes`.
pub fn sha256_hex(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let digest = Sha256::digest(bytes);
    let mut out = String::with_capacity(digest.len() * 2);
    for b in digest.iter() {
        let _ = write!(out, "{b:02x}");
    }
    out
}

/// Accepts `"<hex>"` or `"sha256:<hex>"`, any case.
fn normalize_checksum(checksum: &str) -> String {
    let lower = checksum.trim().to_ascii_lowercase();
    match lower.strip_prefix("sha256:") {
        Some(hex) => hex.to_string(),
        None => lower,
    }
}

#[derive(Debug, Clone)]
pub struct WorkingArea {
    root: PathBuf,
}

impl WorkingArea {
    pub fn for_task(workspace_root: &Path, task_id: TaskId) -> Self {
        Self {
            root: workspace_root.join(task_id.to_string()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    pub fn file(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    pub async fn prepare(&self) -> Result<(), RunError> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| RunError::io(format!("creating {}", self.root.display()), e))
    }

    /// Copy `source` into the area and verify it against `expected`.
    pub async fn stage_input(&self, source: &Path, expected: &str) -> Result<PathBuf, RunError> {
        let bytes = tokio::fs::read(source)
            .await
            .map_err(|e| RunError::io(format!("reading {}", source.display()), e))?;

        let actual = sha256_hex(&bytes);
        let expected = normalize_checksum(expected);
        if actual != expected {
            return Err(RunError::ChecksumMismatch {
                path: source.display().to_string(),
                expected,
                actual,
            });
        }

        let name = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "input".to_string());
        self.write(&name, &bytes).await
    }

    pub async fn write(&self, name: &str, bytes: &[u8]) -> Result<PathBuf, RunError> {
        let path = self.file(name);
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| RunError::io(format!("writing {}", path.display()), e))?;
        Ok(path)
    }

    /// Remove the area. Missing is fine.
    pub async fn remove(&self) -> io::Result<()> {
        match tokio::fs::remove_dir_all(&self.root).await {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}

/// `content_id` must be usable as a single directory name.
///
/// Rejects empty ids, `.` / `..`, path separators and NUL.
pub fn check_content_id(content_id: &str) -> Result<(), RunError> {
    let trimmed = content_id.trim();
    if trimmed.is_empty() {
        return Err(RunError::validation("content_id is empty"));
    }
    if trimmed == "." || trimmed == ".." || content_id.contains("..") {
        return Err(RunError::validation(format!(
            "content_id '{content_id}' must not contain '..'"
        )));
    }
    if content_id.contains(['/', '\\', '\0']) {
        return Err(RunError::validation(format!(
            "content_id '{content_id}' must not contain path separators"
        )));
    }
    Ok(())
}

/// A file made visible to the rest of the system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Distributed {
    pub path: PathBuf,
    pub sha256: String,
}

/// Write `bytes` to `<publish_root>/<content_id>/<task_id>/<name>`.
pub async fn distribute(
    publish_root: &Path,
    content_id: &str,
    task_id: TaskId,
    name: &str,
    bytes: &[u8],
) -> Result<Distributed, RunError> {
    check_content_id(content_id)?;
    let dir = publish_root.join(content_id).join(task_id.to_string());
    tokio::fs::create_dir_all(&dir)
        .await
        .map_err(|e| RunError::io(format!("creating {}", dir.display()), e))?;

    let path = dir.join(name);
    let staging = dir.join(format!(".{name}.partial"));
    tokio::fs::write(&staging, bytes)
        .await
        .map_err(|e| RunError::io(format!("writing {}", staging.display()), e))?;
    tokio::fs::rename(&staging, &path)
        .await
        .map_err(|e| RunError::io(format!("publishing {}", path.display()), e))?;

    Ok(Distributed {
        path,
        sha256: sha256_hex(bytes),
    })
}
