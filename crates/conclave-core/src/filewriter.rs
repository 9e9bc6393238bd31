//! File writer (§6): the external collaborator the Tag Router's `file`
//! delivery invokes. Path normalisation follows §6 literally; confinement
//! is layered on top the way `SafeConfirmingSandbox` layers on `exec`.

use std::path::{Path, PathBuf};

use crate::error::{ConclaveError, Result};

/// The outcome of a successful write (§6 `write(path, content) -> {path,
/// bytes}`).
#[derive(Debug, Clone)]
pub struct WriteOutcome {
    pub path: String,
    pub bytes: usize,
}

/// Capability seam for persisting a `##file:` delivery to disk.
#[async_trait::async_trait]
pub trait FileWriter: Send + Sync {
    async fn write(&self, path: &str, content: &str) -> Result<WriteOutcome>;
}

/// §6 path normalisation: trim, prefix `./` unless it starts with `/` or
/// `.`, unescape backslash sequences only when no real newline is present
/// (a model that emitted `\n` as two characters instead of a literal
/// newline still gets one).
pub fn normalize_path(raw: &str) -> String {
    let trimmed = raw.trim();
    let prefixed = if trimmed.starts_with('/') || trimmed.starts_with('.') {
        trimmed.to_string()
    } else {
        format!("./{trimmed}")
    };
    prefixed
}

pub fn unescape_if_literal(content: &str) -> String {
    if content.contains('\n') {
        return content.to_string();
    }
    content
        .replace("\\n", "\n")
        .replace("\\t", "\t")
        .replace("\\\"", "\"")
}

/// Plain writer: no confinement, writes anywhere the process can reach.
/// Used when the caller has already decided the path is trustworthy.
pub struct PlainFileWriter;

#[async_trait::async_trait]
impl FileWriter for PlainFileWriter {
    async fn write(&self, path: &str, content: &str) -> Result<WriteOutcome> {
        let normalized = normalize_path(path);
        let body = unescape_if_literal(content);
        write_to(Path::new(&normalized), &body).await?;
        Ok(WriteOutcome {
            path: normalized,
            bytes: body.len(),
        })
    }
}

/// Locked-down writer: rejects absolute paths and parent-traversal, and
/// confines all writes under a fixed root (the sandbox writer's `/work`
/// default per §6).
pub struct SandboxFileWriter {
    root: PathBuf,
}

impl SandboxFileWriter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait::async_trait]
impl FileWriter for SandboxFileWriter {
    async fn write(&self, path: &str, content: &str) -> Result<WriteOutcome> {
        let normalized = normalize_path(path);
        if normalized.starts_with('/') || normalized.split('/').any(|seg| seg == "..") {
            return Err(ConclaveError::SandboxWrite(format!(
                "path escapes sandbox root: {normalized}"
            )));
        }
        let body = unescape_if_literal(content);
        let full = self.root.join(normalized.trim_start_matches("./"));
        write_to(&full, &body).await?;
        Ok(WriteOutcome {
            path: normalized,
            bytes: body.len(),
        })
    }
}

async fn write_to(path: &Path, body: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| ConclaveError::MemorySave {
                    path: path.to_path_buf(),
                    source,
                })?;
        }
    }
    tokio::fs::write(path, body)
        .await
        .map_err(|source| ConclaveError::MemorySave {
            path: path.to_path_buf(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_prefixes_bare_paths() {
        assert_eq!(normalize_path("notes.txt"), "./notes.txt");
        assert_eq!(normalize_path("./notes.txt"), "./notes.txt");
        assert_eq!(normalize_path("/etc/passwd"), "/etc/passwd");
    }

    #[tokio::test]
    async fn sandbox_writer_rejects_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let writer = SandboxFileWriter::new(dir.path());
        let err = writer.write("../escape.txt", "x").await.unwrap_err();
        assert!(matches!(err, ConclaveError::SandboxWrite(_)));
    }

    #[tokio::test]
    async fn sandbox_writer_rejects_absolute_paths() {
        let dir = tempfile::tempdir().unwrap();
        let writer = SandboxFileWriter::new(dir.path());
        let err = writer.write("/etc/passwd", "x").await.unwrap_err();
        assert!(matches!(err, ConclaveError::SandboxWrite(_)));
    }

    #[tokio::test]
    async fn sandbox_writer_confines_to_root() {
        let dir = tempfile::tempdir().unwrap();
        let writer = SandboxFileWriter::new(dir.path());
        let outcome = writer.write("notes/a.txt", "hello").await.unwrap();
        assert_eq!(outcome.path, "./notes/a.txt");
        let on_disk = tokio::fs::read_to_string(dir.path().join("notes/a.txt"))
            .await
            .unwrap();
        assert_eq!(on_disk, "hello");
    }

    #[tokio::test]
    async fn plain_writer_unescapes_literal_newlines() {
        let dir = tempfile::tempdir().unwrap();
        let writer = PlainFileWriter;
        let path = dir.path().join("out.txt");
        writer
            .write(path.to_str().unwrap(), "line one\\nline two")
            .await
            .unwrap();
        let on_disk = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(on_disk, "line one\nline two");
    }
}
