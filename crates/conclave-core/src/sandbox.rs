//! Shell sandbox (§6, §4.G.1): the external collaborator the Tool Executor
//! delegates `sh`/`exec` calls to. `ProcessSandbox` is the default, plain
//! `tokio::process::Command` runner (grounded in the teacher's
//! `BashTool`); `SafeConfirmingSandbox` is the `SAFE_MODE` decorator named
//! in §9's redesign note.

use std::io::Write as _;
use std::path::PathBuf;

use tokio::io::AsyncReadExt;
use tokio::process::Command;

/// 1 MB truncation cap on each captured stream (§6).
const OUTPUT_CAP_BYTES: usize = 1024 * 1024;

/// The result of running a shell command (§6 `exec(cmd) -> {ok, exit_code,
/// stdout, stderr}`).
#[derive(Debug, Clone)]
pub struct ShellResult {
    pub ok: bool,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Capability seam for executing a shell command (§9: a single
/// `CommandRunner` interface, never a monkey-patched global).
#[async_trait::async_trait]
pub trait ShellSandbox: Send + Sync {
    async fn exec(&self, cmd: &str) -> ShellResult;
}

/// Default sandbox: spawns `sh -c <cmd>` in a fixed working directory,
/// captures combined stdout/stderr, truncates each stream to 1 MB.
pub struct ProcessSandbox {
    cwd: PathBuf,
}

impl ProcessSandbox {
    pub fn new(cwd: impl Into<PathBuf>) -> Self {
        Self { cwd: cwd.into() }
    }
}

#[async_trait::async_trait]
impl ShellSandbox for ProcessSandbox {
    async fn exec(&self, cmd: &str) -> ShellResult {
        let child = Command::new("sh")
            .arg("-c")
            .arg(cmd)
            .current_dir(&self.cwd)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn();

        let mut child = match child {
            Ok(c) => c,
            Err(e) => {
                return ShellResult {
                    ok: false,
                    exit_code: 127,
                    stdout: String::new(),
                    stderr: format!("failed to spawn shell: {e}"),
                };
            }
        };

        let mut stdout_pipe = child.stdout.take();
        let mut stderr_pipe = child.stderr.take();
        let stdout_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            if let Some(pipe) = stdout_pipe.as_mut() {
                let _ = read_capped(pipe, &mut buf).await;
            }
            buf
        });
        let stderr_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            if let Some(pipe) = stderr_pipe.as_mut() {
                let _ = read_capped(pipe, &mut buf).await;
            }
            buf
        });

        let status = child.wait().await;
        let stdout_bytes = stdout_task.await.unwrap_or_default();
        let stderr_bytes = stderr_task.await.unwrap_or_default();

        let (ok, exit_code) = match status {
            Ok(status) => (status.success(), status.code().unwrap_or(-1)),
            Err(e) => {
                return ShellResult {
                    ok: false,
                    exit_code: 127,
                    stdout: String::new(),
                    stderr: format!("failed to wait for shell: {e}"),
                };
            }
        };

        ShellResult {
            ok,
            exit_code,
            stdout: String::from_utf8_lossy(&stdout_bytes).into_owned(),
            stderr: String::from_utf8_lossy(&stderr_bytes).into_owned(),
        }
    }
}

async fn read_capped(
    pipe: &mut (impl tokio::io::AsyncRead + Unpin),
    buf: &mut Vec<u8>,
) -> std::io::Result<()> {
    let mut chunk = [0u8; 8192];
    loop {
        let n = pipe.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        if buf.len() < OUTPUT_CAP_BYTES {
            let remaining = OUTPUT_CAP_BYTES - buf.len();
            buf.extend_from_slice(&chunk[..n.min(remaining)]);
        }
    }
    Ok(())
}

/// `SAFE_MODE=1` / `--safe` decorator: prompts on stdin before delegating.
/// A non-affirmative answer never invokes the inner sandbox.
pub struct SafeConfirmingSandbox<S: ShellSandbox> {
    inner: S,
}

impl<S: ShellSandbox> SafeConfirmingSandbox<S> {
    pub fn new(inner: S) -> Self {
        Self { inner }
    }
}

#[async_trait::async_trait]
impl<S: ShellSandbox> ShellSandbox for SafeConfirmingSandbox<S> {
    async fn exec(&self, cmd: &str) -> ShellResult {
        eprint!("About to run: {cmd}\nProceed? [y/N] ");
        let _ = std::io::stderr().flush();

        let confirmed = tokio::task::spawn_blocking(|| {
            let mut line = String::new();
            std::io::stdin().read_line(&mut line).is_ok()
                && matches!(line.trim().to_lowercase().as_str(), "y" | "yes")
        })
        .await
        .unwrap_or(false);

        if !confirmed {
            return ShellResult {
                ok: false,
                exit_code: 130,
                stdout: String::new(),
                stderr: "aborted by user".to_string(),
            };
        }

        self.inner.exec(cmd).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn process_sandbox_captures_stdout_and_exit_code() {
        let sandbox = ProcessSandbox::new(std::env::temp_dir());
        let res = sandbox.exec("echo hi").await;
        assert!(res.ok);
        assert_eq!(res.exit_code, 0);
        assert_eq!(res.stdout.trim(), "hi");
    }

    #[tokio::test]
    async fn process_sandbox_reports_nonzero_exit() {
        let sandbox = ProcessSandbox::new(std::env::temp_dir());
        let res = sandbox.exec("exit 3").await;
        assert!(!res.ok);
        assert_eq!(res.exit_code, 3);
    }
}
