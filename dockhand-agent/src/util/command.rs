//! Child-process execution for hook scripts.
//!
//! Scripts run in their own process group so that a timeout or shutdown
//! can terminate the script together with anything it spawned. Output is
//! captured per stream up to a byte cap; the reader keeps consuming past
//! the cap so the child never blocks on a full pipe.

use anyhow::{Context, anyhow};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

/// Per-stream capture cap. Bytes beyond it are discarded, not buffered.
pub const OUTPUT_CAP_BYTES: usize = 2 * 1024 * 1024;

/// How the script process is invoked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invocation {
    Direct,
    Sudo,
    RunAs(String),
}

#[derive(Debug)]
pub struct RunRequest<'a> {
    /// The script file itself; made executable before spawning.
    pub script: &'a Path,
    pub cwd: &'a Path,
    pub env: &'a BTreeMap<String, String>,
    pub timeout: Duration,
    pub invocation: Invocation,
}

/// Outcome of a finished (or terminated) script. A non-zero exit is not an
/// error at this layer; callers decide what it means.
#[derive(Debug, Clone, Default)]
pub struct ScriptResult {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("script {0} does not exist")]
    MissingScript(PathBuf),
    #[error("failed to spawn {script}: {source}")]
    Spawn {
        script: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("script execution cancelled")]
    Cancelled,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Keep the first `limit` bytes, drop the rest but keep draining.
async fn read_capped<R: AsyncRead + Unpin>(mut r: R, limit: usize) -> std::io::Result<Vec<u8>> {
    let mut out = Vec::with_capacity(limit.min(64 * 1024));
    let mut tmp = [0u8; 8192];
    loop {
        let n = r.read(&mut tmp).await?;
        if n == 0 {
            break;
        }
        if out.len() < limit {
            let take = n.min(limit - out.len());
            out.extend_from_slice(&tmp[..take]);
        }
    }
    Ok(out)
}

#[cfg(unix)]
fn ensure_executable(script: &Path) -> Result<(), RunError> {
    use std::os::unix::fs::PermissionsExt;

    let meta =
        std::fs::metadata(script).map_err(|_| RunError::MissingScript(script.to_path_buf()))?;
    let mode = meta.permissions().mode();
    if mode & 0o111 == 0 {
        std::fs::set_permissions(script, std::fs::Permissions::from_mode(mode | 0o755))
            .with_context(|| format!("failed to mark {} executable", script.display()))?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn ensure_executable(script: &Path) -> Result<(), RunError> {
    if !script.exists() {
        return Err(RunError::MissingScript(script.to_path_buf()));
    }
    Ok(())
}

fn build_command(req: &RunRequest<'_>) -> Command {
    let mut c = match &req.invocation {
        Invocation::Direct => Command::new(req.script),
        Invocation::Sudo => {
            let mut c = Command::new("sudo");
            c.arg(req.script);
            c
        }
        Invocation::RunAs(user) => {
            let mut c = Command::new("su");
            c.arg(user).arg("-c").arg(req.script.display().to_string());
            c
        }
    };
    c.current_dir(req.cwd);
    for (k, v) in req.env {
        c.env(k, v);
    }
    c.stdin(Stdio::null());
    c.stdout(Stdio::piped());
    c.stderr(Stdio::piped());

    // Make the child a process-group leader so group signals reach the
    // whole script tree.
    #[cfg(unix)]
    unsafe {
        c.pre_exec(|| {
            libc::setpgid(0, 0);
            Ok(())
        });
    }

    c
}

#[cfg(unix)]
fn kill_group(child: &Child) {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    if let Some(pid) = child.id() {
        let _ = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL);
    }
}

#[cfg(not(unix))]
fn kill_group(_child: &Child) {}

pub async fn run_script(
    req: RunRequest<'_>,
    cancel: &CancellationToken,
) -> Result<ScriptResult, RunError> {
    ensure_executable(req.script)?;

    let mut child = build_command(&req).spawn().map_err(|e| RunError::Spawn {
        script: req.script.to_path_buf(),
        source: e,
    })?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| RunError::Other(anyhow!("stdout missing")))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| RunError::Other(anyhow!("stderr missing")))?;

    let stdout_task = tokio::spawn(async move { read_capped(stdout, OUTPUT_CAP_BYTES).await });
    let stderr_task = tokio::spawn(async move { read_capped(stderr, OUTPUT_CAP_BYTES).await });

    let mut timed_out = false;
    let status = tokio::select! {
        res = tokio::time::timeout(req.timeout, child.wait()) => match res {
            Ok(status) => {
                Some(status.with_context(|| format!("wait failed for {}", req.script.display()))?)
            }
            Err(_) => {
                timed_out = true;
                kill_group(&child);
                let _ = child.wait().await;
                None
            }
        },
        _ = cancel.cancelled() => {
            kill_group(&child);
            let _ = child.wait().await;
            return Err(RunError::Cancelled);
        }
    };

    // Readers finish once the pipes close after exit/kill.
    let stdout = stdout_task
        .await
        .context("join stdout reader")?
        .context("read stdout")?;
    let stderr = stderr_task
        .await
        .context("join stderr reader")?
        .context("read stderr")?;

    Ok(ScriptResult {
        exit_code: status.as_ref().and_then(|s| s.code()),
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
        timed_out,
    })
}
