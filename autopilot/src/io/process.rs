//! Helpers for running child processes with timeouts, cancellation and
//! bounded output.

use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument, warn};

/// How long to wait for output readers after the child is gone.
const READER_GRACE: Duration = Duration::from_secs(2);

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    /// `None` when the child was killed before reporting a status.
    pub status: Option<ExitStatus>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
    pub cancelled: bool,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && !self.cancelled && self.status.is_some_and(|s| s.success())
    }

    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    pub fn stdout_truncated_notice(&self, label: &str) -> String {
        if self.stdout_truncated > 0 {
            format!(
                "\n[{label} stdout truncated {} bytes]\n",
                self.stdout_truncated
            )
        } else {
            String::new()
        }
    }

    /// One-line description of a non-successful run.
    pub fn failure_summary(&self, label: &str) -> String {
        if self.cancelled {
            return format!("{label} aborted");
        }
        if self.timed_out {
            return format!("{label} timed out");
        }
        let code = self
            .status
            .and_then(|s| s.code())
            .map_or_else(|| "signal".to_string(), |c| c.to_string());
        let stderr = self.stderr_text();
        let detail = stderr.lines().rev().find(|l| !l.trim().is_empty());
        match detail {
            Some(line) => format!("{label} failed (exit {code}): {}", line.trim()),
            None => format!("{label} failed (exit {code})"),
        }
    }
}

/// Run a command, capturing stdout/stderr without risking pipe deadlocks.
///
/// Output is read concurrently while the child runs. `output_limit_bytes`
/// bounds the amount of stdout/stderr stored in memory (bytes beyond this are
/// discarded while still draining the pipe). The child is killed on timeout or
/// when `cancel` fires; both are reported through flags rather than errors.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes))]
pub async fn run_command(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    output_limit_bytes: usize,
    cancel: &CancellationToken,
) -> Result<CommandOutput> {
    if stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    debug!("spawning child process");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };

    let stdin_handle = match stdin {
        Some(input) => {
            let mut child_stdin = child
                .stdin
                .take()
                .ok_or_else(|| anyhow!("stdin was not piped"))?;
            let input = input.to_vec();
            Some(tokio::spawn(async move {
                // The child may exit without reading everything.
                if let Err(e) = child_stdin.write_all(&input).await {
                    debug!(err = %e, "stdin closed early");
                }
            }))
        }
        None => None,
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let stdout_handle = tokio::spawn(read_stream_limited(stdout, output_limit_bytes));
    let stderr_handle = tokio::spawn(read_stream_limited(stderr, output_limit_bytes));

    let mut timed_out = false;
    let mut cancelled = false;
    let status = tokio::select! {
        status = child.wait() => Some(status.context("wait for command")?),
        () = tokio::time::sleep(timeout) => {
            warn!(timeout_secs = timeout.as_secs(), "command timed out, killing");
            timed_out = true;
            None
        }
        () = cancel.cancelled() => {
            warn!("command cancelled, killing");
            cancelled = true;
            None
        }
    };
    let status = match status {
        Some(status) => Some(status),
        None => {
            child.kill().await.context("kill command")?;
            child.wait().await.ok()
        }
    };

    if let Some(handle) = stdin_handle {
        handle.abort();
    }
    let (stdout, stdout_truncated) = join_output(stdout_handle).await.context("join stdout")?;
    let (stderr, stderr_truncated) = join_output(stderr_handle).await.context("join stderr")?;

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(exit_code = ?status.and_then(|s| s.code()), timed_out, cancelled, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
        cancelled,
    })
}

/// Join a reader task, giving up (with empty output) if a grandchild keeps the
/// pipe open past the grace period.
async fn join_output(handle: JoinHandle<Result<(Vec<u8>, usize)>>) -> Result<(Vec<u8>, usize)> {
    let abort = handle.abort_handle();
    match tokio::time::timeout(READER_GRACE, handle).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => Err(anyhow!("output reader task failed: {e}")),
        Err(_) => {
            abort.abort();
            warn!("output reader still open after child exit; discarding");
            Ok((Vec::new(), 0))
        }
    }
}

async fn read_stream_limited<R: AsyncRead + Unpin>(
    mut reader: R,
    limit: usize,
) -> Result<(Vec<u8>, usize)> {
    let mut buf = Vec::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).await.context("read output")?;
        if n == 0 {
            break;
        }
        let remaining = limit.saturating_sub(buf.len());
        if remaining > 0 {
            let keep = n.min(remaining);
            buf.extend_from_slice(&chunk[..keep]);
            truncated += n.saturating_sub(keep);
        } else {
            truncated += n;
        }
    }

    Ok((buf, truncated))
}
