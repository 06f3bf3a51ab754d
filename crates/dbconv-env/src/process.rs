use crate::{CancelToken, EnvError, RunOutput};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::{debug, warn};

/// Spawns `command` and collects its output, whatever the exit status.
///
/// Dropping the child on cancel/timeout kills it (`kill_on_drop`).
pub(crate) async fn capture(
    mut command: Command,
    label: &str,
    timeout: Option<Duration>,
    cancel: &CancelToken,
) -> Result<RunOutput, EnvError> {
    if cancel.is_cancelled() {
        return Err(EnvError::Cancelled);
    }

    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let started = Instant::now();
    let child = command.spawn()?;
    debug!(command = label, pid = child.id(), "spawned");

    let deadline = async {
        match timeout {
            Some(limit) => tokio::time::sleep(limit).await,
            None => std::future::pending::<()>().await,
        }
    };

    let output = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            warn!(command = label, "cancelled; killing process");
            return Err(EnvError::Cancelled);
        }
        _ = deadline => {
            let limit = timeout.unwrap_or_default();
            warn!(command = label, timeout_secs = limit.as_secs(), "timed out; killing process");
            return Err(EnvError::Timeout { timeout: limit });
        }
        output = child.wait_with_output() => output?,
    };

    let result = RunOutput {
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        exit_code: output.status.code().unwrap_or(-1),
    };
    debug!(
        command = label,
        exit_code = result.exit_code,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "finished"
    );
    Ok(result)
}

pub(crate) fn require_success(output: RunOutput) -> Result<RunOutput, EnvError> {
    if output.success() {
        return Ok(output);
    }
    Err(EnvError::ExecutionFailed {
        exit_code: output.exit_code,
        stderr: output.stderr.trim().to_string(),
    })
}
