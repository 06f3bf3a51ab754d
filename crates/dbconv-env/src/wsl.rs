use crate::path::{windows_to_wsl, wsl_to_windows};
use crate::process::{capture, require_success};
use crate::{CancelToken, EnvError, ExecutionEnvironment, RunOutput, RunRequest};
use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

const DEFAULT_LAUNCHER: &str = "wsl";
const WARMUP_TIMEOUT: Duration = Duration::from_secs(15);
const STATUS_TIMEOUT: Duration = Duration::from_secs(15);
const LOOKUP_TIMEOUT: Duration = Duration::from_secs(30);
const DF_TIMEOUT: Duration = Duration::from_secs(5);

/// Runs tools inside the default WSL distribution through the `wsl` launcher.
#[derive(Debug)]
pub struct WslEnvironment {
    launcher: String,
    warmed_up: AtomicBool,
}

impl Default for WslEnvironment {
    fn default() -> Self {
        Self::new()
    }
}

impl WslEnvironment {
    pub fn new() -> Self {
        Self::with_launcher(DEFAULT_LAUNCHER)
    }

    pub fn with_launcher(launcher: impl Into<String>) -> Self {
        Self {
            launcher: launcher.into(),
            warmed_up: AtomicBool::new(false),
        }
    }

    // The first command after boot can stall while the VM starts.
    async fn warm_up(&self) {
        if self.warmed_up.swap(true, Ordering::SeqCst) {
            return;
        }
        let request = RunRequest::new("echo").arg("warmup").timeout(WARMUP_TIMEOUT);
        if let Err(err) = self.launch(&request, &CancelToken::new()).await {
            debug!(error = %err, "wsl warm-up failed");
        }
    }

    async fn launch(&self, request: &RunRequest, cancel: &CancelToken) -> Result<RunOutput, EnvError> {
        let mut command = Command::new(&self.launcher);
        command.args(launcher_args(request));
        capture(command, &request.program, request.timeout, cancel)
            .await
            .map_err(|err| match err {
                EnvError::Io(io_err) if io_err.kind() == io::ErrorKind::NotFound => {
                    EnvError::Unavailable(format!("{} launcher not found", self.launcher))
                }
                other => other,
            })
    }
}

#[async_trait]
impl ExecutionEnvironment for WslEnvironment {
    fn name(&self) -> &str {
        "wsl"
    }

    async fn available(&self) -> bool {
        let mut command = Command::new(&self.launcher);
        command.arg("--status");
        match capture(command, "wsl --status", Some(STATUS_TIMEOUT), &CancelToken::new()).await {
            Ok(output) => output.success(),
            Err(err) => {
                debug!(error = %err, "wsl status check failed");
                false
            }
        }
    }

    async fn locate_tool(&self, tool: &str) -> Option<String> {
        self.warm_up().await;
        let request = RunRequest::new("which").arg(tool).timeout(LOOKUP_TIMEOUT);
        let output = self.launch(&request, &CancelToken::new()).await.ok()?;
        let location = output.stdout.trim();
        (output.success() && !location.is_empty()).then(|| location.to_string())
    }

    fn translate_path(&self, host_path: &Path) -> Result<String, EnvError> {
        windows_to_wsl(host_path)
    }

    fn host_path(&self, env_path: &str) -> Option<PathBuf> {
        wsl_to_windows(env_path)
    }

    async fn free_bytes(&self, env_path: &str) -> Result<u64, EnvError> {
        let request = RunRequest::new("df")
            .args(["-B1", "--output=avail", env_path])
            .timeout(DF_TIMEOUT);
        let output = require_success(self.launch(&request, &CancelToken::new()).await?)?;
        parse_df_available(&output.stdout).ok_or_else(|| EnvError::UnexpectedOutput {
            command: request.display(),
            output: output.stdout.trim().to_string(),
        })
    }

    async fn run(&self, request: RunRequest, cancel: &CancelToken) -> Result<RunOutput, EnvError> {
        self.warm_up().await;
        let output = self.launch(&request, cancel).await?;
        if output.exit_code != 0 && output.stderr.contains("command not found") {
            warn!(program = %request.program, "tool missing inside wsl");
        }
        require_success(output)
    }
}

/// `wsl [--cd DIR] --exec PROGRAM ARGS...`; `--exec` skips the login shell so
/// arguments reach the tool unquoted.
fn launcher_args(request: &RunRequest) -> Vec<String> {
    let mut args = Vec::with_capacity(request.args.len() + 4);
    if let Some(dir) = &request.working_dir {
        args.push("--cd".to_string());
        args.push(dir.clone());
    }
    args.push("--exec".to_string());
    args.push(request.program.clone());
    args.extend(request.args.iter().cloned());
    args
}

fn parse_df_available(stdout: &str) -> Option<u64> {
    stdout
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .and_then(|line| line.split_whitespace().next())
        .and_then(|value| value.parse().ok())
}
