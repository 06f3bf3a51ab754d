//! Execution environment adapter: runs the external conversion tools where they
//! actually live (the host itself, or a WSL distribution) and maps host paths
//! into that environment.

mod cancel;
mod native;
mod path;
mod probe;
mod process;
mod wsl;

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub use cancel::CancelToken;
pub use native::NativeEnvironment;
pub use path::{windows_to_wsl, wsl_to_windows};
pub use probe::{probe_tool, ToolReport};
pub use wsl::WslEnvironment;

#[derive(Debug, Error)]
pub enum EnvError {
    #[error("execution environment unavailable: {0}")]
    Unavailable(String),
    #[error("cannot map {} into the execution environment: {reason}", .path.display())]
    PathTranslation { path: PathBuf, reason: String },
    #[error("command timed out after {}s", .timeout.as_secs())]
    Timeout { timeout: Duration },
    #[error("command exited with status {exit_code}: {stderr}")]
    ExecutionFailed { exit_code: i32, stderr: String },
    #[error("command cancelled")]
    Cancelled,
    #[error("unexpected output from {command}: {output}")]
    UnexpectedOutput { command: String, output: String },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRequest {
    pub program: String,
    pub args: Vec<String>,
    /// Working directory, already in environment path form.
    pub working_dir: Option<String>,
    pub timeout: Option<Duration>,
}

impl RunRequest {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
            timeout: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl RunOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[async_trait]
pub trait ExecutionEnvironment: Send + Sync {
    fn name(&self) -> &str;

    /// True iff the environment itself can be reached.
    async fn available(&self) -> bool;

    /// Resolves `tool` on the environment search path.
    async fn locate_tool(&self, tool: &str) -> Option<String>;

    async fn tool_present(&self, tool: &str) -> bool {
        self.locate_tool(tool).await.is_some()
    }

    fn translate_path(&self, host_path: &Path) -> Result<String, EnvError>;

    /// Inverse of `translate_path` where the environment path lies under a mapped root.
    fn host_path(&self, env_path: &str) -> Option<PathBuf>;

    async fn free_bytes(&self, env_path: &str) -> Result<u64, EnvError>;

    /// Runs to completion. Non-zero exit is `ExecutionFailed`; the process is
    /// killed when `cancel` fires or the request timeout elapses.
    async fn run(&self, request: RunRequest, cancel: &CancelToken) -> Result<RunOutput, EnvError>;
}
