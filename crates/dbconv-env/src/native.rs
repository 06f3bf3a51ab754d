use crate::process::{capture, require_success};
use crate::{CancelToken, EnvError, ExecutionEnvironment, RunOutput, RunRequest};
use async_trait::async_trait;
use std::env;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tokio::process::Command;

/// Runs tools directly on the host; environment paths are host paths.
#[derive(Debug, Clone, Default)]
pub struct NativeEnvironment {
    search_path: Option<OsString>,
}

impl NativeEnvironment {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overrides `PATH` for tool resolution and execution.
    pub fn with_search_path(search_path: impl Into<OsString>) -> Self {
        Self {
            search_path: Some(search_path.into()),
        }
    }

    fn search_path(&self) -> Option<OsString> {
        self.search_path.clone().or_else(|| env::var_os("PATH"))
    }

    fn resolve(&self, tool: &str) -> Option<PathBuf> {
        let tool = tool.trim();
        if tool.is_empty() {
            return None;
        }
        let direct = Path::new(tool);
        if direct.components().count() > 1 {
            return is_executable(direct).then(|| direct.to_path_buf());
        }
        let search_path = self.search_path()?;
        env::split_paths(&search_path).find_map(|dir| {
            executable_names(tool)
                .into_iter()
                .map(|name| dir.join(name))
                .find(|candidate| is_executable(candidate))
        })
    }
}

#[async_trait]
impl ExecutionEnvironment for NativeEnvironment {
    fn name(&self) -> &str {
        "native"
    }

    async fn available(&self) -> bool {
        true
    }

    async fn locate_tool(&self, tool: &str) -> Option<String> {
        self.resolve(tool)
            .map(|path| path.to_string_lossy().to_string())
    }

    fn translate_path(&self, host_path: &Path) -> Result<String, EnvError> {
        if !host_path.is_absolute() {
            return Err(EnvError::PathTranslation {
                path: host_path.to_path_buf(),
                reason: "path is not absolute".to_string(),
            });
        }
        Ok(host_path.to_string_lossy().to_string())
    }

    fn host_path(&self, env_path: &str) -> Option<PathBuf> {
        let path = PathBuf::from(env_path);
        path.is_absolute().then_some(path)
    }

    async fn free_bytes(&self, env_path: &str) -> Result<u64, EnvError> {
        let probe = nearest_existing(Path::new(env_path));
        Ok(fs2::available_space(probe)?)
    }

    async fn run(&self, request: RunRequest, cancel: &CancelToken) -> Result<RunOutput, EnvError> {
        let program = self
            .resolve(&request.program)
            .unwrap_or_else(|| PathBuf::from(&request.program));
        let mut command = Command::new(program);
        command.args(&request.args);
        if let Some(search_path) = &self.search_path {
            command.env("PATH", search_path);
        }
        if let Some(dir) = &request.working_dir {
            command.current_dir(dir);
        }
        let output = capture(command, &request.program, request.timeout, cancel).await?;
        require_success(output)
    }
}

// statvfs needs an existing path; probe the closest existing ancestor.
fn nearest_existing(path: &Path) -> PathBuf {
    let mut current = Some(path);
    while let Some(candidate) = current {
        if !candidate.as_os_str().is_empty() && candidate.exists() {
            return candidate.to_path_buf();
        }
        current = candidate.parent();
    }
    PathBuf::from(".")
}

fn executable_names(tool: &str) -> Vec<String> {
    if cfg!(windows) && Path::new(tool).extension().is_none() {
        vec![format!("{tool}.exe"), tool.to_string()]
    } else {
        vec![tool.to_string()]
    }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
