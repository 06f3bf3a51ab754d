use crate::{CancelToken, ExecutionEnvironment, RunRequest};
use std::path::Path;
use std::time::Duration;

const VERSION_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolReport {
    pub tool: String,
    pub present: bool,
    pub location: Option<String>,
    pub version: Option<String>,
}

/// Locates `tool` and asks it for its version (first non-empty output line).
///
/// A tool that resolves but fails its version call is still reported present.
pub async fn probe_tool(env: &dyn ExecutionEnvironment, tool: &str) -> ToolReport {
    let Some(location) = env.locate_tool(tool).await else {
        return ToolReport {
            tool: tool.to_string(),
            present: false,
            location: None,
            version: None,
        };
    };

    let request = RunRequest::new(tool)
        .args(version_args(tool).iter().copied())
        .timeout(VERSION_TIMEOUT);
    let version = env
        .run(request, &CancelToken::new())
        .await
        .ok()
        .and_then(|output| {
            output
                .stdout
                .lines()
                .map(str::trim)
                .find(|line| !line.is_empty())
                .map(str::to_string)
        });

    ToolReport {
        tool: tool.to_string(),
        present: true,
        location: Some(location),
        version,
    }
}

fn version_args(tool: &str) -> &'static [&'static str] {
    let base = Path::new(tool)
        .file_stem()
        .map(|stem| stem.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    match base.as_str() {
        "mmseqs" => &["version"],
        "blastdbcmd" | "makeblastdb" | "blastp" | "blastn" => &["-version"],
        _ => &["--version"],
    }
}
