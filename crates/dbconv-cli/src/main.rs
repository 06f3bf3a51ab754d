mod commands;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dbconv_core::{ConversionConfig, EnvironmentKind};
use dbconv_engine::ConversionManager;
use dbconv_env::{ExecutionEnvironment, NativeEnvironment, WslEnvironment};
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG_FILE: &str = "dbconv.json";

#[derive(Parser, Debug)]
#[command(name = "dbconv")]
#[command(about = "Convert BLAST databases into MMseqs2 databases", long_about = None)]
struct Cli {
    /// JSON config file (default: ./dbconv.json when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(long, global = true)]
    target_root: Option<PathBuf>,
    #[arg(long, global = true)]
    status_file: Option<PathBuf>,
    /// Execution environment: native or wsl
    #[arg(long, global = true)]
    env: Option<String>,
    #[arg(long, global = true)]
    log_dir: Option<String>,
    #[arg(long, global = true, default_value_t = false)]
    debug: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
#[command(rename_all = "kebab-case")]
pub(crate) enum Command {
    /// Convert a database, streaming progress until it finishes
    Convert(commands::ConvertArgs),
    /// Show conversion status for one or all databases
    Status(commands::StatusArgs),
    /// List converted databases that are ready for search
    Ready,
    /// Retry a failed conversion
    Retry { id: String },
    /// Delete a converted database and reset its status
    Cleanup { id: String },
    /// Repair the status file after a crash
    Reconcile,
    /// Check the execution environment and tools
    Doctor,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.debug, &resolve_log_dir(cli.log_dir.as_deref()));

    let config = resolve_config(&cli, |key| std::env::var(key).ok())?;
    let env = build_environment(config.environment);
    let manager = ConversionManager::new(config, env);

    let report = manager.reconcile().context("failed to reconcile status file")?;
    if !report.is_empty() {
        info!(
            interrupted = report.interrupted.len(),
            repaired = report.repaired_paths.len(),
            "status file reconciled"
        );
    }

    commands::run(&manager, cli.command).await
}

/// Config file, then `DBCONV_*` variables, then flags.
fn resolve_config<F>(cli: &Cli, lookup: F) -> Result<ConversionConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let mut config = load_config_file(cli.config.as_deref());
    config
        .apply_env_overrides(&lookup)
        .context("invalid DBCONV_* environment variable")?;

    if let Some(root) = &cli.target_root {
        config.target_root = root.clone();
    }
    if let Some(status_file) = &cli.status_file {
        config.status_file = Some(status_file.clone());
    }
    if let Some(env) = &cli.env {
        config.environment = env
            .parse::<EnvironmentKind>()
            .map_err(anyhow::Error::msg)
            .context("invalid --env")?;
    }
    Ok(config)
}

fn load_config_file(flag: Option<&Path>) -> ConversionConfig {
    let path = match flag {
        Some(path) => path.to_path_buf(),
        None => {
            let default = PathBuf::from(DEFAULT_CONFIG_FILE);
            if !default.exists() {
                return ConversionConfig::default();
            }
            default
        }
    };
    match ConversionConfig::from_json_file(&path) {
        Ok(config) => config,
        Err(err) => {
            warn!(error = %err, "using default configuration");
            ConversionConfig::default()
        }
    }
}

fn build_environment(kind: EnvironmentKind) -> Arc<dyn ExecutionEnvironment> {
    match kind {
        EnvironmentKind::Native => Arc::new(NativeEnvironment::new()),
        EnvironmentKind::Wsl => Arc::new(WslEnvironment::new()),
    }
}

fn init_logging(debug: bool, log_dir: &str) {
    let level = if debug {
        "debug".to_string()
    } else if let Ok(level) = std::env::var("DBCONV_LOG_LEVEL") {
        level
    } else {
        "info".to_string()
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let sink = match open_log_file(log_dir) {
        Ok(file) => LogSink::new(file),
        Err(err) => {
            eprintln!("dbconv: log file unavailable in {log_dir}: {err}");
            LogSink::new(None)
        }
    };
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(BoxMakeWriter::new(move || sink.clone()))
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

/// Tees each formatted event to stderr and, when configured, `dbconv.log`.
/// Stdout is left to command output.
#[derive(Clone)]
struct LogSink {
    file: Option<Arc<Mutex<File>>>,
}

impl LogSink {
    fn new(file: Option<File>) -> Self {
        Self {
            file: file.map(|file| Arc::new(Mutex::new(file))),
        }
    }

    fn with_file<R>(&self, op: impl FnOnce(&mut File) -> io::Result<R>) {
        let Some(file) = &self.file else { return };
        if let Ok(mut file) = file.lock() {
            let _ = op(&mut file);
        }
    }
}

impl Write for LogSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let _ = io::stderr().write_all(buf);
        self.with_file(|file| file.write_all(buf));
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let _ = io::stderr().flush();
        self.with_file(|file| file.flush());
        Ok(())
    }
}

/// `None` when logging to a file is switched off.
fn open_log_file(log_dir: &str) -> io::Result<Option<File>> {
    if log_dir.trim().is_empty() {
        return Ok(None);
    }
    let dir = Path::new(log_dir);
    std::fs::create_dir_all(dir)?;
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join("dbconv.log"))
        .map(Some)
}

/// Empty means no log file.
fn resolve_log_dir(flag: Option<&str>) -> String {
    if let Some(value) = flag.filter(|value| !value.trim().is_empty()) {
        return value.to_string();
    }
    if let Ok(value) = std::env::var("DBCONV_LOG_DIR") {
        if !value.trim().is_empty() {
            return value;
        }
    }
    String::new()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("dbconv").chain(args.iter().copied()))
            .expect("valid arguments")
    }

    #[test]
    fn flags_override_file_and_environment() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config_path = dir.path().join("dbconv.json");
        std::fs::write(
            &config_path,
            r#"{"target_root": "/from/file", "extractor": "/opt/blast/bin/blastdbcmd", "max_concurrent": 2}"#,
        )
        .expect("write config");
        let vars: HashMap<&str, &str> =
            HashMap::from([("DBCONV_TARGET_ROOT", "/from/env"), ("DBCONV_ENV", "wsl")]);

        let cli = parse(&[
            "--config",
            config_path.to_str().expect("utf-8 path"),
            "status",
        ]);
        let config = resolve_config(&cli, |key| vars.get(key).map(|value| value.to_string()))
            .expect("resolve");
        assert_eq!(config.target_root, PathBuf::from("/from/env"));
        assert_eq!(config.extractor, "/opt/blast/bin/blastdbcmd");
        assert_eq!(config.max_concurrent, 2);
        assert_eq!(config.environment, EnvironmentKind::Wsl);

        let cli = parse(&[
            "--config",
            config_path.to_str().expect("utf-8 path"),
            "--target-root",
            "/from/flag",
            "--env",
            "native",
            "ready",
        ]);
        let config = resolve_config(&cli, |key| vars.get(key).map(|value| value.to_string()))
            .expect("resolve");
        assert_eq!(config.target_root, PathBuf::from("/from/flag"));
        assert_eq!(config.environment, EnvironmentKind::Native);
    }

    #[test]
    fn malformed_config_falls_back_to_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config_path = dir.path().join("dbconv.json");
        std::fs::write(&config_path, "{ not json").expect("write config");
        assert_eq!(load_config_file(Some(config_path.as_path())), ConversionConfig::default());

        let cli = parse(&["--env", "cygwin", "doctor"]);
        assert!(resolve_config(&cli, |_| None).is_err());
    }

    #[test]
    fn convert_arguments_parse() {
        let cli = parse(&["convert", "--source", "/data/mydb", "--custom"]);
        match cli.command {
            Command::Convert(args) => {
                assert_eq!(args.name, None);
                assert_eq!(args.source, Some(PathBuf::from("/data/mydb")));
                assert!(args.custom);
            }
            other => panic!("unexpected command: {other:?}"),
        }

        let cli = parse(&["convert", "swissprot"]);
        match cli.command {
            Command::Convert(args) => assert_eq!(args.name.as_deref(), Some("swissprot")),
            other => panic!("unexpected command: {other:?}"),
        }

        // A name alongside --custom would be silently ignored, so it is rejected.
        let with_name = ["dbconv", "convert", "mydb", "--source", "/data/mydb", "--custom"];
        assert!(Cli::try_parse_from(with_name).is_err());
        assert!(Cli::try_parse_from(["dbconv", "convert"]).is_err());
    }

    #[test]
    fn log_sink_appends_to_the_log_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log_dir = dir.path().join("logs");
        let log_dir = log_dir.to_str().expect("utf-8 path");

        let mut sink = LogSink::new(open_log_file(log_dir).expect("open"));
        let mut clone = sink.clone();
        sink.write_all(b"first\n").expect("write");
        clone.write_all(b"second\n").expect("write");
        sink.flush().expect("flush");

        let mut reopened = LogSink::new(open_log_file(log_dir).expect("reopen"));
        reopened.write_all(b"third\n").expect("write");

        let text = std::fs::read_to_string(Path::new(log_dir).join("dbconv.log")).expect("read");
        assert_eq!(text, "first\nsecond\nthird\n");
        assert!(open_log_file("  ").expect("disabled").is_none());
    }
}
