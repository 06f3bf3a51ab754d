use crate::catalog::CatalogEntry;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_TARGET_ROOT: &str = "mmseqs_databases";
pub const DEFAULT_STATUS_FILE_NAME: &str = "conversion_status.json";
pub const DEFAULT_EXTRACTOR: &str = "blastdbcmd";
pub const DEFAULT_BUILDER: &str = "mmseqs";
pub const MIN_FREE_BYTES: u64 = 1 << 30;
pub const DEFAULT_STAGE_TIMEOUT_SECS: u64 = 3_600;
pub const DEFAULT_PROGRESS_INTERVAL_MS: u64 = 1_000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("could not parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum EnvironmentKind {
    #[default]
    Native,
    Wsl,
}

impl fmt::Display for EnvironmentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnvironmentKind::Native => f.write_str("native"),
            EnvironmentKind::Wsl => f.write_str("wsl"),
        }
    }
}

impl FromStr for EnvironmentKind {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_lowercase().as_str() {
            "native" | "local" | "host" => Ok(EnvironmentKind::Native),
            "wsl" => Ok(EnvironmentKind::Wsl),
            other => Err(format!("Unknown environment: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ConversionConfig {
    pub target_root: PathBuf,
    pub status_file: Option<PathBuf>,
    pub extractor: String,
    pub builder: String,
    pub min_free_bytes: u64,
    pub stage_timeout_secs: u64,
    pub progress_interval_ms: u64,
    /// 0 means no limit on concurrent distinct-database runs.
    pub max_concurrent: usize,
    pub environment: EnvironmentKind,
    pub catalog: Vec<CatalogEntry>,
}

impl Default for ConversionConfig {
    fn default() -> Self {
        Self {
            target_root: PathBuf::from(DEFAULT_TARGET_ROOT),
            status_file: None,
            extractor: DEFAULT_EXTRACTOR.to_string(),
            builder: DEFAULT_BUILDER.to_string(),
            min_free_bytes: MIN_FREE_BYTES,
            stage_timeout_secs: DEFAULT_STAGE_TIMEOUT_SECS,
            progress_interval_ms: DEFAULT_PROGRESS_INTERVAL_MS,
            max_concurrent: 0,
            environment: EnvironmentKind::default(),
            catalog: Vec::new(),
        }
    }
}

impl ConversionConfig {
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Applies `DBCONV_*` overrides. `lookup` is `std::env::var` in production.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        if let Some(value) = read("DBCONV_TARGET_ROOT") {
            self.target_root = PathBuf::from(value);
        }
        if let Some(value) = read("DBCONV_STATUS_FILE") {
            self.status_file = Some(PathBuf::from(value));
        }
        if let Some(value) = read("DBCONV_MIN_FREE_BYTES") {
            self.min_free_bytes = parse_number("DBCONV_MIN_FREE_BYTES", &value)?;
        }
        if let Some(value) = read("DBCONV_STAGE_TIMEOUT_SECS") {
            self.stage_timeout_secs = parse_number("DBCONV_STAGE_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = read("DBCONV_MAX_CONCURRENT") {
            self.max_concurrent = parse_number("DBCONV_MAX_CONCURRENT", &value)?;
        }
        if let Some(value) = read("DBCONV_ENV") {
            self.environment = value.parse().map_err(|_| ConfigError::InvalidValue {
                key: "DBCONV_ENV".to_string(),
                value,
            })?;
        }
        Ok(())
    }

    pub fn status_file_path(&self) -> PathBuf {
        self.status_file
            .clone()
            .unwrap_or_else(|| self.target_root.join(DEFAULT_STATUS_FILE_NAME))
    }

    pub fn target_path(&self, id: &str) -> PathBuf {
        self.target_root.join(id)
    }

    /// Per-id scratch directory; distinct ids never share one.
    pub fn scratch_dir(&self, id: &str) -> PathBuf {
        self.target_root.join(format!(".temp_{id}"))
    }

    pub fn stage_timeout(&self) -> Duration {
        Duration::from_secs(self.stage_timeout_secs)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms.max(1))
    }

    pub fn catalog_entry(&self, name: &str) -> Option<&CatalogEntry> {
        self.catalog.iter().find(|entry| entry.name == name.trim())
    }
}

fn parse_number<T: FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}
