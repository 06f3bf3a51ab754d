use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConversionStatus {
    #[default]
    NotConverted,
    Converting,
    Converted,
    Failed,
}

impl ConversionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversionStatus::NotConverted => "not_converted",
            ConversionStatus::Converting => "converting",
            ConversionStatus::Converted => "converted",
            ConversionStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for ConversionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConversionStatus {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase();
        match normalized.as_str() {
            "not_converted" | "not-converted" | "notconverted" => Ok(ConversionStatus::NotConverted),
            "converting" => Ok(ConversionStatus::Converting),
            "converted" => Ok(ConversionStatus::Converted),
            "failed" => Ok(ConversionStatus::Failed),
            other => Err(format!("Unknown conversion status: {other}")),
        }
    }
}

/// Where a source database came from. Only affects identifier derivation and display.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    #[default]
    Catalog,
    Custom,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Catalog => "catalog",
            SourceKind::Custom => "custom",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classified reason a conversion run ended without producing a database.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    EnvironmentUnavailable,
    ToolMissing,
    InsufficientSpace,
    SourceMissing,
    PathTranslation,
    ExtractionFailed,
    EmptyIntermediate,
    BuildFailed,
    ExecutionTimeout,
    Cancelled,
    Interrupted,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::EnvironmentUnavailable => "environment_unavailable",
            FailureReason::ToolMissing => "tool_missing",
            FailureReason::InsufficientSpace => "insufficient_space",
            FailureReason::SourceMissing => "source_missing",
            FailureReason::PathTranslation => "path_translation",
            FailureReason::ExtractionFailed => "extraction_failed",
            FailureReason::EmptyIntermediate => "empty_intermediate",
            FailureReason::BuildFailed => "build_failed",
            FailureReason::ExecutionTimeout => "timeout",
            FailureReason::Cancelled => "cancelled",
            FailureReason::Interrupted => "interrupted",
        }
    }

    /// Cancelled runs go back to `NotConverted`, everything else lands in `Failed`.
    pub fn resulting_status(&self) -> ConversionStatus {
        match self {
            FailureReason::Cancelled => ConversionStatus::NotConverted,
            _ => ConversionStatus::Failed,
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted conversion state for one source database.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DatabaseRecord {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub status: ConversionStatus,
    #[serde(default)]
    pub source_path: Option<PathBuf>,
    #[serde(default)]
    pub converted_path: Option<PathBuf>,
    #[serde(default)]
    pub converted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub source_kind: SourceKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<DateTime<Utc>>,
}

impl DatabaseRecord {
    pub fn new(id: impl Into<String>, source_kind: SourceKind) -> Self {
        Self {
            id: id.into(),
            status: ConversionStatus::NotConverted,
            source_path: None,
            converted_path: None,
            converted_at: None,
            error: None,
            source_kind,
            started_at: None,
            failed_at: None,
        }
    }

    pub fn with_source(mut self, source_path: impl Into<PathBuf>) -> Self {
        self.source_path = Some(source_path.into());
        self
    }

    pub fn converted_path(&self) -> Option<&Path> {
        match self.status {
            ConversionStatus::Converted => self.converted_path.as_deref(),
            _ => None,
        }
    }

    pub fn is_converted(&self) -> bool {
        self.status == ConversionStatus::Converted
    }

    pub fn is_converting(&self) -> bool {
        self.status == ConversionStatus::Converting
    }

    pub fn begin_conversion(&mut self, now: DateTime<Utc>) {
        self.status = ConversionStatus::Converting;
        self.converted_path = None;
        self.converted_at = None;
        self.error = None;
        self.failed_at = None;
        self.started_at = Some(now);
    }

    pub fn mark_converted(&mut self, converted_path: impl Into<PathBuf>, now: DateTime<Utc>) {
        self.status = ConversionStatus::Converted;
        self.converted_path = Some(converted_path.into());
        self.converted_at = Some(now);
        self.error = None;
        self.failed_at = None;
        self.started_at = None;
    }

    pub fn mark_failed(&mut self, error: impl Into<String>, now: DateTime<Utc>) {
        let mut error = error.into();
        if error.trim().is_empty() {
            error = "unknown error".to_string();
        }
        self.status = ConversionStatus::Failed;
        self.converted_path = None;
        self.converted_at = None;
        self.error = Some(error);
        self.failed_at = Some(now);
        self.started_at = None;
    }

    pub fn reset(&mut self) {
        self.status = ConversionStatus::NotConverted;
        self.converted_path = None;
        self.converted_at = None;
        self.error = None;
        self.failed_at = None;
        self.started_at = None;
    }

    /// `converted_path` is set iff converted, `error` is set iff failed.
    pub fn is_consistent(&self) -> bool {
        let has_path = self
            .converted_path
            .as_ref()
            .is_some_and(|path| !path.as_os_str().is_empty());
        let has_error = self.error.as_ref().is_some_and(|err| !err.is_empty());
        has_path == (self.status == ConversionStatus::Converted)
            && has_error == (self.status == ConversionStatus::Failed)
    }
}
