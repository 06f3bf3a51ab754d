use dbconv_core::{ConversionStatus, FailureReason};
use dbconv_storage::StorageError;
use std::path::PathBuf;
use thiserror::Error;

/// Terminal, classified outcome of a run that did not produce a database.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{reason}: {message}")]
pub struct ConversionFailure {
    pub reason: FailureReason,
    pub message: String,
}

impl ConversionFailure {
    pub fn new(reason: FailureReason, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
        }
    }

    pub fn cancelled() -> Self {
        Self::new(FailureReason::Cancelled, "cancelled")
    }

    pub fn interrupted() -> Self {
        Self::new(FailureReason::Interrupted, "interrupted")
    }
}

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("database id must not be empty")]
    InvalidId,
    #[error(
        "database {id} is bound to source {}, not {}",
        .existing.display(),
        .requested.display()
    )]
    SourceConflict {
        id: String,
        existing: PathBuf,
        requested: PathBuf,
    },
    #[error("unknown database: {0}")]
    UnknownDatabase(String),
    #[error("database {id} is {status}; only failed conversions can be retried")]
    NotRetryable { id: String, status: ConversionStatus },
    #[error("database {0} has no recorded source path")]
    MissingSource(String),
    #[error("database {0} has an active conversion")]
    Busy(String),
}
