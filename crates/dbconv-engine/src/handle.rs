use crate::error::ConversionFailure;
use dbconv_core::ProgressEvent;
use std::path::PathBuf;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::watch;
use tracing::debug;

pub(crate) type RunOutcome = Result<PathBuf, ConversionFailure>;

/// A caller's view of one conversion run: its progress stream and its outcome.
///
/// Every handle attached to the same run observes the same outcome.
#[derive(Debug)]
pub struct ConversionHandle {
    id: String,
    cached: bool,
    events: Option<broadcast::Receiver<ProgressEvent>>,
    outcome: watch::Receiver<Option<RunOutcome>>,
}

impl ConversionHandle {
    pub(crate) fn attached(
        id: impl Into<String>,
        events: broadcast::Receiver<ProgressEvent>,
        outcome: watch::Receiver<Option<RunOutcome>>,
    ) -> Self {
        Self {
            id: id.into(),
            cached: false,
            events: Some(events),
            outcome,
        }
    }

    /// Already converted: resolves immediately and streams nothing.
    pub(crate) fn ready(id: impl Into<String>, path: PathBuf) -> Self {
        let (_, outcome) = watch::channel(Some(Ok(path)));
        Self {
            id: id.into(),
            cached: true,
            events: None,
            outcome,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// True when the handle was satisfied from an existing artifact without a run.
    pub fn cached(&self) -> bool {
        self.cached
    }

    /// Next progress event, or `None` once the run has finished and the stream
    /// is drained. Slow receivers skip the events they missed.
    pub async fn next_event(&mut self) -> Option<ProgressEvent> {
        let events = self.events.as_mut()?;
        loop {
            match events.recv().await {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(skipped)) => {
                    debug!(id = %self.id, skipped, "progress receiver lagged");
                }
                Err(RecvError::Closed) => {
                    self.events = None;
                    return None;
                }
            }
        }
    }

    /// Outcome if the run has already finished.
    pub fn outcome(&self) -> Option<Result<PathBuf, ConversionFailure>> {
        self.outcome.borrow().clone()
    }

    pub async fn wait(self) -> Result<PathBuf, ConversionFailure> {
        let mut outcome = self.outcome;
        let finished = match outcome.wait_for(Option::is_some).await {
            Ok(value) => value.clone(),
            Err(_) => None,
        };
        // A run whose driver vanished without publishing counts as interrupted.
        finished.unwrap_or_else(|| Err(ConversionFailure::interrupted()))
    }
}
