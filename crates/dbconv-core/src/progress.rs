use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

pub const PREFLIGHT_PERCENT: u8 = 5;
pub const EXTRACT_START_PERCENT: u8 = 10;
pub const EXTRACT_END_PERCENT: u8 = 50;
pub const BUILD_START_PERCENT: u8 = 50;
pub const BUILD_END_PERCENT: u8 = 90;
pub const CLEANUP_PERCENT: u8 = 95;
pub const DONE_PERCENT: u8 = 100;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Preflight,
    Extracting,
    Building,
    Cleanup,
    Done,
    Failed,
    Cancelled,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Preflight => "preflight",
            Stage::Extracting => "extracting",
            Stage::Building => "building",
            Stage::Cleanup => "cleanup",
            Stage::Done => "done",
            Stage::Failed => "failed",
            Stage::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Stage::Done | Stage::Failed | Stage::Cancelled)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProgressEvent {
    pub id: String,
    pub stage: Stage,
    pub percent: u8,
    pub message: String,
}

impl ProgressEvent {
    pub fn new(id: impl Into<String>, stage: Stage, percent: u8, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            stage,
            percent: percent.min(DONE_PERCENT),
            message: message.into(),
        }
    }
}

/// Time-based progress for stages whose tool reports nothing: linear in
/// `elapsed / budget`, held below `end` until the stage really completes.
pub fn ramp_percent(start: u8, end: u8, elapsed: Duration, budget: Duration) -> u8 {
    if end <= start {
        return start;
    }
    let ceiling = end - 1;
    if budget.is_zero() {
        return ceiling;
    }
    let fraction = (elapsed.as_secs_f64() / budget.as_secs_f64()).clamp(0.0, 1.0);
    let span = f64::from(end - start);
    let value = f64::from(start) + span * fraction;
    (value.floor() as u8).clamp(start, ceiling)
}
