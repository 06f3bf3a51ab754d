pub mod catalog;
pub mod config;
pub mod progress;
pub mod record;

pub use catalog::{custom_id, derive_id, display_name, CatalogEntry, CUSTOM_PREFIX};
pub use config::{ConfigError, ConversionConfig, EnvironmentKind, MIN_FREE_BYTES};
pub use progress::{ramp_percent, ProgressEvent, Stage};
pub use record::{ConversionStatus, DatabaseRecord, FailureReason, SourceKind};
