//! Conversion engine: turns BLAST databases into MMseqs2 databases through an
//! [`ExecutionEnvironment`](dbconv_env::ExecutionEnvironment), one worker per
//! database id, with progress streaming and durable status.

mod artifact;
mod error;
mod handle;
mod manager;
mod scratch;
mod worker;

pub use artifact::{artifact_exists, remove_artifact};
pub use error::{ConversionFailure, ManagerError};
pub use handle::ConversionHandle;
pub use manager::{ConversionManager, ReconcileReport};
