//! One conversion run: PREFLIGHT, EXTRACTING, BUILDING, CLEANUP, DONE.

use crate::artifact::{artifact_exists, database_files, remove_artifact};
use crate::error::ConversionFailure;
use crate::scratch::ScratchDir;
use dbconv_core::progress::{
    BUILD_END_PERCENT, BUILD_START_PERCENT, CLEANUP_PERCENT, DONE_PERCENT, EXTRACT_END_PERCENT,
    EXTRACT_START_PERCENT, PREFLIGHT_PERCENT,
};
use dbconv_core::{ramp_percent, ConversionConfig, FailureReason, ProgressEvent, Stage};
use dbconv_env::{CancelToken, EnvError, ExecutionEnvironment, RunOutput, RunRequest};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

const BYTES_PER_GB: f64 = 1_073_741_824.0;

#[derive(Debug, Clone)]
pub(crate) struct WorkerSettings {
    pub extractor: String,
    pub builder: String,
    pub min_free_bytes: u64,
    pub stage_timeout: Duration,
    pub progress_interval: Duration,
}

impl WorkerSettings {
    pub(crate) fn from_config(config: &ConversionConfig) -> Self {
        Self {
            extractor: config.extractor.clone(),
            builder: config.builder.clone(),
            min_free_bytes: config.min_free_bytes,
            stage_timeout: config.stage_timeout(),
            progress_interval: config.progress_interval(),
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct ConversionJob {
    pub id: String,
    pub source_path: PathBuf,
    pub target_path: PathBuf,
    pub scratch_dir: PathBuf,
}

/// Paths of one run in execution-environment form.
struct EnvPaths {
    source: String,
    target: String,
    target_dir: String,
    intermediate: String,
}

pub(crate) struct ConversionWorker {
    env: Arc<dyn ExecutionEnvironment>,
    settings: WorkerSettings,
    job: ConversionJob,
    cancel: CancelToken,
    events: broadcast::Sender<ProgressEvent>,
    limiter: Option<Arc<Semaphore>>,
    percent: u8,
}

impl ConversionWorker {
    pub(crate) fn new(
        env: Arc<dyn ExecutionEnvironment>,
        settings: WorkerSettings,
        job: ConversionJob,
        cancel: CancelToken,
        events: broadcast::Sender<ProgressEvent>,
        limiter: Option<Arc<Semaphore>>,
    ) -> Self {
        Self {
            env,
            settings,
            job,
            cancel,
            events,
            limiter,
            percent: 0,
        }
    }

    /// Drives the run to a terminal outcome. A terminal progress event is
    /// always the last thing emitted.
    pub(crate) async fn run(mut self) -> Result<PathBuf, ConversionFailure> {
        let started = Instant::now();
        let result = self.execute().await;
        match &result {
            Ok(path) => {
                info!(
                    id = %self.job.id,
                    path = %path.display(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "conversion finished"
                );
            }
            Err(failure) if failure.reason == FailureReason::Cancelled => {
                info!(id = %self.job.id, "conversion cancelled");
                self.emit(Stage::Cancelled, self.percent, "Conversion cancelled");
            }
            Err(failure) => {
                warn!(id = %self.job.id, reason = %failure.reason, error = %failure.message, "conversion failed");
                self.emit(Stage::Failed, self.percent, failure.message.clone());
            }
        }
        result
    }

    async fn execute(&mut self) -> Result<PathBuf, ConversionFailure> {
        let _permit = self.acquire_slot().await?;
        self.checkpoint()?;

        self.emit(Stage::Preflight, 0, "Checking execution environment");
        let paths = self.preflight().await?;
        let scratch = ScratchDir::acquire(self.job.scratch_dir.clone()).map_err(|err| {
            ConversionFailure::new(
                FailureReason::ExtractionFailed,
                format!("cannot create scratch directory: {err}"),
            )
        })?;
        self.emit(Stage::Preflight, PREFLIGHT_PERCENT, "Preflight checks passed");
        self.checkpoint()?;

        let intermediate = scratch.path().join(intermediate_name(&self.job.id));
        self.extract(&paths, &intermediate).await?;
        self.checkpoint()?;

        if let Err(failure) = self.build(&paths).await {
            remove_artifact(&self.job.target_path);
            return Err(failure);
        }
        if let Err(failure) = self.checkpoint() {
            remove_artifact(&self.job.target_path);
            return Err(failure);
        }

        if let Err(err) = scratch.release() {
            warn!(id = %self.job.id, error = %err, "failed to remove scratch directory");
        }
        self.emit(Stage::Cleanup, CLEANUP_PERCENT, "Removed temporary files");
        self.emit(Stage::Done, DONE_PERCENT, "Conversion complete");
        Ok(self.job.target_path.clone())
    }

    async fn acquire_slot(&mut self) -> Result<Option<OwnedSemaphorePermit>, ConversionFailure> {
        let Some(limiter) = self.limiter.clone() else {
            return Ok(None);
        };
        if let Ok(permit) = Arc::clone(&limiter).try_acquire_owned() {
            return Ok(Some(permit));
        }
        self.emit(Stage::Preflight, 0, "Waiting for a free conversion slot");
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(ConversionFailure::cancelled()),
            permit = limiter.acquire_owned() => permit.map(Some).map_err(|_| {
                ConversionFailure::new(FailureReason::EnvironmentUnavailable, "conversion slots closed")
            }),
        }
    }

    async fn preflight(&mut self) -> Result<EnvPaths, ConversionFailure> {
        let env = Arc::clone(&self.env);
        if !env.available().await {
            return Err(ConversionFailure::new(
                FailureReason::EnvironmentUnavailable,
                format!("{} execution environment is not available", env.name()),
            ));
        }
        if !source_exists(&self.job.source_path) {
            return Err(ConversionFailure::new(
                FailureReason::SourceMissing,
                format!("source database not found: {}", self.job.source_path.display()),
            ));
        }
        for tool in [&self.settings.extractor, &self.settings.builder] {
            if !env.tool_present(tool).await {
                return Err(ConversionFailure::new(
                    FailureReason::ToolMissing,
                    format!("{tool} not found in {} execution environment", env.name()),
                ));
            }
        }

        let target_dir = self
            .job
            .target_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        fs::create_dir_all(&target_dir).map_err(|err| {
            ConversionFailure::new(
                FailureReason::BuildFailed,
                format!("cannot create {}: {err}", target_dir.display()),
            )
        })?;
        let intermediate = self.job.scratch_dir.join(intermediate_name(&self.job.id));
        let paths = EnvPaths {
            source: translate(env.as_ref(), &self.job.source_path)?,
            target: translate(env.as_ref(), &self.job.target_path)?,
            target_dir: translate(env.as_ref(), &target_dir)?,
            intermediate: translate(env.as_ref(), &intermediate)?,
        };

        match env.free_bytes(&paths.target_dir).await {
            Ok(free) if free < self.settings.min_free_bytes => {
                return Err(ConversionFailure::new(
                    FailureReason::InsufficientSpace,
                    format!(
                        "insufficient disk space: {:.2} GB available, {:.2} GB required",
                        free as f64 / BYTES_PER_GB,
                        self.settings.min_free_bytes as f64 / BYTES_PER_GB
                    ),
                ));
            }
            Ok(free) => debug!(id = %self.job.id, free, "free space check passed"),
            Err(EnvError::Unavailable(reason)) => {
                return Err(ConversionFailure::new(FailureReason::EnvironmentUnavailable, reason));
            }
            Err(err) => {
                warn!(id = %self.job.id, error = %err, "free space unknown; continuing");
            }
        }
        Ok(paths)
    }

    async fn extract(&mut self, paths: &EnvPaths, intermediate: &Path) -> Result<(), ConversionFailure> {
        info!(id = %self.job.id, source = %paths.source, "extracting sequences");
        self.emit(Stage::Extracting, EXTRACT_START_PERCENT, "Extracting sequences");
        let request = RunRequest::new(&self.settings.extractor)
            .args(["-db", paths.source.as_str(), "-entry", "all", "-out", paths.intermediate.as_str()])
            .timeout(self.settings.stage_timeout);
        self.run_with_ramp(Stage::Extracting, request, EXTRACT_START_PERCENT, EXTRACT_END_PERCENT)
            .await
            .map_err(|err| classify_extract_error(err, &self.settings.extractor))?;

        let size = match fs::metadata(intermediate) {
            Ok(meta) => meta.len(),
            Err(_) => {
                return Err(ConversionFailure::new(
                    FailureReason::ExtractionFailed,
                    "extractor produced no output file",
                ))
            }
        };
        if size == 0 {
            return Err(ConversionFailure::new(
                FailureReason::EmptyIntermediate,
                "extracted sequence file is empty",
            ));
        }
        self.emit(
            Stage::Extracting,
            EXTRACT_END_PERCENT,
            format!("Extracted {:.1} MB of sequences", size as f64 / 1_048_576.0),
        );
        Ok(())
    }

    async fn build(&mut self, paths: &EnvPaths) -> Result<(), ConversionFailure> {
        info!(id = %self.job.id, target = %paths.target, "building target database");
        let stale = remove_artifact(&self.job.target_path);
        if stale > 0 {
            debug!(id = %self.job.id, stale, "removed stale target files");
            self.emit(Stage::Building, BUILD_START_PERCENT, "Removed old database");
        }
        self.emit(Stage::Building, BUILD_START_PERCENT, "Building target database");
        let request = RunRequest::new(&self.settings.builder)
            .args(["createdb", paths.intermediate.as_str(), paths.target.as_str()])
            .working_dir(paths.target_dir.clone())
            .timeout(self.settings.stage_timeout);
        self.run_with_ramp(Stage::Building, request, BUILD_START_PERCENT, BUILD_END_PERCENT)
            .await
            .map_err(|err| classify_build_error(err, &self.settings.builder))?;

        if !artifact_exists(&self.job.target_path) {
            return Err(ConversionFailure::new(
                FailureReason::BuildFailed,
                "builder produced no database",
            ));
        }
        self.emit(Stage::Building, BUILD_END_PERCENT, "Target database built");
        Ok(())
    }

    // Tools report nothing while they run, so progress ramps on a timer
    // across the stage's window and stays below its end.
    async fn run_with_ramp(
        &mut self,
        stage: Stage,
        request: RunRequest,
        start: u8,
        end: u8,
    ) -> Result<RunOutput, EnvError> {
        let env = Arc::clone(&self.env);
        let cancel = self.cancel.clone();
        let budget = self.settings.stage_timeout;
        let started = Instant::now();
        debug!(id = %self.job.id, command = %request.display(), "running tool");

        let run = env.run(request, &cancel);
        tokio::pin!(run);
        let mut ticker = tokio::time::interval(self.settings.progress_interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                result = &mut run => return result,
                _ = ticker.tick() => {
                    let percent = ramp_percent(start, end, started.elapsed(), budget);
                    if percent > self.percent {
                        let label = match stage {
                            Stage::Extracting => "Extracting sequences",
                            _ => "Building target database",
                        };
                        self.emit(stage, percent, format!("{label} ({}s elapsed)", started.elapsed().as_secs()));
                    }
                }
            }
        }
    }

    fn checkpoint(&self) -> Result<(), ConversionFailure> {
        if self.cancel.is_cancelled() {
            Err(ConversionFailure::cancelled())
        } else {
            Ok(())
        }
    }

    fn emit(&mut self, stage: Stage, percent: u8, message: impl Into<String>) {
        let event = ProgressEvent::new(self.job.id.clone(), stage, percent, message);
        if !stage.is_terminal() {
            self.percent = self.percent.max(event.percent);
        }
        debug!(id = %event.id, stage = %event.stage, percent = event.percent, message = %event.message, "progress");
        // No subscribers is fine; nobody may be watching.
        let _ = self.events.send(event);
    }
}

fn intermediate_name(id: &str) -> String {
    format!("{id}.fasta")
}

/// Source databases are multi-file: `swissprot` exists if `swissprot.pin` does.
fn source_exists(source: &Path) -> bool {
    source.is_dir()
        || database_files(source)
            .map(|files| !files.is_empty())
            .unwrap_or(false)
}

fn translate(env: &dyn ExecutionEnvironment, path: &Path) -> Result<String, ConversionFailure> {
    env.translate_path(path)
        .map_err(|err| ConversionFailure::new(FailureReason::PathTranslation, err.to_string()))
}

fn common_failure(err: EnvError, tool: &str) -> Result<ConversionFailure, (i32, String)> {
    match err {
        // Spawn failures: the binary itself is missing, whatever the message says.
        EnvError::Io(io_err) if io_err.kind() == io::ErrorKind::NotFound => Ok(ConversionFailure::new(
            FailureReason::ToolMissing,
            format!("{tool} not found: {io_err}"),
        )),
        EnvError::Cancelled => Ok(ConversionFailure::cancelled()),
        EnvError::Timeout { timeout } => Ok(ConversionFailure::new(
            FailureReason::ExecutionTimeout,
            format!("tool timed out after {}s", timeout.as_secs()),
        )),
        EnvError::Unavailable(reason) => {
            Ok(ConversionFailure::new(FailureReason::EnvironmentUnavailable, reason))
        }
        EnvError::PathTranslation { path, reason } => Ok(ConversionFailure::new(
            FailureReason::PathTranslation,
            format!("{}: {reason}", path.display()),
        )),
        EnvError::ExecutionFailed { exit_code, stderr } => Err((exit_code, stderr)),
        other => Err((-1, other.to_string())),
    }
}

fn tool_missing(exit_code: i32, stderr: &str) -> bool {
    exit_code == 127 || stderr.contains("command not found")
}

fn detail(stderr: &str) -> &str {
    let stderr = stderr.trim();
    if stderr.is_empty() {
        "unknown error"
    } else {
        stderr
    }
}

pub(crate) fn classify_extract_error(err: EnvError, extractor: &str) -> ConversionFailure {
    let (exit_code, stderr) = match common_failure(err, extractor) {
        Ok(failure) => return failure,
        Err(raw) => raw,
    };
    if tool_missing(exit_code, &stderr) {
        ConversionFailure::new(FailureReason::ToolMissing, format!("{extractor} not found"))
    } else if stderr.contains("not found") || stderr.contains("No such file") {
        ConversionFailure::new(
            FailureReason::SourceMissing,
            format!("source database not found: {}", detail(&stderr)),
        )
    } else {
        ConversionFailure::new(
            FailureReason::ExtractionFailed,
            format!("extraction failed: {}", detail(&stderr)),
        )
    }
}

pub(crate) fn classify_build_error(err: EnvError, builder: &str) -> ConversionFailure {
    let (exit_code, stderr) = match common_failure(err, builder) {
        Ok(failure) => return failure,
        Err(raw) => raw,
    };
    if tool_missing(exit_code, &stderr) {
        ConversionFailure::new(FailureReason::ToolMissing, format!("{builder} not found"))
    } else {
        ConversionFailure::new(
            FailureReason::BuildFailed,
            format!("database build failed: {}", detail(&stderr)),
        )
    }
}
