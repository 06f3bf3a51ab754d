use crate::artifact::{artifact_exists, remove_artifact};
use crate::error::{ConversionFailure, ManagerError};
use crate::handle::{ConversionHandle, RunOutcome};
use crate::scratch::remove_dir;
use crate::worker::{ConversionJob, ConversionWorker, WorkerSettings};
use chrono::Utc;
use dbconv_core::{
    ConversionConfig, ConversionStatus, DatabaseRecord, FailureReason, ProgressEvent, SourceKind,
};
use dbconv_env::{CancelToken, ExecutionEnvironment};
use dbconv_storage::StatusStore;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{broadcast, watch, Semaphore};
use tracing::{debug, error, info, warn};

const EVENT_CAPACITY: usize = 64;

/// What [`ConversionManager::reconcile`] changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Records left CONVERTING by a previous process, now FAILED.
    pub interrupted: Vec<String>,
    /// Records whose converted path was stored in environment form.
    pub repaired_paths: Vec<String>,
}

impl ReconcileReport {
    pub fn is_empty(&self) -> bool {
        self.interrupted.is_empty() && self.repaired_paths.is_empty()
    }
}

struct ActiveRun {
    cancel: CancelToken,
    events: broadcast::Sender<ProgressEvent>,
    outcome: watch::Receiver<Option<RunOutcome>>,
}

impl ActiveRun {
    fn attach(&self, id: &str) -> ConversionHandle {
        ConversionHandle::attached(id, self.events.subscribe(), self.outcome.clone())
    }
}

struct ManagerInner {
    env: Arc<dyn ExecutionEnvironment>,
    store: StatusStore,
    config: ConversionConfig,
    settings: WorkerSettings,
    limiter: Option<Arc<Semaphore>>,
    runs: Mutex<HashMap<String, ActiveRun>>,
}

/// Owns the status store and every live conversion. At most one run exists
/// per database id; later requests for the same id attach to it.
#[derive(Clone)]
pub struct ConversionManager {
    inner: Arc<ManagerInner>,
}

impl ConversionManager {
    pub fn new(config: ConversionConfig, env: Arc<dyn ExecutionEnvironment>) -> Self {
        let mut config = config;
        config.target_root = absolutize(&config.target_root);
        let store = StatusStore::open(absolutize(&config.status_file_path()));
        let limiter = (config.max_concurrent > 0).then(|| Arc::new(Semaphore::new(config.max_concurrent)));
        info!(
            env = env.name(),
            target_root = %config.target_root.display(),
            status_file = %store.path().display(),
            "conversion manager ready"
        );
        Self {
            inner: Arc::new(ManagerInner {
                env,
                store,
                settings: WorkerSettings::from_config(&config),
                config,
                limiter,
                runs: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn config(&self) -> &ConversionConfig {
        &self.inner.config
    }

    pub fn environment(&self) -> &Arc<dyn ExecutionEnvironment> {
        &self.inner.env
    }

    /// Returns a handle resolving to the converted database for `id`, starting
    /// a run only if none is live and no verified artifact exists.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn ensure_converted(
        &self,
        id: &str,
        source_path: impl AsRef<Path>,
        kind: SourceKind,
    ) -> Result<ConversionHandle, ManagerError> {
        let id = id.trim();
        if id.is_empty() {
            return Err(ManagerError::InvalidId);
        }
        let source_path = absolutize(source_path.as_ref());
        let inner = &self.inner;

        let mut runs = inner.runs();
        if let Some(run) = runs.get(id) {
            debug!(id, "attaching to running conversion");
            return Ok(run.attach(id));
        }

        let existing = inner.store.get(id);
        if let Some(bound) = existing.as_ref().and_then(|record| record.source_path.as_ref()) {
            if *bound != source_path {
                return Err(ManagerError::SourceConflict {
                    id: id.to_string(),
                    existing: bound.clone(),
                    requested: source_path,
                });
            }
        }
        if let Some(record) = existing.as_ref().filter(|record| record.is_converted()) {
            match record.converted_path().filter(|path| artifact_exists(path)) {
                Some(path) => {
                    debug!(id, path = %path.display(), "already converted");
                    return Ok(ConversionHandle::ready(id, path.to_path_buf()));
                }
                None => warn!(id, "converted database is missing on disk; converting again"),
            }
        }

        let mut record = existing.unwrap_or_else(|| DatabaseRecord::new(id, kind));
        record.source_path.get_or_insert_with(|| source_path.clone());
        record.begin_conversion(Utc::now());
        inner.store.upsert(record)?;

        let cancel = CancelToken::new();
        let (events, events_rx) = broadcast::channel(EVENT_CAPACITY);
        let (outcome_tx, outcome_rx) = watch::channel(None);
        let handle = ConversionHandle::attached(id, events_rx, outcome_rx.clone());
        let worker = ConversionWorker::new(
            Arc::clone(&inner.env),
            inner.settings.clone(),
            ConversionJob {
                id: id.to_string(),
                source_path,
                target_path: inner.config.target_path(id),
                scratch_dir: inner.config.scratch_dir(id),
            },
            cancel.clone(),
            events.clone(),
            inner.limiter.clone(),
        );
        runs.insert(
            id.to_string(),
            ActiveRun {
                cancel,
                events,
                outcome: outcome_rx,
            },
        );
        drop(runs);

        info!(id, "conversion started");
        tokio::spawn(Arc::clone(inner).drive(id.to_string(), worker, outcome_tx));
        Ok(handle)
    }

    /// Attaches to a live run without starting one.
    pub fn subscribe(&self, id: &str) -> Option<ConversionHandle> {
        self.inner.runs().get(id).map(|run| run.attach(id))
    }

    /// Requests cancellation of the live run for `id`. False when nothing is running.
    pub fn cancel(&self, id: &str) -> bool {
        match self.inner.runs().get(id) {
            Some(run) => {
                info!(id, "cancellation requested");
                run.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Restarts a FAILED conversion from its recorded source.
    pub fn retry(&self, id: &str) -> Result<ConversionHandle, ManagerError> {
        let record = self
            .inner
            .store
            .get(id)
            .ok_or_else(|| ManagerError::UnknownDatabase(id.to_string()))?;
        if record.status != ConversionStatus::Failed {
            return Err(ManagerError::NotRetryable {
                id: id.to_string(),
                status: record.status,
            });
        }
        let source = record
            .source_path
            .clone()
            .ok_or_else(|| ManagerError::MissingSource(id.to_string()))?;
        self.inner.store.update(id, DatabaseRecord::reset)?;
        self.ensure_converted(id, source, record.source_kind)
    }

    /// Cancels any live run, removes the database files and resets the record.
    /// Returns false for an unknown id.
    pub async fn cleanup(&self, id: &str) -> Result<bool, ManagerError> {
        let live = self
            .inner
            .runs()
            .get(id)
            .map(|run| (run.cancel.clone(), run.outcome.clone()));
        if let Some((cancel, mut outcome)) = live {
            cancel.cancel();
            let _ = outcome.wait_for(Option::is_some).await;
        }

        let runs = self.inner.runs();
        if runs.contains_key(id) {
            return Err(ManagerError::Busy(id.to_string()));
        }
        let Some(record) = self.inner.store.get(id) else {
            return Ok(false);
        };
        let target = record
            .converted_path
            .clone()
            .unwrap_or_else(|| self.inner.config.target_path(id));
        let removed = remove_artifact(&target);
        if let Err(err) = remove_dir(&self.inner.config.scratch_dir(id)) {
            warn!(id, error = %err, "failed to remove scratch directory");
        }
        self.inner.store.update(id, DatabaseRecord::reset)?;
        drop(runs);
        info!(id, removed, "database cleaned up");
        Ok(true)
    }

    /// Startup repair: runs left CONVERTING by a dead process become FAILED
    /// ("interrupted") and environment-form converted paths are mapped back.
    pub fn reconcile(&self) -> Result<ReconcileReport, ManagerError> {
        let inner = &self.inner;
        let runs = inner.runs();
        let mut report = ReconcileReport::default();
        let now = Utc::now();

        for record in inner.store.all() {
            if record.is_converting() && !runs.contains_key(&record.id) {
                inner.store.update(&record.id, |record| {
                    record.mark_failed(ConversionFailure::interrupted().message, now)
                })?;
                if let Err(err) = remove_dir(&inner.config.scratch_dir(&record.id)) {
                    warn!(id = %record.id, error = %err, "failed to remove stale scratch directory");
                }
                warn!(id = %record.id, "marked interrupted conversion as failed");
                report.interrupted.push(record.id.clone());
                continue;
            }

            let Some(stored) = record.converted_path() else {
                continue;
            };
            if inner.env.translate_path(stored).is_ok() {
                continue;
            }
            let Some(host) = inner.env.host_path(&stored.to_string_lossy()) else {
                continue;
            };
            if host.as_path() == stored {
                continue;
            }
            inner
                .store
                .update(&record.id, |record| record.converted_path = Some(host.clone()))?;
            info!(id = %record.id, path = %host.display(), "repaired converted path");
            report.repaired_paths.push(record.id.clone());
        }
        Ok(report)
    }

    /// Current record for `id`; unknown ids read as NOT_CONVERTED.
    pub fn status(&self, id: &str) -> DatabaseRecord {
        self.inner
            .store
            .get(id)
            .unwrap_or_else(|| DatabaseRecord::new(id, SourceKind::Catalog))
    }

    pub fn statuses(&self) -> Vec<DatabaseRecord> {
        self.inner.store.all()
    }

    /// Converted databases whose artifacts are still on disk.
    pub fn ready(&self) -> Vec<DatabaseRecord> {
        self.inner
            .store
            .all_ready()
            .into_iter()
            .filter(|record| record.converted_path().is_some_and(artifact_exists))
            .collect()
    }

    pub fn is_converting(&self, id: &str) -> bool {
        self.inner.runs().contains_key(id)
    }

    /// True iff the record says CONVERTED and the artifact is still there. A
    /// record whose artifact vanished is reset.
    pub fn is_converted(&self, id: &str) -> bool {
        let _runs = self.inner.runs();
        let Some(record) = self.inner.store.get(id) else {
            return false;
        };
        let Some(path) = record.converted_path() else {
            return false;
        };
        if artifact_exists(path) {
            return true;
        }
        warn!(id, path = %path.display(), "converted database missing; resetting status");
        if let Err(err) = self.inner.store.update(id, DatabaseRecord::reset) {
            error!(id, error = %err, "failed to reset status");
        }
        false
    }
}

impl ManagerInner {
    fn runs(&self) -> MutexGuard<'_, HashMap<String, ActiveRun>> {
        self.runs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn drive(
        self: Arc<Self>,
        id: String,
        worker: ConversionWorker,
        outcome_tx: watch::Sender<Option<RunOutcome>>,
    ) {
        let outcome = match tokio::spawn(worker.run()).await {
            Ok(outcome) => outcome,
            Err(err) => {
                error!(id = %id, error = %err, "conversion worker aborted");
                Err(ConversionFailure::new(
                    FailureReason::Interrupted,
                    format!("conversion worker aborted: {err}"),
                ))
            }
        };

        // Terminal status is durable before the run stops being live.
        let mut runs = self.runs();
        let now = Utc::now();
        let persisted = self.store.update(&id, |record| match &outcome {
            Ok(path) => record.mark_converted(path.clone(), now),
            Err(failure) if failure.reason == FailureReason::Cancelled => record.reset(),
            Err(failure) => record.mark_failed(failure.message.clone(), now),
        });
        if let Err(err) = persisted {
            error!(id = %id, error = %err, "failed to persist conversion outcome");
        }
        runs.remove(&id);
        drop(runs);
        outcome_tx.send_replace(Some(outcome));
    }
}

fn absolutize(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    match std::env::current_dir() {
        Ok(cwd) => cwd.join(path),
        Err(_) => path.to_path_buf(),
    }
}
