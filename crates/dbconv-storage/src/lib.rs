use chrono::{DateTime, Utc};
use dbconv_core::{ConversionStatus, DatabaseRecord};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error on {}: {source}", .path.display())]
    Io { path: PathBuf, source: io::Error },
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// On-disk shape of the status file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusDocument {
    #[serde(default)]
    pub databases: BTreeMap<String, DatabaseRecord>,
    #[serde(default)]
    pub last_updated: Option<DateTime<Utc>>,
}

/// Durable id -> record mapping. Every mutation rewrites the whole file before returning.
#[derive(Debug)]
pub struct StatusStore {
    path: PathBuf,
    state: Mutex<StatusDocument>,
}

impl StatusStore {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let databases = Self::load(&path);
        debug!(path = %path.display(), records = databases.len(), "status store loaded");
        Self {
            path,
            state: Mutex::new(StatusDocument {
                databases,
                last_updated: None,
            }),
        }
    }

    /// Reads the persisted mapping. Absent or unparsable files are "no history";
    /// individual malformed records are dropped.
    pub fn load(path: &Path) -> BTreeMap<String, DatabaseRecord> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return BTreeMap::new(),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "status file unreadable; starting empty");
                return BTreeMap::new();
            }
        };
        let root: Value = match serde_json::from_str(&content) {
            Ok(root) => root,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "status file malformed; starting empty");
                return BTreeMap::new();
            }
        };
        let Some(entries) = root.get("databases").and_then(Value::as_object) else {
            warn!(path = %path.display(), "status file has no databases map; starting empty");
            return BTreeMap::new();
        };

        let mut databases = BTreeMap::new();
        for (id, raw) in entries {
            match serde_json::from_value::<DatabaseRecord>(raw.clone()) {
                Ok(mut record) => {
                    record.id = id.clone();
                    databases.insert(id.clone(), record);
                }
                Err(err) => {
                    warn!(id = %id, error = %err, "dropping malformed status record");
                }
            }
        }
        databases
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, id: &str) -> Option<DatabaseRecord> {
        self.lock().databases.get(id).cloned()
    }

    pub fn all(&self) -> Vec<DatabaseRecord> {
        self.lock().databases.values().cloned().collect()
    }

    pub fn all_ready(&self) -> Vec<DatabaseRecord> {
        self.lock()
            .databases
            .values()
            .filter(|record| record.status == ConversionStatus::Converted)
            .cloned()
            .collect()
    }

    pub fn upsert(&self, record: DatabaseRecord) -> Result<(), StorageError> {
        self.mutate(|document| {
            document.databases.insert(record.id.clone(), record);
        })
    }

    /// Read-modify-write of one record under the store lock. Returns the stored
    /// record, or `None` (and writes nothing) when `id` is unknown.
    pub fn update<F>(&self, id: &str, mutator: F) -> Result<Option<DatabaseRecord>, StorageError>
    where
        F: FnOnce(&mut DatabaseRecord),
    {
        let mut guard = self.lock();
        let Some(current) = guard.databases.get(id) else {
            return Ok(None);
        };
        let mut record = current.clone();
        mutator(&mut record);
        record.id = id.to_string();

        let mut next = guard.clone();
        next.databases.insert(id.to_string(), record.clone());
        self.commit(&mut guard, next)?;
        Ok(Some(record))
    }

    pub fn delete(&self, id: &str) -> Result<Option<DatabaseRecord>, StorageError> {
        let mut guard = self.lock();
        if !guard.databases.contains_key(id) {
            return Ok(None);
        }
        let mut next = guard.clone();
        let removed = next.databases.remove(id);
        self.commit(&mut guard, next)?;
        Ok(removed)
    }

    fn mutate<F>(&self, mutator: F) -> Result<(), StorageError>
    where
        F: FnOnce(&mut StatusDocument),
    {
        let mut guard = self.lock();
        let mut next = guard.clone();
        mutator(&mut next);
        self.commit(&mut guard, next)
    }

    // Memory only changes once the new snapshot is on disk.
    fn commit(
        &self,
        guard: &mut MutexGuard<'_, StatusDocument>,
        mut next: StatusDocument,
    ) -> Result<(), StorageError> {
        next.last_updated = Some(Utc::now());
        persist(&self.path, &next)?;
        **guard = next;
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, StatusDocument> {
        // A panic mid-mutation never leaves a half-applied document: commits swap whole snapshots.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

struct PersistLock {
    file: File,
}

impl PersistLock {
    fn acquire(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        file.lock_exclusive()?;
        Ok(Self { file })
    }
}

impl Drop for PersistLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

fn persist(path: &Path, document: &StatusDocument) -> Result<(), StorageError> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(io_error(parent))?;
    }
    let payload = serde_json::to_string_pretty(document)?;

    let lock_path = sibling(path, "lock");
    let _lock = PersistLock::acquire(&lock_path).map_err(io_error(&lock_path))?;

    let temp_path = sibling(path, "tmp");
    {
        let mut file = File::create(&temp_path).map_err(io_error(&temp_path))?;
        file.write_all(payload.as_bytes())
            .map_err(io_error(&temp_path))?;
        file.sync_all().map_err(io_error(&temp_path))?;
    }
    fs::rename(&temp_path, path).map_err(io_error(path))?;
    Ok(())
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> StorageError + '_ {
    move |source| StorageError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    match path.file_name() {
        Some(name) => path.with_file_name(format!("{}.{suffix}", name.to_string_lossy())),
        None => path.with_extension(suffix),
    }
}
