//! Multi-file database artifacts on the host filesystem.
//!
//! A database named by `base` is the file `base` itself plus its companions:
//! `base.*` (indexes, BLAST volumes, lookup tables) and the `base_h*` header
//! files MMseqs2 writes next to it.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub(crate) fn database_files(base: &Path) -> io::Result<Vec<PathBuf>> {
    let Some(name) = base.file_name().map(|name| name.to_string_lossy().to_string()) else {
        return Ok(Vec::new());
    };
    let parent = match base.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let entries = match fs::read_dir(&parent) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err),
    };

    let dotted = format!("{name}.");
    let header = format!("{name}_h");
    let mut files = Vec::new();
    for entry in entries {
        let entry = entry?;
        let file_name = entry.file_name().to_string_lossy().to_string();
        let belongs = file_name == name
            || file_name.starts_with(&dotted)
            || file_name == header
            || file_name.starts_with(&format!("{header}."));
        if belongs && entry.file_type().map(|kind| kind.is_file()).unwrap_or(false) {
            files.push(entry.path());
        }
    }
    files.sort();
    Ok(files)
}

/// True iff at least one file of the database exists.
pub fn artifact_exists(base: &Path) -> bool {
    match database_files(base) {
        Ok(files) => !files.is_empty(),
        Err(err) => {
            warn!(path = %base.display(), error = %err, "cannot inspect database directory");
            false
        }
    }
}

/// Best-effort removal of every file of the database. Returns how many were removed.
pub fn remove_artifact(base: &Path) -> usize {
    let files = match database_files(base) {
        Ok(files) => files,
        Err(err) => {
            warn!(path = %base.display(), error = %err, "cannot list database files for removal");
            return 0;
        }
    };
    let mut removed = 0;
    for file in files {
        match fs::remove_file(&file) {
            Ok(()) => removed += 1,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => warn!(path = %file.display(), error = %err, "failed to remove database file"),
        }
    }
    if removed > 0 {
        debug!(path = %base.display(), removed, "removed database files");
    }
    removed
}
