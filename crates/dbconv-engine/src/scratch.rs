use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Per-run scratch directory. Removed on every exit path: explicitly via
/// [`ScratchDir::release`], otherwise when dropped.
#[derive(Debug)]
pub(crate) struct ScratchDir {
    path: PathBuf,
    released: bool,
}

impl ScratchDir {
    /// Creates the directory, discarding leftovers of an earlier interrupted run.
    pub(crate) fn acquire(path: PathBuf) -> io::Result<Self> {
        remove_dir(&path)?;
        fs::create_dir_all(&path)?;
        Ok(Self {
            path,
            released: false,
        })
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn release(mut self) -> io::Result<()> {
        self.released = true;
        remove_dir(&self.path)
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(err) = remove_dir(&self.path) {
            warn!(path = %self.path.display(), error = %err, "failed to remove scratch directory");
        }
    }
}

pub(crate) fn remove_dir(path: &Path) -> io::Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}
