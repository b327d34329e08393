//! Cross-process advisory lock guarding a table during rename/drop.
//!
//! `<lock_dir>/<table>.lock` is held with a non-blocking exclusive `flock`.
//! Dropping [`LockFile`] releases it.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use crate::error::PoolError;

pub(crate) struct LockFile {
    path: PathBuf,
    #[cfg(unix)]
    _lock: nix::fcntl::Flock<File>,
    #[cfg(not(unix))]
    _file: File,
}

impl LockFile {
    pub(crate) fn path(&self) -> &Path {
        &self.path
    }
}

/// A table name must stay a single path component inside the lock directory.
fn is_plain_name(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains(['/', '\\', '\0'])
}

fn lock_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{name}.lock"))
}

pub(crate) fn acquire(dir: &Path, name: &str) -> Result<LockFile, PoolError> {
    if !is_plain_name(name) {
        return Err(PoolError::ExternalLockFailed {
            name: name.to_string(),
            message: "table name is not a plain file name".to_string(),
        });
    }
    let path = lock_path(dir, name);
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&path)
        .map_err(|e| PoolError::ExternalLockFailed {
            name: name.to_string(),
            message: format!("open {}: {}", path.display(), e),
        })?;

    #[cfg(unix)]
    {
        use nix::fcntl::{Flock, FlockArg};

        let lock = Flock::lock(file, FlockArg::LockExclusiveNonblock).map_err(|(_, errno)| {
            PoolError::ExternalLockFailed {
                name: name.to_string(),
                message: format!("flock {}: {}", path.display(), errno),
            }
        })?;
        tracing::debug!(path = %path.display(), "Acquired lock file");
        Ok(LockFile { path, _lock: lock })
    }

    #[cfg(not(unix))]
    {
        tracing::debug!(path = %path.display(), "Created lock file (no OS lock on this platform)");
        Ok(LockFile { path, _file: file })
    }
}
