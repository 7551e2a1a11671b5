//! Named async critical sections, in-process and across processes.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use fs2::FileExt;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::error::StoreError;

/// Held for the duration of a critical section.
pub type KeyGuard = OwnedMutexGuard<()>;

/// One async mutex per name, created on demand.
///
/// Entries no longer held by anyone are pruned on the next acquisition, so the
/// map only grows with the number of concurrently active names.
#[derive(Default)]
pub struct KeyedLocks {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `name`.
    pub async fn lock(&self, name: &str) -> KeyGuard {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            Arc::clone(
                locks
                    .entry(name.to_string())
                    .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
            )
        };
        lock.lock_owned().await
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// Exclusive advisory lock on a file, shared by every process using the store.
///
/// The lock is released when the guard is dropped and the file closed.
#[derive(Debug)]
pub struct StoreLock {
    _file: File,
    path: PathBuf,
}

impl StoreLock {
    /// Wait for the exclusive lock on `path`, creating the file if needed.
    pub async fn acquire(path: PathBuf) -> Result<Self, StoreError> {
        tokio::task::spawn_blocking(move || -> Result<Self, StoreError> {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&path)?;
            FileExt::lock_exclusive(&file)?;
            tracing::trace!(path = %path.display(), "Store lock acquired");
            Ok(Self { _file: file, path })
        })
        .await
        .map_err(|e| StoreError::Io(std::io::Error::other(e)))?
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        tracing::trace!(path = %self.path().display(), "Store lock released");
    }
}
