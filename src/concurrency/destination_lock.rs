//! Per-destination-directory lock held while an approved operation executes.
//!
//! Two levels: an in-process async mutex per directory, so tasks in one
//! process queue without blocking threads, and an advisory file lock (fs2
//! flock) so separate processes (CLI runs, organizer workers) serialize too.

use anyhow::{Context, Result};
use fs2::FileExt;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::safety::pathutil::{comparable, normalize};

const DEFAULT_WAIT: Duration = Duration::from_secs(30);
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Table of destination locks. Cheap to clone; clones share the table.
#[derive(Clone)]
pub struct DestinationLocks {
    dir: PathBuf,
    wait: Duration,
    local: Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>,
}

/// RAII guard; releases both levels on drop.
#[derive(Debug)]
pub struct DestinationLockGuard {
    directory: PathBuf,
    file: File,
    _local: OwnedMutexGuard<()>,
}

impl DestinationLockGuard {
    pub fn directory(&self) -> &Path {
        &self.directory
    }
}

impl Drop for DestinationLockGuard {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

impl DestinationLocks {
    /// Lock files go under the runtime directory (or state directory fallback).
    pub fn new(paths: &crate::paths::Paths) -> Result<Self> {
        Self::in_dir(paths.locks_dir())
    }

    pub fn in_dir(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create lock directory {}", dir.display()))?;
        Ok(Self {
            dir,
            wait: DEFAULT_WAIT,
            local: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Upper bound on how long [`acquire`](Self::acquire) waits.
    pub fn with_wait(mut self, wait: Duration) -> Self {
        self.wait = wait;
        self
    }

    fn key(directory: &Path) -> String {
        comparable(&normalize(directory))
    }

    fn lock_file(&self, key: &str) -> PathBuf {
        let digest: String = Sha256::digest(key.as_bytes())
            .iter()
            .take(16)
            .map(|b| format!("{:02x}", b))
            .collect();
        self.dir.join(format!("{}.lock", digest))
    }

    fn local_mutex(&self, key: &str) -> Arc<AsyncMutex<()>> {
        let mut table = self.local.lock().unwrap_or_else(|e| e.into_inner());
        // Drop entries nobody is holding or waiting on.
        table.retain(|k, m| k == key || Arc::strong_count(m) > 1);
        table
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Wait for exclusive ownership of `directory`.
    pub async fn acquire(&self, directory: &Path) -> Result<DestinationLockGuard> {
        let key = Self::key(directory);
        let mutex = self.local_mutex(&key);
        let path = self.lock_file(&key);

        let acquire = async move {
            let local = mutex.lock_owned().await;
            let file = File::create(&path)
                .with_context(|| format!("Failed to create lock file {}", path.display()))?;
            // Poll instead of a blocking flock so an abandoned wait holds no
            // thread.
            loop {
                match file.try_lock_exclusive() {
                    Ok(()) => break,
                    Err(ref e) if crate::safety::probe::is_contended(e) => {
                        tokio::time::sleep(LOCK_POLL_INTERVAL).await;
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            Ok::<_, anyhow::Error>((local, file))
        };

        let (local, file) = tokio::time::timeout(self.wait, acquire)
            .await
            .map_err(|_| {
                anyhow::anyhow!(
                    "Timed out after {}ms waiting for {}",
                    self.wait.as_millis(),
                    directory.display()
                )
            })??;

        Ok(DestinationLockGuard {
            directory: directory.to_path_buf(),
            file,
            _local: local,
        })
    }

    /// Non-blocking try-acquire; `None` if another task or process holds it.
    pub fn try_acquire(&self, directory: &Path) -> Result<Option<DestinationLockGuard>> {
        let key = Self::key(directory);
        let mutex = self.local_mutex(&key);
        let Ok(local) = mutex.try_lock_owned() else {
            return Ok(None);
        };

        let file = File::create(self.lock_file(&key))?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(DestinationLockGuard {
                directory: directory.to_path_buf(),
                file,
                _local: local,
            })),
            Err(ref e) if crate::safety::probe::is_contended(e) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
