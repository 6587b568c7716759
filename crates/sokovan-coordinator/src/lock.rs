//! Per-phase mutual exclusion.
//!
//! Every phase cycle runs under a named lock so that multiple
//! coordinator processes sharing a data directory never execute the
//! same phase concurrently. Acquisition is non-blocking: a busy lock
//! skips the cycle, and the next timer tick tries again.

use std::collections::HashSet;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

use crate::error::{CoordinatorError, CoordinatorResult};

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Non-blocking named lock provider. `Ok(None)` means busy.
pub trait LockFactory: Send + Sync + 'static {
    type Guard: Send;

    fn try_acquire(&self, id: &str) -> CoordinatorResult<Option<Self::Guard>>;
}

// ── File-based locks ───────────────────────────────────────────────

/// Lock files under a shared directory. The file holds the acquisition
/// time; a holder that died leaves a file behind, which later acquirers
/// take over once it is older than the stale lifetime.
pub struct FileLockFactory {
    dir: PathBuf,
    stale_after: Duration,
}

impl FileLockFactory {
    pub fn new(dir: impl Into<PathBuf>, stale_after: Duration) -> CoordinatorResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .map_err(|e| CoordinatorError::Lock(format!("create lock dir: {e}")))?;
        Ok(Self { dir, stale_after })
    }

    fn lock_path(&self, id: &str) -> PathBuf {
        // Lock ids may contain separators; flatten them.
        let name: String = id
            .chars()
            .map(|c| if c.is_alphanumeric() || c == '-' { c } else { '_' })
            .collect();
        self.dir.join(format!("{name}.lock"))
    }

    fn try_create(&self, path: &Path) -> CoordinatorResult<bool> {
        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
        {
            Ok(_) => {
                fs::write(path, epoch_secs().to_string())
                    .map_err(|e| CoordinatorError::Lock(format!("write lock: {e}")))?;
                Ok(true)
            }
            Err(err) if err.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(err) => Err(CoordinatorError::Lock(format!("create lock: {err}"))),
        }
    }

    fn is_stale(&self, path: &Path) -> bool {
        let Ok(content) = fs::read_to_string(path) else {
            return false;
        };
        let Ok(acquired_at) = content.trim().parse::<u64>() else {
            // Unreadable content: treat as stale rather than wedging
            // the phase forever.
            return true;
        };
        epoch_secs().saturating_sub(acquired_at) > self.stale_after.as_secs()
    }
}

impl LockFactory for FileLockFactory {
    type Guard = FileLockGuard;

    fn try_acquire(&self, id: &str) -> CoordinatorResult<Option<Self::Guard>> {
        let path = self.lock_path(id);
        if self.try_create(&path)? {
            return Ok(Some(FileLockGuard { path }));
        }
        if self.is_stale(&path) {
            warn!(lock = id, "taking over stale lock");
            let _ = fs::remove_file(&path);
            if self.try_create(&path)? {
                return Ok(Some(FileLockGuard { path }));
            }
        }
        debug!(lock = id, "lock busy");
        Ok(None)
    }
}

pub struct FileLockGuard {
    path: PathBuf,
}

impl Drop for FileLockGuard {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

// ── In-process locks ───────────────────────────────────────────────

/// Mutex-map lock for single-process deployments and tests.
#[derive(Clone, Default)]
pub struct LocalLockFactory {
    held: Arc<Mutex<HashSet<String>>>,
}

impl LocalLockFactory {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LockFactory for LocalLockFactory {
    type Guard = LocalLockGuard;

    fn try_acquire(&self, id: &str) -> CoordinatorResult<Option<Self::Guard>> {
        let mut held = self
            .held
            .lock()
            .map_err(|_| CoordinatorError::Lock("lock set poisoned".to_string()))?;
        if !held.insert(id.to_string()) {
            return Ok(None);
        }
        Ok(Some(LocalLockGuard {
            id: id.to_string(),
            held: Arc::clone(&self.held),
        }))
    }
}

pub struct LocalLockGuard {
    id: String,
    held: Arc<Mutex<HashSet<String>>>,
}

impl Drop for LocalLockGuard {
    fn drop(&mut self) {
        if let Ok(mut held) = self.held.lock() {
            held.remove(&self.id);
        }
    }
}
