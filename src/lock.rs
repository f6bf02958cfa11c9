//! The cross-process cache mutex.
//!
//! Metadata reads that decide whether a fetcher starts, cache file
//! creation/unlink, and download-slot table accesses all happen under
//! this lock. It is two locks in one: an advisory `flock` on a file in
//! the cache directory excludes other processes, and an async mutex
//! excludes other tasks inside this process. A per-request handle keeps
//! an owned-count so re-acquisition never blocks; the underlying locks
//! are only touched when the count moves through zero.

use std::fs::{File, OpenOptions};
use std::os::fd::AsRawFd;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

use crate::error::{OffloadError, OffloadResult};

pub struct CacheMutex {
    file: File,
    task_gate: Arc<Mutex<()>>,
}

impl CacheMutex {
    /// Open (creating if needed) the shared lock file.
    pub fn open(path: &Path) -> std::io::Result<Arc<Self>> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        Ok(Arc::new(Self {
            file,
            task_gate: Arc::new(Mutex::new(())),
        }))
    }

    pub fn handle(self: &Arc<Self>) -> LockHandle {
        LockHandle {
            shared: Arc::clone(self),
            owned: 0,
            guard: None,
        }
    }

    fn flock(&self, op: libc::c_int) -> std::io::Result<()> {
        let rc = unsafe { libc::flock(self.file.as_raw_fd(), op) };
        if rc == -1 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(())
    }
}

/// One request's view of the cache mutex. Dropping the handle releases
/// every count it still owns.
pub struct LockHandle {
    shared: Arc<CacheMutex>,
    owned: u32,
    guard: Option<OwnedMutexGuard<()>>,
}

impl LockHandle {
    pub async fn acquire(&mut self) -> OffloadResult<()> {
        debug!(owned = self.owned, "grabbing cache mutex");
        if self.owned > 0 {
            self.owned += 1;
            return Ok(());
        }

        let guard = self.shared.task_gate.clone().lock_owned().await;
        let shared = Arc::clone(&self.shared);
        tokio::task::spawn_blocking(move || shared.flock(libc::LOCK_EX))
            .await
            .map_err(|e| OffloadError::Internal(format!("lock task failed: {e}")))?
            .map_err(|_| {
                OffloadError::OriginUnavailable("Couldn't lock cache mutex.".to_string())
            })?;

        self.guard = Some(guard);
        self.owned = 1;
        Ok(())
    }

    pub fn release(&mut self) {
        if self.owned == 0 {
            return;
        }
        self.owned -= 1;
        if self.owned == 0 {
            let _ = self.shared.flock(libc::LOCK_UN);
            self.guard = None;
        }
        debug!(owned = self.owned, "released cache mutex");
    }

    pub fn owned(&self) -> u32 {
        self.owned
    }

    pub fn mutex(&self) -> Arc<CacheMutex> {
        Arc::clone(&self.shared)
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        while self.owned > 0 {
            self.release();
        }
    }
}
