//! Duplicate-download limiter.
//!
//! A fixed-capacity slot table, shared between every offload process
//! pointed at the same cache directory, counts active downloads per
//! `(client address, URI)` fingerprint. "Download accelerators" that
//! open many connections for one file get `403` once the configured
//! limit of live twins is reached. All table accesses happen under the
//! cache mutex.

use dashmap::DashMap;
use sha1::{Digest, Sha1};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

use crate::error::OffloadResult;
use crate::fetcher::process_dead;
use crate::lock::{CacheMutex, LockHandle};

/// We can track this many concurrent connections. If your server is
/// still standing with 512 active downloads, you probably don't care
/// about download accelerators anyhow.
pub const MAX_DOWNLOAD_RECORDS: usize = 512;

pub const DIGEST_LEN: usize = 20;

// pid (4) + task token (8) + digest (20)
const SLOT_LEN: usize = 4 + 8 + DIGEST_LEN;
const TABLE_LEN: usize = SLOT_LEN * MAX_DOWNLOAD_RECORDS;

pub const DUPE_FORBID_TEXT: &str = "Your network address has too many connections for this \
     specific file.\nPlease disable any 'download accelerators' and try again.";

pub struct DupeTracker {
    path: PathBuf,
    limit: u32,
    live_tokens: DashMap<u64, ()>,
    next_token: AtomicU64,
}

pub enum Admission {
    /// Admitted and recorded; drop (or release) the slot when done.
    Granted(DupeSlot),
    /// Admitted but not recorded: limiter disabled, client address
    /// unknown, or the table is full.
    Unrecorded,
    /// Too many live downloads of this URI from this address.
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Slot {
    pid: u32,
    token: u64,
    digest: [u8; DIGEST_LEN],
}

impl Slot {
    const EMPTY: Slot = Slot {
        pid: 0,
        token: 0,
        digest: [0; DIGEST_LEN],
    };

    fn read(buf: &[u8]) -> Slot {
        Slot {
            pid: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
            token: u64::from_le_bytes(buf[4..12].try_into().unwrap()),
            digest: buf[12..SLOT_LEN].try_into().unwrap(),
        }
    }

    fn write(&self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&self.pid.to_le_bytes());
        buf[4..12].copy_from_slice(&self.token.to_le_bytes());
        buf[12..SLOT_LEN].copy_from_slice(&self.digest);
    }
}

pub fn download_digest(remote: &str, uri: &str) -> [u8; DIGEST_LEN] {
    let mut hasher = Sha1::new();
    hasher.update(remote.as_bytes());
    hasher.update([0u8]);
    hasher.update(uri.as_bytes());
    hasher.update([0u8]);
    hasher.finalize().into()
}

impl DupeTracker {
    pub fn new(path: PathBuf, limit: u32) -> Arc<Self> {
        Arc::new(Self {
            path,
            limit,
            live_tokens: DashMap::new(),
            next_token: AtomicU64::new(1),
        })
    }

    /// Admit a download, recording it in the slot table. Walks every
    /// slot: live twins of our fingerprint count toward the limit, dead
    /// ones are cleared and their slots reused.
    pub async fn admit(
        self: &Arc<Self>,
        lock: &mut LockHandle,
        remote: &str,
        uri: &str,
    ) -> OffloadResult<Admission> {
        if self.limit == 0 || remote.is_empty() {
            return Ok(Admission::Unrecorded);
        }

        let digest = download_digest(remote, uri);
        let my_pid = std::process::id();
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);

        lock.acquire().await?;
        let mut table = self.read_table().await;

        let mut dupes = 0u32;
        let mut candidate = None;
        for (i, buf) in table.chunks_exact_mut(SLOT_LEN).enumerate() {
            let slot = Slot::read(buf);
            if slot.pid == 0 {
                candidate = Some(i);
            } else if slot.digest == digest {
                if self.slot_alive(&slot) {
                    debug!(pid = slot.pid, token = slot.token, "live dupe slot");
                    dupes += 1;
                } else {
                    debug!(pid = slot.pid, "download slot holder died, reusing");
                    Slot::EMPTY.write(buf);
                    candidate = Some(i);
                }
            }
        }
        debug!(dupes = dupes, "scanned download slots");

        if dupes >= self.limit {
            self.write_table(&table).await?;
            lock.release();
            return Ok(Admission::Rejected);
        }

        let Some(index) = candidate else {
            debug!("no free download slots, proceeding unrecorded");
            self.write_table(&table).await?;
            lock.release();
            return Ok(Admission::Unrecorded);
        };

        let slot = Slot {
            pid: my_pid,
            token,
            digest,
        };
        slot.write(&mut table[index * SLOT_LEN..(index + 1) * SLOT_LEN]);
        self.live_tokens.insert(token, ());
        self.write_table(&table).await?;
        lock.release();

        debug!(index = index, token = token, "took download slot");
        Ok(Admission::Granted(DupeSlot {
            inner: Some(SlotHold {
                tracker: Arc::clone(self),
                mutex: lock.mutex(),
                index,
                token,
            }),
        }))
    }

    /// A slot is live when its recorder still exists: by pid probe for
    /// other processes, by token registry for our own tasks.
    fn slot_alive(&self, slot: &Slot) -> bool {
        if slot.pid == std::process::id() {
            self.live_tokens.contains_key(&slot.token)
        } else {
            !process_dead(slot.pid)
        }
    }

    async fn read_table(&self) -> Vec<u8> {
        let mut table = tokio::fs::read(&self.path).await.unwrap_or_default();
        table.resize(TABLE_LEN, 0);
        table
    }

    async fn write_table(&self, table: &[u8]) -> OffloadResult<()> {
        tokio::fs::write(&self.path, table).await?;
        Ok(())
    }

    async fn release_slot(&self, lock: &mut LockHandle, index: usize, token: u64) {
        self.live_tokens.remove(&token);
        if lock.acquire().await.is_err() {
            return;
        }
        let mut table = self.read_table().await;
        let range = index * SLOT_LEN..(index + 1) * SLOT_LEN;
        let slot = Slot::read(&table[range.clone()]);
        if slot.pid == std::process::id() && slot.token == token {
            Slot::EMPTY.write(&mut table[range]);
            let _ = self.write_table(&table).await;
        }
        lock.release();
    }
}

/// An occupied download slot. Released explicitly at the end of a
/// request, or from `Drop` as a backstop (client disconnects tear down
/// the response body without unwinding the request path).
pub struct DupeSlot {
    inner: Option<SlotHold>,
}

struct SlotHold {
    tracker: Arc<DupeTracker>,
    mutex: Arc<CacheMutex>,
    index: usize,
    token: u64,
}

impl DupeSlot {
    pub async fn release(mut self) {
        if let Some(hold) = self.inner.take() {
            let mut lock = hold.mutex.handle();
            hold.tracker
                .release_slot(&mut lock, hold.index, hold.token)
                .await;
        }
    }
}

impl Drop for DupeSlot {
    fn drop(&mut self) {
        let Some(hold) = self.inner.take() else {
            return;
        };
        hold.tracker.live_tokens.remove(&hold.token);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let mut lock = hold.mutex.handle();
                hold.tracker
                    .release_slot(&mut lock, hold.index, hold.token)
                    .await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn setup(limit: u32) -> (tempfile::TempDir, Arc<CacheMutex>, Arc<DupeTracker>) {
        let dir = tempdir().unwrap();
        let mutex = CacheMutex::open(&dir.path().join("lock")).unwrap();
        let tracker = DupeTracker::new(dir.path().join("dupes"), limit);
        (dir, mutex, tracker)
    }

    #[tokio::test]
    async fn test_disabled_limit_is_unconditional() {
        let (_dir, mutex, tracker) = setup(0);
        let mut lock = mutex.handle();
        for _ in 0..10 {
            match tracker
                .admit(&mut lock, "10.0.0.1", "/a.bin")
                .await
                .unwrap()
            {
                Admission::Unrecorded => {}
                _ => panic!("expected unconditional admission"),
            }
        }
    }

    #[tokio::test]
    async fn test_second_download_rejected_at_limit_one() {
        let (_dir, mutex, tracker) = setup(1);
        let mut lock = mutex.handle();

        let first = match tracker
            .admit(&mut lock, "10.0.0.1", "/a.bin")
            .await
            .unwrap()
        {
            Admission::Granted(slot) => slot,
            _ => panic!("first download should be granted"),
        };

        match tracker
            .admit(&mut lock, "10.0.0.1", "/a.bin")
            .await
            .unwrap()
        {
            Admission::Rejected => {}
            _ => panic!("second download should be rejected"),
        }

        // a different URI from the same address is fine
        match tracker
            .admit(&mut lock, "10.0.0.1", "/b.bin")
            .await
            .unwrap()
        {
            Admission::Granted(_) => {}
            _ => panic!("different URI should be granted"),
        }

        // and a different address for the same URI is fine
        match tracker
            .admit(&mut lock, "10.0.0.2", "/a.bin")
            .await
            .unwrap()
        {
            Admission::Granted(_) => {}
            _ => panic!("different address should be granted"),
        }

        first.release().await;
        match tracker
            .admit(&mut lock, "10.0.0.1", "/a.bin")
            .await
            .unwrap()
        {
            Admission::Granted(_) => {}
            _ => panic!("released slot should admit again"),
        }
    }

    #[tokio::test]
    async fn test_missing_remote_is_unrecorded() {
        let (_dir, mutex, tracker) = setup(1);
        let mut lock = mutex.handle();
        match tracker.admit(&mut lock, "", "/a.bin").await.unwrap() {
            Admission::Unrecorded => {}
            _ => panic!("unknown address cannot be tracked"),
        }
    }

    #[tokio::test]
    async fn test_slot_of_dead_process_is_reused() {
        let (_dir, mutex, tracker) = setup(1);
        let mut lock = mutex.handle();

        // forge a table where a dead pid holds our fingerprint
        let digest = download_digest("10.0.0.1", "/a.bin");
        let mut table = vec![0u8; TABLE_LEN];
        Slot {
            pid: i32::MAX as u32 - 1,
            token: 7,
            digest,
        }
        .write(&mut table[0..SLOT_LEN]);
        tracker.write_table(&table).await.unwrap();

        match tracker
            .admit(&mut lock, "10.0.0.1", "/a.bin")
            .await
            .unwrap()
        {
            Admission::Granted(_) => {}
            _ => panic!("dead holder should not count as a dupe"),
        }
    }

    #[test]
    fn test_digest_is_deterministic_and_distinct() {
        let a = download_digest("10.0.0.1", "/a.bin");
        assert_eq!(a, download_digest("10.0.0.1", "/a.bin"));
        assert_ne!(a, download_digest("10.0.0.2", "/a.bin"));
        assert_ne!(a, download_digest("10.0.0.1", "/b.bin"));
        // the NUL separators keep boundary ambiguity out
        assert_ne!(download_digest("ab", "c"), download_digest("a", "bc"));
    }
}
