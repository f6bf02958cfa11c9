//! The background fetcher: pulls the origin body into the cache file
//! while any number of streamers read behind it.
//!
//! At most one fetcher runs per cache entry. That is enforced by the
//! request pipeline: the coherence verdict and the metadata write that
//! flips an entry to "fetch in progress" both happen under the cache
//! mutex, so later arrivals see either the growing entry or the
//! finished one. The registry here is the liveness signal for entries
//! written by this process; entries written by other processes are
//! probed by pid.

use bytes::Bytes;
use dashmap::DashMap;
use futures::StreamExt;
use futures::stream::BoxStream;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::lock::CacheMutex;
use crate::stats::Stats;
use crate::store::{CacheStore, EntryPaths};
use crate::streamer::COPY_CHUNK;

pub type OriginBody = BoxStream<'static, reqwest::Result<Bytes>>;

/// True when no process with this pid exists (signal-0 probe).
pub fn process_dead(pid: u32) -> bool {
    if pid == 0 || pid > i32::MAX as u32 {
        return true;
    }
    let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
    rc == -1 && std::io::Error::last_os_error().raw_os_error() == Some(libc::ESRCH)
}

/// Cache keys with a live fetcher task in this process.
#[derive(Default)]
pub struct FetchRegistry {
    in_flight: DashMap<String, ()>,
}

impl FetchRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.in_flight.contains_key(key)
    }

    pub fn is_idle(&self) -> bool {
        self.in_flight.is_empty()
    }

    /// Wait for every in-flight fetch to finish. Used on shutdown so a
    /// short-lived process doesn't strand half-written entries.
    pub async fn wait_idle(&self) {
        while !self.is_idle() {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    pub fn register(self: &Arc<Self>, key: String) -> FetchGuard {
        self.in_flight.insert(key.clone(), ());
        debug!(key = %key, "registered fetcher");
        FetchGuard {
            key,
            registry: Arc::clone(self),
        }
    }
}

/// Removes the registry entry when the fetcher ends, however it ends.
pub struct FetchGuard {
    key: String,
    registry: Arc<FetchRegistry>,
}

impl Drop for FetchGuard {
    fn drop(&mut self) {
        self.registry.in_flight.remove(&self.key);
    }
}

/// Is the fetcher recorded in an entry's metadata still alive?
pub fn fetcher_alive(pid: u32, key: &str, registry: &FetchRegistry) -> bool {
    if pid == std::process::id() {
        registry.contains(key)
    } else {
        !process_dead(pid)
    }
}

/// Start the detached copy task. Called with the cache mutex held,
/// after the metadata for this entry has been persisted.
pub fn spawn(
    guard: FetchGuard,
    mutex: Arc<CacheMutex>,
    store: CacheStore,
    paths: EntryPaths,
    file: File,
    body: OriginBody,
    content_length: u64,
    stats: Arc<Stats>,
) {
    stats.record_fetch_started();
    tokio::spawn(async move {
        match copy_body(file, body, content_length).await {
            Ok(()) => {
                debug!(body = %paths.body.display(), "fetch complete");
            }
            Err(reason) => {
                warn!(body = %paths.body.display(), reason = %reason, "fetch failed, nuking entry");
                stats.record_fetch_failed();
                let mut lock = mutex.handle();
                if lock.acquire().await.is_ok() {
                    store.nuke(&paths).await;
                }
                lock.release();
            }
        }
        drop(guard);
    });
}

async fn copy_body(mut file: File, mut body: OriginBody, content_length: u64) -> Result<(), String> {
    let mut written: u64 = 0;
    while written < content_length {
        let chunk = match body.next().await {
            None => return Err("origin closed connection early".to_string()),
            Some(Err(e)) => return Err(format!("origin read error: {e}")),
            Some(Ok(chunk)) => chunk,
        };

        let take = chunk.len().min((content_length - written) as usize);
        // readers poll the file length; flush each bounded piece
        for piece in chunk[..take].chunks(COPY_CHUNK) {
            file.write_all(piece)
                .await
                .map_err(|e| format!("cache write error: {e}"))?;
            file.flush()
                .await
                .map_err(|e| format!("cache flush error: {e}"))?;
            debug!(bytes = piece.len(), "wrote to the cache");
        }
        written += take as u64;
    }
    file.flush().await.map_err(|e| format!("cache flush error: {e}"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use tempfile::tempdir;

    fn body_of(chunks: Vec<&'static [u8]>) -> OriginBody {
        stream::iter(
            chunks
                .into_iter()
                .map(|c| Ok(Bytes::from_static(c)))
                .collect::<Vec<reqwest::Result<Bytes>>>(),
        )
        .boxed()
    }

    #[test]
    fn test_process_dead() {
        assert!(!process_dead(std::process::id()));
        assert!(process_dead(0));
        // pid_max on Linux tops out well below this
        assert!(process_dead(i32::MAX as u32 - 1));
    }

    #[test]
    fn test_registry_guard() {
        let registry = FetchRegistry::new();
        {
            let _guard = registry.register("k".to_string());
            assert!(registry.contains("k"));
            assert!(!registry.is_idle());
        }
        assert!(!registry.contains("k"));
        assert!(registry.is_idle());
    }

    #[test]
    fn test_fetcher_alive_same_process_uses_registry() {
        let registry = FetchRegistry::new();
        let me = std::process::id();
        assert!(!fetcher_alive(me, "k", &registry));
        let _guard = registry.register("k".to_string());
        assert!(fetcher_alive(me, "k", &registry));
    }

    #[tokio::test]
    async fn test_copy_body_caps_at_content_length() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("body");
        let file = File::create(&path).await.unwrap();

        copy_body(file, body_of(vec![&b"hello "[..], &b"world, and more"[..]]), 11)
            .await
            .unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"hello world");
    }

    #[tokio::test]
    async fn test_copy_body_short_stream_is_error() {
        let dir = tempdir().unwrap();
        let file = File::create(dir.path().join("body")).await.unwrap();
        let err = copy_body(file, body_of(vec![&b"abc"[..]]), 10).await.unwrap_err();
        assert!(err.contains("closed connection early"));
    }
}
