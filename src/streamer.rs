//! Streams a cache body file to the client, even while the fetcher is
//! still appending to it.
//!
//! The reader may safely consume `[0, len)` of the file at any moment:
//! the fetcher only appends, and flushes before the length grows. When
//! the file stops growing short of its `Content-Length` for longer than
//! the I/O timeout, the stream gives up; the fetcher is left alone to
//! finish or clean up on its own.

use async_stream::try_stream;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use std::time::Duration;
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::accesslog::Transaction;
use crate::range::ByteWindow;

/// Read/write granularity for both the fetcher and the streamer.
pub const COPY_CHUNK: usize = 32 * 1024;

/// Body stream over the (possibly growing) cache file. Bytes before the
/// window's start are read and discarded, never crossing the boundary
/// mid-read.
pub fn body_stream(
    mut file: File,
    window: ByteWindow,
    total: i64,
    timeout: Duration,
) -> impl Stream<Item = std::io::Result<Bytes>> {
    try_stream! {
        let start = window.start;
        let end_excl = window.end + 1;
        let mut br: i64 = 0;
        let mut last_progress = Instant::now();
        let mut buf = vec![0u8; COPY_CHUNK];

        while br < end_excl {
            let mut readsize = start - br;
            if readsize <= 0 || readsize > COPY_CHUNK as i64 {
                readsize = COPY_CHUNK as i64;
            }
            if readsize > end_excl - br {
                readsize = end_excl - br;
            }
            if readsize == 0 {
                debug!("readsize is unexpectedly zero");
                break;
            }

            let cursize = file.metadata().await?.len() as i64;
            if cursize < total && cursize - br <= 0 {
                if last_progress.elapsed() > timeout {
                    warn!("cache file seems to have stalled, giving up");
                    break;
                }
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }

            let len = file.read(&mut buf[..readsize as usize]).await?;
            if len == 0 {
                debug!("unexpected EOF on cache file");
                break;
            }

            if br >= start {
                yield Bytes::copy_from_slice(&buf[..len]);
            }
            br += len as i64;
            last_progress = Instant::now();
        }

        if br != end_excl {
            debug!(sent = br, wanted = end_excl, "transfer cut short");
        }
    }
}

/// `body_stream` with the transaction carried inside, so the access log
/// line is written when streaming ends - including when the client
/// disconnects and the response body is simply dropped.
pub fn logged_body_stream(
    file: File,
    window: ByteWindow,
    total: i64,
    timeout: Duration,
    mut txn: Transaction,
) -> impl Stream<Item = std::io::Result<Bytes>> {
    try_stream! {
        let inner = body_stream(file, window, total, timeout);
        futures::pin_mut!(inner);
        while let Some(chunk) = inner.next().await {
            let chunk = chunk?;
            txn.add_bytes(chunk.len() as u64);
            yield chunk;
        }
        txn.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::range::ByteWindow;
    use tempfile::tempdir;
    use tokio::io::AsyncWriteExt;

    async fn collect(stream: impl Stream<Item = std::io::Result<Bytes>>) -> Vec<u8> {
        let mut out = Vec::new();
        futures::pin_mut!(stream);
        while let Some(chunk) = stream.next().await {
            out.extend_from_slice(&chunk.unwrap());
        }
        out
    }

    #[tokio::test]
    async fn test_streams_complete_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("body");
        std::fs::write(&path, b"hello world").unwrap();

        let file = File::open(&path).await.unwrap();
        let body = collect(body_stream(
            file,
            ByteWindow::full(11),
            11,
            Duration::from_secs(5),
        ))
        .await;
        assert_eq!(body, b"hello world");
    }

    #[tokio::test]
    async fn test_streams_window_only() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("body");
        let content: Vec<u8> = (0..=255u8).collect();
        std::fs::write(&path, &content).unwrap();

        let window = ByteWindow { start: 100, end: 199, partial: true };
        let file = File::open(&path).await.unwrap();
        let body = collect(body_stream(file, window, 256, Duration::from_secs(5))).await;
        assert_eq!(body, &content[100..200]);
    }

    #[tokio::test]
    async fn test_follows_growing_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("body");
        std::fs::write(&path, b"").unwrap();

        let writer_path = path.clone();
        let writer = tokio::spawn(async move {
            let mut out = tokio::fs::OpenOptions::new()
                .append(true)
                .open(&writer_path)
                .await
                .unwrap();
            for piece in [&b"first"[..], &b"-second"[..]] {
                tokio::time::sleep(Duration::from_millis(1200)).await;
                out.write_all(piece).await.unwrap();
                out.flush().await.unwrap();
            }
        });

        let file = File::open(&path).await.unwrap();
        let body = collect(body_stream(
            file,
            ByteWindow::full(12),
            12,
            Duration::from_secs(10),
        ))
        .await;
        assert_eq!(body, b"first-second");
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_stalled_file_gives_up() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("body");
        std::fs::write(&path, b"only").unwrap();

        // claims 100 bytes but never grows past 4
        let file = File::open(&path).await.unwrap();
        let body = collect(body_stream(
            file,
            ByteWindow::full(100),
            100,
            Duration::from_secs(2),
        ))
        .await;
        assert_eq!(body, b"only");
    }

    #[tokio::test]
    async fn test_skip_phase_does_not_wait_for_window_start() {
        // window starts beyond the current size; the stream must wait
        // for growth rather than erroring
        let dir = tempdir().unwrap();
        let path = dir.path().join("body");
        std::fs::write(&path, b"0123").unwrap();

        let writer_path = path.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(1200)).await;
            let mut out = tokio::fs::OpenOptions::new()
                .append(true)
                .open(&writer_path)
                .await
                .unwrap();
            out.write_all(b"456789").await.unwrap();
            out.flush().await.unwrap();
        });

        let window = ByteWindow { start: 6, end: 9, partial: true };
        let file = File::open(&path).await.unwrap();
        let body = collect(body_stream(file, window, 10, Duration::from_secs(10))).await;
        assert_eq!(body, b"6789");
    }
}
