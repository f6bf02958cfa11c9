//! Cache coherence: decide, from a fresh origin `HEAD` and the
//! persisted metadata, whether the cached body may be served.

use tracing::debug;

use crate::headers::HeaderTable;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// Serve the cached body (possibly still growing under a live
    /// fetcher).
    Fresh,
    /// Refetch from the base server.
    Stale,
    /// Truncated body with no fetcher left alive: unlink both files,
    /// then refetch.
    Corrupt,
}

/// `head` carries the freshly observed validators (weak ETags already
/// chopped); `body_len` is the current size of the cache body file;
/// `fetcher_alive` reports whether the pid persisted in
/// `X-Offload-Caching-PID` still refers to a live fetcher.
pub fn evaluate(
    metadata: Option<&HeaderTable>,
    head: &HeaderTable,
    body_len: Option<u64>,
    fetcher_alive: bool,
) -> Freshness {
    let Some(metadata) = metadata else {
        return Freshness::Stale;
    };

    let (Some(content_length), Some(etag), Some(last_modified)) = (
        metadata.get("Content-Length"),
        metadata.get("ETag"),
        metadata.get("Last-Modified"),
    ) else {
        debug!("metadata is missing a required validator");
        return Freshness::Stale;
    };

    if head.get("Content-Length") != Some(content_length) {
        return Freshness::Stale;
    }
    if head.get("ETag") != Some(etag) {
        return Freshness::Stale;
    }
    if head.get("Last-Modified") != Some(last_modified)
        && metadata.get("X-Offload-Is-Weak") != Some("1")
    {
        return Freshness::Stale;
    }

    let Some(body_len) = body_len else {
        return Freshness::Stale;
    };
    let Ok(expected) = content_length.parse::<u64>() else {
        return Freshness::Stale;
    };

    if body_len != expected && !fetcher_alive {
        debug!(
            body_len = body_len,
            expected = expected,
            "truncated body and its fetcher died"
        );
        return Freshness::Corrupt;
    }

    Freshness::Fresh
}
