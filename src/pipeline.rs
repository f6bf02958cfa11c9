//! The request pipeline shared by the daemon and CGI front ends.
//!
//! Gating order: URI sanity, the canned `robots.txt`, method and query
//! checks, dupe-tracker admission, origin `HEAD`, then (for `GET`) the
//! coherence check and cache work under the cross-process mutex.

use axum::http::StatusCode;
use std::sync::Arc;
use tokio::fs::File;
use tracing::{debug, warn};

use crate::SERVER_STRING;
use crate::accesslog::{AccessLog, Transaction};
use crate::coherence::{self, Freshness};
use crate::config::Config;
use crate::dupes::{Admission, DUPE_FORBID_TEXT, DupeTracker};
use crate::error::{OffloadError, OffloadResult};
use crate::fetcher::{self, FetchRegistry};
use crate::headers::{HeaderTable, http_date};
use crate::lock::CacheMutex;
use crate::origin::OriginClient;
use crate::range::{self, ByteWindow};
use crate::stats::Stats;
use crate::store::{self, CacheStore, EntryPaths};

/// Feed a fake robots.txt to keep webcrawlers out of the offload server.
pub const ROBOTS_TXT_BODY: &str = "User-agent: *\nDisallow: /";

pub struct App {
    pub config: Arc<Config>,
    pub store: CacheStore,
    pub origin: OriginClient,
    pub mutex: Arc<CacheMutex>,
    pub dupes: Arc<DupeTracker>,
    pub fetches: Arc<FetchRegistry>,
    pub access_log: Arc<AccessLog>,
    pub stats: Arc<Stats>,
}

impl App {
    pub fn new(config: Config) -> anyhow::Result<Arc<Self>> {
        config.validate()?;
        std::fs::create_dir_all(&config.cache.dir)?;

        let mutex = CacheMutex::open(&config.cache.lock_path())?;
        let origin = OriginClient::new(&config.base, &config.io)?;
        let dupes = DupeTracker::new(config.cache.dupe_table_path(), config.dupes.max_downloads);
        let store = CacheStore::new(&config.cache.dir);
        let access_log = AccessLog::new(&config.access_log);

        Ok(Arc::new(Self {
            store,
            origin,
            mutex,
            dupes,
            fetches: FetchRegistry::new(),
            access_log,
            stats: Arc::new(Stats::new()),
            config: Arc::new(config),
        }))
    }

    pub fn transaction(&self, ctx: &RequestContext) -> Transaction {
        Transaction::new(
            Arc::clone(&self.access_log),
            Arc::clone(&self.stats),
            ctx.remote.clone(),
            ctx.method.clone(),
            ctx.uri.clone(),
            ctx.version.clone(),
            ctx.referer.clone(),
            ctx.user_agent.clone(),
        )
    }
}

/// Everything we keep about one in-flight request.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub method: String,
    pub uri: String,
    pub remote: String,
    pub version: String,
    pub user_agent: Option<String>,
    pub referer: Option<String>,
    pub range: Option<String>,
    pub if_range: Option<String>,
}

pub enum Outcome {
    Canned(CannedResponse),
    Entry(EntryResponse),
}

/// A short, self-contained text response: robots.txt, errors, and
/// mirrored origin statuses.
pub struct CannedResponse {
    pub status: StatusCode,
    pub status_text: String,
    pub body: String,
    pub location: Option<String>,
}

impl CannedResponse {
    pub fn ok(body: &str) -> Self {
        Self {
            status: StatusCode::OK,
            status_text: "200 OK".to_string(),
            body: body.to_string(),
            location: None,
        }
    }

    pub fn from_error(err: &OffloadError) -> Self {
        Self {
            status: err.status_code(),
            status_text: err.status_text(),
            body: err.message(),
            location: err.location().map(str::to_string),
        }
    }

    pub fn header_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = vec![
            ("Status", self.status_text.clone()),
            ("Server", SERVER_STRING.to_string()),
            ("Date", http_date()),
        ];
        if let Some(location) = &self.location {
            pairs.push(("Location", location.clone()));
        }
        pairs.push(("Connection", "close".to_string()));
        pairs.push(("Content-Type", "text/plain; charset=utf-8".to_string()));
        pairs
    }

    pub fn body_text(&self) -> String {
        format!("{}\n\n", self.body)
    }
}

/// A cache-entry response: headers from the entry's metadata, body (for
/// `GET`) streamed from the cache file.
pub struct EntryResponse {
    pub status: StatusCode,
    pub status_text: String,
    pub etag: String,
    pub last_modified: String,
    pub content_type: String,
    pub window: ByteWindow,
    pub total: i64,
    pub body: Option<File>,
}

impl EntryResponse {
    pub fn header_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = vec![
            ("Status", self.status_text.clone()),
            ("Date", http_date()),
            ("Server", SERVER_STRING.to_string()),
            ("Connection", "close".to_string()),
            ("ETag", self.etag.clone()),
            ("Last-Modified", self.last_modified.clone()),
            ("Content-Length", self.window.length().to_string()),
            ("Accept-Ranges", "bytes".to_string()),
            ("Content-Type", self.content_type.clone()),
        ];
        if self.window.partial {
            pairs.push(("Content-Range", self.window.content_range(self.total)));
        }
        pairs
    }
}

pub async fn run(
    app: &Arc<App>,
    ctx: &RequestContext,
    txn: &mut Transaction,
) -> OffloadResult<Outcome> {
    if !ctx.uri.starts_with('/') {
        return Err(OffloadError::Internal("Bad request URI".to_string()));
    }

    if ctx.uri == "/robots.txt" {
        return Ok(Outcome::Canned(CannedResponse::ok(ROBOTS_TXT_BODY)));
    }

    let is_get = ctx.method.eq_ignore_ascii_case("GET");
    let is_head = ctx.method.eq_ignore_ascii_case("HEAD");
    if ctx.uri.contains('?') || (!is_get && !is_head) {
        return Err(OffloadError::Forbidden(
            "Offload server doesn't do dynamic content.".to_string(),
        ));
    }

    let mut lock = app.mutex.handle();

    if is_get {
        match app.dupes.admit(&mut lock, &ctx.remote, &ctx.uri).await? {
            Admission::Granted(slot) => txn.attach_slot(slot),
            Admission::Unrecorded => {}
            Admission::Rejected => {
                app.stats.record_dupe_rejected();
                return Err(OffloadError::Forbidden(DUPE_FORBID_TEXT.to_string()));
            }
        }
    }

    let head = app.origin.head(&ctx.uri).await?;
    debug!(fields = head.len(), "origin HEAD complete");
    validate_origin(&head)?;
    let head = annotate(head, ctx, app.origin.base_host());

    if is_head {
        debug!("HEAD request, answering from the origin record alone");
        return entry_from(&head, ctx, None);
    }

    lock.acquire().await?;

    let etag = head.get("ETag").unwrap_or_default().to_string();
    let key = store::cache_key_from_etag(&etag);
    let paths = app.store.entry_paths(&key);
    debug!(
        metadata = %paths.metadata.display(),
        body = %paths.body.display(),
        "cache entry paths"
    );

    let metadata = app.store.load_metadata(&paths).await;
    let body_len = app.store.body_len(&paths).await;
    let alive = metadata
        .as_ref()
        .and_then(|m| m.get("X-Offload-Caching-PID"))
        .and_then(|pid| pid.parse::<u32>().ok())
        .map(|pid| fetcher::fetcher_alive(pid, &key, &app.fetches))
        .unwrap_or(false);

    let verdict = coherence::evaluate(metadata.as_ref(), &head, body_len, alive);
    let (metadata, paths) = match verdict {
        Freshness::Fresh => {
            debug!("file is cached");
            app.stats.record_hit();
            (metadata.unwrap_or_default(), paths)
        }
        Freshness::Stale | Freshness::Corrupt => {
            if verdict == Freshness::Corrupt {
                app.store.nuke(&paths).await;
            }
            app.stats.record_miss();
            refetch(app, ctx).await?
        }
    };

    lock.release();

    let file = app
        .store
        .open_body(&paths)
        .await
        .map_err(|_| OffloadError::Internal("Couldn't access cached data.".to_string()))?;

    entry_from(&metadata, ctx, Some(file))
}

/// Pull a new copy from the base server: persist metadata from the GET
/// response's own headers (the resource may have changed since the
/// HEAD), then hand the body stream to a detached fetcher. Runs with
/// the cache mutex held.
async fn refetch(
    app: &Arc<App>,
    ctx: &RequestContext,
) -> OffloadResult<(HeaderTable, EntryPaths)> {
    let (headers, body) = app.origin.get(&ctx.uri).await?;
    validate_origin(&headers)?;
    let mut headers = annotate(headers, ctx, app.origin.base_host());

    let etag = headers.get("ETag").unwrap_or_default().to_string();
    let key = store::cache_key_from_etag(&etag);
    let paths = app.store.entry_paths(&key);

    if !headers.contains("Content-Type") {
        headers.set("Content-Type", "application/octet-stream");
    }

    let content_length = headers
        .get("Content-Length")
        .and_then(|s| s.parse::<u64>().ok())
        .ok_or_else(|| {
            OffloadError::Forbidden("Offload server doesn't do dynamic content.".to_string())
        })?;

    let cache_file = app
        .store
        .create_body(&paths)
        .await
        .map_err(|_| OffloadError::Internal("Couldn't update cached data.".to_string()))?;

    headers.set("X-Offload-Caching-PID", &std::process::id().to_string());

    let guard = app.fetches.register(key.clone());
    if let Err(e) = app.store.write_metadata(&paths, &headers).await {
        warn!(error = %e, "couldn't write metadata");
        app.store.nuke(&paths).await;
        return Err(OffloadError::Internal(
            "Couldn't update metadata.".to_string(),
        ));
    }

    fetcher::spawn(
        guard,
        Arc::clone(&app.mutex),
        app.store.clone(),
        paths.clone(),
        cache_file,
        body,
        content_length,
        Arc::clone(&app.stats),
    );

    Ok((headers, paths))
}

/// Gate an origin response: no protected content, only 200s pass (other
/// statuses are mirrored), and the validators we key the cache on must
/// all be present.
fn validate_origin(head: &HeaderTable) -> OffloadResult<()> {
    let code = head.response_code().unwrap_or(0);

    if code == 401 || head.contains("WWW-Authenticate") {
        return Err(OffloadError::Forbidden(
            "Offload server doesn't do protected content.".to_string(),
        ));
    }
    if code != 200 {
        return Err(OffloadError::OriginStatus {
            status: code,
            status_line: head
                .status_line()
                .unwrap_or("HTTP/1.1 502 Bad Gateway")
                .to_string(),
            location: head.get("Location").map(str::to_string),
        });
    }
    if !head.contains("ETag") || !head.contains("Content-Length") || !head.contains("Last-Modified")
    {
        return Err(OffloadError::Forbidden(
            "Offload server doesn't do dynamic content.".to_string(),
        ));
    }
    Ok(())
}

/// Record the original validator and request, chopping weak ETags down
/// to their comparable form.
fn annotate(mut head: HeaderTable, ctx: &RequestContext, base_host: &str) -> HeaderTable {
    let etag = head.get("ETag").unwrap_or_default().to_string();
    head.set("X-Offload-Orig-ETag", &etag);
    if store::is_weak_etag(&etag) {
        debug!(etag = %etag, "weak ETag, chopping");
        head.set("X-Offload-Is-Weak", "1");
        head.set("ETag", &etag[2..]);
    } else {
        head.set("X-Offload-Is-Weak", "0");
    }
    head.set("X-Offload-Orig-URL", &ctx.uri);
    head.set("X-Offload-Hostname", base_host);
    head
}

fn entry_from(
    metadata: &HeaderTable,
    ctx: &RequestContext,
    body: Option<File>,
) -> OffloadResult<Outcome> {
    let total = metadata
        .get("Content-Length")
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| {
            OffloadError::Internal("Cached entry has no usable Content-Length.".to_string())
        })?;

    let window = range::resolve(ctx.range.as_deref(), ctx.if_range.as_deref(), total)?;
    debug!(
        start = window.start,
        end = window.end,
        total = total,
        "feeding the client this window"
    );

    let (status, status_text) = if window.partial {
        (StatusCode::PARTIAL_CONTENT, "206 Partial Content")
    } else {
        (StatusCode::OK, "200 OK")
    };

    Ok(Outcome::Entry(EntryResponse {
        status,
        status_text: status_text.to_string(),
        etag: metadata.get("ETag").unwrap_or_default().to_string(),
        last_modified: metadata.get("Last-Modified").unwrap_or_default().to_string(),
        content_type: metadata
            .get("Content-Type")
            .unwrap_or("application/octet-stream")
            .to_string(),
        window,
        total,
        body,
    }))
}
