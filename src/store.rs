use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tracing::debug;

use crate::headers::HeaderTable;

/// Characters trimmed from both ends of an ETag when deriving the cache
/// key: whitespace and quoting.
const TRIM_CHARS: [char; 5] = [' ', '\t', '\x0B', '"', '\''];

/// Filesystem key for a cache entry, derived from the origin ETag.
pub fn cache_key_from_etag(etag: &str) -> String {
    etag.trim_matches(|c| TRIM_CHARS.contains(&c)).to_string()
}

/// A "weak" validator: longer than the `W/` marker itself and prefixed
/// with it (any case).
pub fn is_weak_etag(etag: &str) -> bool {
    etag.len() > 2 && etag.as_bytes()[..2].eq_ignore_ascii_case(b"W/")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryPaths {
    pub metadata: PathBuf,
    pub body: PathBuf,
}

#[derive(Debug, Clone)]
pub struct CacheStore {
    dir: PathBuf,
}

impl CacheStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn entry_paths(&self, key: &str) -> EntryPaths {
        EntryPaths {
            metadata: self.dir.join(format!("metadata-{key}")),
            body: self.dir.join(format!("filedata-{key}")),
        }
    }

    /// Load a metadata table, or `None` when the entry has none.
    pub async fn load_metadata(&self, paths: &EntryPaths) -> Option<HeaderTable> {
        let text = match tokio::fs::read_to_string(&paths.metadata).await {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => return None,
            Err(e) => {
                debug!(path = %paths.metadata.display(), error = %e, "metadata unreadable");
                return None;
            }
        };
        Some(parse_metadata(&text))
    }

    pub async fn write_metadata(
        &self,
        paths: &EntryPaths,
        table: &HeaderTable,
    ) -> std::io::Result<()> {
        let mut out = String::new();
        for (key, value) in table.iter() {
            out.push_str(key);
            out.push('\n');
            out.push_str(value);
            out.push('\n');
        }
        tokio::fs::write(&paths.metadata, out).await
    }

    /// Create (or truncate) the body file, returning the write handle
    /// the fetcher will append through.
    pub async fn create_body(&self, paths: &EntryPaths) -> std::io::Result<File> {
        File::create(&paths.body).await
    }

    pub async fn open_body(&self, paths: &EntryPaths) -> std::io::Result<File> {
        File::open(&paths.body).await
    }

    pub async fn body_len(&self, paths: &EntryPaths) -> Option<u64> {
        tokio::fs::metadata(&paths.body).await.ok().map(|m| m.len())
    }

    /// Remove both halves of an entry. Callers hold the cache mutex.
    pub async fn nuke(&self, paths: &EntryPaths) {
        debug!(key = %paths.body.display(), "nuking entry from cache");
        let _ = tokio::fs::remove_file(&paths.metadata).await;
        let _ = tokio::fs::remove_file(&paths.body).await;
    }
}

/// Alternating key/value lines; an empty key line ends the table.
fn parse_metadata(text: &str) -> HeaderTable {
    let mut table = HeaderTable::new();
    let mut lines = text.split('\n');
    while let (Some(key), Some(value)) = (lines.next(), lines.next()) {
        if key.is_empty() {
            break;
        }
        table.set(key, value);
    }
    table
}
