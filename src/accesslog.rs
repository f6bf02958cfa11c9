use chrono::Local;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::AccessLogConfig;
use crate::dupes::DupeSlot;
use crate::stats::Stats;

/// Apache Combined Log Format writer. Lines are appended one at a time
/// with the file reopened per write, so several processes can share one
/// log file.
pub struct AccessLog {
    path: Option<PathBuf>,
}

impl AccessLog {
    pub fn new(config: &AccessLogConfig) -> Arc<Self> {
        Arc::new(Self {
            path: config.enabled.then(|| config.file.clone()),
        })
    }

    pub fn disabled() -> Arc<Self> {
        Arc::new(Self { path: None })
    }

    fn write_line(&self, line: &str) {
        let Some(path) = &self.path else {
            return;
        };
        let appended = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .and_then(|mut f| writeln!(f, "{line}"));
        if let Err(e) = appended {
            warn!(path = %path.display(), error = %e, "failed to append access log");
        }
    }
}

pub fn combined_log_line(
    remote: &str,
    method: &str,
    uri: &str,
    version: &str,
    status: u16,
    bytes: u64,
    referer: Option<&str>,
    user_agent: Option<&str>,
) -> String {
    let timestamp = Local::now().format("%d/%b/%Y:%H:%M:%S %z");
    let request = if version.is_empty() {
        format!("{method} {uri}")
    } else {
        format!("{method} {uri} {version}")
    };
    format!(
        "{} - - [{}] \"{}\" {} {} \"{}\" \"{}\"",
        if remote.is_empty() { "-" } else { remote },
        timestamp,
        request,
        status,
        bytes,
        referer.unwrap_or("-"),
        user_agent.unwrap_or("-"),
    )
}

/// One client transaction, from parse to the last body byte. Carries
/// the download slot and writes the access log line exactly once, when
/// finished or dropped - a disconnect mid-stream drops the response
/// body and everything in it.
pub struct Transaction {
    log: Arc<AccessLog>,
    stats: Arc<Stats>,
    remote: String,
    method: String,
    uri: String,
    version: String,
    referer: Option<String>,
    user_agent: Option<String>,
    status: u16,
    bytes: u64,
    slot: Option<DupeSlot>,
    logged: bool,
}

impl Transaction {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        log: Arc<AccessLog>,
        stats: Arc<Stats>,
        remote: String,
        method: String,
        uri: String,
        version: String,
        referer: Option<String>,
        user_agent: Option<String>,
    ) -> Self {
        Self {
            log,
            stats,
            remote,
            method,
            uri,
            version,
            referer,
            user_agent,
            status: 0,
            bytes: 0,
            slot: None,
            logged: false,
        }
    }

    pub fn attach_slot(&mut self, slot: DupeSlot) {
        self.slot = Some(slot);
    }

    pub fn set_status(&mut self, status: u16) {
        if self.status == 0 {
            self.status = status;
        }
    }

    pub fn add_bytes(&mut self, n: u64) {
        self.bytes += n;
        self.stats.record_bytes_streamed(n);
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Write the log line and drop the download slot. Idempotent.
    pub fn finish(&mut self) {
        if self.logged {
            return;
        }
        self.logged = true;
        self.log.write_line(&combined_log_line(
            &self.remote,
            &self.method,
            &self.uri,
            &self.version,
            self.status,
            self.bytes,
            self.referer.as_deref(),
            self.user_agent.as_deref(),
        ));
        debug!(
            remote = %self.remote,
            uri = %self.uri,
            status = self.status,
            bytes = self.bytes,
            "transaction complete"
        );
        self.slot = None;
    }

    /// Finish, releasing the download slot inline rather than from a
    /// spawned task. Used by the CGI front end, which exits right after.
    pub async fn finish_releasing(&mut self) {
        let slot = self.slot.take();
        self.finish();
        if let Some(slot) = slot {
            slot.release().await;
        }
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        self.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_combined_log_line_shape() {
        let line = combined_log_line(
            "10.0.0.1",
            "GET",
            "/a.bin",
            "HTTP/1.1",
            200,
            1024,
            Some("http://base/"),
            Some("agent/1.0"),
        );
        assert!(line.starts_with("10.0.0.1 - - ["));
        assert!(line.contains("\"GET /a.bin HTTP/1.1\" 200 1024"));
        assert!(line.ends_with("\"http://base/\" \"agent/1.0\""));
    }

    #[test]
    fn test_missing_fields_dashed() {
        let line = combined_log_line("", "HEAD", "/x", "", 403, 0, None, None);
        assert!(line.starts_with("- - - ["));
        // no trailing space inside the request when the version is unknown
        assert!(line.contains("\"HEAD /x\" 403 0"));
        assert!(line.ends_with("\"-\" \"-\""));
    }

    #[test]
    fn test_transaction_logs_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("access.log");
        let log = AccessLog::new(&AccessLogConfig {
            enabled: true,
            file: path.clone(),
        });

        let mut txn = Transaction::new(
            log,
            Arc::new(Stats::new()),
            "10.0.0.1".into(),
            "GET".into(),
            "/a.bin".into(),
            "HTTP/1.1".into(),
            None,
            None,
        );
        txn.set_status(200);
        txn.set_status(404); // first status wins
        txn.add_bytes(100);
        txn.add_bytes(24);
        txn.finish();
        drop(txn);

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().count(), 1);
        assert!(text.contains("\"GET /a.bin HTTP/1.1\" 200 124"));
    }
}
