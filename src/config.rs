use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{OffloadError, OffloadResult};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub base: BaseConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub io: IoConfig,

    #[serde(default)]
    pub dupes: DupeConfig,

    #[serde(default)]
    pub listen: ListenConfig,

    #[serde(default)]
    pub access_log: AccessLogConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// The base server whose bandwidth is being offloaded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BaseConfig {
    #[serde(default = "default_base_host")]
    pub host: String,

    #[serde(default = "default_base_port")]
    pub port: u16,
}

impl Default for BaseConfig {
    fn default() -> Self {
        Self {
            host: default_base_host(),
            port: default_base_port(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Directory holding `metadata-*`/`filedata-*` pairs, the lock file,
    /// and the download-slot table.
    #[serde(default = "default_cache_dir")]
    pub dir: PathBuf,

    /// Identifier naming the shared lock and slot-table files, so
    /// several processes configured alike coordinate on the same cache.
    #[serde(default = "default_shm_name")]
    pub shm_name: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: default_cache_dir(),
            shm_name: default_shm_name(),
        }
    }
}

impl CacheConfig {
    pub fn lock_path(&self) -> PathBuf {
        self.dir.join(format!(".{}.lock", self.shm_name))
    }

    pub fn dupe_table_path(&self) -> PathBuf {
        self.dir.join(format!(".{}.dupes", self.shm_name))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IoConfig {
    /// Seconds of inactivity after which network and cache-file waits
    /// give up.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for IoConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl IoConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DupeConfig {
    /// Maximum concurrent downloads of one URI by one client address.
    /// Zero disables the limiter entirely.
    #[serde(default)]
    pub max_downloads: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenConfig {
    /// Run the standalone listener. When false the process behaves as a
    /// one-shot CGI program driven by environment variables.
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_listen_addr")]
    pub addr: String,

    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Detach into the background before binding.
    #[serde(default)]
    pub daemonize: bool,

    /// Peer addresses whose `X-Forwarded-For` is believed.
    #[serde(default)]
    pub trusted_proxies: Vec<String>,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            addr: default_listen_addr(),
            port: default_listen_port(),
            daemonize: false,
            trusted_proxies: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessLogConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_access_log_file")]
    pub file: PathBuf,
}

impl Default for AccessLogConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            file: default_access_log_file(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json_format: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Cgi,
    Daemon,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> OffloadResult<Self> {
        let text = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            OffloadError::Config(format!(
                "Failed to read {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        let config: Config = toml::from_str(&text)
            .map_err(|e| OffloadError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> OffloadResult<()> {
        if self.base.host.is_empty() {
            return Err(OffloadError::Config("base.host must not be empty".into()));
        }
        if self.io.timeout_secs == 0 {
            return Err(OffloadError::Config(
                "io.timeout_secs must be at least 1".into(),
            ));
        }
        if self.cache.shm_name.is_empty()
            || !self
                .cache
                .shm_name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(OffloadError::Config(
                "cache.shm_name must be a non-empty alphanumeric/dash/underscore name".into(),
            ));
        }
        Ok(())
    }

    pub fn mode(&self) -> Mode {
        if self.listen.enabled {
            Mode::Daemon
        } else {
            Mode::Cgi
        }
    }

    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.listen.addr, self.listen.port)
    }
}

fn default_base_host() -> String {
    "localhost".to_string()
}

fn default_base_port() -> u16 {
    80
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("offload-cache")
}

fn default_shm_name() -> String {
    "mod-offload".to_string()
}

fn default_timeout_secs() -> u64 {
    90
}

fn default_listen_addr() -> String {
    "0.0.0.0".to_string()
}

fn default_listen_port() -> u16 {
    9090
}

fn default_access_log_file() -> PathBuf {
    PathBuf::from("offload-access.log")
}

fn default_log_level() -> String {
    "info".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.base.port, 80);
        assert_eq!(config.io.timeout(), Duration::from_secs(90));
        assert_eq!(config.dupes.max_downloads, 0);
        assert_eq!(config.mode(), Mode::Cgi);
        config.validate().expect("defaults validate");
    }

    #[test]
    fn test_parse_toml() {
        let text = r#"
            [base]
            host = "origin.example.com"
            port = 8080

            [cache]
            dir = "/tmp/offload"
            shm_name = "offload-test"

            [io]
            timeout_secs = 30

            [dupes]
            max_downloads = 1

            [listen]
            enabled = true
            addr = "127.0.0.1"
            port = 9090
            trusted_proxies = ["127.0.0.1"]
        "#;
        let config: Config = toml::from_str(text).unwrap();
        assert_eq!(config.base.host, "origin.example.com");
        assert_eq!(config.mode(), Mode::Daemon);
        assert_eq!(config.server_addr(), "127.0.0.1:9090");
        assert_eq!(
            config.cache.lock_path(),
            PathBuf::from("/tmp/offload/.offload-test.lock")
        );
        config.validate().unwrap();
    }

    #[test]
    fn test_rejects_bad_shm_name() {
        let mut config = Config::default();
        config.cache.shm_name = "has/slash".to_string();
        assert!(config.validate().is_err());
    }
}
