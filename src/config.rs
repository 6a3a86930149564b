//! Runtime configuration, read from the environment.

use crate::error::{SyncError, SyncResult};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_API_URL: &str = "https://crm.solutionprovider.com.bd/api";
pub const DEFAULT_SOCKET_URL: &str = "http://192.168.68.130";
pub const DEFAULT_SOCKET_PATH: &str = "/socket.io";

/// Configuration for the sync context.
#[derive(Debug, Clone)]
pub struct Config {
    /// REST base URL, without trailing slash.
    pub api_url: String,
    /// Socket server origin (`http(s)://` or `ws(s)://`).
    pub socket_url: String,
    /// Socket.IO endpoint path.
    pub socket_path: String,
    /// Fixed delay between reconnect attempts.
    pub reconnect_delay: Duration,
    /// Reconnect attempts before the socket gives up.
    pub reconnect_attempts: u32,
    /// How long an unused cache entry survives its last subscriber.
    pub cache_grace: Duration,
    /// Per-request timeout for REST calls.
    pub request_timeout: Duration,
    /// SQLite file holding the persisted session.
    pub db_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        let home_dir = std::env::var("HOME").unwrap_or_else(|_| ".".into());
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            socket_url: DEFAULT_SOCKET_URL.to_string(),
            socket_path: DEFAULT_SOCKET_PATH.to_string(),
            reconnect_delay: Duration::from_millis(1000),
            reconnect_attempts: 10,
            cache_grace: Duration::from_secs(60),
            request_timeout: Duration::from_secs(30),
            db_path: PathBuf::from(home_dir).join(".crm-sync").join("session.db"),
        }
    }
}

impl Config {
    /// Build a configuration from `CRM_*` environment variables, falling back
    /// to defaults for anything unset.
    pub fn from_env() -> SyncResult<Self> {
        let mut config = Self::default();

        if let Ok(url) = std::env::var("CRM_API_URL") {
            config.api_url = url.trim_end_matches('/').to_string();
        }
        if let Ok(url) = std::env::var("CRM_SOCKET_URL") {
            config.socket_url = url.trim_end_matches('/').to_string();
        }
        if let Ok(path) = std::env::var("CRM_SOCKET_PATH") {
            config.socket_path = path;
        }
        if let Some(ms) = parse_var::<u64>("CRM_RECONNECT_DELAY_MS")? {
            config.reconnect_delay = Duration::from_millis(ms);
        }
        if let Some(attempts) = parse_var::<u32>("CRM_RECONNECT_ATTEMPTS")? {
            config.reconnect_attempts = attempts;
        }
        if let Some(secs) = parse_var::<u64>("CRM_CACHE_GRACE_SECS")? {
            config.cache_grace = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var::<u64>("CRM_REQUEST_TIMEOUT_SECS")? {
            config.request_timeout = Duration::from_secs(secs);
        }
        if let Ok(path) = std::env::var("CRM_DB_PATH") {
            config.db_path = PathBuf::from(path);
        }

        Ok(config)
    }

    pub fn with_api_url(mut self, url: impl Into<String>) -> Self {
        self.api_url = url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_socket_url(mut self, url: impl Into<String>) -> Self {
        self.socket_url = url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_reconnect(mut self, delay: Duration, attempts: u32) -> Self {
        self.reconnect_delay = delay;
        self.reconnect_attempts = attempts;
        self
    }

    pub fn with_cache_grace(mut self, grace: Duration) -> Self {
        self.cache_grace = grace;
        self
    }

    pub fn with_db_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.db_path = path.into();
        self
    }

    /// WebSocket URL for the Engine.IO v4 websocket transport.
    pub fn socket_endpoint(&self) -> String {
        let origin = if let Some(rest) = self.socket_url.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = self.socket_url.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            self.socket_url.clone()
        };
        let path = self.socket_path.trim_end_matches('/');
        format!("{origin}{path}/?EIO=4&transport=websocket")
    }
}

fn parse_var<T: FromStr>(name: &str) -> SyncResult<Option<T>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| SyncError::Config(format!("{name}={raw:?} is not a valid number"))),
        Err(_) => Ok(None),
    }
}
