//! Runtime configuration.

use std::time::Duration;

use reqwest::Url;

use crate::error::ConfigError;
use crate::watcher::{DEFAULT_SHUTDOWN_GRACE, WatcherConfig};

#[derive(Debug, Clone)]
pub struct Config {
    /// Address the HTTP control surface listens on (`host:port`).
    pub listen_addr: String,
    pub opa_endpoint: String,
    pub opa_auth_token: Option<String>,
    pub watcher_enabled: bool,
    pub watcher: WatcherConfig,
    /// Document paths watched from startup.
    pub watch_targets: Vec<String>,
    /// Grace period for open HTTP connections on shutdown.
    pub server_grace: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: listen_addr("0.0.0.0", 33455),
            opa_endpoint: "http://127.0.0.1:8181".to_string(),
            opa_auth_token: None,
            watcher_enabled: false,
            watcher: WatcherConfig::default(),
            watch_targets: Vec::new(),
            server_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.watcher.interval.is_zero() {
            return Err(ConfigError::ZeroInterval);
        }
        if self.watcher.worker_count == 0 {
            return Err(ConfigError::ZeroWorkers);
        }
        if !self.watcher_enabled && !self.watch_targets.is_empty() {
            return Err(ConfigError::WatchWithoutWatcher(self.watch_targets.clone()));
        }

        let endpoint_error = |reason: String| ConfigError::Endpoint {
            endpoint: self.opa_endpoint.clone(),
            reason,
        };
        let url = Url::parse(&self.opa_endpoint).map_err(|e| endpoint_error(e.to_string()))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(endpoint_error(format!("unsupported scheme {}", url.scheme())));
        }

        Ok(())
    }
}

/// Join host and port, bracketing bare IPv6 hosts.
pub fn listen_addr(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}
