//! Client configuration
//!
//! Loaded from `$DOCMISSION_HOME/config.yaml` (default `~/.docmission/config.yaml`):
//! ```yaml
//! server_url: "http://agent.internal:8000"
//! connect_timeout_secs: 10
//! reconnect_initial_ms: 1000
//! reconnect_max_ms: 30000
//! output_file: "documentation.md"
//! ```
//! Every key is optional. `DOCMISSION_SERVER_URL` overrides `server_url`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::transport::{ReconnectPolicy, TransportOptions};

pub const DEFAULT_SERVER_URL: &str = "http://localhost:8000";
pub const DEFAULT_OUTPUT_FILE: &str = "documentation.md";

const HOME_ENV: &str = "DOCMISSION_HOME";
const SERVER_URL_ENV: &str = "DOCMISSION_SERVER_URL";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub server_url: String,
    pub connect_timeout_secs: u64,
    pub reconnect_initial_ms: u64,
    pub reconnect_max_ms: u64,
    pub output_file: PathBuf,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_SERVER_URL.to_string(),
            connect_timeout_secs: 10,
            reconnect_initial_ms: 1000,
            reconnect_max_ms: 30_000,
            output_file: PathBuf::from(DEFAULT_OUTPUT_FILE),
        }
    }
}

impl ClientConfig {
    /// Directory holding docmission state
    pub fn default_home() -> PathBuf {
        if let Ok(home) = std::env::var(HOME_ENV) {
            return PathBuf::from(home);
        }
        dirs::home_dir()
            .map(|h| h.join(".docmission"))
            .unwrap_or_else(|| PathBuf::from(".docmission"))
    }

    pub fn default_path() -> PathBuf {
        Self::default_home().join("config.yaml")
    }

    /// Read `path`; `Ok(None)` when the file does not exist
    pub fn try_load(path: &Path) -> anyhow::Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: {}", path.display()))?;
        let config: Self = serde_yaml::from_str(&content)
            .with_context(|| format!("Invalid config: {}", path.display()))?;
        Ok(Some(config))
    }

    /// Load from `path`, falling back to defaults on any problem
    pub fn load(path: &Path) -> Self {
        match Self::try_load(path) {
            Ok(Some(config)) => {
                debug!(path = %path.display(), "Loaded client config");
                config
            }
            Ok(None) => Self::default(),
            Err(e) => {
                warn!(error = %format!("{:#}", e), "Using default client config");
                Self::default()
            }
        }
    }

    /// Apply environment overrides
    pub fn apply_env(&mut self) {
        self.override_server_url(std::env::var(SERVER_URL_ENV).ok());
    }

    /// Replace `server_url` when `url` is a non-empty value
    pub fn override_server_url(&mut self, url: Option<String>) {
        if let Some(url) = url.filter(|u| !u.trim().is_empty()) {
            self.server_url = url;
        }
    }

    pub fn transport_options(&self) -> TransportOptions {
        let initial = Duration::from_millis(self.reconnect_initial_ms.max(1));
        let max = Duration::from_millis(self.reconnect_max_ms).max(initial);
        TransportOptions {
            connect_timeout: Duration::from_secs(self.connect_timeout_secs.max(1)),
            reconnect: ReconnectPolicy { initial, max },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempdir().unwrap();
        let config = ClientConfig::load(&dir.path().join("config.yaml"));
        assert_eq!(config, ClientConfig::default());
        assert_eq!(config.server_url, DEFAULT_SERVER_URL);
    }

    #[test]
    fn test_partial_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(
            &path,
            "server_url: \"http://agent:9000\"\nreconnect_max_ms: 5000\n",
        )
        .unwrap();

        let config = ClientConfig::load(&path);
        assert_eq!(config.server_url, "http://agent:9000");
        assert_eq!(config.connect_timeout_secs, 10);
        assert_eq!(
            config.transport_options().reconnect.max,
            Duration::from_secs(5)
        );
    }

    #[test]
    fn test_invalid_file_falls_back() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "server_url: [unterminated").unwrap();

        assert!(ClientConfig::try_load(&path).is_err());
        assert_eq!(ClientConfig::load(&path), ClientConfig::default());
    }

    #[test]
    fn test_override_server_url() {
        let mut config = ClientConfig::default();
        config.override_server_url(Some(String::new()));
        assert_eq!(config.server_url, DEFAULT_SERVER_URL);

        config.override_server_url(Some("wss://remote/ws".to_string()));
        assert_eq!(config.server_url, "wss://remote/ws");
    }

    #[test]
    fn test_transport_options() {
        let config = ClientConfig {
            reconnect_initial_ms: 2000,
            reconnect_max_ms: 500,
            ..ClientConfig::default()
        };
        let options = config.transport_options();
        assert_eq!(options.connect_timeout, Duration::from_secs(10));
        assert_eq!(options.reconnect.initial, Duration::from_secs(2));
        // max never drops below initial
        assert_eq!(options.reconnect.max, Duration::from_secs(2));
    }
}
