//! Configuration loading and persistence.
//!
//! Resolution order: defaults, then `config.json` in the config directory,
//! then `HASS_*` environment variables. The binary applies CLI flags last.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::time::Duration;
use std::{fs, path::PathBuf};

use crate::constants::{DEFAULT_PORT, READY_POLL_INTERVAL, RECONNECT_INTERVAL, COMMAND_TIMEOUT};

const CONFIG_FILE: &str = "config.json";

/// Connection settings for the hub.
#[derive(Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// Hub host name or address.
    pub host: String,
    /// Hub port.
    pub port: u16,
    /// Use `wss://` and `https://`.
    pub ssl: bool,
    /// Long-lived access token.
    pub token: String,
    /// Seconds between a disconnect and the next connect attempt.
    pub reconnect_interval_secs: u64,
    /// Seconds between readiness polls while the hub starts.
    pub ready_poll_interval_secs: u64,
    /// Seconds to wait for a command reply.
    pub command_timeout_secs: u64,
    /// Load all entity states right after authenticating.
    pub fetch_states_on_connect: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "homeassistant.local".to_string(),
            port: DEFAULT_PORT,
            ssl: false,
            token: String::new(),
            reconnect_interval_secs: RECONNECT_INTERVAL.as_secs(),
            ready_poll_interval_secs: READY_POLL_INTERVAL.as_secs(),
            command_timeout_secs: COMMAND_TIMEOUT.as_secs(),
            fetch_states_on_connect: true,
        }
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("ssl", &self.ssl)
            .field("token", &if self.token.is_empty() { "<unset>" } else { "<redacted>" })
            .field("reconnect_interval_secs", &self.reconnect_interval_secs)
            .field("ready_poll_interval_secs", &self.ready_poll_interval_secs)
            .field("command_timeout_secs", &self.command_timeout_secs)
            .field("fetch_states_on_connect", &self.fetch_states_on_connect)
            .finish()
    }
}

impl Config {
    /// Returns the configuration directory path, creating it if necessary.
    ///
    /// `HASS_CONFIG_DIR` overrides the platform config directory
    /// (e.g. `~/.config/hass-link` on Linux).
    pub fn config_dir() -> Result<PathBuf> {
        let dir = if let Ok(dir) = std::env::var("HASS_CONFIG_DIR") {
            PathBuf::from(dir)
        } else {
            dirs::config_dir()
                .context("Could not determine config directory")?
                .join("hass-link")
        };
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create config directory {}", dir.display()))?;
        Ok(dir)
    }

    /// Loads configuration from file, with environment variable overrides.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from_dir(&Self::config_dir()?)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Reads `config.json` from `dir`, falling back to defaults if absent.
    pub fn load_from_dir(dir: &Path) -> Result<Self> {
        let path = dir.join(CONFIG_FILE);
        if !path.exists() {
            log::debug!("No config file at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_str(&content).with_context(|| format!("Invalid config in {}", path.display()))
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Applies `HASS_*` overrides looked up through `lookup`.
    /// Unparseable numeric or boolean values are ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(host) = lookup("HASS_HOST") {
            self.host = host;
        }

        if let Some(port) = lookup("HASS_PORT").and_then(|p| p.parse().ok()) {
            self.port = port;
        }

        if let Some(ssl) = lookup("HASS_SSL").and_then(|s| parse_bool(&s)) {
            self.ssl = ssl;
        }

        if let Some(token) = lookup("HASS_TOKEN") {
            self.token = token;
        }

        if let Some(interval) = lookup("HASS_RECONNECT_INTERVAL").and_then(|i| i.parse().ok()) {
            self.reconnect_interval_secs = interval;
        }
    }

    /// Persists the configuration to the config directory.
    pub fn save(&self) -> Result<PathBuf> {
        self.save_to_dir(&Self::config_dir()?)
    }

    /// Writes `config.json` into `dir`, readable by the owner only.
    pub fn save_to_dir(&self, dir: &Path) -> Result<PathBuf> {
        let path = dir.join(CONFIG_FILE);
        fs::write(&path, serde_json::to_string_pretty(self)?)
            .with_context(|| format!("Failed to write {}", path.display()))?;

        #[cfg(unix)]
        fs::set_permissions(&path, fs::Permissions::from_mode(0o600))?;

        Ok(path)
    }

    /// Check if an access token is configured.
    #[must_use]
    pub fn has_token(&self) -> bool {
        !self.token.is_empty()
    }

    /// `ws[s]://host:port/api/websocket`
    #[must_use]
    pub fn websocket_url(&self) -> String {
        crate::ws::websocket_url(&self.host, self.port, self.ssl)
    }

    /// `http[s]://host:port`
    #[must_use]
    pub fn http_url(&self) -> String {
        let scheme = if self.ssl { "https" } else { "http" };
        format!("{}://{}:{}", scheme, self.host, self.port)
    }

    /// Backoff between connect attempts.
    #[must_use]
    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_secs(self.reconnect_interval_secs)
    }

    /// Spacing between readiness polls.
    #[must_use]
    pub fn ready_poll_interval(&self) -> Duration {
        Duration::from_secs(self.ready_poll_interval_secs)
    }

    /// Per-command reply timeout.
    #[must_use]
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.host, "homeassistant.local");
        assert_eq!(config.port, 8123);
        assert!(!config.ssl);
        assert_eq!(config.reconnect_interval(), Duration::from_secs(30));
        assert_eq!(config.ready_poll_interval(), Duration::from_secs(2));
        assert!(config.fetch_states_on_connect);
        assert!(!config.has_token());
    }

    #[test]
    fn test_urls() {
        let mut config = Config::default();
        assert_eq!(config.websocket_url(), "ws://homeassistant.local:8123/api/websocket");
        assert_eq!(config.http_url(), "http://homeassistant.local:8123");

        config.ssl = true;
        config.host = "hub.example.com".into();
        config.port = 443;
        assert_eq!(config.websocket_url(), "wss://hub.example.com:443/api/websocket");
        assert_eq!(config.http_url(), "https://hub.example.com:443");
    }

    #[test]
    fn test_debug_redacts_token() {
        let config = Config {
            token: "super-secret".into(),
            ..Config::default()
        };
        let debug = format!("{config:?}");
        assert!(!debug.contains("super-secret"));
        assert!(debug.contains("<redacted>"));
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(Config::load_from_dir(dir.path()).unwrap(), Config::default());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("config.json"), r#"{"host": "10.0.0.5", "ssl": true}"#).unwrap();

        let config = Config::load_from_dir(dir.path()).unwrap();
        assert_eq!(config.host, "10.0.0.5");
        assert!(config.ssl);
        assert_eq!(config.port, 8123);
    }

    #[test]
    fn test_invalid_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("config.json"), "{not json").unwrap();
        assert!(Config::load_from_dir(dir.path()).is_err());
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            host: "hub.lan".into(),
            token: "abc".into(),
            command_timeout_secs: 9,
            ..Config::default()
        };
        let path = config.save_to_dir(dir.path()).unwrap();

        #[cfg(unix)]
        assert_eq!(fs::metadata(&path).unwrap().permissions().mode() & 0o777, 0o600);

        assert_eq!(Config::load_from_dir(dir.path()).unwrap(), config);
    }

    #[test]
    fn test_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("HASS_HOST", "override.local"),
            ("HASS_PORT", "9000"),
            ("HASS_SSL", "yes"),
            ("HASS_TOKEN", "from-env"),
            ("HASS_RECONNECT_INTERVAL", "not-a-number"),
        ]);
        let mut config = Config::default();
        config.apply_overrides(|key| env.get(key).map(|v| (*v).to_string()));

        assert_eq!(config.host, "override.local");
        assert_eq!(config.port, 9000);
        assert!(config.ssl);
        assert_eq!(config.token, "from-env");
        assert_eq!(config.reconnect_interval_secs, 30);
    }
}
