use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::daemon::{FailurePolicy, DEFAULT_POLL_TIMEOUT};

const DEFAULT_HTTP_HOST: &str = "127.0.0.1";
const DEFAULT_HTTP_PORT: u16 = 14740;
const DEFAULT_REPORT_EVERY: u64 = 10;

/// Effective configuration of the edge host.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct EdgedConfig {
    pub daemon: DaemonSection,
    pub http: HttpSection,
    pub heartbeat: HeartbeatSection,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct DaemonSection {
    /// Command poll interval, e.g. "1000ms", "2s"
    pub poll_timeout: Option<String>,
    /// "crash" (default) or "report"
    pub failure_policy: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpSection {
    pub host: String,
    pub port: u16,
}

impl Default for HttpSection {
    fn default() -> Self {
        Self {
            host: DEFAULT_HTTP_HOST.to_string(),
            port: DEFAULT_HTTP_PORT,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatSection {
    /// One heartbeat daemon is attached under the root per name
    pub workers: Vec<String>,
    /// Log a heartbeat every N cycles
    pub report_every: u64,
}

impl Default for HeartbeatSection {
    fn default() -> Self {
        Self {
            workers: vec!["heartbeat".to_string()],
            report_every: DEFAULT_REPORT_EVERY,
        }
    }
}

impl EdgedConfig {
    /// $EDGED_CONFIG_DIR/config.toml or ~/.config/edged/config.toml
    pub fn config_path() -> PathBuf {
        crate::clienv::config_dir().join("config.toml")
    }

    /// Load from the default path, then apply environment overrides.
    pub fn load() -> Result<Self> {
        Ok(Self::load_from(&Self::config_path())?.with_env_overrides())
    }

    /// Load from `path`; a missing file yields defaults.
    pub fn load_from(path: &Path) -> Result<Self> {
        tracing::trace!(path = %path.display(), "Loading config");

        if !path.exists() {
            tracing::trace!("Config file does not exist, using defaults");
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;

        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))?;

        tracing::trace!(
            poll_timeout = ?config.daemon.poll_timeout,
            failure_policy = ?config.daemon.failure_policy,
            port = config.http.port,
            "Config loaded"
        );
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        tracing::trace!(path = %path.display(), "Saving config");

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config to TOML")?;

        fs::write(path, content)
            .with_context(|| format!("Failed to write config to {}", path.display()))?;

        Ok(())
    }

    /// Environment variables take priority over the file.
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(timeout) = crate::clienv::poll_timeout() {
            self.daemon.poll_timeout = Some(timeout);
        }
        if let Some(policy) = crate::clienv::failure_policy() {
            self.daemon.failure_policy = Some(policy);
        }
        if let Some(host) = crate::clienv::http_host() {
            self.http.host = host;
        }
        if let Some(port) = crate::clienv::http_port() {
            self.http.port = port;
        }
        self
    }

    pub fn poll_timeout(&self) -> Duration {
        parse_poll_timeout(self.daemon.poll_timeout.as_deref())
    }

    /// Configured failure policy; unknown values fall back to crash with a warning.
    pub fn failure_policy(&self) -> FailurePolicy {
        match self.daemon.failure_policy.as_deref() {
            None => FailurePolicy::default(),
            Some(raw) => raw.parse().unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Using default failure policy");
                FailurePolicy::default()
            }),
        }
    }
}

/// Parse a poll timeout like "1000ms", "2s" or "1m" (bare numbers are
/// milliseconds). Absent, zero or malformed values fall back to 1000 ms.
pub fn parse_poll_timeout(value: Option<&str>) -> Duration {
    let Some(raw) = value else {
        tracing::warn!(
            default_ms = DEFAULT_POLL_TIMEOUT.as_millis() as u64,
            "Poll timeout not configured, using default"
        );
        return DEFAULT_POLL_TIMEOUT;
    };

    match parse_duration(raw) {
        Some(timeout) if !timeout.is_zero() => timeout,
        _ => {
            tracing::warn!(
                value = %raw,
                default_ms = DEFAULT_POLL_TIMEOUT.as_millis() as u64,
                "Invalid poll timeout, using default"
            );
            DEFAULT_POLL_TIMEOUT
        }
    }
}

fn parse_duration(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    let split = raw
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(raw.len());
    let (digits, unit) = raw.split_at(split);
    let amount: u64 = digits.parse().ok()?;

    match unit.trim() {
        "" | "ms" => Some(Duration::from_millis(amount)),
        "s" => Some(Duration::from_secs(amount)),
        "m" => amount.checked_mul(60).map(Duration::from_secs),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_poll_timeout_units() {
        assert_eq!(parse_poll_timeout(Some("250ms")), Duration::from_millis(250));
        assert_eq!(parse_poll_timeout(Some("2s")), Duration::from_secs(2));
        assert_eq!(parse_poll_timeout(Some("1m")), Duration::from_secs(60));
        assert_eq!(parse_poll_timeout(Some(" 40 ")), Duration::from_millis(40));
    }

    #[test]
    fn bad_poll_timeout_falls_back() {
        assert_eq!(parse_poll_timeout(None), DEFAULT_POLL_TIMEOUT);
        assert_eq!(parse_poll_timeout(Some("soon")), DEFAULT_POLL_TIMEOUT);
        assert_eq!(parse_poll_timeout(Some("10h")), DEFAULT_POLL_TIMEOUT);
        assert_eq!(parse_poll_timeout(Some("0ms")), DEFAULT_POLL_TIMEOUT);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = EdgedConfig::load_from(&dir.path().join("config.toml")).unwrap();
        assert_eq!(config.http.port, DEFAULT_HTTP_PORT);
        assert_eq!(config.heartbeat.workers, vec!["heartbeat".to_string()]);
        assert_eq!(config.poll_timeout(), DEFAULT_POLL_TIMEOUT);
        assert_eq!(config.failure_policy(), FailurePolicy::Crash);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            "[daemon]\npoll_timeout = \"200ms\"\nfailure_policy = \"report\"\n\n[heartbeat]\nworkers = [\"line-1\", \"line-2\"]\n",
        )
        .unwrap();

        let config = EdgedConfig::load_from(&path).unwrap();
        assert_eq!(config.poll_timeout(), Duration::from_millis(200));
        assert_eq!(config.failure_policy(), FailurePolicy::Report);
        assert_eq!(config.heartbeat.workers.len(), 2);
        assert_eq!(config.heartbeat.report_every, DEFAULT_REPORT_EVERY);
        assert_eq!(config.http.host, DEFAULT_HTTP_HOST);
    }

    #[test]
    fn save_then_load_preserves_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let mut config = EdgedConfig::default();
        config.http.port = 18080;
        config.daemon.poll_timeout = Some("5s".into());
        config.save_to(&path).unwrap();

        let loaded = EdgedConfig::load_from(&path).unwrap();
        assert_eq!(loaded.http.port, 18080);
        assert_eq!(loaded.poll_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn unknown_policy_defaults_to_crash() {
        let mut config = EdgedConfig::default();
        config.daemon.failure_policy = Some("restart".into());
        assert_eq!(config.failure_policy(), FailurePolicy::Crash);
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[http\nport = ").unwrap();
        assert!(EdgedConfig::load_from(&path).is_err());
    }
}
