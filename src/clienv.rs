use std::path::PathBuf;

/// Environment variables read by the edge host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvVar {
    ConfigDir,
    PollTimeout,
    FailurePolicy,
    HttpHost,
    HttpPort,
}

impl EnvVar {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvVar::ConfigDir => "EDGED_CONFIG_DIR",
            EnvVar::PollTimeout => "EDGED_POLL_TIMEOUT",
            EnvVar::FailurePolicy => "EDGED_FAILURE_POLICY",
            EnvVar::HttpHost => "EDGED_HTTP_HOST",
            EnvVar::HttpPort => "EDGED_HTTP_PORT",
        }
    }
}

const FALLBACK_CONFIG_DIR: &str = "~/.config";
const EDGED_SUBDIR: &str = "edged";

/// Non-empty value of an environment variable.
fn env_opt(var: EnvVar) -> Option<String> {
    std::env::var(var.as_str())
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Config directory ($EDGED_CONFIG_DIR or ~/.config/edged)
pub fn config_dir() -> PathBuf {
    let dir = env_opt(EnvVar::ConfigDir)
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            dirs::config_dir()
                .unwrap_or_else(|| PathBuf::from(FALLBACK_CONFIG_DIR))
                .join(EDGED_SUBDIR)
        });
    tracing::trace!(dir = %dir.display(), "Resolved config directory");
    dir
}

/// Poll timeout override ($EDGED_POLL_TIMEOUT, e.g. "250ms")
pub fn poll_timeout() -> Option<String> {
    let val = env_opt(EnvVar::PollTimeout);
    tracing::trace!(value = ?val, "EDGED_POLL_TIMEOUT env var");
    val
}

/// Failure policy override ($EDGED_FAILURE_POLICY: crash | report)
pub fn failure_policy() -> Option<String> {
    let val = env_opt(EnvVar::FailurePolicy);
    tracing::trace!(value = ?val, "EDGED_FAILURE_POLICY env var");
    val
}

/// HTTP bind host override ($EDGED_HTTP_HOST)
pub fn http_host() -> Option<String> {
    let val = env_opt(EnvVar::HttpHost);
    tracing::trace!(value = ?val, "EDGED_HTTP_HOST env var");
    val
}

/// HTTP port override ($EDGED_HTTP_PORT); unparseable values are ignored
pub fn http_port() -> Option<u16> {
    let val = env_opt(EnvVar::HttpPort);
    let port = val.as_deref().and_then(|s| s.parse().ok());
    if val.is_some() && port.is_none() {
        tracing::warn!(value = ?val, "Ignoring invalid EDGED_HTTP_PORT");
    }
    port
}
