//! Environment-driven runtime configuration for the ingestion subsystem.

use std::env;
use std::time::Duration;

fn env_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .ok()
        .map(|value| matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_duration_millis(key: &str, default_millis: u64) -> Duration {
    Duration::from_millis(env_u64(key, default_millis))
}

fn env_string(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt_string(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

/// Configuration for reply ingestion: mailbox gateway, analyzer callback,
/// OAuth token refresh, and correlation behavior.
#[derive(Debug, Clone)]
pub struct IngestConfig {
    /// Base URL of the mailbox gateway (search/get/history endpoints).
    pub gateway_url: String,
    /// Analyzer callback URL; when unset, confirmed replies are only logged.
    pub analyzer_url: Option<String>,
    /// OAuth token endpoint for explicit credential refresh.
    pub token_url: String,
    pub oauth_client_id: String,
    pub oauth_client_secret: String,
    /// Default polling interval for watches started without an explicit one.
    pub default_poll_interval: Duration,
    /// Whether the normalized-subject correlation fallback is consulted.
    /// It is a documented best-effort heuristic and can misfire under
    /// subject reuse, so stricter deployments may turn it off.
    pub subject_fallback: bool,
    pub request_timeout: Duration,
}

impl IngestConfig {
    pub fn from_env() -> Self {
        Self {
            gateway_url: env_string("MAIL_GATEWAY_URL", "http://mail-gateway:8080"),
            analyzer_url: env_opt_string("ANALYZER_URL"),
            token_url: env_string("OAUTH_TOKEN_URL", "https://oauth2.googleapis.com/token"),
            oauth_client_id: env_string("OAUTH_CLIENT_ID", ""),
            oauth_client_secret: env_string("OAUTH_CLIENT_SECRET", ""),
            default_poll_interval: Duration::from_secs(env_u64("POLL_INTERVAL_SECS", 300)),
            subject_fallback: env_bool("INGEST_SUBJECT_FALLBACK", true),
            request_timeout: env_duration_millis("GATEWAY_TIMEOUT_MS", 30_000),
        }
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self::from_env()
    }
}
