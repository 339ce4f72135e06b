//! Environment variable readers.

use std::path::PathBuf;
use std::time::Duration;

use crate::Result;

const DEFAULT_DISCOVERY_STATUS_TTL_MS: u64 = 5_000;
const DEFAULT_SESSION_HIGH_WATER: usize = 1_000;
const DEFAULT_SESSION_GC_INTERVAL_MS: u64 = 3_600_000; // 1 hour

fn env_truthy(key: &str) -> bool {
    std::env::var(key)
        .map(|s| s == "1" || s.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// Returns the user's home directory.
pub fn home_dir() -> Result<PathBuf> {
    #[cfg(unix)]
    if let Ok(home) = std::env::var("HOME") {
        return Ok(PathBuf::from(home));
    }
    dirs::home_dir().ok_or_else(|| anyhow::anyhow!("home directory not found"))
}

/// Whether the package-install helper may run (`METAMCP_INSTALL_ENABLED`).
pub fn env_install_enabled() -> bool {
    env_truthy("METAMCP_INSTALL_ENABLED")
}

/// API key for the chat-completions provider.
///
/// `METAMCP_CHAT_API_KEY` wins; `OPENAI_API_KEY` is accepted as the
/// conventional fallback.
pub fn chat_api_key() -> Option<String> {
    std::env::var("METAMCP_CHAT_API_KEY")
        .or_else(|_| std::env::var("OPENAI_API_KEY"))
        .ok()
        .filter(|s| !s.is_empty())
}

/// Base URL override for the chat-completions provider
/// (`METAMCP_CHAT_BASE_URL`).
pub fn chat_base_url() -> Option<String> {
    std::env::var("METAMCP_CHAT_BASE_URL")
        .ok()
        .filter(|s| !s.is_empty())
}

/// TTL of the per-namespace smart-discovery status cache
/// (`METAMCP_DISCOVERY_STATUS_TTL_MS`, default 5 s).
pub fn discovery_status_ttl() -> Duration {
    let ms = std::env::var("METAMCP_DISCOVERY_STATUS_TTL_MS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(DEFAULT_DISCOVERY_STATUS_TTL_MS);
    Duration::from_millis(ms)
}

/// Session count above which the coarse exposure GC may fire
/// (`METAMCP_SESSION_HIGH_WATER`, default 1000).
pub fn session_high_water_mark() -> usize {
    std::env::var("METAMCP_SESSION_HIGH_WATER")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(DEFAULT_SESSION_HIGH_WATER)
}

/// Minimum interval between coarse exposure GC sweeps
/// (`METAMCP_SESSION_GC_INTERVAL_MS`, default 1 h).
pub fn session_gc_interval() -> Duration {
    let ms = std::env::var("METAMCP_SESSION_GC_INTERVAL_MS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(DEFAULT_SESSION_GC_INTERVAL_MS);
    Duration::from_millis(ms)
}
