use std::env;

use serde::{Deserialize, Serialize};

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

/// Read a profiled env var: tries {PROFILE}_{KEY} first, falls back to {KEY}.
fn profiled_env_opt(profile: &str, key: &str) -> Option<String> {
    if !profile.is_empty() {
        let prefixed = format!("{}_{}", profile, key);
        if let Some(v) = env_opt(&prefixed) {
            return Some(v);
        }
    }
    env_opt(key)
}

fn profiled_env_or(profile: &str, key: &str, default: &str) -> String {
    profiled_env_opt(profile, key).unwrap_or_else(|| default.to_string())
}

fn profiled_env_usize(profile: &str, key: &str, default: usize) -> usize {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

// ── Top-level config ──────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Active profile name (empty = default).
    pub profile: String,
    pub service: ServiceConfig,
    pub channel: ChannelConfig,
}

/// Well-known env keys that identify a profile when prefixed.
const PROFILE_MARKER_KEYS: &[&str] = &["SERVICE_URL", "SERVICE_API_PREFIX"];

impl Config {
    /// Build config from environment variables (call `load_dotenv()` first).
    /// Profile is read from `PROVISIONER_PROFILE`. When set (e.g. `STAGING`),
    /// every key is first looked up as `{PROFILE}_{KEY}`, falling back to `{KEY}`.
    pub fn from_env() -> Self {
        let profile = env_or("PROVISIONER_PROFILE", "").to_uppercase();
        Self::for_profile(&profile)
    }

    /// Build config for a specific named profile (empty string = default).
    pub fn for_profile(profile: &str) -> Self {
        let p = profile.to_uppercase();
        let p = p.as_str();
        Self {
            profile: p.to_string(),
            service: ServiceConfig::from_env_profiled(p),
            channel: ChannelConfig::from_env_profiled(p),
        }
    }

    /// Discover available profiles by scanning env vars for `{PREFIX}_{MARKER_KEY}` patterns.
    /// Always includes "default" (the unprefixed config).
    pub fn available_profiles() -> Vec<String> {
        let mut profiles = std::collections::BTreeSet::new();
        profiles.insert("default".to_string());

        for (key, _) in env::vars() {
            for marker in PROFILE_MARKER_KEYS {
                if let Some(prefix) = key.strip_suffix(&format!("_{}", marker)) {
                    if !prefix.is_empty()
                        && prefix.chars().all(|c| c.is_ascii_uppercase() || c == '_')
                    {
                        profiles.insert(prefix.to_string());
                    }
                }
            }
        }

        profiles.into_iter().collect()
    }

    pub fn profile_label(&self) -> &str {
        if self.profile.is_empty() { "default" } else { &self.profile }
    }

    /// Print a summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Config loaded (profile: {}):", self.profile_label());
        tracing::info!("  service:  base_url={}, api_prefix={}", self.service.base_url, self.service.api_prefix);
        tracing::info!("  channel:  events={}, buffer={}", self.events_url(), self.channel.buffer);
    }

    /// Absolute URL of the push-notification stream.
    pub fn events_url(&self) -> String {
        self.service.endpoint(&self.channel.events_path)
    }
}

// ── Remote compute service ────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub base_url: String,
    pub api_prefix: String,
}

impl ServiceConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            base_url: profiled_env_or(p, "SERVICE_URL", "http://localhost:5000"),
            api_prefix: profiled_env_or(p, "SERVICE_API_PREFIX", "/api"),
        }
    }

    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_prefix: "/api".to_string(),
        }
    }

    /// Join `path` onto the base URL and API prefix, normalising slashes.
    pub fn endpoint(&self, path: &str) -> String {
        let base = self.base_url.trim_end_matches('/');
        let prefix = self.api_prefix.trim_matches('/');
        let path = path.trim_start_matches('/');
        if prefix.is_empty() {
            format!("{}/{}", base, path)
        } else {
            format!("{}/{}/{}", base, prefix, path)
        }
    }
}

// ── Push channel ──────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Path of the event stream, relative to the API prefix.
    pub events_path: String,
    /// Capacity of bounded queues fed from channel subscribers, such as
    /// `panel-monitor`'s echo queue. Never below 1.
    pub buffer: usize,
}

impl ChannelConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            events_path: profiled_env_or(p, "SERVICE_EVENTS_PATH", "events"),
            buffer: profiled_env_usize(p, "PANEL_CHANNEL_BUFFER", 256).max(1),
        }
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            events_path: "events".to_string(),
            buffer: 256,
        }
    }
}
