//! Engine configuration.
//!
//! Loading flow:
//! 1. Start with compiled [`SyncConfig::default()`]
//! 2. If a config file is given and exists, merge its JSON over defaults;
//!    unknown keys are dropped with a warning
//! 3. Apply `TEMPO_*` environment variable overrides (highest priority)
//! 4. Validate

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::session::{CadenceDurations, SessionKind};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid config value: {0}")]
    InvalidValue(String),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncConfig {
    /// Realtime endpoint base; the engine appends `/ws/{userId}`.
    pub ws_base_url: String,
    /// REST base; sessions live under `/api/timer/sessions`.
    pub api_base_url: String,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_attempts: u32,
    pub tick_interval_ms: u64,
    /// Upper bound of the random delay added to each reconnect backoff.
    pub jitter_ms: u64,
    /// `0` disables heartbeat pings.
    pub heartbeat_interval_ms: u64,
    pub send_queue_capacity: usize,
    /// Retries after the first failed session update.
    pub persist_retry_limit: u32,
    pub persist_retry_delay_ms: u64,
    pub request_timeout_ms: u64,
    pub cadence: CadenceDurations,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            ws_base_url: "ws://localhost:8000".into(),
            api_base_url: "http://localhost:8000".into(),
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            max_attempts: 5,
            tick_interval_ms: 1000,
            jitter_ms: 250,
            heartbeat_interval_ms: 30_000,
            send_queue_capacity: 256,
            persist_retry_limit: 3,
            persist_retry_delay_ms: 500,
            request_timeout_ms: 10_000,
            cadence: CadenceDurations::default(),
        }
    }
}

impl SyncConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn jitter(&self) -> Duration {
        Duration::from_millis(self.jitter_ms)
    }

    pub fn heartbeat_interval(&self) -> Option<Duration> {
        (self.heartbeat_interval_ms > 0).then(|| Duration::from_millis(self.heartbeat_interval_ms))
    }

    pub fn persist_retry_delay(&self) -> Duration {
        Duration::from_millis(self.persist_retry_delay_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Load from an optional JSON file with process environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let defaults = serde_json::to_value(Self::default())?;

        let merged = match path {
            Some(path) if path.exists() => {
                debug!(?path, "loading config from file");
                let content = std::fs::read_to_string(path)?;
                let user: Value = serde_json::from_str(&content)?;
                let mut overridden = Vec::new();
                let merged = merge_layer(defaults, user, "", &mut overridden);
                debug!(?overridden, "config file applied");
                merged
            }
            Some(path) => {
                debug!(?path, "config file not found, using defaults");
                defaults
            }
            None => defaults,
        };

        let mut config: Self = serde_json::from_value(merged)?;
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Apply `TEMPO_*` overrides. Unparseable values are ignored with a warning.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("TEMPO_WS_BASE_URL") {
            self.ws_base_url = v;
        }
        if let Some(v) = lookup("TEMPO_API_BASE_URL") {
            self.api_base_url = v;
        }
        if let Some(v) = parse_env(&lookup, "TEMPO_BASE_DELAY_MS") {
            self.base_delay_ms = v;
        }
        if let Some(v) = parse_env(&lookup, "TEMPO_MAX_DELAY_MS") {
            self.max_delay_ms = v;
        }
        if let Some(v) = parse_env(&lookup, "TEMPO_MAX_ATTEMPTS") {
            self.max_attempts = v;
        }
        if let Some(v) = parse_env(&lookup, "TEMPO_TICK_INTERVAL_MS") {
            self.tick_interval_ms = v;
        }
        if let Some(v) = parse_env(&lookup, "TEMPO_HEARTBEAT_INTERVAL_MS") {
            self.heartbeat_interval_ms = v;
        }
        if let Some(v) = parse_env(&lookup, "TEMPO_JITTER_MS") {
            self.jitter_ms = v;
        }
        if let Some(v) = parse_env(&lookup, "TEMPO_SEND_QUEUE_CAPACITY") {
            self.send_queue_capacity = v;
        }
        if let Some(v) = parse_env(&lookup, "TEMPO_PERSIST_RETRY_LIMIT") {
            self.persist_retry_limit = v;
        }
        if let Some(v) = parse_env(&lookup, "TEMPO_PERSIST_RETRY_DELAY_MS") {
            self.persist_retry_delay_ms = v;
        }
        if let Some(v) = parse_env(&lookup, "TEMPO_REQUEST_TIMEOUT_MS") {
            self.request_timeout_ms = v;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.base_delay_ms > self.max_delay_ms {
            return Err(ConfigError::InvalidValue(format!(
                "baseDelayMs ({}) exceeds maxDelayMs ({})",
                self.base_delay_ms, self.max_delay_ms
            )));
        }
        if self.tick_interval_ms == 0 {
            return Err(ConfigError::InvalidValue("tickIntervalMs must be positive".into()));
        }
        if self.send_queue_capacity == 0 {
            return Err(ConfigError::InvalidValue("sendQueueCapacity must be positive".into()));
        }
        for kind in [SessionKind::Focus, SessionKind::Break, SessionKind::LongBreak] {
            if self.cadence.for_kind(kind) == 0 {
                return Err(ConfigError::InvalidValue(format!(
                    "cadence for {kind} must be positive"
                )));
            }
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(key, value = %raw, "ignoring unparseable environment override");
            None
        }
    }
}

/// Merge a config-file layer over `target`, which always holds the full
/// default tree. Nested objects merge per key, anything else replaces.
/// `null` keeps the target value. Keys with no default are dropped with a
/// warning; dotted paths of replaced values are pushed onto `overridden`.
fn merge_layer(target: Value, source: Value, path: &str, overridden: &mut Vec<String>) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let child = if path.is_empty() { key.clone() } else { format!("{path}.{key}") };
                let Some(target_val) = target_map.remove(&key) else {
                    warn!(key = %child, "ignoring unknown config key");
                    continue;
                };
                let merged = merge_layer(target_val, source_val, &child, overridden);
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => {
            overridden.push(path.to_owned());
            source
        }
    }
}
