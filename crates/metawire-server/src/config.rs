//! Listener settings for [`MetawireServer`](crate::MetawireServer).
//!
//! [`ServerConfig::load`] layers a JSON file over the built-in defaults,
//! keeping default values for any key the file leaves out or sets to
//! `null`, then lets `METAWIRE_*` variables override single fields.

use std::path::Path;
use std::time::Duration;

use metawire_protocol::TransportOptions;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

/// Errors that can occur when loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the config file from disk.
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    /// Failed to parse JSON in the config file.
    #[error("failed to parse config JSON: {0}")]
    Json(#[from] serde_json::Error),
    /// A config value was invalid.
    #[error("invalid config value: {0}")]
    InvalidValue(String),
}

/// What the listener does with requests.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Run the protocol engine.
    #[default]
    Server,
    /// Redirect `/` and `/api...` to a random port from `ports`.
    Balancer,
}

/// Configuration for a metawire server.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind (default `"127.0.0.1"`).
    pub host: String,
    /// Port to bind (default `8000`, `0` for auto-assign).
    pub port: u16,
    /// Server or balancer.
    pub role: Role,
    /// Scheme used in balancer redirects.
    pub scheme: String,
    /// Balancer target ports.
    pub ports: Vec<u16>,
    /// `Access-Control-Allow-Origin` value.
    pub cors_origin: Option<String>,
    /// Hand non-API paths to the static file server.
    pub serve_static: bool,
    /// Bind attempts on `AddrInUse`.
    pub bind_retry: u32,
    /// Delay between bind attempts.
    pub bind_retry_delay_ms: u64,
    /// Longest wait for clients to go away on close.
    pub drain_timeout_ms: u64,
    /// Client-count poll interval while draining.
    pub drain_poll_ms: u64,
    /// Heartbeat interval in seconds.
    pub heartbeat_interval_secs: u64,
    /// Close a socket that answered no ping for this long.
    pub heartbeat_timeout_secs: u64,
    /// Max WebSocket message size in bytes.
    pub max_message_size: usize,
    /// Max HTTP request body in bytes.
    pub max_body_size: usize,
    /// Outbound frames queued per socket before senders wait.
    pub outbound_queue: usize,
    /// `Domain` attribute of the session cookie.
    pub cookie_domain: Option<String>,
    /// Session cookie lifetime in seconds.
    pub session_cookie_ttl_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8000,
            role: Role::Server,
            scheme: "http".into(),
            ports: Vec::new(),
            cors_origin: None,
            serve_static: true,
            bind_retry: 3,
            bind_retry_delay_ms: 1000,
            drain_timeout_ms: 30_000,
            drain_poll_ms: 500,
            heartbeat_interval_secs: 30,
            heartbeat_timeout_secs: 90,
            max_message_size: 16 * 1024 * 1024, // 16 MB
            max_body_size: 8 * 1024 * 1024,
            outbound_queue: 1024,
            cookie_domain: None,
            session_cookie_ttl_secs: 24 * 60 * 60,
        }
    }
}

impl ServerConfig {
    /// Load defaults, the optional file at `path`, then env overrides.
    ///
    /// A missing file yields defaults; an unreadable or invalid one is an error.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let defaults = serde_json::to_value(Self::default())?;
        let merged = match path {
            Some(path) if path.exists() => {
                debug!(?path, "loading config from file");
                let content = std::fs::read_to_string(path)?;
                let user: Value = serde_json::from_str(&content)?;
                deep_merge(defaults, user)
            }
            Some(path) => {
                debug!(?path, "config file not found, using defaults");
                defaults
            }
            None => defaults,
        };
        let mut config: Self = serde_json::from_value(merged)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply `METAWIRE_*` environment variables.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    /// Apply overrides read through `lookup`. Invalid values are ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let read = |name: &str| lookup(name).filter(|v| !v.is_empty());

        if let Some(v) = read("METAWIRE_HOST") {
            self.host = v;
        }
        if let Some(v) = read("METAWIRE_PORT") {
            match parse_range::<u16>(&v, 0, u16::MAX) {
                Some(port) => self.port = port,
                None => warn!(key = "METAWIRE_PORT", value = %v, "invalid env var, ignoring"),
            }
        }
        if let Some(v) = read("METAWIRE_ROLE") {
            match serde_json::from_value(Value::String(v.clone())) {
                Ok(role) => self.role = role,
                Err(_) => warn!(key = "METAWIRE_ROLE", value = %v, "invalid env var, ignoring"),
            }
        }
        if let Some(v) = read("METAWIRE_CORS_ORIGIN") {
            self.cors_origin = Some(v);
        }
        if let Some(v) = read("METAWIRE_BIND_RETRY") {
            match parse_range::<u32>(&v, 1, 100) {
                Some(retry) => self.bind_retry = retry,
                None => warn!(key = "METAWIRE_BIND_RETRY", value = %v, "invalid env var, ignoring"),
            }
        }
        if let Some(v) = read("METAWIRE_DRAIN_TIMEOUT_MS") {
            match parse_range::<u64>(&v, 0, 3_600_000) {
                Some(ms) => self.drain_timeout_ms = ms,
                None => {
                    warn!(key = "METAWIRE_DRAIN_TIMEOUT_MS", value = %v, "invalid env var, ignoring");
                }
            }
        }
    }

    /// Reject combinations the server cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.role == Role::Balancer && self.ports.is_empty() {
            return Err(ConfigError::InvalidValue(
                "balancer role needs at least one target port".into(),
            ));
        }
        if self.bind_retry == 0 {
            return Err(ConfigError::InvalidValue("bind_retry must be at least 1".into()));
        }
        if self.drain_poll_ms == 0 || self.heartbeat_interval_secs == 0 {
            return Err(ConfigError::InvalidValue(
                "drain_poll_ms and heartbeat_interval_secs must be positive".into(),
            ));
        }
        if self.outbound_queue == 0 {
            return Err(ConfigError::InvalidValue("outbound_queue must be positive".into()));
        }
        Ok(())
    }

    /// `host:port` to bind.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Per-transport settings derived from this config.
    pub fn transport_options(&self) -> TransportOptions {
        TransportOptions {
            cors_origin: self.cors_origin.clone(),
            cookie_domain: self.cookie_domain.clone(),
            cookie_ttl: Duration::from_secs(self.session_cookie_ttl_secs),
        }
    }
}

/// Recursive deep merge of two JSON values.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = match target_map.remove(&key) {
                    Some(target_val) => deep_merge(target_val, source_val),
                    None => source_val,
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

fn parse_range<T: std::str::FromStr + PartialOrd>(val: &str, min: T, max: T) -> Option<T> {
    let n: T = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}
