//! Server configuration.
//!
//! Loading flow:
//! 1. Start with compiled [`ServerConfig::default()`]
//! 2. If a config file is given and exists, deep-merge its values over defaults
//! 3. Apply `PARLEY_*` environment variable overrides (highest priority)
//! 4. Validate

use std::fmt;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::time::Duration;

use parley_telemetry::LogFormat;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid config JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid value for {key}: {reason}")]
    InvalidValue { key: &'static str, reason: String },
}

/// Inclusive bounds for numeric settings. Env overrides outside a range are
/// ignored; file values outside it fail [`ServerConfig::validate`].
pub mod limits {
    use std::ops::RangeInclusive;

    pub const TOKEN_TTL_SECS: RangeInclusive<u64> = 60..=30 * 24 * 60 * 60;
    pub const REFRESH_TOKEN_TTL_SECS: RangeInclusive<u64> = 60..=365 * 24 * 60 * 60;
    pub const MAILBOX_CAPACITY: RangeInclusive<u64> = 1..=65_536;
    pub const WRITE_WAIT_SECS: RangeInclusive<u64> = 1..=300;
    pub const PONG_WAIT_SECS: RangeInclusive<u64> = 1..=3600;
    pub const MAX_MESSAGE_SIZE: RangeInclusive<u64> = 1024..=64 * 1024 * 1024;
    pub const REQUEST_TIMEOUT_SECS: RangeInclusive<u64> = 1..=3600;
    pub const SHUTDOWN_TIMEOUT_SECS: RangeInclusive<u64> = 1..=600;
    /// bcrypt work factor.
    pub const PASSWORD_HASH_COST: RangeInclusive<u64> = 4..=31;
}

/// Configuration for the chat server.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind (default `"127.0.0.1"`).
    pub host: String,
    /// Port to bind (`0` picks a free port).
    pub port: u16,
    /// SQLite database path.
    pub db_path: PathBuf,
    /// HS256 secret used to sign and verify bearer tokens.
    pub jwt_secret: String,
    /// Lifetime of access tokens.
    pub token_ttl_secs: u64,
    /// Lifetime of refresh tokens handed out by `/api/login`.
    pub refresh_token_ttl_secs: u64,
    /// bcrypt work factor for stored passwords.
    pub password_hash_cost: u32,
    /// Pending outbound frames per connection before it is evicted.
    pub mailbox_capacity: usize,
    /// Deadline for a single websocket write.
    pub write_wait_secs: u64,
    /// How long a connection may stay silent (no pong) before it is dropped.
    pub pong_wait_secs: u64,
    /// Largest inbound websocket message accepted, in bytes.
    pub max_message_size: usize,
    /// Deadline for REST requests.
    pub request_timeout_secs: u64,
    /// How long shutdown waits for sessions to close.
    pub shutdown_timeout_secs: u64,
    pub log_level: String,
    pub log_format: LogFormat,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8080,
            db_path: data_dir().join("parley.db"),
            jwt_secret: String::new(),
            token_ttl_secs: 24 * 60 * 60,
            refresh_token_ttl_secs: 7 * 24 * 60 * 60,
            password_hash_cost: 12,
            mailbox_capacity: 256,
            write_wait_secs: 10,
            pong_wait_secs: 60,
            max_message_size: 512 * 1024,
            request_timeout_secs: 30,
            shutdown_timeout_secs: 10,
            log_level: "info".into(),
            log_format: LogFormat::Json,
        }
    }
}

impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("db_path", &self.db_path)
            .field("jwt_secret", &"[redacted]")
            .field("token_ttl_secs", &self.token_ttl_secs)
            .field("refresh_token_ttl_secs", &self.refresh_token_ttl_secs)
            .field("password_hash_cost", &self.password_hash_cost)
            .field("mailbox_capacity", &self.mailbox_capacity)
            .field("write_wait_secs", &self.write_wait_secs)
            .field("pong_wait_secs", &self.pong_wait_secs)
            .field("max_message_size", &self.max_message_size)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("shutdown_timeout_secs", &self.shutdown_timeout_secs)
            .field("log_level", &self.log_level)
            .field("log_format", &self.log_format)
            .finish()
    }
}

impl ServerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn write_wait(&self) -> Duration {
        Duration::from_secs(self.write_wait_secs)
    }

    pub fn pong_wait(&self) -> Duration {
        Duration::from_secs(self.pong_wait_secs)
    }

    /// Keepalive ping cadence; always shorter than `pong_wait`.
    pub fn ping_period(&self) -> Duration {
        self.pong_wait() / 10 * 9
    }

    pub fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.token_ttl_secs)
    }

    pub fn refresh_token_ttl(&self) -> Duration {
        Duration::from_secs(self.refresh_token_ttl_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |key, reason: &str| {
            Err(ConfigError::InvalidValue {
                key,
                reason: reason.to_owned(),
            })
        };
        if self.jwt_secret.trim().is_empty() {
            return invalid("jwt_secret", "must be set");
        }
        check_range("token_ttl_secs", self.token_ttl_secs, limits::TOKEN_TTL_SECS)?;
        check_range(
            "refresh_token_ttl_secs",
            self.refresh_token_ttl_secs,
            limits::REFRESH_TOKEN_TTL_SECS,
        )?;
        if self.refresh_token_ttl_secs < self.token_ttl_secs {
            return invalid("refresh_token_ttl_secs", "must not be shorter than token_ttl_secs");
        }
        check_range(
            "password_hash_cost",
            u64::from(self.password_hash_cost),
            limits::PASSWORD_HASH_COST,
        )?;
        check_range("mailbox_capacity", widen(self.mailbox_capacity), limits::MAILBOX_CAPACITY)?;
        check_range("write_wait_secs", self.write_wait_secs, limits::WRITE_WAIT_SECS)?;
        check_range("pong_wait_secs", self.pong_wait_secs, limits::PONG_WAIT_SECS)?;
        check_range("max_message_size", widen(self.max_message_size), limits::MAX_MESSAGE_SIZE)?;
        check_range(
            "request_timeout_secs",
            self.request_timeout_secs,
            limits::REQUEST_TIMEOUT_SECS,
        )?;
        check_range(
            "shutdown_timeout_secs",
            self.shutdown_timeout_secs,
            limits::SHUTDOWN_TIMEOUT_SECS,
        )?;
        Ok(())
    }
}

fn widen(n: usize) -> u64 {
    u64::try_from(n).unwrap_or(u64::MAX)
}

fn check_range(key: &'static str, value: u64, range: RangeInclusive<u64>) -> Result<(), ConfigError> {
    if range.contains(&value) {
        return Ok(());
    }
    Err(ConfigError::InvalidValue {
        key,
        reason: format!("{value} is outside {}..={}", range.start(), range.end()),
    })
}

/// Default data directory (`~/.parley`).
pub fn data_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
        .join(".parley")
}

/// Load configuration from an optional file plus the process environment.
/// Not validated; the server validates before starting.
pub fn load_config(path: Option<&Path>) -> Result<ServerConfig, ConfigError> {
    let mut config = load_config_file(path)?;
    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    Ok(config)
}

/// Defaults deep-merged with the file at `path`, without env overrides.
pub fn load_config_file(path: Option<&Path>) -> Result<ServerConfig, ConfigError> {
    let defaults = serde_json::to_value(ServerConfig::default())?;

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

    Ok(serde_json::from_value(merged)?)
}

/// Recursive deep merge of two JSON values.
///
/// Objects merge per key, anything else is replaced by `source`, and nulls in
/// `source` keep the target value.
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
                target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `PARLEY_*` overrides read through `lookup`.
///
/// Values that fail to parse or fall outside their range are ignored with a
/// warning.
pub fn apply_env_overrides<F>(config: &mut ServerConfig, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let string = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
    let number = |key: &str, range: RangeInclusive<u64>| -> Option<u64> {
        let raw = string(key)?;
        let parsed = parse_u64_range(&raw, *range.start(), *range.end());
        if parsed.is_none() {
            warn!(key, value = %raw, "invalid numeric env var, ignoring");
        }
        parsed
    };

    if let Some(v) = string("PARLEY_HOST") {
        config.host = v;
    }
    if let Some(v) = number("PARLEY_PORT", 0..=u64::from(u16::MAX)) {
        config.port = v as u16;
    }
    if let Some(v) = string("PARLEY_DB_PATH") {
        config.db_path = PathBuf::from(v);
    }
    if let Some(v) = string("PARLEY_JWT_SECRET") {
        config.jwt_secret = v;
    }
    if let Some(v) = number("PARLEY_TOKEN_TTL_SECS", limits::TOKEN_TTL_SECS) {
        config.token_ttl_secs = v;
    }
    if let Some(v) = number("PARLEY_REFRESH_TOKEN_TTL_SECS", limits::REFRESH_TOKEN_TTL_SECS) {
        config.refresh_token_ttl_secs = v;
    }
    if let Some(v) = number("PARLEY_PASSWORD_HASH_COST", limits::PASSWORD_HASH_COST) {
        config.password_hash_cost = v as u32;
    }
    if let Some(v) = number("PARLEY_MAILBOX_CAPACITY", limits::MAILBOX_CAPACITY) {
        config.mailbox_capacity = v as usize;
    }
    if let Some(v) = number("PARLEY_WRITE_WAIT_SECS", limits::WRITE_WAIT_SECS) {
        config.write_wait_secs = v;
    }
    if let Some(v) = number("PARLEY_PONG_WAIT_SECS", limits::PONG_WAIT_SECS) {
        config.pong_wait_secs = v;
    }
    if let Some(v) = number("PARLEY_MAX_MESSAGE_SIZE", limits::MAX_MESSAGE_SIZE) {
        config.max_message_size = v as usize;
    }
    if let Some(v) = number("PARLEY_REQUEST_TIMEOUT_SECS", limits::REQUEST_TIMEOUT_SECS) {
        config.request_timeout_secs = v;
    }
    if let Some(v) = number("PARLEY_SHUTDOWN_TIMEOUT_SECS", limits::SHUTDOWN_TIMEOUT_SECS) {
        config.shutdown_timeout_secs = v;
    }
    if let Some(v) = string("PARLEY_LOG_LEVEL") {
        config.log_level = v;
    }
    if let Some(v) = string("PARLEY_LOG_FORMAT") {
        match v.parse() {
            Ok(format) => config.log_format = format,
            Err(e) => warn!(key = "PARLEY_LOG_FORMAT", error = %e, "ignoring"),
        }
    }
}

/// Parse a string as a `u64` within an inclusive range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}
