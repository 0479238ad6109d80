//! Server configuration loaded from environment variables.
//!
//! All settings have sensible defaults so the server can start with zero
//! configuration for local development.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use quickchat_shared::constants::{
    DEFAULT_HANDSHAKE_TIMEOUT_MS, DEFAULT_HTTP_PORT, DEFAULT_PUSH_TIMEOUT_MS, MAX_BODY_SIZE,
};

/// Secret used when `JWT_SECRET` is unset. Only suitable for local development.
pub const DEV_JWT_SECRET: &str = "quickchat-dev-secret";

/// Server configuration.
#[derive(Clone)]
pub struct ServerConfig {
    /// Socket address for the HTTP (axum) server.
    /// Env: `HTTP_ADDR`, or `PORT` to override only the port.
    /// Default: `0.0.0.0:5000`
    pub http_addr: SocketAddr,

    /// SQLite database file holding messages.
    /// Env: `DATABASE_PATH`
    /// Default: `./quickchat.db`
    pub database_path: PathBuf,

    /// HS256 secret shared with the service that issues login tokens.
    /// Env: `JWT_SECRET`
    pub jwt_secret: String,

    /// Browser origin allowed by CORS. `None` allows any origin.
    /// Env: `CORS_ORIGIN`
    pub cors_origin: Option<String>,

    /// How long a new connection may take to present a valid credential.
    /// Env: `HANDSHAKE_TIMEOUT_MS`
    pub handshake_timeout: Duration,

    /// Write timeout for a single push to a live connection.
    /// Env: `PUSH_TIMEOUT_MS`
    pub push_timeout: Duration,

    /// Maximum REST request body in bytes.
    /// Env: `MAX_BODY_BYTES`
    pub max_body_bytes: usize,

    /// Sustained requests per second allowed per client IP.
    /// Env: `RATE_LIMIT_PER_SEC`
    pub rate_limit_per_sec: f64,

    /// Burst size of the per-IP token bucket.
    /// Env: `RATE_LIMIT_BURST`
    pub rate_limit_burst: f64,
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("http_addr", &self.http_addr)
            .field("database_path", &self.database_path)
            .field("jwt_secret", &"<redacted>")
            .field("cors_origin", &self.cors_origin)
            .field("handshake_timeout", &self.handshake_timeout)
            .field("push_timeout", &self.push_timeout)
            .field("max_body_bytes", &self.max_body_bytes)
            .field("rate_limit_per_sec", &self.rate_limit_per_sec)
            .field("rate_limit_burst", &self.rate_limit_burst)
            .finish()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], DEFAULT_HTTP_PORT).into(),
            database_path: PathBuf::from("./quickchat.db"),
            jwt_secret: DEV_JWT_SECRET.to_string(),
            cors_origin: None,
            handshake_timeout: Duration::from_millis(DEFAULT_HANDSHAKE_TIMEOUT_MS),
            push_timeout: Duration::from_millis(DEFAULT_PUSH_TIMEOUT_MS),
            max_body_bytes: MAX_BODY_SIZE,
            rate_limit_per_sec: 10.0,
            rate_limit_burst: 30.0,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary key lookup.
    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(addr) = parse_var::<SocketAddr>(&lookup, "HTTP_ADDR") {
            config.http_addr = addr;
        }

        if let Some(port) = parse_var::<u16>(&lookup, "PORT") {
            config.http_addr.set_port(port);
        }

        if let Some(path) = lookup("DATABASE_PATH").filter(|p| !p.is_empty()) {
            config.database_path = PathBuf::from(path);
        }

        match lookup("JWT_SECRET").filter(|s| !s.is_empty()) {
            Some(secret) => config.jwt_secret = secret,
            None => tracing::warn!("JWT_SECRET not set, using development secret"),
        }

        if let Some(origin) = lookup("CORS_ORIGIN").filter(|o| !o.is_empty() && o != "*") {
            config.cors_origin = Some(origin);
        }

        if let Some(ms) = parse_var::<u64>(&lookup, "HANDSHAKE_TIMEOUT_MS") {
            config.handshake_timeout = Duration::from_millis(ms);
        }

        if let Some(ms) = parse_var::<u64>(&lookup, "PUSH_TIMEOUT_MS") {
            config.push_timeout = Duration::from_millis(ms);
        }

        if let Some(bytes) = parse_var::<usize>(&lookup, "MAX_BODY_BYTES") {
            config.max_body_bytes = bytes;
        }

        if let Some(rate) = parse_positive(&lookup, "RATE_LIMIT_PER_SEC") {
            config.rate_limit_per_sec = rate;
        }

        if let Some(burst) = parse_positive(&lookup, "RATE_LIMIT_BURST") {
            config.rate_limit_burst = burst;
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter,
        // so we do not store it here.

        config
    }
}

/// Read and parse one variable, warning and returning `None` on bad input.
fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::warn!(key, value = %raw, error = %e, "Invalid value, using default");
            None
        }
    }
}

/// Like [`parse_var`], but only finite values above zero are accepted.
fn parse_positive(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<f64> {
    let value = parse_var::<f64>(lookup, key)?;
    if value.is_finite() && value > 0.0 {
        Some(value)
    } else {
        tracing::warn!(key, value, "Value must be a positive number, using default");
        None
    }
}
