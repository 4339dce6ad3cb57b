// Relay server configuration.
//
// Centralizes environment variable parsing with defaults for local
// development. Present-but-invalid values are rejected at startup rather
// than silently replaced.

use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 1234;
const DEFAULT_CORS_ORIGIN: &str = "http://localhost:3000";
const VALID_LOG_LEVELS: [&str; 4] = ["error", "warn", "info", "debug"];

/// Resource limits enforced by admission control and connection sessions.
#[derive(Debug, Clone, PartialEq)]
pub struct Limits {
    /// Largest accepted application message, in bytes.
    pub max_payload: usize,
    pub max_conns_per_ip: usize,
    pub max_global_conns: usize,
    /// Connections one IP may open within a rolling 60 s window.
    pub max_conn_rate_per_min: usize,
    /// Messages one connection may send within a 1 s window.
    pub max_msg_rate_per_sec: usize,
    /// Memory-pressure ratio (0, 1] above which new connections are refused.
    pub memory_threshold: f64,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_payload: 5 * 1024 * 1024,
            max_conns_per_ip: 100,
            max_global_conns: 10_000,
            max_conn_rate_per_min: 100,
            max_msg_rate_per_sec: 100,
            memory_threshold: 0.8,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

/// Core relay server configuration.
///
/// Constructed via [`RelayConfig::from_env`] which reads environment
/// variables and falls back to development defaults.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Listen address (host:port).
    pub listen_addr: SocketAddr,
    /// Origins allowed to call the probe endpoints (`*` for any).
    pub cors_origins: Vec<String>,
    /// Default log level when `RUST_LOG` is unset.
    pub log_level: String,
    pub log_format: LogFormat,
    /// How often the reaper sweeps for idle rooms.
    pub room_cleanup_interval: Duration,
    /// How long an empty room may stay idle before the reaper removes it.
    pub room_inactive_timeout: Duration,
    /// How long shutdown waits for sessions to close before forcing exit.
    pub shutdown_grace_period: Duration,
    pub limits: Limits,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            cors_origins: vec![DEFAULT_CORS_ORIGIN.to_string()],
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
            room_cleanup_interval: Duration::from_millis(300_000),
            room_inactive_timeout: Duration::from_millis(3_600_000),
            shutdown_grace_period: Duration::from_millis(10_000),
            limits: Limits::default(),
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("invalid {key}: {value:?}, {expected}")]
    Invalid { key: &'static str, value: String, expected: &'static str },
    #[error("invalid listen address {host}:{port}")]
    ListenAddr { host: String, port: u16 },
}

impl RelayConfig {
    /// Parse configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `HOST` | `0.0.0.0` |
    /// | `PORT` | `1234` |
    /// | `CORS_ORIGINS` | `http://localhost:3000` |
    /// | `LOG_LEVEL` | `info` |
    /// | `LOG_FORMAT` | `text` |
    /// | `ROOM_CLEANUP_INTERVAL` | `300000` ms |
    /// | `ROOM_INACTIVE_TIMEOUT` | `3600000` ms |
    /// | `SHUTDOWN_GRACE_PERIOD` | `10000` ms |
    /// | `MAX_PAYLOAD` | `5242880` bytes |
    /// | `MAX_CONNS_PER_IP` | `100` |
    /// | `MAX_GLOBAL_CONNS` | `10000` |
    /// | `MAX_CONN_RATE_PER_MIN` | `100` |
    /// | `MAX_MSG_RATE_PER_SEC` | `100` |
    /// | `MEMORY_THRESHOLD` | `0.8` |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_env_fn(|key| std::env::var(key))
    }

    /// Testable constructor that accepts an environment lookup function.
    fn from_env_fn<F>(env: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        let defaults = Self::default();

        let host = env("HOST").unwrap_or_else(|_| DEFAULT_HOST.into());
        let port = match env("PORT") {
            Ok(raw) => match raw.trim().parse::<u16>() {
                Ok(port) if port > 0 => port,
                _ => return Err(invalid("PORT", raw, "must be between 1 and 65535")),
            },
            Err(_) => DEFAULT_PORT,
        };
        let listen_addr = format!("{host}:{port}")
            .parse()
            .map_err(|_| ConfigError::ListenAddr { host: host.clone(), port })?;

        let cors_origins = match env("CORS_ORIGINS") {
            Ok(raw) => parse_origins(&raw),
            Err(_) => defaults.cors_origins,
        };

        let log_level = env("LOG_LEVEL")
            .ok()
            .map(|level| level.trim().to_ascii_lowercase())
            .filter(|level| VALID_LOG_LEVELS.contains(&level.as_str()))
            .unwrap_or(defaults.log_level);

        let log_format = match env("LOG_FORMAT").ok().as_deref().map(str::trim) {
            Some("json") => LogFormat::Json,
            _ => LogFormat::Text,
        };

        let room_cleanup_interval = positive_millis(&env, "ROOM_CLEANUP_INTERVAL")?
            .unwrap_or(defaults.room_cleanup_interval);
        let room_inactive_timeout = positive_millis(&env, "ROOM_INACTIVE_TIMEOUT")?
            .unwrap_or(defaults.room_inactive_timeout);
        let shutdown_grace_period = positive_millis(&env, "SHUTDOWN_GRACE_PERIOD")?
            .unwrap_or(defaults.shutdown_grace_period);

        let default_limits = defaults.limits;
        let limits = Limits {
            max_payload: positive_count(&env, "MAX_PAYLOAD")?
                .unwrap_or(default_limits.max_payload),
            max_conns_per_ip: positive_count(&env, "MAX_CONNS_PER_IP")?
                .unwrap_or(default_limits.max_conns_per_ip),
            max_global_conns: positive_count(&env, "MAX_GLOBAL_CONNS")?
                .unwrap_or(default_limits.max_global_conns),
            max_conn_rate_per_min: positive_count(&env, "MAX_CONN_RATE_PER_MIN")?
                .unwrap_or(default_limits.max_conn_rate_per_min),
            max_msg_rate_per_sec: positive_count(&env, "MAX_MSG_RATE_PER_SEC")?
                .unwrap_or(default_limits.max_msg_rate_per_sec),
            memory_threshold: memory_threshold(&env)?.unwrap_or(default_limits.memory_threshold),
        };

        Ok(Self {
            listen_addr,
            cors_origins,
            log_level,
            log_format,
            room_cleanup_interval,
            room_inactive_timeout,
            shutdown_grace_period,
            limits,
        })
    }
}

fn invalid(key: &'static str, value: String, expected: &'static str) -> ConfigError {
    ConfigError::Invalid { key, value, expected }
}

fn positive_count<F>(env: &F, key: &'static str) -> Result<Option<usize>, ConfigError>
where
    F: Fn(&str) -> Result<String, std::env::VarError>,
{
    let Ok(raw) = env(key) else {
        return Ok(None);
    };
    match raw.trim().parse::<usize>() {
        Ok(value) if value > 0 => Ok(Some(value)),
        _ => Err(invalid(key, raw, "must be a positive number")),
    }
}

fn positive_millis<F>(env: &F, key: &'static str) -> Result<Option<Duration>, ConfigError>
where
    F: Fn(&str) -> Result<String, std::env::VarError>,
{
    let Ok(raw) = env(key) else {
        return Ok(None);
    };
    match raw.trim().parse::<u64>() {
        Ok(value) if value > 0 => Ok(Some(Duration::from_millis(value))),
        _ => Err(invalid(key, raw, "must be a positive number (milliseconds)")),
    }
}

fn memory_threshold<F>(env: &F) -> Result<Option<f64>, ConfigError>
where
    F: Fn(&str) -> Result<String, std::env::VarError>,
{
    let Ok(raw) = env("MEMORY_THRESHOLD") else {
        return Ok(None);
    };
    match raw.trim().parse::<f64>() {
        Ok(value) if value > 0.0 && value <= 1.0 => Ok(Some(value)),
        _ => Err(invalid("MEMORY_THRESHOLD", raw, "must be between 0 and 1")),
    }
}

fn parse_origins(comma_separated: &str) -> Vec<String> {
    comma_separated
        .split(',')
        .map(str::trim)
        .filter(|origin| !origin.is_empty())
        .map(ToOwned::to_owned)
        .collect()
}
