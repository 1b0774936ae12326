//! # Configuration Management Module
//!
//! All runtime configuration comes from the process environment. This module
//! reads and validates it into typed section structs so the rest of the crate
//! never touches `std::env`.
//!
//! ## Sections
//!
//! - [`MqttConfig`] - broker endpoint, credentials, TLS, root topic
//! - [`ApiConfig`] - HTTP bind address and debug flag
//! - [`MeshtasticConfig`] - radio link, decryption keys, command bot tuning
//! - [`ScheduleConfig`] - daily DM and broadcast times (UTC)
//! - [`GroupingConfig`] - packet grouper window / quiescence / retention
//!
//! ## Precedence and validation
//!
//! Every option has either a required presence check or a documented default.
//! Integer options are range-checked on load; a bad value is a startup error,
//! not a runtime surprise. `MQTT_SERVER` and `MQTT_ROOT_TOPIC` are the only
//! required variables.
//!
//! Parsing helpers are pure functions over `Option<&str>` so they can be unit
//! tested without mutating process state.

use anyhow::{anyhow, Result};

/// Well-known Meshtastic public channel key (base64, AES-128).
pub const DEFAULT_CHANNEL_KEY: &str = "1PG7OiApB1nwvP+rz05pAQ==";

#[derive(Debug, Clone)]
pub struct Config {
    pub mqtt: MqttConfig,
    pub database_url: String,
    pub api: ApiConfig,
    pub meshtastic: MeshtasticConfig,
    pub schedule: ScheduleConfig,
    pub grouping: GroupingConfig,
    pub log_level: String,
    pub log_retention_days: u32,
    pub dashboard_dir: String,
}

#[derive(Debug, Clone)]
pub struct MqttConfig {
    pub server: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub root_topic: String,
    pub tls_enabled: bool,
    pub tls_insecure: bool,
}

#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
    pub debug: bool,
}

#[derive(Debug, Clone)]
pub struct MeshtasticConfig {
    /// Radio endpoint, e.g. `tcp://192.168.1.20:4403`.
    pub connection_url: Option<String>,
    pub commands_enabled: bool,
    /// Channel index (0-7) command replies are echoed to; 0 disables the echo.
    pub stats_channel_id: u8,
    /// Extra base64 AES keys for envelope decryption, in trial order.
    pub decryption_keys: Vec<String>,
    pub include_default_key: bool,
    pub default_key: Option<String>,
    /// Sliding-window rate limit for bot commands.
    pub rate_limit_seconds: u64,
    pub rate_limit_burst: u32,
    /// Maximum DM payload per chunk, bytes.
    pub max_message_bytes: usize,
    /// Pause between reply chunks, seconds.
    pub inter_chunk_delay_seconds: u64,
}

#[derive(Debug, Clone)]
pub struct ScheduleConfig {
    pub subscription_send_hour: u8,
    pub subscription_send_minute: u8,
    pub broadcast_enabled: bool,
    pub broadcast_hour: u8,
    pub broadcast_minute: u8,
    pub broadcast_channel: u8,
}

#[derive(Debug, Clone)]
pub struct GroupingConfig {
    /// Grouping window W, seconds.
    pub window_seconds: u64,
    /// Quiescence Q, seconds. Must be < window. 0 reproduces fixed-window closes.
    pub quiescence_seconds: u64,
    /// Late-arrival retention R, hours.
    pub late_retention_hours: u64,
}

impl Config {
    /// Load and validate configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        let env = |name: &str| std::env::var(name).ok();
        Self::from_lookup(&env)
    }

    /// Build a config from an arbitrary lookup function. Split out from
    /// [`Config::from_env`] so tests can feed synthetic environments.
    pub fn from_lookup(env: &dyn Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |name: &str| env(name).filter(|v| !v.trim().is_empty());

        let server = get("MQTT_SERVER")
            .ok_or_else(|| anyhow!("missing required environment variable MQTT_SERVER"))?;
        let root_topic = get("MQTT_ROOT_TOPIC")
            .ok_or_else(|| anyhow!("missing required environment variable MQTT_ROOT_TOPIC"))?;

        let window_seconds = parse_int(
            get("GROUPING_WINDOW_SECONDS").as_deref(),
            "GROUPING_WINDOW_SECONDS",
            10,
            1,
            600,
        )? as u64;
        let quiescence_seconds = parse_int(
            get("GROUPING_QUIESCENCE_SECONDS").as_deref(),
            "GROUPING_QUIESCENCE_SECONDS",
            2,
            0,
            600,
        )? as u64;
        if quiescence_seconds >= window_seconds {
            return Err(anyhow!(
                "GROUPING_QUIESCENCE_SECONDS ({}) must be less than GROUPING_WINDOW_SECONDS ({})",
                quiescence_seconds,
                window_seconds
            ));
        }

        Ok(Config {
            mqtt: MqttConfig {
                server,
                username: get("MQTT_USERNAME"),
                password: get("MQTT_PASSWORD"),
                root_topic,
                tls_enabled: parse_bool(get("MQTT_TLS_ENABLED").as_deref(), false),
                tls_insecure: parse_bool(get("MQTT_TLS_INSECURE").as_deref(), false),
            },
            database_url: get("DATABASE_URL")
                .unwrap_or_else(|| "sqlite://meshstats.db".to_string()),
            api: ApiConfig {
                host: get("API_HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
                port: parse_int(get("API_PORT").as_deref(), "API_PORT", 8000, 1, 65535)? as u16,
                debug: parse_bool(get("API_DEBUG").as_deref(), false),
            },
            meshtastic: MeshtasticConfig {
                connection_url: get("MESHTASTIC_CONNECTION_URL"),
                commands_enabled: parse_bool(
                    get("MESHTASTIC_COMMANDS_ENABLED").as_deref(),
                    false,
                ),
                stats_channel_id: parse_int(
                    get("MESHTASTIC_STATS_CHANNEL_ID").as_deref(),
                    "MESHTASTIC_STATS_CHANNEL_ID",
                    0,
                    0,
                    7,
                )? as u8,
                decryption_keys: parse_csv(get("MESHTASTIC_DECRYPTION_KEYS").as_deref()),
                include_default_key: parse_bool(
                    get("MESHTASTIC_INCLUDE_DEFAULT_KEY").as_deref(),
                    true,
                ),
                default_key: get("MESHTASTIC_DEFAULT_KEY"),
                rate_limit_seconds: parse_int(
                    get("MESHTASTIC_RATE_LIMIT_SECONDS").as_deref(),
                    "MESHTASTIC_RATE_LIMIT_SECONDS",
                    60,
                    1,
                    3600,
                )? as u64,
                rate_limit_burst: parse_int(
                    get("MESHTASTIC_RATE_LIMIT_BURST").as_deref(),
                    "MESHTASTIC_RATE_LIMIT_BURST",
                    5,
                    1,
                    50,
                )? as u32,
                max_message_bytes: parse_int(
                    get("MESHTASTIC_MAX_MESSAGE_BYTES").as_deref(),
                    "MESHTASTIC_MAX_MESSAGE_BYTES",
                    200,
                    50,
                    230,
                )? as usize,
                inter_chunk_delay_seconds: parse_int(
                    get("MESHTASTIC_INTER_CHUNK_DELAY_SECONDS").as_deref(),
                    "MESHTASTIC_INTER_CHUNK_DELAY_SECONDS",
                    5,
                    0,
                    60,
                )? as u64,
            },
            schedule: ScheduleConfig {
                subscription_send_hour: parse_int(
                    get("SUBSCRIPTION_SEND_HOUR").as_deref(),
                    "SUBSCRIPTION_SEND_HOUR",
                    9,
                    0,
                    23,
                )? as u8,
                subscription_send_minute: parse_int(
                    get("SUBSCRIPTION_SEND_MINUTE").as_deref(),
                    "SUBSCRIPTION_SEND_MINUTE",
                    0,
                    0,
                    59,
                )? as u8,
                broadcast_enabled: parse_bool(get("DAILY_BROADCAST_ENABLED").as_deref(), false),
                broadcast_hour: parse_int(
                    get("DAILY_BROADCAST_HOUR").as_deref(),
                    "DAILY_BROADCAST_HOUR",
                    21,
                    0,
                    23,
                )? as u8,
                broadcast_minute: parse_int(
                    get("DAILY_BROADCAST_MINUTE").as_deref(),
                    "DAILY_BROADCAST_MINUTE",
                    0,
                    0,
                    59,
                )? as u8,
                broadcast_channel: parse_int(
                    get("DAILY_BROADCAST_CHANNEL").as_deref(),
                    "DAILY_BROADCAST_CHANNEL",
                    0,
                    0,
                    7,
                )? as u8,
            },
            grouping: GroupingConfig {
                window_seconds,
                quiescence_seconds,
                late_retention_hours: parse_int(
                    get("LATE_RETENTION_HOURS").as_deref(),
                    "LATE_RETENTION_HOURS",
                    24,
                    1,
                    876_000,
                )? as u64,
            },
            log_level: get("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            log_retention_days: parse_int(
                get("LOG_RETENTION_DAYS").as_deref(),
                "LOG_RETENTION_DAYS",
                7,
                1,
                365,
            )? as u32,
            dashboard_dir: get("DASHBOARD_DIR").unwrap_or_else(|| "./dashboard".to_string()),
        })
    }
}

/// Truthy values: `1`, `true`, `yes`, `on` (case-insensitive).
pub fn parse_bool(raw: Option<&str>, default: bool) -> bool {
    match raw {
        None => default,
        Some(v) => matches!(
            v.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
    }
}

/// Parse an integer option with inclusive bounds. Empty/absent yields the default.
pub fn parse_int(
    raw: Option<&str>,
    name: &str,
    default: i64,
    min: i64,
    max: i64,
) -> Result<i64> {
    let value = match raw {
        None => default,
        Some(v) if v.trim().is_empty() => default,
        Some(v) => v
            .trim()
            .parse::<i64>()
            .map_err(|_| anyhow!("environment variable {} must be an integer, got {:?}", name, v))?,
    };
    if value < min {
        return Err(anyhow!("{} must be >= {}", name, min));
    }
    if value > max {
        return Err(anyhow!("{} must be <= {}", name, max));
    }
    Ok(value)
}

/// Split a comma-separated option, trimming blanks.
pub fn parse_csv(raw: Option<&str>) -> Vec<String> {
    raw.map(|v| {
        v.split(',')
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .collect()
    })
    .unwrap_or_default()
}
