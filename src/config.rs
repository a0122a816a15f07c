use std::path::PathBuf;
use std::str::FromStr;

use crate::clock::ReferenceZone;
use crate::limits::MIN_SLOT_GRANULARITY_MINUTES;
use crate::model::MinuteRange;

/// Policy knobs of the scheduling core. Loaded once at startup, read-only afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemConfig {
    pub min_cancellation_hours: i64,
    pub min_reschedule_hours: i64,
    pub slot_granularity_minutes: u32,
    /// Grace period: client slots starting sooner than `now + lead` are not offered.
    pub min_lead_minutes: u32,
    /// Mon–Sat hours used when the catalog carries no weekly schedule.
    pub default_hours: MinuteRange,
    pub zone: ReferenceZone,
    /// Treat regional holidays as full closures instead of annotations.
    pub regional_holidays_close: bool,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            min_cancellation_hours: 8,
            min_reschedule_hours: 8,
            slot_granularity_minutes: 60,
            min_lead_minutes: 30,
            default_hours: MinuteRange::new(540, 1080),
            zone: ReferenceZone::utc(),
            regional_holidays_close: false,
        }
    }
}

impl SystemConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let open = env_or("SALOND_DEFAULT_OPEN", defaults.default_hours.start)?;
        let close = env_or("SALOND_DEFAULT_CLOSE", defaults.default_hours.end)?;
        if open >= close || close > MinuteRange::DAY_END {
            return Err(ConfigError::Invalid {
                key: "SALOND_DEFAULT_OPEN/SALOND_DEFAULT_CLOSE",
                reason: format!("[{open}, {close}) is not a valid minute-of-day range"),
            });
        }
        let offset: i32 = env_or("SALOND_UTC_OFFSET_MINUTES", 0)?;
        let zone = ReferenceZone::from_minutes(offset).ok_or_else(|| ConfigError::Invalid {
            key: "SALOND_UTC_OFFSET_MINUTES",
            reason: format!("offset {offset} out of range"),
        })?;

        let config = Self {
            min_cancellation_hours: env_or(
                "SALOND_MIN_CANCELLATION_HOURS",
                defaults.min_cancellation_hours,
            )?,
            min_reschedule_hours: env_or(
                "SALOND_MIN_RESCHEDULE_HOURS",
                defaults.min_reschedule_hours,
            )?,
            slot_granularity_minutes: env_or(
                "SALOND_SLOT_GRANULARITY_MINUTES",
                defaults.slot_granularity_minutes,
            )?,
            min_lead_minutes: env_or("SALOND_MIN_LEAD_MINUTES", defaults.min_lead_minutes)?,
            default_hours: MinuteRange::new(open, close),
            zone,
            regional_holidays_close: env_or(
                "SALOND_REGIONAL_HOLIDAYS_CLOSE",
                defaults.regional_holidays_close,
            )?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.slot_granularity_minutes < MIN_SLOT_GRANULARITY_MINUTES {
            return Err(ConfigError::Invalid {
                key: "SALOND_SLOT_GRANULARITY_MINUTES",
                reason: format!("must be at least {MIN_SLOT_GRANULARITY_MINUTES}"),
            });
        }
        if self.min_cancellation_hours < 0 || self.min_reschedule_hours < 0 {
            return Err(ConfigError::Invalid {
                key: "SALOND_MIN_CANCELLATION_HOURS/SALOND_MIN_RESCHEDULE_HOURS",
                reason: "notice windows cannot be negative".into(),
            });
        }
        Ok(())
    }
}

/// Daemon knobs: listener, storage, security, metrics.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub catalog_path: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let metrics_port = match std::env::var("SALOND_METRICS_PORT") {
            Ok(raw) => Some(parse_value("SALOND_METRICS_PORT", &raw)?),
            Err(_) => None,
        };
        Ok(Self {
            bind: std::env::var("SALOND_BIND").unwrap_or_else(|_| "0.0.0.0".into()),
            port: env_or("SALOND_PORT", 5433)?,
            data_dir: PathBuf::from(
                std::env::var("SALOND_DATA_DIR").unwrap_or_else(|_| "./data".into()),
            ),
            catalog_path: PathBuf::from(
                std::env::var("SALOND_CATALOG").unwrap_or_else(|_| "./catalog.json".into()),
            ),
            password: std::env::var("SALOND_PASSWORD").unwrap_or_else(|_| "salond".into()),
            max_connections: env_or("SALOND_MAX_CONNECTIONS", 256)?,
            compact_threshold: env_or("SALOND_COMPACT_THRESHOLD", 1000)?,
            metrics_port,
            tls_cert: std::env::var("SALOND_TLS_CERT").ok(),
            tls_key: std::env::var("SALOND_TLS_KEY").ok(),
        })
    }
}

fn env_or<T: FromStr>(key: &'static str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => parse_value(key, &raw),
        Err(_) => Ok(default),
    }
}

fn parse_value<T: FromStr>(key: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
        key,
        reason: format!("{raw:?}: {e}"),
    })
}

#[derive(Debug)]
pub enum ConfigError {
    Invalid { key: &'static str, reason: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Invalid { key, reason } => write!(f, "invalid {key}: {reason}"),
        }
    }
}

impl std::error::Error for ConfigError {}
