//! Configuration module
//!
//! Loads configuration from environment variables.

use std::env;
use std::str::FromStr;

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            _ => Err(()),
        }
    }
}

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Database connection URL; without one the in-memory store is used
    pub database_url: Option<String>,

    /// Maximum database connections in pool
    pub database_max_connections: u32,

    /// Server host
    pub host: String,

    /// Server port
    pub port: u16,

    /// Environment (development, production)
    pub environment: String,

    pub log_format: LogFormat,

    /// Auto-transfer poll and stale transfer sweep interval
    pub scheduler_poll_secs: u64,

    pub accrual_interval_secs: u64,

    /// Buffer of the ledger event channel
    pub event_queue_capacity: usize,

    /// Age after which a non-terminal transfer is failed by the sweep
    pub stale_transfer_after_secs: u64,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load configuration through `lookup`, which returns a variable's value if set
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let database_url = lookup("DATABASE_URL").filter(|url| !url.trim().is_empty());

        let database_max_connections = parse_or(&lookup, "DATABASE_MAX_CONNECTIONS", 10)?;

        let host = lookup("HOST").unwrap_or_else(|| "127.0.0.1".to_string());

        let port = parse_or(&lookup, "PORT", 3000)?;

        let environment = lookup("ENVIRONMENT").unwrap_or_else(|| "development".to_string());
        if environment == "production" && database_url.is_none() {
            return Err(ConfigError::MissingEnv("DATABASE_URL"));
        }

        let log_format = parse_or(&lookup, "LOG_FORMAT", LogFormat::Pretty)?;

        let scheduler_poll_secs = parse_or(&lookup, "SCHEDULER_POLL_SECS", 60)?;
        let accrual_interval_secs = parse_or(&lookup, "ACCRUAL_INTERVAL_SECS", 86_400)?;
        let event_queue_capacity = parse_or(&lookup, "EVENT_QUEUE_CAPACITY", 1024)?;
        let stale_transfer_after_secs = parse_or(&lookup, "STALE_TRANSFER_AFTER_SECS", 300)?;

        if scheduler_poll_secs == 0 {
            return Err(ConfigError::InvalidValue("SCHEDULER_POLL_SECS"));
        }
        if accrual_interval_secs == 0 {
            return Err(ConfigError::InvalidValue("ACCRUAL_INTERVAL_SECS"));
        }
        if event_queue_capacity == 0 {
            return Err(ConfigError::InvalidValue("EVENT_QUEUE_CAPACITY"));
        }

        Ok(Self {
            database_url,
            database_max_connections,
            host,
            port,
            environment,
            log_format,
            scheduler_poll_secs,
            accrual_interval_secs,
            event_queue_capacity,
            stale_transfer_after_secs,
        })
    }

    /// Check if running in production
    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }
}

fn parse_or<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(name) {
        Some(value) => value.trim().parse().map_err(|_| ConfigError::InvalidValue(name)),
        None => Ok(default),
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingEnv(&'static str),

    #[error("Invalid value for environment variable: {0}")]
    InvalidValue(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        Config::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[]).unwrap();
        assert!(config.database_url.is_none());
        assert_eq!(config.database_max_connections, 10);
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 3000);
        assert_eq!(config.log_format, LogFormat::Pretty);
        assert_eq!(config.scheduler_poll_secs, 60);
        assert_eq!(config.accrual_interval_secs, 86_400);
        assert_eq!(config.event_queue_capacity, 1024);
        assert_eq!(config.stale_transfer_after_secs, 300);
        assert!(!config.is_production());
    }

    #[test]
    fn test_overrides() {
        let config = load(&[
            ("DATABASE_URL", "postgres://localhost/ledger"),
            ("PORT", "8080"),
            ("ENVIRONMENT", "production"),
            ("LOG_FORMAT", "JSON"),
            ("SCHEDULER_POLL_SECS", "5"),
        ])
        .unwrap();
        assert_eq!(config.database_url.as_deref(), Some("postgres://localhost/ledger"));
        assert_eq!(config.port, 8080);
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.scheduler_poll_secs, 5);
        assert!(config.is_production());
    }

    #[test]
    fn test_invalid_values() {
        assert!(matches!(load(&[("PORT", "http")]), Err(ConfigError::InvalidValue("PORT"))));
        assert!(matches!(
            load(&[("LOG_FORMAT", "xml")]),
            Err(ConfigError::InvalidValue("LOG_FORMAT"))
        ));
        assert!(matches!(
            load(&[("SCHEDULER_POLL_SECS", "0")]),
            Err(ConfigError::InvalidValue("SCHEDULER_POLL_SECS"))
        ));
    }

    #[test]
    fn test_production_requires_database() {
        assert!(matches!(
            load(&[("ENVIRONMENT", "production")]),
            Err(ConfigError::MissingEnv("DATABASE_URL"))
        ));
    }

    #[test]
    fn test_blank_database_url_means_memory() {
        let config = load(&[("DATABASE_URL", "  ")]).unwrap();
        assert!(config.database_url.is_none());
    }
}
