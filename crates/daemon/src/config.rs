// Daemon configuration from environment variables

use courier_core::application::{EMAIL_QUEUE, EMAIL_WORKER_CONCURRENCY, MAX_CONCURRENCY};
use courier_core::domain::validate_queue_name;
use courier_core::port::BrokerConfig;
use courier_core::AppError;
use courier_infra_smtp::SmtpConfig;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::logging::LogFormat;

pub const DEFAULT_DB_PATH: &str = "~/.courier/queue.db";
const DEFAULT_DB_MAX_CONNECTIONS: u32 = 10;
const DEFAULT_POLL_INTERVAL_MS: u64 = 100;
const DEFAULT_RETENTION_HOURS: u64 = 7 * 24;
const DEFAULT_CLEANUP_INTERVAL_SECS: u64 = 60 * 60;
const DEFAULT_RECOVERY_WINDOW_MS: i64 = 5 * 60 * 1000;
const DEFAULT_RECOVERY_INTERVAL_SECS: u64 = 60;
const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 10;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("{key} must be {expected}, got '{value}'")]
    Invalid {
        key: &'static str,
        value: String,
        expected: &'static str,
    },

    #[error(transparent)]
    Smtp(#[from] AppError),
}

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub db_path: String,
    pub db_max_connections: u32,
    pub email_queue: String,
    pub email_concurrency: usize,
    pub poll_interval: Duration,
    pub retention: Duration,
    pub cleanup_interval: Duration,
    pub recovery_window_ms: i64,
    pub recovery_interval: Duration,
    pub shutdown_grace: Duration,
    pub log_format: LogFormat,
    pub smtp: SmtpConfig,
}

impl DaemonConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration through `lookup`; empty values count as unset
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let db_path = get("COURIER_DB_PATH").unwrap_or_else(|| DEFAULT_DB_PATH.to_string());
        let db_path = shellexpand::tilde(&db_path).into_owned();

        let email_queue = get("COURIER_EMAIL_QUEUE").unwrap_or_else(|| EMAIL_QUEUE.to_string());
        if validate_queue_name(&email_queue).is_err() {
            return Err(ConfigError::Invalid {
                key: "COURIER_EMAIL_QUEUE",
                value: email_queue,
                expected: "a valid queue name",
            });
        }

        let email_concurrency = positive(
            &get,
            "COURIER_EMAIL_CONCURRENCY",
            EMAIL_WORKER_CONCURRENCY,
        )?;
        if email_concurrency > MAX_CONCURRENCY {
            return Err(ConfigError::Invalid {
                key: "COURIER_EMAIL_CONCURRENCY",
                value: email_concurrency.to_string(),
                expected: "at most u32::MAX",
            });
        }

        let retention_hours: u64 = parse(&get, "COURIER_RETENTION_HOURS", DEFAULT_RETENTION_HOURS)?;
        let retention_secs = retention_hours
            .checked_mul(3600)
            .ok_or_else(|| ConfigError::Invalid {
                key: "COURIER_RETENTION_HOURS",
                value: retention_hours.to_string(),
                expected: "a number of hours that fits in seconds",
            })?;

        Ok(Self {
            db_path,
            db_max_connections: positive(
                &get,
                "COURIER_DB_MAX_CONNECTIONS",
                DEFAULT_DB_MAX_CONNECTIONS,
            )?,
            email_queue,
            email_concurrency,
            poll_interval: Duration::from_millis(positive(
                &get,
                "COURIER_POLL_INTERVAL_MS",
                DEFAULT_POLL_INTERVAL_MS,
            )?),
            retention: Duration::from_secs(retention_secs),
            cleanup_interval: Duration::from_secs(positive(
                &get,
                "COURIER_CLEANUP_INTERVAL_SECS",
                DEFAULT_CLEANUP_INTERVAL_SECS,
            )?),
            recovery_window_ms: parse(
                &get,
                "COURIER_RECOVERY_WINDOW_MS",
                DEFAULT_RECOVERY_WINDOW_MS,
            )?,
            recovery_interval: Duration::from_secs(positive(
                &get,
                "COURIER_RECOVERY_INTERVAL_SECS",
                DEFAULT_RECOVERY_INTERVAL_SECS,
            )?),
            shutdown_grace: Duration::from_secs(parse(
                &get,
                "COURIER_SHUTDOWN_GRACE_SECS",
                DEFAULT_SHUTDOWN_GRACE_SECS,
            )?),
            log_format: LogFormat::parse(get("COURIER_LOG_FORMAT").as_deref()),
            smtp: SmtpConfig::from_lookup(&lookup)?,
        })
    }

    pub fn broker_config(&self) -> BrokerConfig {
        BrokerConfig::new(format!("sqlite://{}", self.db_path))
            .with_max_connections(self.db_max_connections)
    }
}

fn parse<G, T>(get: &G, key: &'static str, default: T) -> Result<T, ConfigError>
where
    G: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match get(key) {
        Some(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid {
            key,
            value: raw,
            expected: "a number",
        }),
        None => Ok(default),
    }
}

fn positive<G, T>(get: &G, key: &'static str, default: T) -> Result<T, ConfigError>
where
    G: Fn(&str) -> Option<String>,
    T: FromStr + PartialOrd + Default + ToString,
{
    let value = parse(get, key, default)?;
    if value <= T::default() {
        return Err(ConfigError::Invalid {
            key,
            value: value.to_string(),
            expected: "greater than zero",
        });
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<DaemonConfig, ConfigError> {
        let mut map: HashMap<String, String> = [
            ("SMTP_HOST", "smtp.example.com"),
            ("SMTP_USER", "sender@example.com"),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        for (k, v) in vars {
            map.insert(k.to_string(), v.to_string());
        }
        DaemonConfig::from_lookup(move |key| map.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config(&[]).unwrap();

        assert!(config.db_path.ends_with(".courier/queue.db"));
        assert!(!config.db_path.starts_with('~'));
        assert_eq!(config.email_queue, "email-queue");
        assert_eq!(config.email_concurrency, 3);
        assert_eq!(config.poll_interval, Duration::from_millis(100));
        assert_eq!(config.retention, Duration::from_secs(168 * 3600));
        assert_eq!(config.cleanup_interval, Duration::from_secs(3600));
        assert_eq!(config.recovery_window_ms, 300_000);
        assert_eq!(config.recovery_interval, Duration::from_secs(60));
        assert_eq!(config.shutdown_grace, Duration::from_secs(10));
        assert_eq!(config.log_format, LogFormat::Pretty);
        assert_eq!(config.smtp.port, 587);
    }

    #[test]
    fn test_overrides() {
        let config = config(&[
            ("COURIER_DB_PATH", "/var/lib/courier/queue.db"),
            ("COURIER_DB_MAX_CONNECTIONS", "4"),
            ("COURIER_EMAIL_QUEUE", "mail"),
            ("COURIER_EMAIL_CONCURRENCY", "8"),
            ("COURIER_LOG_FORMAT", "json"),
        ])
        .unwrap();

        assert_eq!(config.email_queue, "mail");
        assert_eq!(config.email_concurrency, 8);
        assert_eq!(config.log_format, LogFormat::Json);

        let broker = config.broker_config();
        assert_eq!(broker.database_url, "sqlite:///var/lib/courier/queue.db");
        assert_eq!(broker.max_connections, 4);
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let err = config(&[("COURIER_EMAIL_CONCURRENCY", "0")]).unwrap_err();
        assert!(err.to_string().contains("COURIER_EMAIL_CONCURRENCY"));
    }

    #[test]
    fn test_oversized_concurrency_rejected() {
        let too_many = (MAX_CONCURRENCY as u128 + 1).to_string();
        let err = config(&[("COURIER_EMAIL_CONCURRENCY", too_many.as_str())]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "COURIER_EMAIL_CONCURRENCY", .. }));
    }

    #[test]
    fn test_retention_overflow_rejected() {
        let hours = u64::MAX.to_string();
        let err = config(&[("COURIER_RETENTION_HOURS", hours.as_str())]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "COURIER_RETENTION_HOURS", .. }));

        let config = config(&[("COURIER_RETENTION_HOURS", "48")]).unwrap();
        assert_eq!(config.retention, Duration::from_secs(48 * 3600));
    }

    #[test]
    fn test_non_numeric_rejected() {
        let err = config(&[("COURIER_POLL_INTERVAL_MS", "fast")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "COURIER_POLL_INTERVAL_MS", .. }));
    }

    #[test]
    fn test_invalid_queue_name_rejected() {
        assert!(config(&[("COURIER_EMAIL_QUEUE", "bad queue")]).is_err());
    }

    #[test]
    fn test_missing_smtp_host_is_error() {
        let result = DaemonConfig::from_lookup(|_| None);
        assert!(matches!(result, Err(ConfigError::Smtp(_))));
    }
}
