// SQLite Connection Pool Setup

use courier_core::error::{AppError, Result};
use courier_core::port::BrokerConfig;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use tracing::debug;

fn is_in_memory(database_url: &str) -> bool {
    database_url.contains(":memory:") || database_url.contains("mode=memory")
}

/// Create SQLite connection pool with WAL mode and foreign keys
///
/// In-memory databases get a single long-lived connection: the database
/// disappears with its last connection and shared-cache tables lock per
/// connection.
///
/// # Errors
/// - AppError::Connection if the URL is invalid or the file cannot be opened
pub async fn create_pool(config: &BrokerConfig) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(&config.database_url)
        .map_err(|e| AppError::Connection(format!("{}: {}", config.database_url, e)))?
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(config.busy_timeout)
        .foreign_keys(true)
        .create_if_missing(true);

    let pool_options = if is_in_memory(&config.database_url) {
        SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
    } else {
        SqlitePoolOptions::new().max_connections(config.max_connections)
    };

    let pool = pool_options
        .connect_with(options)
        .await
        .map_err(|e| AppError::Connection(format!("{}: {}", config.database_url, e)))?;

    debug!(database_url = %config.database_url, "SQLite pool ready");
    Ok(pool)
}
