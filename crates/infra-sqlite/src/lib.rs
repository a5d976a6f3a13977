// Courier Infrastructure - SQLite Adapter
// Implements: Broker

mod broker;
mod connection;
mod error;
mod migration;

pub use broker::SqliteBroker;
pub use connection::create_pool;
pub use error::map_sqlx_error;
pub use migration::run_migrations;
