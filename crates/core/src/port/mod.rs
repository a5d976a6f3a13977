// Port Layer - Interfaces for external dependencies

pub mod broker;
pub mod email_transport;
pub mod id_provider; // For deterministic testing
pub mod time_provider;

// Re-exports
pub use broker::{Broker, BrokerConfig, FailureOutcome};
pub use email_transport::{EmailTransport, TransportError};
pub use id_provider::IdProvider;
pub use time_provider::TimeProvider;
