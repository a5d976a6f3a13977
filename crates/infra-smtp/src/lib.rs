// Courier Infrastructure - SMTP Adapter
// Implements: EmailTransport

mod config;
mod transport;

pub use config::{SmtpConfig, TlsMode};
pub use transport::SmtpEmailTransport;
