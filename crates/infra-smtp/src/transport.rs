// SMTP EmailTransport Implementation

use crate::config::{SmtpConfig, TlsMode};
use async_trait::async_trait;
use courier_core::error::{AppError, Result};
use courier_core::port::{EmailTransport, TransportError};
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use tracing::{debug, info};

/// Sends plain-text mail through one SMTP relay
///
/// The underlying lettre transport pools connections, so one instance is
/// shared by every email job.
pub struct SmtpEmailTransport {
    mailer: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl SmtpEmailTransport {
    /// Build the transport; no connection is opened until the first send
    ///
    /// # Errors
    /// - AppError::Config if the sender address or relay host is invalid
    pub fn new(config: &SmtpConfig) -> Result<Self> {
        let from: Mailbox = config.from.parse().map_err(|e| {
            AppError::Config(format!("invalid sender address '{}': {}", config.from, e))
        })?;

        let builder = match config.tls {
            TlsMode::StartTls => AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)
                .map_err(|e| AppError::Config(format!("SMTP relay {}: {}", config.host, e)))?,
            TlsMode::Tls => AsyncSmtpTransport::<Tokio1Executor>::relay(&config.host)
                .map_err(|e| AppError::Config(format!("SMTP relay {}: {}", config.host, e)))?,
            TlsMode::None => AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.host),
        };

        let mut builder = builder.port(config.port);
        if let Some(user) = &config.user {
            let password = config.password.clone().unwrap_or_default();
            builder = builder.credentials(Credentials::new(user.clone(), password));
        }

        info!(
            host = %config.host,
            port = config.port,
            tls = ?config.tls,
            from = %config.from,
            "SMTP transport configured"
        );

        Ok(Self {
            mailer: builder.build(),
            from,
        })
    }

    /// Check that the relay accepts connections
    pub async fn test_connection(&self) -> Result<bool> {
        self.mailer
            .test_connection()
            .await
            .map_err(|e| AppError::Connection(e.to_string()))
    }

    fn build_message(
        &self,
        to: &str,
        subject: &str,
        text: &str,
    ) -> std::result::Result<Message, TransportError> {
        let to: Mailbox = to
            .parse()
            .map_err(|_| TransportError::InvalidAddress(to.to_string()))?;

        Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(subject)
            .header(ContentType::TEXT_PLAIN)
            .body(text.to_string())
            .map_err(|e| TransportError::Build(e.to_string()))
    }
}

#[async_trait]
impl EmailTransport for SmtpEmailTransport {
    async fn send_mail(
        &self,
        to: &str,
        subject: &str,
        text: &str,
    ) -> std::result::Result<(), TransportError> {
        let message = self.build_message(to, subject, text)?;

        let response = self
            .mailer
            .send(message)
            .await
            .map_err(|e| TransportError::Send(e.to_string()))?;

        debug!(to = %to, code = %response.code(), "SMTP relay accepted message");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // The pooled transport spawns onto the runtime, hence tokio tests throughout
    fn config(tls: TlsMode) -> SmtpConfig {
        SmtpConfig {
            host: "localhost".to_string(),
            port: 1025,
            user: Some("sender@example.com".to_string()),
            password: Some("secret".to_string()),
            from: "sender@example.com".to_string(),
            tls,
        }
    }

    #[tokio::test]
    async fn test_builds_for_every_tls_mode() {
        for tls in [TlsMode::StartTls, TlsMode::Tls, TlsMode::None] {
            assert!(SmtpEmailTransport::new(&config(tls)).is_ok());
        }
    }

    #[tokio::test]
    async fn test_invalid_sender_is_config_error() {
        let mut config = config(TlsMode::None);
        config.from = "not an address".to_string();
        assert!(matches!(
            SmtpEmailTransport::new(&config),
            Err(AppError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_message_headers() {
        let transport = SmtpEmailTransport::new(&config(TlsMode::None)).unwrap();
        let message = transport
            .build_message("test@example.com", "Hello", "World!")
            .unwrap();

        let raw = String::from_utf8(message.formatted()).unwrap();
        assert!(raw.contains("From: sender@example.com"));
        assert!(raw.contains("To: test@example.com"));
        assert!(raw.contains("Subject: Hello"));
        assert!(raw.contains("text/plain"));
        assert!(raw.contains("World!"));
    }

    #[tokio::test]
    async fn test_invalid_recipient() {
        let transport = SmtpEmailTransport::new(&config(TlsMode::None)).unwrap();
        let err = transport
            .build_message("not-an-email", "Hello", "World!")
            .unwrap_err();
        assert_eq!(err, TransportError::InvalidAddress("not-an-email".to_string()));
    }

    #[tokio::test]
    async fn test_unreachable_relay_is_send_error() {
        let mut config = config(TlsMode::None);
        config.port = 1;
        let transport = SmtpEmailTransport::new(&config).unwrap();

        let err = transport
            .send_mail("test@example.com", "Hello", "World!")
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Send(_)));
    }
}
