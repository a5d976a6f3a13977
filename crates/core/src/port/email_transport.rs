// Email Transport Port
// Abstraction over the outgoing mail channel (SMTP in production)

use async_trait::async_trait;
use thiserror::Error;

/// Transport errors
///
/// `Send` displays the underlying message unchanged so failed jobs carry it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Failed to build message: {0}")]
    Build(String),

    #[error("{0}")]
    Send(String),
}

/// Email Transport trait
///
/// Implementations:
/// - SmtpEmailTransport (courier-infra-smtp)
/// - mocks::MockEmailTransport (tests)
#[async_trait]
pub trait EmailTransport: Send + Sync {
    /// Send a plain-text email
    ///
    /// # Errors
    /// - TransportError::InvalidAddress if `to` cannot be parsed
    /// - TransportError::Send if the server rejects or the connection fails
    async fn send_mail(&self, to: &str, subject: &str, text: &str) -> Result<(), TransportError>;
}

// ============================================================================
// Mock Implementations for Testing
// ============================================================================

pub mod mocks {
    use super::*;
    use crate::domain::EmailMessage;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::sync::Semaphore;

    /// Mock transport behavior
    #[derive(Debug, Clone)]
    pub enum MockBehavior {
        /// Always succeed
        Success,
        /// Always fail with message
        Fail(String),
        /// Wait until `release` is called, then succeed
        Block,
    }

    /// Mock Email Transport for testing
    pub struct MockEmailTransport {
        behavior: Mutex<MockBehavior>,
        calls: Mutex<Vec<EmailMessage>>,
        gate: Semaphore,
        in_flight: AtomicUsize,
        peak_in_flight: AtomicUsize,
    }

    impl MockEmailTransport {
        pub fn new(behavior: MockBehavior) -> Self {
            Self {
                behavior: Mutex::new(behavior),
                calls: Mutex::new(Vec::new()),
                gate: Semaphore::new(0),
                in_flight: AtomicUsize::new(0),
                peak_in_flight: AtomicUsize::new(0),
            }
        }
        pub fn new_success() -> Self {
            Self::new(MockBehavior::Success)
        }
        pub fn new_fail(message: impl Into<String>) -> Self {
            Self::new(MockBehavior::Fail(message.into()))
        }
        pub fn new_blocking() -> Self {
            Self::new(MockBehavior::Block)
        }
        pub fn set_behavior(&self, behavior: MockBehavior) {
            *self.behavior.lock().unwrap() = behavior;
        }
        /// Let `n` blocked sends finish
        pub fn release(&self, n: usize) {
            self.gate.add_permits(n);
        }
        pub fn calls(&self) -> Vec<EmailMessage> {
            self.calls.lock().unwrap().clone()
        }
        pub fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
        pub fn in_flight(&self) -> usize {
            self.in_flight.load(Ordering::SeqCst)
        }
        pub fn peak_in_flight(&self) -> usize {
            self.peak_in_flight.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl EmailTransport for MockEmailTransport {
        async fn send_mail(
            &self,
            to: &str,
            subject: &str,
            text: &str,
        ) -> Result<(), TransportError> {
            self.calls
                .lock()
                .unwrap()
                .push(EmailMessage::new(to, subject, text));

            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak_in_flight.fetch_max(now, Ordering::SeqCst);

            let behavior = self.behavior.lock().unwrap().clone();
            let result = match behavior {
                MockBehavior::Success => Ok(()),
                MockBehavior::Fail(msg) => Err(TransportError::Send(msg)),
                MockBehavior::Block => match self.gate.acquire().await {
                    Ok(permit) => {
                        permit.forget();
                        Ok(())
                    }
                    Err(_) => Err(TransportError::Send("gate closed".to_string())),
                },
            };

            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            result
        }
    }
}
