// Stalled job recovery
use crate::application::worker::ShutdownToken;
use crate::error::Result;
use crate::port::Broker;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, Instant};
use tracing::{debug, error, info, warn};

use crate::application::worker::constants::DEFAULT_RECOVERY_WINDOW_MS;

/// Recovery service
///
/// Returns jobs left ACTIVE by a crashed process, or whose outcome could not
/// be recorded, to the queue so another worker can claim them. Runs once on
/// startup and then periodically.
pub struct RecoveryService {
    broker: Arc<dyn Broker>,
    recovery_window_ms: i64,
}

impl RecoveryService {
    /// Create a new recovery service
    ///
    /// # Arguments
    /// * `broker` - Shared broker
    /// * `recovery_window_ms` - Optional custom stall window (default: 5 minutes)
    pub fn new(broker: Arc<dyn Broker>, recovery_window_ms: Option<i64>) -> Self {
        Self {
            broker,
            recovery_window_ms: recovery_window_ms.unwrap_or(DEFAULT_RECOVERY_WINDOW_MS),
        }
    }

    pub fn recovery_window_ms(&self) -> i64 {
        self.recovery_window_ms
    }

    /// Move jobs ACTIVE for longer than the window back to WAITING
    ///
    /// # Returns
    /// Number of jobs recovered
    pub async fn recover_stalled_jobs(&self) -> Result<u64> {
        debug!(
            recovery_window_ms = self.recovery_window_ms,
            "Starting stalled job recovery"
        );

        let recovered = self.broker.recover_stalled(self.recovery_window_ms).await?;

        if recovered > 0 {
            warn!(recovered, "Stalled jobs returned to their queues");
        } else {
            debug!("No stalled jobs found");
        }
        Ok(recovered)
    }

    /// Recover stalled jobs every `period` until shutdown (background task)
    ///
    /// The first pass runs one `period` after start.
    pub async fn run(self, period: Duration, mut shutdown: ShutdownToken) {
        info!(
            interval_secs = period.as_secs(),
            recovery_window_ms = self.recovery_window_ms,
            "Stalled job recovery scheduled"
        );

        let mut tick = interval_at(Instant::now() + period, period);

        loop {
            tokio::select! {
                _ = tick.tick() => {}
                _ = shutdown.wait() => break,
            }

            if let Err(e) = self.recover_stalled_jobs().await {
                error!(error = %e, "Scheduled stalled job recovery failed");
            }
        }

        info!("Stalled job recovery stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::worker::shutdown_channel;
    use crate::domain::{JobState, NewJob};
    use crate::port::broker::mocks::InMemoryBroker;
    use serde_json::json;

    #[tokio::test]
    async fn test_active_jobs_go_back_to_waiting() {
        let broker = Arc::new(InMemoryBroker::new());
        broker
            .add_job(NewJob::new("job", "q", json!({})))
            .await
            .unwrap();
        let claimed = broker.claim_next("q").await.unwrap().unwrap();
        assert_eq!(claimed.state, JobState::Active);

        let service = RecoveryService::new(broker.clone(), Some(0));
        assert_eq!(service.recover_stalled_jobs().await.unwrap(), 1);

        let job = broker.get_job(&claimed.id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Waiting);
    }

    #[tokio::test]
    async fn test_nothing_to_recover() {
        let broker = Arc::new(InMemoryBroker::new());
        let service = RecoveryService::new(broker, None);
        assert_eq!(service.recovery_window_ms(), DEFAULT_RECOVERY_WINDOW_MS);
        assert_eq!(service.recover_stalled_jobs().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_periodic_recovery_until_shutdown() {
        let broker = Arc::new(InMemoryBroker::new());
        let id = broker
            .add_job(NewJob::new("job", "q", json!({})))
            .await
            .unwrap();
        broker.claim_next("q").await.unwrap().unwrap();

        let (stop, token) = shutdown_channel();
        let service = RecoveryService::new(broker.clone(), Some(0));
        let task = tokio::spawn(service.run(Duration::from_millis(10), token));

        tokio::time::timeout(Duration::from_secs(5), async {
            while broker.get_job(&id).await.unwrap().unwrap().state != JobState::Waiting {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("job not recovered in time");

        stop.shutdown();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("recovery loop did not stop")
            .unwrap();
    }
}
