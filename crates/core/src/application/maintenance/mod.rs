// Cleanup Scheduler
// Periodically removes finished jobs past their retention

use crate::application::queue::QueueRegistry;
use crate::application::worker::ShutdownToken;
use crate::domain::JobState;
use crate::error::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tracing::{error, info};

/// Cleanup scheduler
///
/// Deletes COMPLETED and FAILED jobs older than the retention period from
/// every configured queue.
pub struct CleanupScheduler {
    registry: Arc<QueueRegistry>,
    queues: Vec<String>,
    retention: Duration,
    interval: Duration,
}

impl CleanupScheduler {
    /// Create a new cleanup scheduler
    ///
    /// # Arguments
    /// * `registry` - Queue registry owning the handles
    /// * `queues` - Queue names to clean
    /// * `retention` - How long finished jobs are kept
    /// * `interval` - How often cleanup runs
    pub fn new(
        registry: Arc<QueueRegistry>,
        queues: Vec<String>,
        retention: Duration,
        interval: Duration,
    ) -> Self {
        Self {
            registry,
            queues,
            retention,
            interval,
        }
    }

    /// Run cleanup loop until shutdown (background task)
    pub async fn run(self, mut shutdown: ShutdownToken) {
        info!(
            interval_secs = self.interval.as_secs(),
            retention_secs = self.retention.as_secs(),
            queues = ?self.queues,
            "Cleanup scheduler started"
        );

        let mut tick = interval(self.interval);

        loop {
            tokio::select! {
                _ = tick.tick() => {}
                _ = shutdown.wait() => break,
            }

            match self.run_now().await {
                Ok(removed) => info!(removed, "Scheduled cleanup completed"),
                Err(e) => error!(error = %e, "Scheduled cleanup failed"),
            }
        }

        info!("Cleanup scheduler stopped");
    }

    /// Run cleanup immediately, returning the number of jobs removed
    pub async fn run_now(&self) -> Result<u64> {
        let mut removed = 0;
        for name in &self.queues {
            let queue = self.registry.get_or_create_queue(name)?;
            for state in [JobState::Completed, JobState::Failed] {
                removed += queue.clean(self.retention, state).await?;
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::worker::shutdown_channel;
    use crate::port::broker::mocks::InMemoryBroker;
    use crate::port::Broker;
    use serde_json::json;

    #[tokio::test]
    async fn test_run_now_removes_only_finished_jobs() {
        let broker = Arc::new(InMemoryBroker::new());
        let registry = Arc::new(QueueRegistry::new(broker.clone()));

        let done = registry.enqueue("q", "done", json!({}), None).await.unwrap();
        registry.enqueue("q", "pending", json!({}), None).await.unwrap();
        let claimed = broker.claim_next("q").await.unwrap().unwrap();
        assert_eq!(claimed.id, done);
        broker.complete(&done, json!(null)).await.unwrap();

        let scheduler = CleanupScheduler::new(
            registry,
            vec!["q".to_string()],
            Duration::ZERO,
            Duration::from_secs(3600),
        );
        assert_eq!(scheduler.run_now().await.unwrap(), 1);

        let jobs = broker.jobs();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].name, "pending");
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let broker = Arc::new(InMemoryBroker::new());
        let registry = Arc::new(QueueRegistry::new(broker));
        let scheduler = CleanupScheduler::new(
            registry,
            vec!["q".to_string()],
            Duration::ZERO,
            Duration::from_secs(3600),
        );

        let (tx, token) = shutdown_channel();
        let task = tokio::spawn(scheduler.run(token));
        tx.shutdown();

        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("scheduler should stop")
            .unwrap();
    }
}
