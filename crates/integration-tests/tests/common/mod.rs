//! Shared setup for the integration tests

#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use courier_core::application::WorkerOptions;
use courier_core::domain::{Job, JobId, JobState};
use courier_core::port::{Broker, BrokerConfig};
use courier_infra_sqlite::SqliteBroker;

pub async fn memory_broker() -> Arc<SqliteBroker> {
    let broker = SqliteBroker::connect(&BrokerConfig::new("sqlite::memory:"))
        .await
        .unwrap();
    Arc::new(broker)
}

pub fn fast_options() -> WorkerOptions {
    WorkerOptions {
        poll_interval: Duration::from_millis(10),
        error_backoff: Duration::from_millis(10),
    }
}

/// Poll `cond` until it holds, failing the test after five seconds
pub async fn eventually<F, Fut>(what: &str, cond: F)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let reached = tokio::time::timeout(Duration::from_secs(5), async {
        while !cond().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .is_ok();
    assert!(reached, "timed out waiting for {}", what);
}

pub async fn job(broker: &SqliteBroker, id: &JobId) -> Job {
    broker.get_job(id).await.unwrap().unwrap()
}

pub async fn wait_for_state(broker: &SqliteBroker, id: &JobId, state: JobState) -> Job {
    eventually(&format!("job {} to reach {}", id, state), || async move {
        job(broker, id).await.state == state
    })
    .await;
    job(broker, id).await
}
