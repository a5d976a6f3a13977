//! Email worker end to end over the SQLite broker
//!
//! Producer side: QueueRegistry. Consumer side: EmailListener on a
//! WorkerRuntime, with the mock SMTP transport.

mod common;

use std::sync::Arc;
use std::time::Duration;

use courier_core::application::email::SEND_EMAIL_JOB;
use courier_core::application::{
    EmailListener, EmailService, QueueRegistry, WorkerRuntime, EMAIL_QUEUE,
};
use courier_core::domain::{Backoff, JobOptions, JobState};
use courier_core::port::email_transport::mocks::MockEmailTransport;
use courier_core::port::Broker;
use serde_json::json;

use common::{eventually, fast_options, memory_broker, wait_for_state};

#[tokio::test]
async fn test_registry_returns_one_handle_per_name() {
    let broker = memory_broker().await;
    let registry = QueueRegistry::new(broker);

    let first = registry.get_or_create_queue(EMAIL_QUEUE).unwrap();
    for _ in 0..100 {
        let again = registry.get_or_create_queue(EMAIL_QUEUE).unwrap();
        assert!(Arc::ptr_eq(&first, &again));
    }
    assert_eq!(registry.queue_names(), vec![EMAIL_QUEUE.to_string()]);
}

#[tokio::test]
async fn test_valid_email_is_delivered() {
    let broker = memory_broker().await;
    let registry = QueueRegistry::new(broker.clone());
    let transport = Arc::new(MockEmailTransport::new_success());
    let runtime = WorkerRuntime::with_options(broker.clone(), fast_options());
    let worker = EmailListener::new(EmailService::new(transport.clone()))
        .register(&runtime)
        .unwrap();

    let id = registry
        .enqueue(
            EMAIL_QUEUE,
            SEND_EMAIL_JOB,
            json!({"to": "a@b.com", "subject": "Hello", "text": "World"}),
            None,
        )
        .await
        .unwrap();

    let job = wait_for_state(&broker, &id, JobState::Completed).await;
    assert_eq!(job.return_value, Some(json!({"delivered_to": "a@b.com"})));
    assert_eq!(transport.call_count(), 1);
    assert_eq!(transport.calls()[0].subject, "Hello");
    assert_eq!(transport.calls()[0].text, "World");
    assert_eq!(worker.completed(), 1);

    assert!(runtime.shutdown(Duration::from_secs(1)).await);
}

#[tokio::test]
async fn test_invalid_payload_fails_before_smtp() {
    let broker = memory_broker().await;
    let registry = QueueRegistry::new(broker.clone());
    let transport = Arc::new(MockEmailTransport::new_success());
    let runtime = WorkerRuntime::with_options(broker.clone(), fast_options());
    EmailListener::new(EmailService::new(transport.clone()))
        .register(&runtime)
        .unwrap();

    let id = registry
        .enqueue(
            EMAIL_QUEUE,
            SEND_EMAIL_JOB,
            json!({"to": "not-an-email", "subject": "ab", "text": "x"}),
            None,
        )
        .await
        .unwrap();

    let job = wait_for_state(&broker, &id, JobState::Failed).await;
    let reason = job.failed_reason.unwrap();
    assert!(reason.contains("fails validation"), "{}", reason);
    assert!(reason.contains("to: Invalid email"), "{}", reason);
    assert!(reason.contains("subject:"), "{}", reason);
    assert!(reason.contains("text:"), "{}", reason);
    assert_eq!(transport.call_count(), 0);

    runtime.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_smtp_error_becomes_failure_reason() {
    let broker = memory_broker().await;
    let registry = QueueRegistry::new(broker.clone());
    let transport = Arc::new(MockEmailTransport::new_fail("SMTP fail"));
    let runtime = WorkerRuntime::with_options(broker.clone(), fast_options());
    let worker = EmailListener::new(EmailService::new(transport.clone()))
        .register(&runtime)
        .unwrap();

    let id = registry
        .enqueue(
            EMAIL_QUEUE,
            SEND_EMAIL_JOB,
            json!({"to": "a@b.com", "subject": "Hello", "text": "World"}),
            None,
        )
        .await
        .unwrap();

    let job = wait_for_state(&broker, &id, JobState::Failed).await;
    assert_eq!(job.failed_reason.as_deref(), Some("SMTP fail"));
    assert_eq!(job.attempts_made, 1);
    assert_eq!(worker.failed(), 1);

    runtime.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_failed_send_is_retried_with_backoff() {
    let broker = memory_broker().await;
    let registry = QueueRegistry::new(broker.clone());
    let transport = Arc::new(MockEmailTransport::new_fail("SMTP fail"));
    let runtime = WorkerRuntime::with_options(broker.clone(), fast_options());
    EmailListener::new(EmailService::new(transport.clone()))
        .register(&runtime)
        .unwrap();

    let options = JobOptions::default()
        .with_attempts(3)
        .with_backoff(Backoff::exponential(10));
    let id = registry
        .enqueue(
            EMAIL_QUEUE,
            SEND_EMAIL_JOB,
            json!({"to": "a@b.com", "subject": "Hello", "text": "World"}),
            Some(options),
        )
        .await
        .unwrap();

    let job = wait_for_state(&broker, &id, JobState::Failed).await;
    assert_eq!(job.attempts_made, 3);
    assert_eq!(transport.call_count(), 3);

    runtime.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_in_flight_sends_never_exceed_concurrency() {
    const CONCURRENCY: usize = 3;

    let broker = memory_broker().await;
    let registry = QueueRegistry::new(broker.clone());
    let transport = Arc::new(MockEmailTransport::new_blocking());
    let runtime = WorkerRuntime::with_options(broker.clone(), fast_options());
    let worker = EmailListener::new(EmailService::new(transport.clone()))
        .with_concurrency(CONCURRENCY)
        .register(&runtime)
        .unwrap();

    let mut ids = Vec::new();
    for i in 0..CONCURRENCY * 2 {
        let id = registry
            .enqueue(
                EMAIL_QUEUE,
                SEND_EMAIL_JOB,
                json!({"to": format!("user{}@b.com", i), "subject": "Hello", "text": "World"}),
                None,
            )
            .await
            .unwrap();
        ids.push(id);
    }

    let sends = transport.as_ref();
    eventually("the first batch to block", || async move {
        sends.in_flight() == CONCURRENCY
    })
    .await;
    // Give the worker time to overclaim if it were going to
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(transport.in_flight(), CONCURRENCY);
    assert_eq!(
        broker.count_by_state(EMAIL_QUEUE, JobState::Active).await.unwrap(),
        CONCURRENCY as i64
    );

    transport.release(CONCURRENCY * 2);
    for id in &ids {
        wait_for_state(&broker, id, JobState::Completed).await;
    }

    assert!(transport.peak_in_flight() <= CONCURRENCY);
    assert_eq!(worker.completed(), (CONCURRENCY * 2) as u64);

    runtime.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_shutdown_waits_for_in_flight_send() {
    let broker = memory_broker().await;
    let registry = QueueRegistry::new(broker.clone());
    let transport = Arc::new(MockEmailTransport::new_blocking());
    let runtime = Arc::new(WorkerRuntime::with_options(broker.clone(), fast_options()));
    EmailListener::new(EmailService::new(transport.clone()))
        .with_concurrency(1)
        .register(&runtime)
        .unwrap();

    let id = registry
        .enqueue(
            EMAIL_QUEUE,
            SEND_EMAIL_JOB,
            json!({"to": "a@b.com", "subject": "Hello", "text": "World"}),
            None,
        )
        .await
        .unwrap();
    let sends = transport.as_ref();
    eventually("the send to start", || async move { sends.in_flight() == 1 }).await;

    let stopping = {
        let runtime = runtime.clone();
        tokio::spawn(async move { runtime.shutdown(Duration::from_secs(5)).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!stopping.is_finished());

    transport.release(1);
    assert!(stopping.await.unwrap());
    assert_eq!(common::job(&broker, &id).await.state, JobState::Completed);
}

#[tokio::test]
async fn test_concurrent_producers_share_one_queue() {
    let broker = memory_broker().await;
    let registry = Arc::new(QueueRegistry::new(broker.clone()));

    let producers: Vec<_> = (0..10)
        .map(|i| {
            let registry = registry.clone();
            tokio::spawn(async move {
                registry
                    .enqueue(EMAIL_QUEUE, SEND_EMAIL_JOB, json!({ "n": i }), None)
                    .await
                    .unwrap()
            })
        })
        .collect();
    let ids: Vec<_> = futures::future::join_all(producers)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();

    assert_eq!(ids.len(), 10);
    assert_eq!(registry.queue_names().len(), 1);
    assert_eq!(
        broker.count_by_state(EMAIL_QUEUE, JobState::Waiting).await.unwrap(),
        10
    );
}
