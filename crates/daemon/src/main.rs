//! Courier email worker - Main Entry Point

mod config;
mod logging;

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info, warn};

use courier_core::application::{
    shutdown_channel, CleanupScheduler, EmailListener, EmailService, QueueRegistry,
    RecoveryService, WorkerOptions, WorkerRuntime,
};
use courier_core::port::{Broker, EmailTransport};
use courier_infra_smtp::SmtpEmailTransport;
use courier_infra_sqlite::SqliteBroker;

use config::DaemonConfig;
use logging::{init_logging, LogFormat};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Load .env (if any) and initialize logging
    dotenvy::dotenv().ok();
    init_logging(LogFormat::parse(
        std::env::var("COURIER_LOG_FORMAT").ok().as_deref(),
    ))?;

    info!("Courier worker v{} starting...", VERSION);

    // 2. Load configuration
    let config = DaemonConfig::from_env().context("Invalid configuration")?;

    // 3. Connect to the broker (fatal on failure)
    info!(db_path = %config.db_path, "Connecting to broker...");
    ensure_parent_dir(&config.db_path)?;
    let broker = SqliteBroker::connect(&config.broker_config())
        .await
        .context("Broker connection failed")?;
    broker.ping().await.context("Broker connection failed")?;
    let broker: Arc<dyn Broker> = Arc::new(broker);

    // 4. Return jobs orphaned by a previous run
    info!("Running stalled job recovery...");
    let recovery = RecoveryService::new(broker.clone(), Some(config.recovery_window_ms));
    match recovery.recover_stalled_jobs().await {
        Ok(count) => info!(recovered_jobs = count, "Stalled job recovery completed"),
        Err(e) => error!(error = %e, "Stalled job recovery failed"),
    }

    // 5. Wire queue registry and worker runtime
    let registry = Arc::new(QueueRegistry::new(broker.clone()));
    registry.get_or_create_queue(&config.email_queue)?;

    let runtime = WorkerRuntime::with_options(
        broker.clone(),
        WorkerOptions {
            poll_interval: config.poll_interval,
            ..WorkerOptions::default()
        },
    );

    // 6. SMTP transport (unreachable relay is not fatal; jobs fail and retry)
    let smtp = SmtpEmailTransport::new(&config.smtp)?;
    match smtp.test_connection().await {
        Ok(true) => info!(host = %config.smtp.host, "SMTP relay reachable"),
        Ok(false) | Err(_) => warn!(host = %config.smtp.host, "SMTP relay not reachable yet"),
    }
    let transport: Arc<dyn EmailTransport> = Arc::new(smtp);

    // 7. Start the email worker
    info!("Starting email worker...");
    let email_worker = EmailListener::new(EmailService::new(transport))
        .with_queue(config.email_queue.clone())
        .with_concurrency(config.email_concurrency)
        .register(&runtime)?;

    // 8. Start background maintenance: cleanup and periodic stalled-job recovery
    let (maintenance_tx, cleanup_rx) = shutdown_channel();
    let cleanup = CleanupScheduler::new(
        registry.clone(),
        vec![config.email_queue.clone()],
        config.retention,
        config.cleanup_interval,
    );
    let cleanup_handle = tokio::spawn(cleanup.run(cleanup_rx));
    let recovery_handle = tokio::spawn(
        recovery.run(config.recovery_interval, maintenance_tx.token()),
    );

    info!(
        queue = %email_worker.queue(),
        concurrency = email_worker.concurrency(),
        "System ready. Waiting for jobs..."
    );
    info!("Press Ctrl+C to shutdown");

    // 9. Wait for shutdown signal
    tokio::signal::ctrl_c().await?;

    info!("Shutdown signal received. Draining in-flight jobs...");

    // 10. Graceful shutdown
    if !runtime.shutdown(config.shutdown_grace).await {
        warn!(
            in_flight = email_worker.in_flight(),
            "Jobs still in flight; they will be recovered on next start"
        );
    }
    maintenance_tx.shutdown();
    let _ = tokio::time::timeout(std::time::Duration::from_secs(5), async {
        let _ = tokio::join!(cleanup_handle, recovery_handle);
    })
    .await;

    info!(
        completed = email_worker.completed(),
        failed = email_worker.failed(),
        "Shutdown complete."
    );

    Ok(())
}

fn ensure_parent_dir(db_path: &str) -> Result<()> {
    if db_path.contains(":memory:") {
        return Ok(());
    }
    if let Some(parent) = Path::new(db_path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Cannot create {}", parent.display()))?;
        }
    }
    Ok(())
}
