// Worker constants (no magic values)
use std::time::Duration;

/// Sleep when the queue has nothing claimable (100ms)
pub const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Sleep after a broker error before polling again (1s)
pub const ERROR_RECOVERY_SLEEP_DURATION: Duration = Duration::from_secs(1);

/// Tries at recording a job outcome before it is left to stalled recovery
pub const REPORT_ATTEMPTS: u32 = 5;

/// ACTIVE jobs older than this are considered stalled (5 minutes)
pub const DEFAULT_RECOVERY_WINDOW_MS: i64 = 5 * 60 * 1000;

/// Stalled-job recovery period while running (1 minute)
pub const DEFAULT_RECOVERY_INTERVAL: Duration = Duration::from_secs(60);

/// Time given to in-flight jobs on shutdown (10s)
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Finished-job cleanup period (1 hour)
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Finished jobs are kept this long before cleanup (7 days)
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(7 * 24 * 60 * 60);
