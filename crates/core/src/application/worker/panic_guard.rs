// Panic isolation for job handlers
//
// Handlers run in their own task; a panic surfaces as a JoinError and is
// turned into a job failure instead of taking the worker down.
use tokio::task::JoinError;

/// Extract a readable message from a failed handler task
pub fn panic_message(err: JoinError) -> String {
    if !err.is_panic() {
        return "job task was cancelled".to_string();
    }

    let payload = err.into_panic();
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic".to_string()
    }
}
