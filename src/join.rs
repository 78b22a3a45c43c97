//! Joining the control task

use tokio::task::JoinHandle;
use tracing::{event, Level};

// Waits for the control task to stop, and resumes its panic, if any, on
// the joining task.
pub(crate) async fn join_control_task(handle: JoinHandle<()>) {
    let Err(err) = handle.await else {
        return;
    };
    match err.try_into_panic() {
        Ok(payload) => std::panic::resume_unwind(payload),
        // Only cancellation is left: the task was aborted.
        Err(err) => event!(Level::DEBUG, %err, "Control task was cancelled"),
    }
}
