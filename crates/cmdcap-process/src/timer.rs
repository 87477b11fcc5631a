//! Deferred kill scheduling

use tokio::sync::oneshot;
use tokio::time::{sleep_until, Instant};
use tracing::debug;

use crate::{
    error::{ProcessError, Result},
    handle::ProcessControl,
};

/// Kill `control`'s process at `deadline` from a background task.
///
/// The receiver yields the outcome of the kill: `NotRunning` when there is
/// no process, or an abnormal-exit error if it died on its own first. The
/// caller's controller is left untouched; a later Stop or Wait observes
/// the exit.
pub(crate) fn kill_at(control: Option<ProcessControl>, deadline: Instant) -> oneshot::Receiver<Result<()>> {
    let (tx, rx) = oneshot::channel();

    let Some(control) = control else {
        let _ = tx.send(Err(ProcessError::NotRunning));
        return rx;
    };

    tokio::spawn(async move {
        sleep_until(deadline).await;
        debug!(pid = ?control.pid(), "Kill timer fired");
        let result = control.kill_and_wait().await.into_result();
        // Receiver may have been dropped by a caller that does not care.
        let _ = tx.send(result);
    });

    rx
}
