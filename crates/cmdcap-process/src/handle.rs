//! Live process handle: reaper task, exit-state query and signal delivery

use std::process::ExitStatus;

use tokio::process::Child;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    error::{ProcessError, Result},
    invocation::CancelSignal,
    streams::StreamTriple,
};

/// Final state of a process as observed by its reaper
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitOutcome {
    /// Exit code when the process exited normally
    pub code: Option<i32>,
    /// Terminating signal, unix only
    pub signal: Option<i32>,
    /// Termination was requested through cancellation or kill
    pub requested: bool,
}

impl ExitOutcome {
    pub(crate) fn from_status(status: ExitStatus, requested: bool) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
            requested,
        }
    }

    /// Exit code, -1 when the process did not exit normally
    pub fn exit_code(&self) -> i32 {
        self.code.unwrap_or(-1)
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Non-zero exit code, or a signal death nobody asked for.
    ///
    /// An exit code always comes from the process itself, so a child that
    /// handles the cancel signal and exits non-zero is still abnormal.
    pub fn is_abnormal(&self) -> bool {
        match self.code {
            Some(code) => code != 0,
            None => !self.requested,
        }
    }

    pub(crate) fn into_result(self) -> Result<()> {
        if self.is_abnormal() {
            return Err(ProcessError::AbnormalExit {
                code: self.exit_code(),
                output: Box::default(),
            });
        }
        Ok(())
    }
}

/// Cloneable control surface of a running process.
///
/// The child itself lives in a reaper task; this type queries its exit
/// state and forwards cancellation and kill requests to it.
#[derive(Debug, Clone)]
pub struct ProcessControl {
    pid: Option<u32>,
    cancel: CancellationToken,
    exit: watch::Receiver<Option<ExitOutcome>>,
    kill: mpsc::UnboundedSender<()>,
}

impl ProcessControl {
    /// Move the child into a reaper task bound to `cancel`
    pub(crate) fn spawn(child: Child, cancel: CancellationToken, cancel_signal: CancelSignal) -> Self {
        let pid = child.id();
        let (exit_tx, exit_rx) = watch::channel(None);
        let (kill_tx, kill_rx) = mpsc::unbounded_channel();

        tokio::spawn(reap(child, cancel.clone(), cancel_signal, kill_rx, exit_tx));

        Self {
            pid,
            cancel,
            exit: exit_rx,
            kill: kill_tx,
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Cancellation scope of this process
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Fire the cancellation scope, delivering the configured cancel signal
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Exit outcome if the process has already exited
    pub fn exit_outcome(&self) -> Option<ExitOutcome> {
        *self.exit.borrow()
    }

    pub fn has_exited(&self) -> bool {
        self.exit_outcome().is_some()
    }

    /// Ask the reaper to kill the process. No-op once it has exited.
    pub fn request_kill(&self) {
        if self.has_exited() {
            return;
        }
        // A closed channel means the reaper already finished.
        let _ = self.kill.send(());
    }

    /// Wait until the reaper publishes the exit outcome
    pub async fn wait(&self) -> ExitOutcome {
        let mut exit = self.exit.clone();
        loop {
            if let Some(outcome) = *exit.borrow_and_update() {
                return outcome;
            }
            if exit.changed().await.is_err() {
                return exit.borrow().unwrap_or(ExitOutcome {
                    code: None,
                    signal: None,
                    requested: false,
                });
            }
        }
    }

    /// Control with no process behind it. Kill requests pile up unanswered
    /// until the caller publishes an outcome through the returned sender.
    #[cfg(test)]
    pub(crate) fn detached() -> (
        Self,
        watch::Sender<Option<ExitOutcome>>,
        mpsc::UnboundedReceiver<()>,
    ) {
        let (exit_tx, exit_rx) = watch::channel(None);
        let (kill_tx, kill_rx) = mpsc::unbounded_channel();
        let control = Self {
            pid: None,
            cancel: CancellationToken::new(),
            exit: exit_rx,
            kill: kill_tx,
        };
        (control, exit_tx, kill_rx)
    }

    /// Kill and wait. A process that already exited is not signaled.
    pub(crate) async fn kill_and_wait(&self) -> ExitOutcome {
        if let Some(outcome) = self.exit_outcome() {
            debug!(pid = ?self.pid, "Process already exited, nothing to kill");
            return outcome;
        }
        self.cancel();
        self.request_kill();
        self.wait().await
    }
}

async fn reap(
    mut child: Child,
    cancel: CancellationToken,
    cancel_signal: CancelSignal,
    mut kill_rx: mpsc::UnboundedReceiver<()>,
    exit_tx: watch::Sender<Option<ExitOutcome>>,
) {
    let pid = child.id();
    let mut requested = false;
    let mut signaled = false;

    let status = loop {
        tokio::select! {
            status = child.wait() => break status,
            _ = cancel.cancelled(), if !signaled => {
                signaled = true;
                requested = true;
                debug!(pid = ?pid, signal = ?cancel_signal, "Cancellation scope fired");
                deliver(&mut child, cancel_signal);
            }
            Some(()) = kill_rx.recv() => {
                requested = true;
                debug!(pid = ?pid, "Killing process");
                if let Err(e) = child.start_kill() {
                    warn!(pid = ?pid, error = %e, "Failed to kill process");
                }
            }
        }
    };

    let outcome = match status {
        Ok(status) => ExitOutcome::from_status(status, requested),
        Err(e) => {
            warn!(pid = ?pid, error = %e, "Error waiting for process");
            ExitOutcome {
                code: None,
                signal: None,
                requested,
            }
        }
    };

    debug!(pid = ?pid, code = ?outcome.code, signal = ?outcome.signal, "Process exited");
    let _ = exit_tx.send(Some(outcome));
}

/// Send the cancel signal, or kill outright when it has no unix equivalent
pub(crate) fn deliver(child: &mut Child, signal: CancelSignal) {
    #[cfg(unix)]
    {
        if let (Some(sig), Some(pid)) = (signal.as_nix(), child.id()) {
            use nix::sys::signal::kill;
            use nix::unistd::Pid;

            if let Err(e) = kill(Pid::from_raw(pid as i32), sig) {
                warn!(pid = %pid, error = %e, "Failed to deliver cancel signal");
            }
            return;
        }
    }

    #[cfg(not(unix))]
    let _ = signal;

    if let Err(e) = child.start_kill() {
        warn!(pid = ?child.id(), error = %e, "Failed to kill process");
    }
}

/// The started process plus its stream triple, if interactive
#[derive(Debug)]
pub(crate) struct ProcessHandle {
    pub(crate) control: ProcessControl,
    pub(crate) streams: Option<StreamTriple>,
}

impl ProcessHandle {
    pub(crate) fn new(control: ProcessControl) -> Self {
        Self {
            control,
            streams: None,
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::process::Stdio;
    use std::time::Duration;
    use tokio::process::Command;

    fn spawn(program: &str, args: &[&str], cancel: CancellationToken) -> ProcessControl {
        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .unwrap();
        ProcessControl::spawn(child, cancel, CancelSignal::Terminate)
    }

    #[tokio::test]
    async fn test_wait_reports_exit_code() {
        let control = spawn("sh", &["-c", "exit 3"], CancellationToken::new());
        let outcome = control.wait().await;

        assert_eq!(outcome.code, Some(3));
        assert!(!outcome.requested);
        assert!(outcome.is_abnormal());
        assert!(control.has_exited());
        assert_eq!(control.exit_outcome(), Some(outcome));
    }

    #[tokio::test]
    async fn test_cancellation_delivers_sigterm() {
        let control = spawn("sleep", &["30"], CancellationToken::new());
        assert!(control.pid().is_some());
        assert!(!control.has_exited());

        control.cancel();
        let outcome = tokio::time::timeout(Duration::from_secs(5), control.wait())
            .await
            .unwrap();

        assert_eq!(outcome.signal, Some(nix::sys::signal::Signal::SIGTERM as i32));
        assert_eq!(outcome.exit_code(), -1);
        assert!(outcome.requested);
        assert!(!outcome.is_abnormal());
        assert!(outcome.into_result().is_ok());
    }

    #[tokio::test]
    async fn test_parent_cancellation_propagates() {
        let parent = CancellationToken::new();
        let control = spawn("sleep", &["30"], parent.child_token());

        parent.cancel();
        let outcome = tokio::time::timeout(Duration::from_secs(5), control.wait())
            .await
            .unwrap();
        assert!(outcome.requested);
    }

    #[tokio::test]
    async fn test_kill_and_wait_skips_exited_process() {
        let control = spawn("true", &[], CancellationToken::new());
        let first = control.wait().await;

        let second = control.kill_and_wait().await;
        assert_eq!(first, second);
        assert!(!second.requested);
        assert!(!control.cancel_token().is_cancelled());
    }

    #[tokio::test]
    async fn test_kill_ignores_sigterm_trap() {
        let control = spawn("sh", &["-c", "trap '' TERM; exec sleep 30"], CancellationToken::new());
        // let the shell install its trap first
        tokio::time::sleep(Duration::from_millis(200)).await;

        let outcome = tokio::time::timeout(Duration::from_secs(5), control.kill_and_wait())
            .await
            .unwrap();
        assert_eq!(outcome.signal, Some(nix::sys::signal::Signal::SIGKILL as i32));
        assert!(outcome.requested);
    }

    #[tokio::test]
    async fn test_own_exit_code_survives_cancellation() {
        let control = spawn(
            "sh",
            &["-c", "trap 'exit 3' TERM; while :; do sleep 0.05; done"],
            CancellationToken::new(),
        );
        tokio::time::sleep(Duration::from_millis(200)).await;

        control.cancel();
        let outcome = tokio::time::timeout(Duration::from_secs(5), control.wait())
            .await
            .unwrap();
        assert!(outcome.requested);
        assert_eq!(outcome.code, Some(3));
        assert!(outcome.is_abnormal());
        assert_eq!(outcome.into_result().unwrap_err().exit_code(), Some(3));
    }

    #[test]
    fn test_abnormal_classification() {
        let exited = |code, requested| ExitOutcome {
            code: Some(code),
            signal: None,
            requested,
        };
        let signaled = |requested| ExitOutcome {
            code: None,
            signal: Some(9),
            requested,
        };

        assert!(!exited(0, true).is_abnormal());
        assert!(exited(3, true).is_abnormal());
        assert!(exited(3, false).is_abnormal());
        assert!(!signaled(true).is_abnormal());
        assert!(signaled(false).is_abnormal());
    }
}
