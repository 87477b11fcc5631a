//! Lifecycle controller - run, start, stop, kill and rerun one command

use std::path::Path;
use std::process::{ExitStatus, Stdio};

use serde::{Deserialize, Serialize};
use tokio::io::{self, AsyncRead, AsyncReadExt};
use tokio::process::{Child, ChildStderr, ChildStdout};
use tokio::sync::oneshot;
use tokio::time::{timeout, Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    config::StopPolicy,
    error::{ProcessError, Result},
    handle::{deliver, ExitOutcome, ProcessControl, ProcessHandle},
    invocation::{CancelSignal, CaptureOption, Invocation, LaunchRequest},
    pump::{PumpSet, WiredIo},
    streams::StreamTriple,
    timer,
};

/// Buffered output of a blocking run.
///
/// For combined output both streams are interleaved into `stdout`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

/// Lifecycle state of the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LifecycleState {
    #[default]
    NotStarted,
    Running,
    Stopping,
    Stopped,
}

/// A re-runnable command and the controller of its current process.
///
/// Holds the invocation (name, args, dir, env, modifier), the exit code of
/// the last run, and at most one live process handle. Start records a new
/// handle; a terminal Stop or Kill clears it. Calls that mutate the
/// controller must be serialized by the owner.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Capture {
    #[serde(flatten)]
    invocation: Invocation,
    #[serde(default, skip_serializing_if = "is_zero")]
    exit_code: i32,
    #[serde(skip)]
    policy: StopPolicy,
    #[serde(skip)]
    state: LifecycleState,
    #[serde(skip)]
    current: Option<ProcessHandle>,
}

fn is_zero(code: &i32) -> bool {
    *code == 0
}

impl Capture {
    /// Create a capture with the given options applied in order
    pub fn new<I>(options: I) -> Self
    where
        I: IntoIterator<Item = CaptureOption>,
    {
        let mut capture = Self::default();
        capture.with(options);
        capture
    }

    /// Re-apply options, e.g. restoring the modifier after deserialization
    pub fn with<I>(&mut self, options: I)
    where
        I: IntoIterator<Item = CaptureOption>,
    {
        for option in options {
            match option {
                CaptureOption::Env(env) => self.invocation.env = Some(env),
                CaptureOption::Dir(dir) => {
                    self.invocation.dir = (!dir.as_os_str().is_empty()).then_some(dir);
                }
                CaptureOption::Modifier(modifier) => self.invocation.modifier = Some(modifier),
                CaptureOption::CancelSignal(signal) => self.invocation.cancel_signal = signal,
                CaptureOption::Policy(policy) => self.policy = policy,
            }
        }
    }

    /// Program name of the last launch
    pub fn name(&self) -> &str {
        &self.invocation.name
    }

    /// Arguments of the last launch, without the program name
    pub fn args(&self) -> &[String] {
        &self.invocation.args
    }

    /// Working directory, `None` inherits the caller's
    pub fn dir(&self) -> Option<&Path> {
        self.invocation.dir.as_deref()
    }

    /// Explicit environment, `None` inherits the caller's
    pub fn env(&self) -> Option<&[String]> {
        self.invocation.env.as_deref()
    }

    /// Whether a launch modifier is set
    pub fn has_modifier(&self) -> bool {
        self.invocation.modifier.is_some()
    }

    /// Exit code of the last observed exit. Zero also when the command
    /// never ran; check the returned error to tell the two apart.
    pub fn exit_code(&self) -> i32 {
        self.exit_code
    }

    /// Timing used by Stop
    pub fn policy(&self) -> StopPolicy {
        self.policy
    }

    /// Current lifecycle state
    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// PID of the current process, if one is recorded
    pub fn pid(&self) -> Option<u32> {
        self.current.as_ref().and_then(|handle| handle.control.pid())
    }

    /// Control surface of the current process
    pub fn control(&self) -> Option<&ProcessControl> {
        self.current.as_ref().map(|handle| &handle.control)
    }

    /// Streams of the current interactive process
    pub fn streams(&mut self) -> Option<&mut StreamTriple> {
        self.current.as_mut().and_then(|handle| handle.streams.as_mut())
    }

    /// Take the streams out of the controller, e.g. to move them into a task
    pub fn take_streams(&mut self) -> Option<StreamTriple> {
        self.current.as_mut().and_then(|handle| handle.streams.take())
    }

    /// Close the current process's stdin. No-op without streams.
    pub fn close_input(&mut self) {
        if let Some(streams) = self.streams() {
            streams.close_input();
        }
    }

    fn prepare<I, S>(&mut self, name: &str, args: I) -> Result<LaunchRequest>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.invocation.name = name.to_string();
        self.invocation.args = args.into_iter().map(Into::into).collect();
        self.invocation.launch_request()
    }

    /// Run to completion with stdout and stderr captured into buffers.
    ///
    /// A non-zero exit is reported as [`ProcessError::AbnormalExit`] and a
    /// cancellation as [`ProcessError::Cancelled`]; both still carry the
    /// output captured so far. The exit code is recorded either way.
    ///
    /// Cancellation delivers the configured cancel signal and escalates to
    /// a kill if the child is still alive one stop tick later.
    pub async fn run<I, S>(
        &mut self,
        cancel: &CancellationToken,
        name: &str,
        args: I,
    ) -> Result<CapturedOutput>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let request = self.prepare(name, args)?;
        self.execute(cancel, &request, false).await
    }

    /// Run to completion with stdout and stderr interleaved into one buffer
    pub async fn combined_output<I, S>(
        &mut self,
        cancel: &CancellationToken,
        name: &str,
        args: I,
    ) -> Result<Vec<u8>>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let request = self.prepare(name, args)?;
        self.execute(cancel, &request, true)
            .await
            .map(|output| output.stdout)
    }

    /// Run again with the recorded name and args
    pub async fn rerun(&mut self, cancel: &CancellationToken) -> Result<CapturedOutput> {
        let name = self.invocation.name.clone();
        let args = self.invocation.args.clone();
        self.run(cancel, &name, args).await
    }

    async fn execute(
        &mut self,
        cancel: &CancellationToken,
        request: &LaunchRequest,
        combined: bool,
    ) -> Result<CapturedOutput> {
        self.exit_code = 0;

        if cancel.is_cancelled() {
            return Err(ProcessError::cancelled());
        }

        let mut cmd = request.command();
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        debug!(command = %request.program(), args = ?request.args(), "Running command");
        let child = cmd.spawn().map_err(ProcessError::SpawnFailed)?;

        let cancellation = Cancellation {
            token: cancel,
            signal: request.cancel_signal(),
            grace: self.policy.tick,
        };
        let (status, cancelled, output) = collect(child, &cancellation, combined).await?;
        let outcome = ExitOutcome::from_status(status, cancelled);
        self.exit_code = outcome.exit_code();

        if cancelled {
            debug!(command = %request.program(), "Run cancelled");
            return Err(ProcessError::Cancelled {
                output: Box::new(output),
            });
        }
        if !outcome.success() {
            return Err(ProcessError::AbnormalExit {
                code: self.exit_code,
                output: Box::new(output),
            });
        }
        Ok(output)
    }

    /// Start without waiting, returning the live stream triple.
    ///
    /// The process gets a child scope of `cancel`: cancelling `cancel`
    /// reaches the process, stopping the process leaves `cancel` alone.
    /// A previously recorded handle is replaced but not terminated.
    pub async fn start<I, S>(
        &mut self,
        cancel: &CancellationToken,
        name: &str,
        args: I,
    ) -> Result<&mut StreamTriple>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let request = self.prepare(name, args)?;
        let scope = cancel.child_token();
        if scope.is_cancelled() {
            return Err(ProcessError::cancelled());
        }

        let mut cmd = request.command();
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = self.spawn(&mut cmd, &request)?;
        let streams = match StreamTriple::attach(&mut child) {
            Ok(streams) => streams,
            Err(e) => {
                discard(child);
                return Err(e);
            }
        };

        let handle = self.record(child, scope, &request);
        Ok(handle.streams.insert(streams))
    }

    /// Start with caller-supplied IO bridged by background pumps. Streams
    /// left unset read from or write to the null device.
    pub async fn start_wired<I, S>(
        &mut self,
        cancel: &CancellationToken,
        name: &str,
        args: I,
        io: WiredIo,
    ) -> Result<PumpSet>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let request = self.prepare(name, args)?;
        let scope = cancel.child_token();
        if scope.is_cancelled() {
            return Err(ProcessError::cancelled());
        }

        let mut cmd = request.command();
        let (stdin, stdout, stderr) = io.stdio();
        cmd.stdin(stdin).stdout(stdout).stderr(stderr);

        let mut child = self.spawn(&mut cmd, &request)?;
        let pumps = io.start(&mut child);
        self.record(child, scope, &request);
        Ok(pumps)
    }

    /// Start again with the recorded name and args
    pub async fn restart(&mut self, cancel: &CancellationToken) -> Result<&mut StreamTriple> {
        let name = self.invocation.name.clone();
        let args = self.invocation.args.clone();
        self.start(cancel, &name, args).await
    }

    fn spawn(&mut self, cmd: &mut tokio::process::Command, request: &LaunchRequest) -> Result<Child> {
        cmd.spawn().map_err(|e| {
            warn!(command = %request.program(), error = %e, "Failed to spawn process");
            self.exit_code = 0;
            ProcessError::SpawnFailed(e)
        })
    }

    fn record(
        &mut self,
        child: Child,
        scope: CancellationToken,
        request: &LaunchRequest,
    ) -> &mut ProcessHandle {
        let control = ProcessControl::spawn(child, scope, request.cancel_signal());
        info!(pid = ?control.pid(), command = %request.program(), "Process started");

        if let Some(previous) = &self.current {
            debug!(pid = ?previous.control.pid(), "Superseding previous process handle");
        }

        self.exit_code = 0;
        self.state = LifecycleState::Running;
        self.current.insert(ProcessHandle::new(control))
    }

    /// Wait for the current process to exit. The handle stays recorded.
    pub async fn wait(&mut self) -> Result<()> {
        let control = self
            .current
            .as_ref()
            .map(|handle| handle.control.clone())
            .ok_or(ProcessError::NotStarted)?;

        let outcome = control.wait().await;
        self.exit_code = outcome.exit_code();
        outcome.into_result()
    }

    /// Graceful termination: cancel, poll, escalate to kill, give up at
    /// the ceiling. On timeout the handle stays recorded so Stop can be
    /// retried. A policy without room to poll after escalating is rejected
    /// before anything is signaled.
    pub async fn stop(&mut self) -> Result<()> {
        let control = self
            .current
            .as_ref()
            .map(|handle| handle.control.clone())
            .ok_or(ProcessError::NotStarted)?;
        self.policy.validate()?;

        self.state = LifecycleState::Stopping;
        match stop_process(&control, self.policy).await {
            Ok(outcome) => self.settle(outcome),
            Err(e) => {
                self.state = LifecycleState::Running;
                Err(e)
            }
        }
    }

    /// Immediate termination, then wait for the exit
    pub async fn kill(&mut self) -> Result<()> {
        let control = self
            .current
            .as_ref()
            .map(|handle| handle.control.clone())
            .ok_or(ProcessError::NotRunning)?;

        let outcome = control.kill_and_wait().await;
        self.settle(outcome)
    }

    /// Kill the current process after `delay`; the outcome arrives on the
    /// returned receiver
    pub fn kill_timer(&self, delay: Duration) -> oneshot::Receiver<Result<()>> {
        self.kill_after(Instant::now() + delay)
    }

    /// Kill the current process at `deadline`
    pub fn kill_after(&self, deadline: Instant) -> oneshot::Receiver<Result<()>> {
        timer::kill_at(self.control().cloned(), deadline)
    }

    fn settle(&mut self, outcome: ExitOutcome) -> Result<()> {
        self.exit_code = outcome.exit_code();
        self.current = None;
        self.state = LifecycleState::Stopped;
        outcome.into_result()
    }
}

/// Drive the graceful-termination protocol against one process
pub(crate) async fn stop_process(control: &ProcessControl, policy: StopPolicy) -> Result<ExitOutcome> {
    control.cancel();

    let deadline = Instant::now() + policy.ceiling;
    let mut escalated = false;

    loop {
        if let Some(outcome) = control.exit_outcome() {
            return Ok(outcome);
        }

        let now = Instant::now();
        if now >= deadline {
            warn!(pid = ?control.pid(), ceiling = ?policy.ceiling, "Process did not stop in time");
            return Err(ProcessError::Timeout {
                ceiling: policy.ceiling,
            });
        }

        let slice = policy.tick.min(deadline - now);
        if let Ok(outcome) = timeout(slice, control.wait()).await {
            return Ok(outcome);
        }

        if !escalated {
            escalated = true;
            warn!(pid = ?control.pid(), "Process still running after cancel, escalating to kill");
            control.request_kill();
        }
    }
}

/// Kill a child whose streams could not be attached and reap it
fn discard(mut child: Child) {
    if let Err(e) = child.start_kill() {
        warn!(error = %e, "Failed to kill process with unattached streams");
    }
    tokio::spawn(async move {
        let _ = child.wait().await;
    });
}

/// How a blocking run reacts to its cancellation scope
struct Cancellation<'a> {
    token: &'a CancellationToken,
    signal: CancelSignal,
    /// Time the child gets to exit after the signal before it is killed
    grace: Duration,
}

async fn collect(
    mut child: Child,
    cancel: &Cancellation<'_>,
    combined: bool,
) -> io::Result<(ExitStatus, bool, CapturedOutput)> {
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let reader = async move {
        if combined {
            let combined = interleave(stdout, stderr).await?;
            Ok::<_, io::Error>(CapturedOutput {
                stdout: combined,
                stderr: Vec::new(),
            })
        } else {
            let (stdout, stderr) = tokio::try_join!(read_all(stdout), read_all(stderr))?;
            Ok(CapturedOutput { stdout, stderr })
        }
    };

    let waiter = async {
        tokio::select! {
            status = child.wait() => Ok::<_, io::Error>((status?, false)),
            _ = cancel.token.cancelled() => {
                deliver(&mut child, cancel.signal);
                let status = match timeout(cancel.grace, child.wait()).await {
                    Ok(status) => status?,
                    Err(_) => {
                        warn!(pid = ?child.id(), "Cancelled run still alive, killing");
                        child.start_kill()?;
                        child.wait().await?
                    }
                };
                Ok((status, true))
            }
        }
    };

    let (output, (status, cancelled)) = tokio::try_join!(reader, waiter)?;
    Ok((status, cancelled, output))
}

async fn read_all<R>(stream: Option<R>) -> io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    if let Some(mut stream) = stream {
        stream.read_to_end(&mut buf).await?;
    }
    Ok(buf)
}

/// Read stdout and stderr concurrently, appending chunks in arrival order
async fn interleave(
    mut stdout: Option<ChildStdout>,
    mut stderr: Option<ChildStderr>,
) -> io::Result<Vec<u8>> {
    let mut combined = Vec::new();
    let mut out_buf = [0u8; 8192];
    let mut err_buf = [0u8; 8192];

    loop {
        tokio::select! {
            read = read_chunk(&mut stdout, &mut out_buf), if stdout.is_some() => match read? {
                0 => stdout = None,
                n => combined.extend_from_slice(&out_buf[..n]),
            },
            read = read_chunk(&mut stderr, &mut err_buf), if stderr.is_some() => match read? {
                0 => stderr = None,
                n => combined.extend_from_slice(&err_buf[..n]),
            },
            else => break,
        }
    }

    Ok(combined)
}

async fn read_chunk<R>(stream: &mut Option<R>, buf: &mut [u8]) -> io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    match stream {
        Some(stream) => stream.read(buf).await,
        None => Ok(0),
    }
}
