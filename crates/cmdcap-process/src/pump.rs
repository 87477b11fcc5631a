//! IO pumps bridging caller-supplied readers and writers to a child

use std::fmt;
use std::process::Stdio;

use tokio::io::{self, AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::process::{Child, ChildStdin};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Source feeding the child's stdin
pub type PumpSource = Box<dyn AsyncRead + Send + Unpin>;

/// Sink receiving the child's stdout or stderr
pub type PumpSink = Box<dyn AsyncWrite + Send + Unpin>;

/// Caller-supplied IO for wired mode.
///
/// Each `Some` entry gets its own pipe and a background copy task once the
/// child is spawned. `None` entries are attached to the null device, unless
/// built with [`WiredIo::interactive`], where they inherit the caller's stream.
#[derive(Default)]
pub struct WiredIo {
    input: Option<PumpSource>,
    output: Option<PumpSink>,
    err_output: Option<PumpSink>,
    inherit: bool,
}

impl fmt::Debug for WiredIo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WiredIo")
            .field("input", &self.input.is_some())
            .field("output", &self.output.is_some())
            .field("err_output", &self.err_output.is_some())
            .field("inherit", &self.inherit)
            .finish()
    }
}

impl WiredIo {
    /// Wire any combination of input source and output sinks
    pub fn wire(
        input: Option<PumpSource>,
        output: Option<PumpSink>,
        err_output: Option<PumpSink>,
    ) -> Self {
        Self {
            input,
            output,
            err_output,
            inherit: false,
        }
    }

    /// Child shares the caller's stdin, stdout and stderr
    pub fn interactive() -> Self {
        Self {
            inherit: true,
            ..Self::default()
        }
    }

    pub fn input(mut self, source: impl AsyncRead + Send + Unpin + 'static) -> Self {
        self.input = Some(Box::new(source));
        self
    }

    pub fn output(mut self, sink: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        self.output = Some(Box::new(sink));
        self
    }

    pub fn err_output(mut self, sink: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        self.err_output = Some(Box::new(sink));
        self
    }

    /// Stdio configuration for stdin, stdout, stderr
    pub(crate) fn stdio(&self) -> (Stdio, Stdio, Stdio) {
        (
            self.unwired(self.input.is_some()),
            self.unwired(self.output.is_some()),
            self.unwired(self.err_output.is_some()),
        )
    }

    fn unwired(&self, wired: bool) -> Stdio {
        match (wired, self.inherit) {
            (true, _) => Stdio::piped(),
            (false, true) => Stdio::inherit(),
            (false, false) => Stdio::null(),
        }
    }

    /// Start one pump per wired stream. Never blocks.
    pub(crate) fn start(self, child: &mut Child) -> PumpSet {
        let mut pumps = Vec::new();

        if let (Some(source), Some(stdin)) = (self.input, child.stdin.take()) {
            pumps.push(tokio::spawn(pump_input(source, stdin)));
        }
        if let (Some(sink), Some(stdout)) = (self.output, child.stdout.take()) {
            pumps.push(tokio::spawn(pump_output(stdout, sink, "output")));
        }
        if let (Some(sink), Some(stderr)) = (self.err_output, child.stderr.take()) {
            pumps.push(tokio::spawn(pump_output(stderr, sink, "error")));
        }

        PumpSet { pumps }
    }
}

async fn pump_input(mut source: PumpSource, mut stdin: ChildStdin) {
    match io::copy(&mut source, &mut stdin).await {
        Ok(bytes) => debug!(bytes, "Input pump drained"),
        Err(e) => warn!(error = %e, "Input pump failed"),
    }
    // stdin drops here, closing the child's input
}

async fn pump_output<R>(mut stream: R, mut sink: PumpSink, name: &'static str)
where
    R: AsyncRead + Unpin,
{
    match io::copy(&mut stream, &mut sink).await {
        Ok(bytes) => debug!(stream = name, bytes, "Output pump drained"),
        Err(e) => warn!(stream = name, error = %e, "Output pump failed"),
    }
    if let Err(e) = sink.shutdown().await {
        warn!(stream = name, error = %e, "Failed to close pump sink");
    }
}

/// Background pumps started for one wired process
#[derive(Debug)]
pub struct PumpSet {
    pumps: Vec<JoinHandle<()>>,
}

impl PumpSet {
    pub fn len(&self) -> usize {
        self.pumps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pumps.is_empty()
    }

    /// Wait for every pump to finish copying
    pub async fn finished(self) {
        for pump in self.pumps {
            if let Err(e) = pump.await {
                warn!(error = %e, "Pump task ended abnormally");
            }
        }
    }

    /// Stop all pumps without waiting for their sources to drain
    pub fn abort(&self) {
        for pump in &self.pumps {
            pump.abort();
        }
    }
}
