//! # cmdcap-process
//!
//! **Purpose**: Lifecycle management for a single, re-runnable external command
//!
//! Wraps one command invocation (program, arguments, working directory,
//! environment) in a controller that can run it to completion, start it
//! interactively, and stop, kill or re-run it.
//!
//! ## Features
//!
//! - **Blocking Runs**: Run to completion with stdout/stderr captured, or combined
//! - **Interactive Mode**: Start and drive the child's stdin/stdout/stderr directly
//! - **Wired Mode**: Background pumps bridge caller readers and writers to the child
//! - **Graceful Stop**: Cancel, poll, escalate to kill, give up at a ceiling
//! - **Deferred Kill**: Kill after a delay or at a deadline from a background task
//! - **Re-execution**: Rerun or restart with the recorded name and arguments
//! - **Launch Modifier**: Adjust the launch request right before spawning
//! - **Settings**: Load the stop policy from a file and `CMDCAP_*` env vars
//!
//! ## Usage
//!
//! ```rust,no_run
//! use cmdcap_process::{with_env, Capture};
//! use tokio_util::sync::CancellationToken;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let cancel = CancellationToken::new();
//! let mut capture = Capture::new([with_env(["GREETING=hello"])]);
//!
//! // Run to completion
//! let output = capture.run(&cancel, "/bin/sh", ["-c", "echo $GREETING"]).await?;
//! assert_eq!(output.stdout, b"hello\n");
//!
//! // Start interactively and stop gracefully
//! let streams = capture.start(&cancel, "cat", Vec::<String>::new()).await?;
//! streams.write_input(b"ping\n").await?;
//! capture.stop().await?;
//! # Ok(())
//! # }
//! ```

pub mod capture;
pub mod config;
pub mod error;
pub mod handle;
pub mod invocation;
pub mod pump;
pub mod result;
pub mod streams;
mod timer;

pub use capture::{Capture, CapturedOutput, LifecycleState};
pub use crate::config::{ProcessSettings, SettingsLoader, StopPolicy};
pub use error::{BoxError, ProcessError, Result};
pub use handle::{ExitOutcome, ProcessControl};
pub use invocation::{
    with_cancel_signal, with_dir, with_env, with_modifier, with_policy, CancelSignal,
    CaptureOption, Invocation, LaunchModifier, LaunchRequest,
};
pub use pump::{PumpSet, PumpSink, PumpSource, WiredIo};
pub use result::{CaptureFailure, CaptureResult};
pub use streams::StreamTriple;
