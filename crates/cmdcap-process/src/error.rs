//! Error types for command lifecycle management

use std::io;
use std::time::Duration;
use thiserror::Error;

use crate::capture::CapturedOutput;

/// Boxed error returned by launch modifiers
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Command lifecycle errors
#[derive(Debug, Error)]
pub enum ProcessError {
    /// Invalid invocation (empty name, malformed environment entry)
    #[error("Invalid command configuration: {0}")]
    InvalidConfig(String),

    /// Pre-launch modifier rejected the launch request
    #[error("Launch modifier failed: {0}")]
    Modifier(#[source] BoxError),

    /// Failed to spawn process
    #[error("Failed to spawn process: {0}")]
    SpawnFailed(#[source] io::Error),

    /// Process ran but exited with a non-zero code or was signaled
    #[error("Process exited abnormally with code {code}")]
    AbnormalExit {
        /// Extracted exit code (-1 when terminated by a signal)
        code: i32,
        /// Output captured before exit, empty for interactive runs
        output: Box<CapturedOutput>,
    },

    /// Stop or Wait called without a recorded handle
    #[error("Command was not started")]
    NotStarted,

    /// Kill called without a recorded handle
    #[error("Command is not running")]
    NotRunning,

    /// Termination ceiling elapsed without an observed exit
    #[error("Process did not exit within {ceiling:?}")]
    Timeout { ceiling: Duration },

    /// Cancellation scope fired before or during execution
    #[error("Command was cancelled")]
    Cancelled {
        /// Output captured before cancellation, empty if nothing ran
        output: Box<CapturedOutput>,
    },

    /// One of the standard streams could not be attached
    #[error("Standard {stream} stream unavailable")]
    StreamUnavailable { stream: &'static str },

    /// IO error while moving bytes to or from the child
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Settings could not be loaded or failed validation
    #[error("Settings error: {0}")]
    Settings(String),
}

impl ProcessError {
    /// Exit code carried by an abnormal exit
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::AbnormalExit { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Cancellation that happened before anything ran
    pub fn cancelled() -> Self {
        Self::Cancelled {
            output: Box::default(),
        }
    }

    /// Output captured before an abnormal exit or a cancellation
    pub fn output(&self) -> Option<&CapturedOutput> {
        match self {
            Self::AbnormalExit { output, .. } | Self::Cancelled { output } => Some(output.as_ref()),
            _ => None,
        }
    }

    /// Whether retrying Stop may succeed
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

impl From<config::ConfigError> for ProcessError {
    fn from(err: config::ConfigError) -> Self {
        Self::Settings(err.to_string())
    }
}

/// Result type for process operations
pub type Result<T> = std::result::Result<T, ProcessError>;
