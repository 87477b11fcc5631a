//! Termination policy and loadable process settings

use std::path::PathBuf;
use std::time::Duration;

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use crate::{
    error::{ProcessError, Result},
    invocation::{with_cancel_signal, with_policy, CancelSignal, CaptureOption},
};

/// Poll interval used by Stop
pub const DEFAULT_STOP_TICK: Duration = Duration::from_secs(1);

/// Ceiling after which Stop gives up with a timeout
pub const DEFAULT_STOP_CEILING: Duration = Duration::from_secs(10);

/// Timing of the graceful-termination protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopPolicy {
    /// Interval between exit checks; escalation happens after the first one
    pub tick: Duration,
    /// Total time Stop waits for the process to exit
    pub ceiling: Duration,
}

impl StopPolicy {
    pub fn new(tick: Duration, ceiling: Duration) -> Self {
        Self { tick, ceiling }
    }

    /// Validate that the ceiling leaves room for at least one exit check after
    /// escalating, i.e. `ceiling > tick`
    pub fn validate(&self) -> Result<()> {
        if self.tick.is_zero() {
            return Err(ProcessError::Settings(
                "stop tick must be greater than 0".to_string(),
            ));
        }
        if self.ceiling <= self.tick {
            return Err(ProcessError::Settings(format!(
                "stop ceiling {:?} must be longer than tick {:?}",
                self.ceiling, self.tick
            )));
        }
        Ok(())
    }
}

impl Default for StopPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_STOP_TICK, DEFAULT_STOP_CEILING)
    }
}

/// Process settings as read from a config file or the environment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessSettings {
    /// Stop poll interval in milliseconds
    pub stop_tick_ms: u64,
    /// Stop ceiling in milliseconds
    pub stop_ceiling_ms: u64,
    /// Signal sent when a cancellation scope fires
    pub cancel_signal: CancelSignal,
}

impl Default for ProcessSettings {
    fn default() -> Self {
        Self {
            stop_tick_ms: DEFAULT_STOP_TICK.as_millis() as u64,
            stop_ceiling_ms: DEFAULT_STOP_CEILING.as_millis() as u64,
            cancel_signal: CancelSignal::default(),
        }
    }
}

impl ProcessSettings {
    pub fn stop_policy(&self) -> StopPolicy {
        StopPolicy::new(
            Duration::from_millis(self.stop_tick_ms),
            Duration::from_millis(self.stop_ceiling_ms),
        )
    }

    pub fn validate(&self) -> Result<()> {
        self.stop_policy().validate()
    }

    /// Options applying these settings to a [`Capture`](crate::Capture)
    pub fn options(&self) -> Vec<CaptureOption> {
        vec![
            with_policy(self.stop_policy()),
            with_cancel_signal(self.cancel_signal),
        ]
    }
}

/// Loads [`ProcessSettings`] from an optional file and prefixed env vars
#[derive(Debug, Clone)]
pub struct SettingsLoader {
    /// Settings file (format picked from the extension)
    path: Option<PathBuf>,
    /// Environment prefix, e.g. `CMDCAP_STOP_TICK_MS`
    env_prefix: String,
}

impl SettingsLoader {
    pub fn new() -> Self {
        Self {
            path: None,
            env_prefix: "CMDCAP".to_string(),
        }
    }

    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = prefix.into();
        self
    }

    pub fn load(&self) -> Result<ProcessSettings> {
        let mut builder = Config::builder();

        if let Some(path) = &self.path {
            builder = builder.add_source(File::from(path.clone()).required(false));
        }

        let builder = builder.add_source(Environment::with_prefix(&self.env_prefix).try_parsing(true));

        let settings: ProcessSettings = builder.build()?.try_deserialize()?;
        settings.validate()?;

        tracing::debug!(
            stop_tick_ms = settings.stop_tick_ms,
            stop_ceiling_ms = settings.stop_ceiling_ms,
            cancel_signal = ?settings.cancel_signal,
            "Loaded process settings"
        );

        Ok(settings)
    }
}

impl Default for SettingsLoader {
    fn default() -> Self {
        Self::new()
    }
}
