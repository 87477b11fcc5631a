//! Invocation description, options and the concrete launch request

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::process::Command;

use crate::{
    config::StopPolicy,
    error::{BoxError, ProcessError, Result},
};

/// Hook applied to the launch request right before spawning.
///
/// Returning an error aborts the launch; no process is spawned.
pub type LaunchModifier =
    Arc<dyn Fn(&mut LaunchRequest) -> std::result::Result<(), BoxError> + Send + Sync>;

/// Signal delivered to the child when its cancellation scope fires
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CancelSignal {
    /// SIGTERM on unix
    #[default]
    Terminate,
    /// SIGINT on unix
    Interrupt,
    /// Immediate kill
    Kill,
}

#[cfg(unix)]
impl CancelSignal {
    /// Signal to send through `kill(2)`, `None` means use `Child::start_kill`
    pub(crate) fn as_nix(self) -> Option<nix::sys::signal::Signal> {
        use nix::sys::signal::Signal;

        match self {
            Self::Terminate => Some(Signal::SIGTERM),
            Self::Interrupt => Some(Signal::SIGINT),
            Self::Kill => None,
        }
    }
}

/// What to run and how: name, args, working directory, environment.
///
/// `env` distinguishes "inherit" (`None`) from "explicitly empty"
/// (`Some(vec![])`). The modifier is not serialized and must be re-applied
/// after deserialization.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct Invocation {
    pub(crate) name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub(crate) args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) env: Option<Vec<String>>,
    #[serde(skip)]
    pub(crate) modifier: Option<LaunchModifier>,
    #[serde(skip)]
    pub(crate) cancel_signal: CancelSignal,
}

impl fmt::Debug for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Invocation")
            .field("name", &self.name)
            .field("args", &self.args)
            .field("dir", &self.dir)
            .field("env", &self.env)
            .field("modifier", &self.modifier.is_some())
            .field("cancel_signal", &self.cancel_signal)
            .finish()
    }
}

impl Invocation {
    /// Derive the concrete launch request, running the modifier stage last
    pub(crate) fn launch_request(&self) -> Result<LaunchRequest> {
        if self.name.is_empty() {
            return Err(ProcessError::InvalidConfig(
                "program name must not be empty".to_string(),
            ));
        }

        let env = self.env.as_deref().map(parse_env).transpose()?;

        let mut request = LaunchRequest {
            program: self.name.clone(),
            args: self.args.clone(),
            dir: self.dir.clone(),
            env,
            process_group: None,
            kill_on_drop: false,
            cancel_signal: self.cancel_signal,
        };

        if let Some(modifier) = &self.modifier {
            modifier(&mut request).map_err(ProcessError::Modifier)?;
        }

        Ok(request)
    }
}

/// Split `KEY=VALUE` entries. Later duplicates override earlier ones at spawn.
pub(crate) fn parse_env(entries: &[String]) -> Result<Vec<(String, String)>> {
    entries
        .iter()
        .map(|entry| match entry.split_once('=') {
            Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
            _ => Err(ProcessError::InvalidConfig(format!(
                "environment entry {entry:?} is not KEY=VALUE"
            ))),
        })
        .collect()
}

/// Concrete launch request handed to the modifier stage.
///
/// Program, args, directory and environment are fixed by the invocation
/// and readable only; the modifier may change the launch knobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRequest {
    program: String,
    args: Vec<String>,
    dir: Option<PathBuf>,
    env: Option<Vec<(String, String)>>,
    process_group: Option<i32>,
    kill_on_drop: bool,
    cancel_signal: CancelSignal,
}

impl LaunchRequest {
    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    /// Explicit environment, `None` when inherited
    pub fn env(&self) -> Option<&[(String, String)]> {
        self.env.as_deref()
    }

    pub fn process_group(&self) -> Option<i32> {
        self.process_group
    }

    /// Place the child in a process group (unix only, ignored elsewhere).
    /// `Some(0)` creates a new group led by the child.
    pub fn set_process_group(&mut self, pgid: Option<i32>) {
        self.process_group = pgid;
    }

    pub fn kill_on_drop(&self) -> bool {
        self.kill_on_drop
    }

    /// Kill the child if its handle is dropped while it is still running
    pub fn set_kill_on_drop(&mut self, kill_on_drop: bool) {
        self.kill_on_drop = kill_on_drop;
    }

    pub fn cancel_signal(&self) -> CancelSignal {
        self.cancel_signal
    }

    pub fn set_cancel_signal(&mut self, signal: CancelSignal) {
        self.cancel_signal = signal;
    }

    /// Build the tokio command. Stdio is configured by the caller.
    pub(crate) fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);

        if let Some(dir) = &self.dir {
            cmd.current_dir(dir);
        }

        if let Some(env) = &self.env {
            cmd.env_clear();
            cmd.envs(env.iter().map(|(key, value)| (key, value)));
        }

        #[cfg(unix)]
        {
            if let Some(pgid) = self.process_group {
                cmd.process_group(pgid);
            }
        }

        cmd.kill_on_drop(self.kill_on_drop);
        cmd
    }
}

/// Configuration function accepted by [`Capture::new`](crate::Capture::new)
/// and [`Capture::with`](crate::Capture::with)
#[derive(Clone)]
pub enum CaptureOption {
    /// Explicit environment as `KEY=VALUE` entries
    Env(Vec<String>),
    /// Working directory, an empty path means inherit
    Dir(PathBuf),
    /// Pre-launch modifier hook
    Modifier(LaunchModifier),
    /// Signal sent when the cancellation scope fires
    CancelSignal(CancelSignal),
    /// Graceful-termination timing used by Stop
    Policy(StopPolicy),
}

impl fmt::Debug for CaptureOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Env(env) => f.debug_tuple("Env").field(env).finish(),
            Self::Dir(dir) => f.debug_tuple("Dir").field(dir).finish(),
            Self::Modifier(_) => f.write_str("Modifier(..)"),
            Self::CancelSignal(signal) => f.debug_tuple("CancelSignal").field(signal).finish(),
            Self::Policy(policy) => f.debug_tuple("Policy").field(policy).finish(),
        }
    }
}

/// Set the environment
pub fn with_env<I, S>(env: I) -> CaptureOption
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    CaptureOption::Env(env.into_iter().map(Into::into).collect())
}

/// Set the working directory
pub fn with_dir(dir: impl Into<PathBuf>) -> CaptureOption {
    CaptureOption::Dir(dir.into())
}

/// Set the pre-launch modifier
pub fn with_modifier<F>(modifier: F) -> CaptureOption
where
    F: Fn(&mut LaunchRequest) -> std::result::Result<(), BoxError> + Send + Sync + 'static,
{
    CaptureOption::Modifier(Arc::new(modifier))
}

/// Set the cancellation signal
pub fn with_cancel_signal(signal: CancelSignal) -> CaptureOption {
    CaptureOption::CancelSignal(signal)
}

/// Set the Stop timing
pub fn with_policy(policy: StopPolicy) -> CaptureOption {
    CaptureOption::Policy(policy)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn invocation(name: &str) -> Invocation {
        Invocation {
            name: name.to_string(),
            ..Invocation::default()
        }
    }

    #[test]
    fn test_empty_name_rejected() {
        let err = invocation("").launch_request().unwrap_err();
        assert!(matches!(err, ProcessError::InvalidConfig(_)));
    }

    #[test]
    fn test_env_inherit_vs_empty() {
        let inherit = invocation("ls").launch_request().unwrap();
        assert!(inherit.env().is_none());

        let mut empty = invocation("ls");
        empty.env = Some(Vec::new());
        let request = empty.launch_request().unwrap();
        assert_eq!(request.env(), Some(&[] as &[(String, String)]));
    }

    #[test]
    fn test_parse_env_keeps_order_and_equals_in_value() {
        let entries = vec!["A=1".to_string(), "B=x=y".to_string(), "A=2".to_string()];
        let parsed = parse_env(&entries).unwrap();
        assert_eq!(
            parsed,
            vec![
                ("A".to_string(), "1".to_string()),
                ("B".to_string(), "x=y".to_string()),
                ("A".to_string(), "2".to_string()),
            ]
        );
    }

    #[test]
    fn test_parse_env_rejects_malformed_entries() {
        assert!(parse_env(&["NOVALUE".to_string()]).is_err());
        assert!(parse_env(&["=value".to_string()]).is_err());
        assert!(parse_env(&["EMPTY=".to_string()]).is_ok());
    }

    #[test]
    fn test_modifier_adjusts_knobs() {
        let mut inv = invocation("sleep");
        inv.args = vec!["1".to_string()];
        inv.modifier = Some(Arc::new(
            |req: &mut LaunchRequest| -> std::result::Result<(), BoxError> {
                req.set_process_group(Some(0));
                req.set_kill_on_drop(true);
                req.set_cancel_signal(CancelSignal::Interrupt);
                Ok(())
            },
        ));

        let request = inv.launch_request().unwrap();
        assert_eq!(request.program(), "sleep");
        assert_eq!(request.args(), ["1".to_string()]);
        assert_eq!(request.process_group(), Some(0));
        assert!(request.kill_on_drop());
        assert_eq!(request.cancel_signal(), CancelSignal::Interrupt);
    }

    #[test]
    fn test_modifier_failure_aborts() {
        let mut inv = invocation("ls");
        inv.modifier = Some(Arc::new(
            |_: &mut LaunchRequest| -> std::result::Result<(), BoxError> { Err("denied".into()) },
        ));

        let err = inv.launch_request().unwrap_err();
        assert!(matches!(err, ProcessError::Modifier(_)));
        assert_eq!(err.to_string(), "Launch modifier failed: denied");
    }

    #[test]
    fn test_serialization_omits_defaults() {
        let json = serde_json::to_value(invocation("ls")).unwrap();
        assert_eq!(json, serde_json::json!({ "name": "ls" }));

        let mut explicit = invocation("ls");
        explicit.env = Some(Vec::new());
        let json = serde_json::to_value(&explicit).unwrap();
        assert_eq!(json, serde_json::json!({ "name": "ls", "env": [] }));
    }
}
