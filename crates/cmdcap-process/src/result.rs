//! One-shot capture of a command's combined output

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::{capture::Capture, error::ProcessError, invocation::with_env};

/// Record of a single execution: what ran and what it printed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureResult {
    /// Program as given to [`CaptureResult::capture`]
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    /// `None` inherits the caller's environment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<Vec<String>>,
    /// Interleaved stdout and stderr, lossily decoded
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub output: String,
    /// Zero also when the command never ran
    #[serde(default)]
    pub exit_code: i32,
}

/// A failed capture. The best-effort result is always attached.
#[derive(Debug, thiserror::Error)]
#[error("{source}")]
pub struct CaptureFailure {
    pub result: CaptureResult,
    pub source: ProcessError,
}

impl CaptureFailure {
    pub fn into_result(self) -> CaptureResult {
        self.result
    }
}

impl CaptureResult {
    /// Run `name` once with combined output captured
    pub async fn capture<I, S>(
        cancel: &CancellationToken,
        env: Option<Vec<String>>,
        name: &str,
        args: I,
    ) -> Result<Self, CaptureFailure>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let args: Vec<String> = args.into_iter().map(Into::into).collect();
        let mut capture = Capture::new(env.clone().map(|env| with_env(env)));
        let outcome = capture.combined_output(cancel, name, args.clone()).await;

        let mut result = Self {
            name: name.to_string(),
            args,
            env,
            output: String::new(),
            exit_code: capture.exit_code(),
        };

        match outcome {
            Ok(output) => {
                result.output = String::from_utf8_lossy(&output).into_owned();
                Ok(result)
            }
            Err(source) => {
                if let Some(output) = source.output() {
                    result.output = String::from_utf8_lossy(&output.stdout).into_owned();
                }
                Err(CaptureFailure { result, source })
            }
        }
    }

    /// Run the same name, args and env again
    pub async fn recapture(&self, cancel: &CancellationToken) -> Result<Self, CaptureFailure> {
        Self::capture(cancel, self.env.clone(), &self.name, self.args.clone()).await
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_capture_invalid_command() {
        let failure = CaptureResult::capture(
            &CancellationToken::new(),
            None,
            "asdfasdf",
            Vec::<String>::new(),
        )
        .await
        .unwrap_err();

        assert!(matches!(failure.source, ProcessError::SpawnFailed(_)));
        assert_eq!(failure.result.output, "");
        assert_eq!(failure.result.exit_code, 0);
    }

    #[tokio::test]
    async fn test_capture_nonzero_keeps_result() {
        let failure = CaptureResult::capture(
            &CancellationToken::new(),
            None,
            "/bin/bash",
            ["-c", "echo oops; exit 1"],
        )
        .await
        .unwrap_err();

        let result = failure.into_result();
        assert_eq!(result.name, "/bin/bash");
        assert_eq!(result.args, ["-c", "echo oops; exit 1"]);
        assert_eq!(result.output, "oops\n");
        assert_eq!(result.exit_code, 1);
    }

    #[tokio::test]
    async fn test_capture_cancelled() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let failure = CaptureResult::capture(&cancel, None, "/bin/bash", ["-c", "exit 0"])
            .await
            .unwrap_err();
        assert!(matches!(failure.source, ProcessError::Cancelled { .. }));
    }

    #[tokio::test]
    async fn test_capture_cancelled_keeps_partial_output() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(300)).await;
            trigger.cancel();
        });

        let failure = CaptureResult::capture(
            &cancel,
            None,
            "/bin/sh",
            ["-c", "echo partial; echo more 1>&2; exec sleep 30"],
        )
        .await
        .unwrap_err();

        assert!(matches!(failure.source, ProcessError::Cancelled { .. }));
        assert_eq!(failure.result.output, "partial\nmore\n");
    }

    #[tokio::test]
    async fn test_capture_stderr_and_env() {
        let cancel = CancellationToken::new();
        let result = CaptureResult::capture(&cancel, None, "/bin/bash", ["-c", "echo message 1>&2"])
            .await
            .unwrap();
        assert_eq!(result.output, "message\n");

        let env = Some(vec!["A=A".to_string(), "B=B".to_string()]);
        let result = CaptureResult::capture(&cancel, env, "/bin/bash", ["-c", "echo $A $B"])
            .await
            .unwrap();
        assert_eq!(result.output, "A B\n");
        assert_eq!(result.exit_code, 0);
    }

    #[tokio::test]
    async fn test_recapture_matches() {
        let cancel = CancellationToken::new();
        let first = CaptureResult::capture(&cancel, None, "/bin/bash", ["-c", "echo $A $B"])
            .await
            .unwrap();
        let second = first.recapture(&cancel).await.unwrap();

        assert_eq!(first, second);
    }

    #[test]
    fn test_serialized_field_names() {
        let result = CaptureResult {
            name: "echo".to_string(),
            exit_code: 2,
            ..Default::default()
        };
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json, serde_json::json!({"name": "echo", "exitCode": 2}));

        let back: CaptureResult = serde_json::from_value(json).unwrap();
        assert_eq!(back, result);
    }
}
