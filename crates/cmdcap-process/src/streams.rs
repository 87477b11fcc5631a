//! Stream triple: the child's stdin, stdout and stderr conduits

use std::io;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout};

use crate::error::{ProcessError, Result};

/// The three standard conduits of one live process.
///
/// Owned by the controller for the life of one handle. Readers are
/// buffered so raw reads and line reads can be mixed on the same stream.
#[derive(Debug)]
pub struct StreamTriple {
    input: Option<ChildStdin>,
    output: BufReader<ChildStdout>,
    err_output: BufReader<ChildStderr>,
}

impl StreamTriple {
    /// Take all three piped streams from a freshly spawned child.
    ///
    /// Streams are taken in order input, output, error. If any is missing
    /// the ones already taken are dropped (closing them) and no triple is
    /// returned; the caller owns cleanup of the child itself.
    pub(crate) fn attach(child: &mut Child) -> Result<Self> {
        let attached = (child.stdin.take(), child.stdout.take(), child.stderr.take());

        match attached {
            (Some(input), Some(output), Some(err_output)) => Ok(Self {
                input: Some(input),
                output: BufReader::new(output),
                err_output: BufReader::new(err_output),
            }),
            (input, output, _) => {
                let stream = if input.is_none() {
                    "input"
                } else if output.is_none() {
                    "output"
                } else {
                    "error"
                };
                Err(ProcessError::StreamUnavailable { stream })
            }
        }
    }

    /// Writable end of the child's stdin, `None` once closed
    pub fn input(&mut self) -> Option<&mut ChildStdin> {
        self.input.as_mut()
    }

    pub fn output(&mut self) -> &mut BufReader<ChildStdout> {
        &mut self.output
    }

    pub fn err_output(&mut self) -> &mut BufReader<ChildStderr> {
        &mut self.err_output
    }

    /// Write and flush bytes to the child's stdin
    pub async fn write_input(&mut self, bytes: &[u8]) -> io::Result<()> {
        let Some(input) = self.input.as_mut() else {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "input already closed"));
        };
        input.write_all(bytes).await?;
        input.flush().await
    }

    /// Close stdin so line-oriented children see end-of-input.
    /// Closing twice is a no-op.
    pub fn close_input(&mut self) {
        if self.input.take().is_some() {
            tracing::debug!("Closed child input");
        }
    }

    pub fn is_input_closed(&self) -> bool {
        self.input.is_none()
    }

    /// Next stdout line without the trailing newline, `None` at end of stream.
    /// Invalid UTF-8 is replaced rather than rejected.
    pub async fn read_output_line(&mut self) -> io::Result<Option<String>> {
        Ok(next_line(&mut self.output).await?.map(lossy))
    }

    /// Next stderr line without the trailing newline, `None` at end of stream.
    /// Invalid UTF-8 is replaced rather than rejected.
    pub async fn read_err_line(&mut self) -> io::Result<Option<String>> {
        Ok(next_line(&mut self.err_output).await?.map(lossy))
    }

    /// Next raw stdout line without the trailing newline
    pub async fn read_output_line_bytes(&mut self) -> io::Result<Option<Vec<u8>>> {
        next_line(&mut self.output).await
    }

    /// Next raw stderr line without the trailing newline
    pub async fn read_err_line_bytes(&mut self) -> io::Result<Option<Vec<u8>>> {
        next_line(&mut self.err_output).await
    }

    /// Drain stdout until the child closes it
    pub async fn read_output_to_end(&mut self) -> io::Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.output.read_to_end(&mut buf).await?;
        Ok(buf)
    }

    /// Drain stderr until the child closes it
    pub async fn read_err_to_end(&mut self) -> io::Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.err_output.read_to_end(&mut buf).await?;
        Ok(buf)
    }
}

async fn next_line<R>(reader: &mut R) -> io::Result<Option<Vec<u8>>>
where
    R: AsyncBufReadExt + Unpin,
{
    let mut line = Vec::new();
    if reader.read_until(b'\n', &mut line).await? == 0 {
        return Ok(None);
    }
    if line.ends_with(b"\n") {
        line.pop();
        if line.ends_with(b"\r") {
            line.pop();
        }
    }
    Ok(Some(line))
}

fn lossy(line: Vec<u8>) -> String {
    match String::from_utf8(line) {
        Ok(line) => line,
        Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::process::Stdio;
    use tokio::process::Command;

    fn spawn_piped(program: &str, args: &[&str]) -> Child {
        Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .unwrap()
    }

    #[tokio::test]
    async fn test_attach_and_echo_through_cat() {
        let mut child = spawn_piped("cat", &[]);
        let mut streams = StreamTriple::attach(&mut child).unwrap();

        streams.write_input(b"hello\n").await.unwrap();
        streams.close_input();
        assert!(streams.is_input_closed());

        let out = streams.read_output_to_end().await.unwrap();
        assert_eq!(out, b"hello\n");
        child.wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_attach_fails_without_stdin() {
        let mut child = Command::new("true")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .unwrap();

        let err = StreamTriple::attach(&mut child).unwrap_err();
        assert!(matches!(err, ProcessError::StreamUnavailable { stream: "input" }));
        // taken streams were dropped, nothing left on the child
        assert!(child.stdout.is_none());
        assert!(child.stderr.is_none());
        child.wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_line_reading() {
        let mut child = spawn_piped("sh", &["-c", "printf 'one\\ntwo\\r\\nlast'; echo err 1>&2"]);
        let mut streams = StreamTriple::attach(&mut child).unwrap();

        assert_eq!(streams.read_output_line().await.unwrap().as_deref(), Some("one"));
        assert_eq!(streams.read_output_line().await.unwrap().as_deref(), Some("two"));
        assert_eq!(streams.read_output_line().await.unwrap().as_deref(), Some("last"));
        assert_eq!(streams.read_output_line().await.unwrap(), None);
        assert_eq!(streams.read_err_line().await.unwrap().as_deref(), Some("err"));
        child.wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_non_utf8_lines_are_not_lost() {
        let mut child = spawn_piped(
            "sh",
            &["-c", "printf '\\377\\376\\nok\\n'; printf 'bad\\377\\n' 1>&2"],
        );
        let mut streams = StreamTriple::attach(&mut child).unwrap();

        let raw = streams.read_output_line_bytes().await.unwrap();
        assert_eq!(raw, Some(vec![0xff, 0xfe]));
        assert_eq!(streams.read_output_line().await.unwrap().as_deref(), Some("ok"));
        assert_eq!(streams.read_output_line_bytes().await.unwrap(), None);

        let decoded = streams.read_err_line().await.unwrap();
        assert_eq!(decoded.as_deref(), Some("bad\u{fffd}"));
        child.wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_input_twice_is_noop() {
        let mut child = spawn_piped("cat", &[]);
        let mut streams = StreamTriple::attach(&mut child).unwrap();

        streams.close_input();
        streams.close_input();
        let err = streams.write_input(b"late").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
        child.wait().await.unwrap();
    }
}
