//! Internal utilities for streaming command output to logs.
//!
//! This module handles reading from stdout/stderr pipes, logging the output
//! in real-time during command execution, and optionally keeping a copy for
//! callers that consume the output (fact discovery, benign-failure matching).

use std::io::{BufRead, BufReader, Read};

use super::Secrets;

/// Type of output stream for logging purposes.
#[derive(Clone, Copy)]
pub(super) enum StreamType {
    Stdout,
    Stderr,
}

impl std::fmt::Display for StreamType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stdout => f.write_str("stdout"),
            Self::Stderr => f.write_str("stderr"),
        }
    }
}

/// Extracts a human-readable message from a thread panic.
///
/// The returned `&str` borrows from the panic payload, so it is valid
/// as long as the `err` reference is valid.
pub(super) fn panic_message(err: &(dyn std::any::Any + Send)) -> &str {
    err.downcast_ref::<&str>()
        .copied()
        .or_else(|| err.downcast_ref::<String>().map(|s| s.as_str()))
        .unwrap_or("unknown panic")
}

/// Reads from a pipe and logs each line in real-time.
///
/// - Query output (`quiet`) is logged at DEBUG level; otherwise stdout is
///   logged at INFO and stderr at WARN, so package manager progress is
///   visible during a run.
/// - Binary data uses lossy UTF-8 conversion
/// - I/O errors stop reading but don't fail command execution
///   (command success is determined by exit status)
/// - Logged lines have `secrets` masked; the captured copy is verbatim
/// - Returns the collected text when `capture` is set, otherwise an empty string
pub(super) fn read_pipe<R: Read>(
    pipe: Option<R>,
    stream_type: StreamType,
    capture: bool,
    quiet: bool,
    secrets: &Secrets,
) -> String {
    let Some(pipe) = pipe else {
        tracing::error!(
            stream = %stream_type,
            "pipe was None (unexpected: Stdio::piped() was set), no output will be captured"
        );
        return String::new();
    };

    let mut reader = BufReader::new(pipe);
    let mut line_buf = Vec::new();
    let mut captured = String::new();

    loop {
        line_buf.clear();
        match reader.read_until(b'\n', &mut line_buf) {
            Ok(0) => break, // EOF
            Ok(_) => {
                let content = line_buf.strip_suffix(b"\n").unwrap_or(&line_buf);
                let text = String::from_utf8_lossy(content);
                let trimmed = text.trim_end_matches('\r');
                log_line(&secrets.redact(trimmed), stream_type, quiet);
                if capture {
                    captured.push_str(trimmed);
                    captured.push('\n');
                }
            }
            Err(e) => {
                tracing::error!(stream = %stream_type, error = %e, "I/O error, stopping read");
                break;
            }
        }
    }

    captured
}

fn log_line(line: &str, stream_type: StreamType, quiet: bool) {
    if quiet {
        tracing::debug!(stream = %stream_type, "{}", line);
        return;
    }
    match stream_type {
        StreamType::Stdout => tracing::info!(stream = %stream_type, "{}", line),
        StreamType::Stderr => tracing::warn!(stream = %stream_type, "{}", line),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_pipe_captures_lines_and_trims_crlf() {
        let input: &[u8] = b"3.0.26\r\nsecond line\nno newline";
        let captured = read_pipe(Some(input), StreamType::Stdout, true, false, &Secrets::default());
        assert_eq!(captured, "3.0.26\nsecond line\nno newline\n");
    }

    #[test]
    fn test_read_pipe_keeps_secret_in_captured_copy() {
        let input: &[u8] = b"password=hunter2\n";
        let secrets = Secrets::new(["hunter2"]);
        let captured = read_pipe(Some(input), StreamType::Stdout, true, true, &secrets);
        assert_eq!(captured, "password=hunter2\n");
    }

    #[test]
    fn test_read_pipe_without_capture_returns_empty() {
        let input: &[u8] = b"progress\n";
        assert!(read_pipe(Some(input), StreamType::Stderr, false, false, &Secrets::default()).is_empty());
    }

    #[test]
    fn test_read_pipe_none_returns_empty() {
        assert!(read_pipe(None::<&[u8]>, StreamType::Stdout, true, true, &Secrets::default()).is_empty());
    }

    #[test]
    fn test_panic_message_variants() {
        let owned: Box<dyn std::any::Any + Send> = Box::new("boom".to_string());
        assert_eq!(panic_message(&*owned), "boom");
        let unknown: Box<dyn std::any::Any + Send> = Box::new(42_u8);
        assert_eq!(panic_message(&*unknown), "unknown panic");
    }
}
