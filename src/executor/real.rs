//! Real command executor implementation.
//!
//! This module provides [`RealCommandExecutor`], which executes commands
//! using `std::process::Command` with real-time output streaming, optional
//! output capture and a per-call timeout.

use std::os::unix::process::CommandExt;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::Result;
use rustix::process::{Pid, Signal, kill_process_group};
use which::which;

use super::pipe::{StreamType, panic_message, read_pipe};
use super::{CommandExecutor, CommandSpec, ExecutionResult};
use crate::error::ProvisionError;

/// Interval between `try_wait` polls while a timeout is armed.
const TIMEOUT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Cleans up a child process and its associated reader threads.
///
/// Kills the child's whole process group, waits for the child to
/// terminate, and joins all reader threads to prevent resource leaks.
/// Killing only the child would leave its descendants holding the output
/// pipes, and the readers would block until they exit.
fn cleanup_child_process<I>(child: &mut Child, handles: I)
where
    I: IntoIterator<Item = JoinHandle<String>>,
{
    let pid = child.id();
    if let Err(e) = kill_process_group(Pid::from_child(child), Signal::KILL) {
        tracing::debug!(pid = pid, "killpg returned error (group may have already exited): {}", e);
        if let Err(e) = child.kill() {
            tracing::debug!(pid = pid, "kill returned error (process may have already exited): {}", e);
        }
    }
    if let Err(e) = child.wait() {
        tracing::warn!(pid = pid, "failed to wait for child process after kill: {}", e);
    }
    for handle in handles {
        if let Err(e) = handle.join() {
            tracing::warn!("reader thread panicked during cleanup: {}", panic_message(&*e));
        }
    }
}

/// Waits for the child, polling until `timeout` elapses.
///
/// Returns `Ok(None)` if the deadline passed while the child was still running.
fn wait_with_timeout(child: &mut Child, timeout: Duration) -> std::io::Result<Option<ExitStatus>> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if Instant::now() >= deadline {
            return Ok(None);
        }
        thread::sleep(TIMEOUT_POLL_INTERVAL);
    }
}

fn execution_error(spec: &CommandSpec, status: impl Into<String>) -> anyhow::Error {
    ProvisionError::Execution {
        command: spec.display(),
        status: status.into(),
    }
    .into()
}

/// Command executor that runs actual system commands.
///
/// When `dry_run` is true, commands that mutate host state are logged but not
/// executed, and `execute()` returns a result without exit status. Queries
/// ([`CommandSpec::query`]) always run.
pub struct RealCommandExecutor {
    pub dry_run: bool,
}

impl CommandExecutor for RealCommandExecutor {
    fn execute(&self, spec: &CommandSpec) -> Result<ExecutionResult> {
        if self.dry_run && !spec.query {
            tracing::info!("dry run: {}", spec.display());
            return Ok(ExecutionResult::dry_run());
        }

        let cmd = which(&spec.command).map_err(|_| ProvisionError::CommandNotFound {
            command: spec.command.clone(),
        })?;
        tracing::trace!("command found: {}: {}", spec.command, cmd.to_string_lossy());

        let mut command = Command::new(cmd);
        command.args(&spec.args);

        if let Some(ref cwd) = spec.cwd {
            command.current_dir(cwd);
        }

        for (key, value) in &spec.env {
            command.env(key, value);
        }

        // Own process group, so a timeout can take down the whole tree.
        command.process_group(0);
        command.stdin(Stdio::null());
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());

        let mut child = command
            .spawn()
            .map_err(|e| execution_error(spec, format!("failed to spawn: {}", e)))?;

        tracing::trace!("spawned command: {}: pid={}", spec.command, child.id());

        let stdout_pipe = child.stdout.take();
        let stderr_pipe = child.stderr.take();
        let capture = spec.capture;
        let quiet = spec.query;
        let stdout_secrets = spec.secrets.clone();
        let stderr_secrets = spec.secrets.clone();

        let stdout_handle = match thread::Builder::new()
            .name("stdout-reader".to_string())
            .spawn(move || read_pipe(stdout_pipe, StreamType::Stdout, capture, quiet, &stdout_secrets))
        {
            Ok(handle) => handle,
            Err(e) => {
                cleanup_child_process(&mut child, []);
                return Err(execution_error(
                    spec,
                    format!("failed to spawn stdout reader thread: {}", e),
                ));
            }
        };

        let stderr_handle = match thread::Builder::new()
            .name("stderr-reader".to_string())
            .spawn(move || read_pipe(stderr_pipe, StreamType::Stderr, capture, quiet, &stderr_secrets))
        {
            Ok(handle) => handle,
            Err(e) => {
                cleanup_child_process(&mut child, [stdout_handle]);
                return Err(execution_error(
                    spec,
                    format!("failed to spawn stderr reader thread: {}", e),
                ));
            }
        };

        let waited = match spec.timeout {
            Some(timeout) => wait_with_timeout(&mut child, timeout),
            None => child.wait().map(Some),
        };

        let status = match waited {
            Ok(Some(s)) => s,
            Ok(None) => {
                cleanup_child_process(&mut child, [stdout_handle, stderr_handle]);
                let timeout = spec.timeout.unwrap_or_default();
                return Err(execution_error(
                    spec,
                    format!("timed out after {}s", timeout.as_secs_f64()),
                ));
            }
            Err(e) => {
                // The process might still be running; kill it and join the readers.
                cleanup_child_process(&mut child, [stdout_handle, stderr_handle]);
                return Err(execution_error(spec, format!("failed to wait for command: {}", e)));
            }
        };

        let mut panicked_streams = Vec::new();
        let mut outputs = Vec::with_capacity(2);
        let handles = [("stdout", stdout_handle), ("stderr", stderr_handle)];
        for (name, handle) in handles {
            match handle.join() {
                Ok(output) => outputs.push(output),
                Err(e) => {
                    let msg = panic_message(&*e);
                    tracing::error!(stream = name, panic = msg, "reader thread panicked");
                    panicked_streams.push(format!("{}: {}", name, msg));
                    outputs.push(String::new());
                }
            }
        }

        if !panicked_streams.is_empty() {
            return Err(execution_error(
                spec,
                format!(
                    "reader thread(s) panicked during command execution: {}",
                    panicked_streams.join(", ")
                ),
            ));
        }

        tracing::trace!("executed command: {}: success={}", spec.command, status.success());

        let stderr = outputs.pop().unwrap_or_default();
        let stdout = outputs.pop().unwrap_or_default();
        Ok(ExecutionResult {
            status: Some(status),
            stdout,
            stderr,
        })
    }

    fn dry_run(&self) -> bool {
        self.dry_run
    }
}
