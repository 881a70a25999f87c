//! Execution utilities for step command dispatch.
//!
//! Provides command execution with exit-status checking that honors a step's
//! declared tolerance for benign non-zero exits.

use std::time::Duration;

use anyhow::Result;
use regex::Regex;

use crate::error::ProvisionError;
use crate::executor::{CommandExecutor, CommandSpec, ExecutionResult};

/// Number of trailing stderr lines quoted in failure messages.
const STDERR_TAIL_LINES: usize = 5;

/// Which non-zero exits a step treats as success.
#[derive(Debug, Clone, Default)]
pub struct Tolerance {
    /// Extra exit codes treated as success.
    pub accept_exit_codes: Vec<i32>,
    /// A non-zero exit whose stdout or stderr matches is treated as success.
    pub benign_output: Option<Regex>,
    /// Per-call timeout.
    pub timeout: Option<Duration>,
}

impl Tolerance {
    fn tolerates(&self, result: &ExecutionResult) -> Option<String> {
        let code = result.code()?;
        if self.accept_exit_codes.contains(&code) {
            return Some(format!("tolerated exit status {}", code));
        }
        if let Some(re) = &self.benign_output
            && (re.is_match(&result.stdout) || re.is_match(&result.stderr))
        {
            return Some(format!(
                "tolerated exit status {}: output matched '{}'",
                code,
                re.as_str()
            ));
        }
        None
    }
}

fn stderr_tail(stderr: &str) -> String {
    let lines: Vec<&str> = stderr.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = lines.len().saturating_sub(STDERR_TAIL_LINES);
    lines[start..].join("\n")
}

/// Executes `spec` and checks the result against `tolerance`.
///
/// Output is always captured so failures can quote stderr and benign
/// patterns can be matched. Returns a note for the report when the run was
/// a dry run or a non-zero exit was tolerated.
pub(crate) fn execute_and_check(
    executor: &dyn CommandExecutor,
    spec: CommandSpec,
    tolerance: &Tolerance,
) -> Result<Option<String>> {
    let spec = spec.with_capture(true).with_timeout(tolerance.timeout);
    let result = executor.execute(&spec)?;
    check_execution_result(&result, &spec, tolerance, executor.dry_run())
}

/// Checks the execution result and returns an error if the command failed.
///
/// Handles four cases:
/// - Exit 0: success
/// - Non-zero exit tolerated by the step: success with a note
/// - Non-zero exit otherwise: `Execution` error quoting the tail of stderr
/// - No exit status: success in dry-run mode, `Execution` error otherwise
///   (e.g., killed by signal)
pub(crate) fn check_execution_result(
    result: &ExecutionResult,
    spec: &CommandSpec,
    tolerance: &Tolerance,
    dry_run: bool,
) -> Result<Option<String>> {
    match result.status {
        Some(status) if status.success() => Ok(None),
        Some(status) => {
            if let Some(note) = tolerance.tolerates(result) {
                tracing::info!("{}: {}", spec.command, note);
                return Ok(Some(note));
            }
            let tail = spec.redact(&stderr_tail(&result.stderr));
            let status = if tail.is_empty() {
                status.to_string()
            } else {
                format!("{}: {}", status, tail)
            };
            Err(ProvisionError::Execution {
                command: spec.display(),
                status,
            }
            .into())
        }
        None if dry_run => Ok(Some("dry run".to_string())),
        None => Err(ProvisionError::Execution {
            command: spec.display(),
            status: "process exited without status (possibly killed by signal)".to_string(),
        }
        .into()),
    }
}
