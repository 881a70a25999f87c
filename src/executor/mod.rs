//! Command execution abstraction for rsprovision.
//!
//! This module provides:
//! - [`CommandSpec`]: Specification for commands to execute
//! - [`ExecutionResult`]: Result of command execution
//! - [`CommandExecutor`]: Trait for command execution strategies
//! - [`RealCommandExecutor`]: Production implementation using `std::process::Command`

mod pipe;
mod real;

use std::fmt;
use std::process::ExitStatus;
use std::time::Duration;

use anyhow::Result;
use camino::Utf8PathBuf;

pub use real::RealCommandExecutor;

/// Formats string arguments into a space-separated, debug-quoted string.
///
/// Used by error messages and dry-run output to consistently format
/// command arguments (e.g., `"install" "-y" "freeradius"`).
pub(crate) fn format_command_args(args: &[String]) -> String {
    args.iter()
        .map(|a| format!("{:?}", a))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Placeholder shown instead of a secret value.
pub const REDACTED: &str = "********";

/// Secret values that must never reach logs, error messages or reports.
///
/// `Debug` prints only the number of values.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Secrets(Vec<String>);

impl Secrets {
    pub fn new<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut values: Vec<String> = values
            .into_iter()
            .map(Into::into)
            .filter(|v| !v.is_empty())
            .collect();
        // Longest first, so a secret that contains another is masked whole.
        values.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        values.dedup();
        Self(values)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns `text` with every secret value replaced by [`REDACTED`].
    pub fn redact(&self, text: &str) -> String {
        let mut redacted = text.to_string();
        for secret in &self.0 {
            if redacted.contains(secret.as_str()) {
                redacted = redacted.replace(secret.as_str(), REDACTED);
            }
        }
        redacted
    }
}

impl fmt::Debug for Secrets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Secrets({} value(s))", self.0.len())
    }
}

/// Specification for a command to be executed
#[derive(Debug, Clone)]
pub struct CommandSpec {
    /// The command to execute (e.g., "apt-get")
    pub command: String,
    /// Command arguments
    pub args: Vec<String>,
    /// Working directory (optional, defaults to current directory)
    pub cwd: Option<Utf8PathBuf>,
    /// Environment variables to set (in addition to inherited environment)
    pub env: Vec<(String, String)>,
    /// Collect stdout/stderr into the [`ExecutionResult`] in addition to logging them
    pub capture: bool,
    /// The command only reads host state, so it also runs in dry-run mode
    pub query: bool,
    /// Kill the command and report failure if it runs longer than this
    pub timeout: Option<Duration>,
    /// Values masked in the command line, logged output and error messages
    pub secrets: Secrets,
}

impl CommandSpec {
    /// Creates a new CommandSpec with command and args
    #[must_use]
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
            cwd: None,
            env: Vec::new(),
            capture: false,
            query: false,
            timeout: None,
            secrets: Secrets::default(),
        }
    }

    /// Creates a read-only query whose output is captured.
    ///
    /// Queries run even in dry-run mode.
    #[must_use]
    pub fn query(command: impl Into<String>, args: Vec<String>) -> Self {
        let mut spec = Self::new(command, args);
        spec.capture = true;
        spec.query = true;
        spec
    }

    /// Sets the working directory
    #[must_use]
    pub fn with_cwd(mut self, cwd: Utf8PathBuf) -> Self {
        self.cwd = Some(cwd);
        self
    }

    /// Adds an environment variable
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Adds multiple environment variables.
    ///
    /// Accepts any iterator of key-value pairs that can be converted into strings,
    /// such as `Vec<(String, String)>`, `&[(&str, &str)]`, or `BTreeMap<String, String>`.
    #[must_use]
    pub fn with_envs<I, K, V>(mut self, envs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env
            .extend(envs.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// Enables output capture
    #[must_use]
    pub fn with_capture(mut self, capture: bool) -> Self {
        self.capture = capture;
        self
    }

    /// Sets the per-call timeout
    #[must_use]
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the values to mask in anything shown to the operator
    #[must_use]
    pub fn with_secrets(mut self, secrets: Secrets) -> Self {
        self.secrets = secrets;
        self
    }

    /// Masks this command's secrets in `text`.
    pub fn redact(&self, text: &str) -> String {
        self.secrets.redact(text)
    }

    /// Returns the command line for log and error messages, secrets masked.
    pub fn display(&self) -> String {
        let command = self.redact(&self.command);
        if self.args.is_empty() {
            command
        } else {
            let args: Vec<String> = self.args.iter().map(|a| self.redact(a)).collect();
            format!("{} {}", command, format_command_args(&args))
        }
    }
}

/// Result of command execution
#[derive(Debug, Default)]
pub struct ExecutionResult {
    /// Exit status of the command (None in dry-run mode)
    pub status: Option<ExitStatus>,
    /// Captured stdout (empty unless [`CommandSpec::capture`] was set)
    pub stdout: String,
    /// Captured stderr (empty unless [`CommandSpec::capture`] was set)
    pub stderr: String,
}

impl ExecutionResult {
    /// Creates a result carrying only an exit status.
    pub fn from_status(status: ExitStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    /// Creates a dry-run result (no exit status).
    pub fn dry_run() -> Self {
        Self::default()
    }

    /// Returns true if the command executed successfully.
    ///
    /// In dry-run mode (status is None), this always returns true.
    pub fn success(&self) -> bool {
        self.status.is_none_or(|s| s.success())
    }

    /// Returns true only if the command actually ran and exited with status 0.
    ///
    /// Used for precondition checks, where a command that did not run
    /// must not be taken as proof that the precondition holds.
    pub fn confirmed_success(&self) -> bool {
        self.status.is_some_and(|s| s.success())
    }

    /// Returns the exit code if available
    pub fn code(&self) -> Option<i32> {
        self.status.and_then(|s| s.code())
    }
}

/// Trait for command execution.
///
/// Implementations must be `Send + Sync` so a single executor can be shared
/// as `Arc<dyn CommandExecutor>` by the fact prober, step executor and
/// service controller.
pub trait CommandExecutor: Send + Sync {
    /// Executes a command with the given specification.
    fn execute(&self, spec: &CommandSpec) -> Result<ExecutionResult>;

    /// Returns true if commands that mutate host state are only logged.
    fn dry_run(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_masks_secrets() {
        let spec = CommandSpec::new(
            "mysqladmin",
            vec!["-u".to_string(), "root".to_string(), "-phunter2".to_string()],
        )
        .with_secrets(Secrets::new(["hunter2"]));
        assert_eq!(spec.display(), r#"mysqladmin "-u" "root" "-p********""#);
        assert!(!format!("{:?}", spec.secrets).contains("hunter2"));
    }

    #[test]
    fn test_secrets_mask_longest_value_first() {
        let secrets = Secrets::new(["abc", "abcdef", ""]);
        assert_eq!(secrets.redact("x abcdef y abc"), "x ******** y ********");
        assert!(Secrets::new([""]).is_empty());
    }

    #[test]
    fn test_query_enables_capture_and_query() {
        let spec = CommandSpec::query("freeradius", vec!["-v".to_string()]);
        assert!(spec.capture);
        assert!(spec.query);
        assert_eq!(spec.timeout, None);
    }

    #[test]
    fn test_display_quotes_args() {
        let spec = CommandSpec::new("apt-get", vec!["install".to_string(), "-y".to_string()]);
        assert_eq!(spec.display(), "apt-get \"install\" \"-y\"");
        assert_eq!(CommandSpec::new("true", Vec::new()).display(), "true");
    }

    #[test]
    fn test_dry_run_result_is_success_but_not_confirmed() {
        let result = ExecutionResult::dry_run();
        assert!(result.success());
        assert!(!result.confirmed_success());
        assert_eq!(result.code(), None);
    }

    #[cfg(unix)]
    #[test]
    fn test_from_status_reports_code() {
        use std::os::unix::process::ExitStatusExt;
        let result = ExecutionResult::from_status(ExitStatus::from_raw(3 << 8));
        assert!(!result.success());
        assert!(!result.confirmed_success());
        assert_eq!(result.code(), Some(3));
    }

    #[test]
    fn test_with_envs_extends_env() {
        let spec = CommandSpec::new("mysql", Vec::new())
            .with_env("A", "1")
            .with_envs([("B", "2"), ("C", "3")]);
        assert_eq!(spec.env.len(), 3);
        assert_eq!(spec.env[2], ("C".to_string(), "3".to_string()));
    }
}
