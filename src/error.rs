//! Domain-specific error types for rsprovision.
//!
//! This module defines `ProvisionError`, a `thiserror`-based enum that
//! provides typed error variants for every failure a provisioning run can
//! surface. Public API functions return `Result<T, ProvisionError>` for
//! programmatic error handling, while trait boundaries continue to use
//! `anyhow::Result`.
//!
//! `ProvisionError` implements `Into<anyhow::Error>`, so the `?` operator
//! converts it automatically at trait boundaries that return `anyhow::Result`,
//! and callers can recover the typed error with `downcast_ref`.

use std::fmt;
use std::io;

/// Formats an IO error kind into a human-readable message.
///
/// Provides consistent, user-friendly messages for common IO error kinds
/// (e.g., "I/O error: not found") instead of the OS-level messages
/// (e.g., "No such file or directory (os error 2)"). For unrecognized
/// error kinds, falls back to including the OS-level error message.
pub(crate) fn io_error_kind_message(err: &io::Error) -> String {
    match err.kind() {
        io::ErrorKind::NotFound => "I/O error: not found".to_string(),
        io::ErrorKind::PermissionDenied => "I/O error: permission denied".to_string(),
        io::ErrorKind::IsADirectory => "I/O error: is a directory".to_string(),
        _ => format!("I/O error: {}", err),
    }
}

/// Why a single setting was rejected by the configuration loader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettingProblemKind {
    /// The key does not appear in the settings source.
    Missing,
    /// The key is present but its value is empty.
    Empty,
    /// The value failed its validator; holds the validator's message.
    Invalid(String),
}

/// A rejected setting: its key and the reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettingProblem {
    pub key: String,
    pub kind: SettingProblemKind,
}

impl fmt::Display for SettingProblem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            SettingProblemKind::Missing => write!(f, "{} (missing)", self.key),
            SettingProblemKind::Empty => write!(f, "{} (empty)", self.key),
            SettingProblemKind::Invalid(reason) => write!(f, "{} ({})", self.key, reason),
        }
    }
}

fn join_problems(problems: &[SettingProblem]) -> String {
    problems
        .iter()
        .map(|p| p.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Domain-specific error type for rsprovision.
///
/// Provides typed variants for common failure modes, enabling callers
/// to match on error kinds programmatically rather than parsing error
/// message strings.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ProvisionError {
    /// One or more required settings are absent, empty or invalid.
    ///
    /// Always reported before any side effect, naming every offending key.
    #[error("missing or invalid settings: {}", join_problems(.problems))]
    MissingConfig {
        /// Every rejected setting, in schema order.
        problems: Vec<SettingProblem>,
    },

    /// A required fact could not be discovered on this host.
    #[error("fact '{fact}' not found: {search}")]
    FactNotFound {
        /// Name of the fact.
        fact: String,
        /// Human-readable description of the search that was performed.
        search: String,
    },

    /// A template references placeholders that have no binding.
    #[error("template '{template}' has unresolved placeholders: {}", .placeholders.join(", "))]
    UnresolvedPlaceholder {
        /// Name of the template being rendered.
        template: String,
        /// Sorted, de-duplicated names of the unresolved placeholders.
        placeholders: Vec<String>,
    },

    /// A step action failed.
    #[error("step '{step}' failed: {message}")]
    StepActionFailed {
        /// Name of the failing step.
        step: String,
        /// Underlying error text, verbatim.
        message: String,
    },

    /// A managed service did not reach its requested state.
    #[error("service '{service}' did not reach its requested state: {message}")]
    ServiceStateUnreachable {
        /// Name of the service.
        service: String,
        /// What went wrong.
        message: String,
    },

    /// A validation constraint was violated.
    #[error("validation error: {0}")]
    Validation(String),

    /// A command execution failed (non-zero exit, spawn failure, timeout, etc.).
    #[error("command execution failed: {command}: {status}")]
    Execution {
        /// The command that was executed.
        command: String,
        /// Human-readable reason for the failure: exit code, signal information,
        /// timeout, or a description of the internal error.
        status: String,
    },

    /// The requested command could not be found in `PATH`.
    #[error("command not found in PATH: {command}")]
    CommandNotFound {
        /// The command that was looked up.
        command: String,
    },

    /// A configuration file could not be loaded or parsed.
    #[error("configuration error: {0}")]
    Config(String),

    /// An I/O operation failed with contextual information.
    #[error("{context}: {message}")]
    Io {
        /// What was being done when the error occurred (a path or an
        /// operation description with a path).
        context: String,
        /// Human-readable description derived from [`io_error_kind_message`].
        message: String,
        /// The underlying I/O error, preserved for programmatic inspection.
        #[source]
        source: std::io::Error,
    },
}

impl ProvisionError {
    /// Creates an `Io` variant with the `message` field automatically derived
    /// from the `source` via [`io_error_kind_message`].
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            message: io_error_kind_message(&source),
            source,
        }
    }

    /// Returns the keys named by a `MissingConfig` error, in report order.
    ///
    /// Returns an empty vector for every other variant.
    pub fn missing_keys(&self) -> Vec<&str> {
        match self {
            Self::MissingConfig { problems } => problems.iter().map(|p| p.key.as_str()).collect(),
            _ => Vec::new(),
        }
    }
}
