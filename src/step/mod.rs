//! Provisioning steps.
//!
//! A [`Step`] pairs a [`StepAction`] with the data that controls how the
//! sequencer treats it: the `unless` guards that let it be skipped, its
//! failure policy, and which non-zero exits count as benign. Each action
//! variant describes *what* to do; the methods on [`StepAction`] dispatch
//! *how* through exhaustive matching.
//!
//! Adding a new action type requires:
//! 1. Adding a new variant to `StepAction`
//! 2. Creating a corresponding data struct (e.g., `PackagesStep`)
//! 3. Implementing the match arms in all methods on `StepAction`

pub mod command;
pub(crate) mod execution;
pub mod file;
pub mod packages;

use std::fmt;
use std::fs;
use std::time::Duration;

use anyhow::Result;
use camino::Utf8Path;
use serde::Deserialize;
use serde::de::{self, Visitor};
use strum::Display;
use tracing::debug;

pub use command::{CommandStep, ScriptSource, ShellStep};
pub use execution::Tolerance;
pub use file::TemplateStep;
pub use packages::PackagesStep;

use crate::error::ProvisionError;
use crate::executor::{CommandExecutor, CommandSpec};
use crate::facts::compile;
use crate::package::PackageManager;
use crate::template::{Bindings, TemplateSet, placeholders_in, render_str};

/// What happens to the run when a step's action fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum FailurePolicy {
    /// Abort the run; later steps never execute.
    #[default]
    Fatal,
    /// Record the failure and continue with the next step.
    Warn,
}

/// A precondition that, when it holds, means the step has nothing to do.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum Guard {
    /// Holds when the command exits 0.
    Command {
        command: String,
        #[serde(default)]
        args: Vec<String>,
    },
    /// Holds when the path exists.
    PathExists { path: String },
    /// Holds when the file exists and some line matches `pattern`.
    FileContains { path: String, pattern: String },
}

impl Guard {
    fn placeholders(&self) -> Result<Vec<String>, ProvisionError> {
        let texts: Vec<&String> = match self {
            Self::Command { command, args } => std::iter::once(command).chain(args).collect(),
            Self::PathExists { path } => vec![path],
            Self::FileContains { path, .. } => vec![path],
        };
        let mut names = Vec::new();
        for text in texts {
            names.extend(placeholders_in("guard", text)?);
        }
        Ok(names)
    }

    fn validate(&self) -> Result<(), ProvisionError> {
        match self {
            Self::Command { command, .. } if command.trim().is_empty() => Err(
                ProvisionError::Validation("guard command must not be empty".to_string()),
            ),
            Self::FileContains { pattern, .. } => compile(pattern).map(|_| ()),
            _ => Ok(()),
        }
    }

    /// Evaluates the guard. Guard commands are read-only queries and run
    /// even in dry-run mode; `timeout` bounds them like the step's own commands.
    pub fn holds(
        &self,
        executor: &dyn CommandExecutor,
        bindings: &Bindings,
        timeout: Option<Duration>,
    ) -> Result<bool> {
        match self {
            Self::Command { command, args } => {
                let command = render_str("guard", command, bindings)?;
                let args = args
                    .iter()
                    .map(|a| render_str("guard", a, bindings))
                    .collect::<Result<Vec<_>, _>>()?;
                let spec = CommandSpec::query(command, args)
                    .with_timeout(timeout)
                    .with_secrets(bindings.secrets().clone());
                let result = executor.execute(&spec)?;
                Ok(result.confirmed_success())
            }
            Self::PathExists { path } => {
                let path = render_str("guard", path, bindings)?;
                Ok(Utf8Path::new(&path).exists())
            }
            Self::FileContains { path, pattern } => {
                let path = render_str("guard", path, bindings)?;
                let re = compile(pattern)?;
                match fs::read_to_string(&path) {
                    Ok(text) => Ok(text.lines().any(|line| re.is_match(line))),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
                    Err(e) => Err(ProvisionError::io(format!("failed to read {}", path), e).into()),
                }
            }
        }
    }
}

/// Everything an action needs while it runs.
pub struct StepContext<'a> {
    pub executor: &'a dyn CommandExecutor,
    pub bindings: &'a Bindings,
    pub templates: &'a TemplateSet,
    pub packages: PackageManager,
}

impl StepContext<'_> {
    pub fn dry_run(&self) -> bool {
        self.executor.dry_run()
    }

    /// Runs `spec` against `tolerance` with secret settings masked in its output.
    pub(crate) fn run(&self, spec: CommandSpec, tolerance: &Tolerance) -> Result<Option<String>> {
        let spec = spec.with_secrets(self.bindings.secrets().clone());
        execution::execute_and_check(self.executor, spec, tolerance)
    }
}

/// The side-effecting part of a step, selected by the YAML `type` tag.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StepAction {
    /// Run an executable
    Command(CommandStep),
    /// Run a shell script
    Shell(ShellStep),
    /// Render a template to a file
    Template(TemplateStep),
    /// Install packages
    Packages(PackagesStep),
}

impl StepAction {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Command(_) => "command",
            Self::Shell(_) => "shell",
            Self::Template(_) => "template",
            Self::Packages(_) => "packages",
        }
    }

    pub fn validate(&self) -> Result<(), ProvisionError> {
        match self {
            Self::Command(step) => step.validate(),
            Self::Shell(step) => step.validate(),
            Self::Template(step) => step.validate(),
            Self::Packages(step) => step.validate(),
        }
    }

    /// Returns every placeholder name the action will render.
    pub fn placeholders(&self) -> Result<Vec<String>, ProvisionError> {
        match self {
            Self::Command(step) => step.placeholders(),
            Self::Shell(step) => step.placeholders(),
            Self::Template(step) => step.placeholders(),
            Self::Packages(_) => Ok(Vec::new()),
        }
    }

    pub fn resolve_paths(&mut self, base_dir: &Utf8Path) {
        match self {
            Self::Command(step) => step.resolve_paths(base_dir),
            Self::Shell(step) => step.resolve_paths(base_dir),
            Self::Template(_) | Self::Packages(_) => {}
        }
    }

    /// Returns a reason when the action's own postcondition already holds.
    pub fn already_satisfied(
        &self,
        ctx: &StepContext<'_>,
        timeout: Option<Duration>,
    ) -> Result<Option<String>> {
        match self {
            Self::Command(_) | Self::Shell(_) => Ok(None),
            Self::Template(step) => step.already_satisfied(ctx),
            Self::Packages(step) => step.already_satisfied(ctx, timeout),
        }
    }

    pub fn execute(&self, ctx: &StepContext<'_>, tolerance: &Tolerance) -> Result<Option<String>> {
        match self {
            Self::Command(step) => step.execute(ctx, tolerance),
            Self::Shell(step) => step.execute(ctx, tolerance),
            Self::Template(step) => step.execute(ctx),
            Self::Packages(step) => step.execute(ctx, tolerance),
        }
    }
}

/// One declared unit of provisioning work.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct Step {
    pub name: String,
    #[serde(default)]
    pub on_failure: FailurePolicy,
    /// Skip the step when all of these hold.
    #[serde(default)]
    pub unless: Vec<Guard>,
    /// Per-command timeout in seconds.
    #[serde(default)]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub accept_exit_codes: Vec<i32>,
    #[serde(default)]
    pub benign_output: Option<String>,
    #[serde(flatten)]
    pub action: StepAction,
}

impl Step {
    pub fn new(name: impl Into<String>, action: StepAction) -> Self {
        Self {
            name: name.into(),
            on_failure: FailurePolicy::default(),
            unless: Vec::new(),
            timeout: None,
            accept_exit_codes: Vec::new(),
            benign_output: None,
            action,
        }
    }

    pub fn with_policy(mut self, policy: FailurePolicy) -> Self {
        self.on_failure = policy;
        self
    }

    pub fn with_guard(mut self, guard: Guard) -> Self {
        self.unless.push(guard);
        self
    }

    pub fn validate(&self) -> Result<(), ProvisionError> {
        if self.name.trim().is_empty() {
            return Err(ProvisionError::Validation("step name must not be empty".to_string()));
        }
        let wrap = |e: ProvisionError| match e {
            ProvisionError::Validation(msg) => {
                ProvisionError::Validation(format!("step '{}': {}", self.name, msg))
            }
            other => other,
        };
        if let Some(pattern) = &self.benign_output {
            compile(pattern).map_err(wrap)?;
        }
        if self.timeout == Some(0) {
            return Err(wrap(ProvisionError::Validation(
                "timeout must be at least one second".to_string(),
            )));
        }
        for guard in &self.unless {
            guard.validate().map_err(wrap)?;
        }
        self.action.validate().map_err(wrap)
    }

    /// Returns every placeholder the step renders, guards included.
    pub fn placeholders(&self) -> Result<Vec<String>, ProvisionError> {
        let mut names = self.action.placeholders()?;
        for guard in &self.unless {
            names.extend(guard.placeholders()?);
        }
        Ok(names)
    }

    pub fn resolve_paths(&mut self, base_dir: &Utf8Path) {
        self.action.resolve_paths(base_dir);
    }

    pub fn tolerance(&self) -> Result<Tolerance, ProvisionError> {
        Ok(Tolerance {
            accept_exit_codes: self.accept_exit_codes.clone(),
            benign_output: self.benign_output.as_deref().map(compile).transpose()?,
            timeout: self.timeout.map(Duration::from_secs),
        })
    }

    /// Evaluates the step's precondition.
    ///
    /// Returns the reason to skip, or `None` when the action must run. A
    /// guard that cannot be evaluated counts as not holding.
    pub fn skip_reason(&self, ctx: &StepContext<'_>) -> Result<Option<String>> {
        let timeout = self.timeout.map(Duration::from_secs);
        if !self.unless.is_empty() {
            let mut all_hold = true;
            for guard in &self.unless {
                match guard.holds(ctx.executor, ctx.bindings, timeout) {
                    Ok(true) => {}
                    Ok(false) => {
                        all_hold = false;
                        break;
                    }
                    Err(e) => {
                        debug!("step '{}': guard could not be evaluated: {:#}", self.name, e);
                        all_hold = false;
                        break;
                    }
                }
            }
            if all_hold {
                return Ok(Some("unless guards hold".to_string()));
            }
        }
        self.action.already_satisfied(ctx, timeout)
    }

    /// Runs the action. Returns a note for the report, if any.
    pub fn execute(&self, ctx: &StepContext<'_>) -> Result<Option<String>> {
        let tolerance = self.tolerance()?;
        self.action.execute(ctx, &tolerance)
    }
}

/// Deserializes a Unix file mode.
///
/// Strings are parsed as octal (`"0640"`, `"640"`, `"0o640"`). Integers are
/// read by their decimal digits as octal digits, so `mode: 0640` and
/// `mode: 640` both mean `0o640`.
pub(crate) fn deserialize_mode<'de, D>(deserializer: D) -> std::result::Result<Option<u32>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    struct ModeVisitor;

    impl<'de> Visitor<'de> for ModeVisitor {
        type Value = Option<u32>;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("an octal file mode such as \"0640\"")
        }

        fn visit_none<E: de::Error>(self) -> std::result::Result<Self::Value, E> {
            Ok(None)
        }

        fn visit_unit<E: de::Error>(self) -> std::result::Result<Self::Value, E> {
            Ok(None)
        }

        fn visit_some<D>(self, deserializer: D) -> std::result::Result<Self::Value, D::Error>
        where
            D: serde::Deserializer<'de>,
        {
            deserializer.deserialize_any(self)
        }

        fn visit_str<E: de::Error>(self, value: &str) -> std::result::Result<Self::Value, E> {
            parse_mode(value).map(Some).map_err(E::custom)
        }

        fn visit_u64<E: de::Error>(self, value: u64) -> std::result::Result<Self::Value, E> {
            parse_mode(&value.to_string()).map(Some).map_err(E::custom)
        }

        fn visit_i64<E: de::Error>(self, value: i64) -> std::result::Result<Self::Value, E> {
            parse_mode(&value.to_string()).map(Some).map_err(E::custom)
        }
    }

    deserializer.deserialize_option(ModeVisitor)
}

/// Parses an octal mode string.
pub fn parse_mode(text: &str) -> Result<u32, String> {
    let digits = text.trim();
    let digits = digits.strip_prefix("0o").unwrap_or(digits);
    let mode = u32::from_str_radix(digits, 8)
        .map_err(|_| format!("invalid file mode '{}': expected octal digits", text))?;
    if mode > 0o7777 {
        return Err(format!("invalid file mode '{}': out of range", text));
    }
    Ok(mode)
}
