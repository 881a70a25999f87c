//! Command and shell step implementations.
//!
//! `CommandStep` runs an executable in argv form; `ShellStep` runs an inline
//! script or a script file through a shell interpreter. Arguments, environment
//! values and inline script content are rendered against the run's bindings
//! before execution.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;

use anyhow::Result;
use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;
use serde::de::{self, MapAccess, Visitor};

use super::StepContext;
use super::execution::Tolerance;
use crate::error::ProvisionError;
use crate::executor::CommandSpec;
use crate::template::{placeholders_in, render_str};

/// Runs a single executable.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct CommandStep {
    /// Executable name or path.
    pub command: String,
    /// Arguments; may contain placeholders.
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment variables; values may contain placeholders.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Working directory.
    #[serde(default)]
    pub cwd: Option<Utf8PathBuf>,
}

impl CommandStep {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
            env: BTreeMap::new(),
            cwd: None,
        }
    }

    pub fn validate(&self) -> Result<(), ProvisionError> {
        if self.command.trim().is_empty() {
            return Err(ProvisionError::Validation("command must not be empty".to_string()));
        }
        Ok(())
    }

    pub fn placeholders(&self) -> Result<Vec<String>, ProvisionError> {
        let mut names = Vec::new();
        for text in self.args.iter().chain(self.env.values()) {
            names.extend(placeholders_in("command argument", text)?);
        }
        Ok(names)
    }

    pub fn resolve_paths(&mut self, base_dir: &Utf8Path) {
        if let Some(cwd) = &mut self.cwd
            && cwd.is_relative()
        {
            *cwd = base_dir.join(&*cwd);
        }
    }

    pub fn execute(&self, ctx: &StepContext<'_>, tolerance: &Tolerance) -> Result<Option<String>> {
        let args = self
            .args
            .iter()
            .map(|a| render_str("command argument", a, ctx.bindings))
            .collect::<Result<Vec<_>, _>>()?;
        let mut spec = CommandSpec::new(&self.command, args);
        for (key, value) in &self.env {
            spec = spec.with_env(key, render_str("environment value", value, ctx.bindings)?);
        }
        if let Some(cwd) = &self.cwd {
            spec = spec.with_cwd(cwd.clone());
        }
        ctx.run(spec, tolerance)
    }
}

/// Script source for shell execution.
///
/// Represents exactly one of `script` (external file) or `content` (inline).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptSource {
    /// External shell script file path
    Script(Utf8PathBuf),
    /// Inline shell script content
    Content(String),
}

fn default_shell() -> String {
    "/bin/sh".to_string()
}

/// Runs a shell script.
///
/// Deserialization validates that exactly one of `script` or `content` is
/// specified, rejecting YAML that provides both or neither.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellStep {
    source: ScriptSource,
    shell: String,
}

impl<'de> Deserialize<'de> for ShellStep {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(field_identifier, rename_all = "lowercase")]
        enum Field {
            Script,
            Content,
            Shell,
        }

        struct ShellStepVisitor;

        impl<'de> Visitor<'de> for ShellStepVisitor {
            type Value = ShellStep;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a shell step with either 'script' or 'content'")
            }

            fn visit_map<V>(self, mut map: V) -> std::result::Result<ShellStep, V::Error>
            where
                V: MapAccess<'de>,
            {
                let mut script: Option<Utf8PathBuf> = None;
                let mut content: Option<String> = None;
                let mut shell: Option<String> = None;

                while let Some(key) = map.next_key()? {
                    match key {
                        Field::Script => {
                            if script.is_some() {
                                return Err(de::Error::duplicate_field("script"));
                            }
                            script = Some(map.next_value()?);
                        }
                        Field::Content => {
                            if content.is_some() {
                                return Err(de::Error::duplicate_field("content"));
                            }
                            content = Some(map.next_value()?);
                        }
                        Field::Shell => {
                            if shell.is_some() {
                                return Err(de::Error::duplicate_field("shell"));
                            }
                            shell = Some(map.next_value()?);
                        }
                    }
                }

                let source = match (script, content) {
                    (Some(_), Some(_)) => {
                        return Err(de::Error::custom(
                            "'script' and 'content' are mutually exclusive",
                        ));
                    }
                    (None, None) => {
                        return Err(de::Error::custom(
                            "either 'script' or 'content' must be specified",
                        ));
                    }
                    (Some(s), None) => ScriptSource::Script(s),
                    (None, Some(c)) => ScriptSource::Content(c),
                };

                Ok(ShellStep {
                    source,
                    shell: shell.unwrap_or_else(default_shell),
                })
            }
        }

        const FIELDS: &[&str] = &["script", "content", "shell"];
        deserializer.deserialize_struct("ShellStep", FIELDS, ShellStepVisitor)
    }
}

impl ShellStep {
    /// Creates a new ShellStep with the given script source and default shell (/bin/sh).
    pub fn new(source: ScriptSource) -> Self {
        Self {
            source,
            shell: default_shell(),
        }
    }

    /// Creates a new ShellStep with the given script source and custom shell.
    pub fn with_shell(source: ScriptSource, shell: impl Into<String>) -> Self {
        Self {
            source,
            shell: shell.into(),
        }
    }

    /// Returns a reference to the script source.
    pub fn source(&self) -> &ScriptSource {
        &self.source
    }

    /// Returns the shell interpreter path.
    pub fn shell(&self) -> &str {
        &self.shell
    }

    /// Resolves a relative script path against the given base directory.
    pub fn resolve_paths(&mut self, base_dir: &Utf8Path) {
        if let ScriptSource::Script(path) = &mut self.source
            && path.is_relative()
        {
            *path = base_dir.join(&*path);
        }
    }

    /// Validates the step configuration.
    ///
    /// For external script files, validates that the file exists and is a regular file.
    /// For inline content, validates that the content is not empty.
    pub fn validate(&self) -> Result<(), ProvisionError> {
        if self.shell.is_empty() {
            return Err(ProvisionError::Validation("shell path must not be empty".to_string()));
        }
        if !self.shell.starts_with('/') {
            return Err(ProvisionError::Validation(format!(
                "shell path must be absolute (start with '/'): {}",
                self.shell
            )));
        }

        match &self.source {
            ScriptSource::Script(script) => {
                let metadata = fs::metadata(script).map_err(|e| {
                    ProvisionError::io(format!("failed to read shell script metadata: {}", script), e)
                })?;
                if !metadata.is_file() {
                    return Err(ProvisionError::Validation(format!(
                        "shell script is not a file: {}",
                        script
                    )));
                }
            }
            ScriptSource::Content(content) => {
                if content.trim().is_empty() {
                    return Err(ProvisionError::Validation(
                        "inline shell script content must not be empty".to_string(),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Returns the placeholders used by inline content.
    ///
    /// Script files are passed to the shell untouched.
    pub fn placeholders(&self) -> Result<Vec<String>, ProvisionError> {
        match &self.source {
            ScriptSource::Script(_) => Ok(Vec::new()),
            ScriptSource::Content(content) => {
                Ok(placeholders_in("shell content", content)?.into_iter().collect())
            }
        }
    }

    pub fn execute(&self, ctx: &StepContext<'_>, tolerance: &Tolerance) -> Result<Option<String>> {
        let args = match &self.source {
            ScriptSource::Script(path) => vec![path.to_string()],
            ScriptSource::Content(content) => {
                vec!["-c".to_string(), render_str("shell content", content, ctx.bindings)?]
            }
        };
        ctx.run(CommandSpec::new(&self.shell, args), tolerance)
    }
}
