//! Template step: render a named template and write it into place.

use anyhow::Result;
use camino::Utf8PathBuf;
use serde::Deserialize;
use tracing::info;

use super::{StepContext, deserialize_mode};
use crate::error::ProvisionError;
use crate::template::write::{WriteOptions, is_up_to_date, write_atomic};
use crate::template::{placeholders_in, render_str};

/// Renders `template` and atomically replaces `dest` with the result.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct TemplateStep {
    /// Name of a template declared under `templates:`.
    pub template: String,
    /// Destination path; may contain placeholders.
    pub dest: String,
    #[serde(default, deserialize_with = "deserialize_mode")]
    pub mode: Option<u32>,
    /// Create missing parent directories.
    #[serde(default)]
    pub create_dirs: bool,
}

impl TemplateStep {
    pub fn new(template: impl Into<String>, dest: impl Into<String>) -> Self {
        Self {
            template: template.into(),
            dest: dest.into(),
            mode: None,
            create_dirs: false,
        }
    }

    pub fn validate(&self) -> Result<(), ProvisionError> {
        if self.template.trim().is_empty() {
            return Err(ProvisionError::Validation("template name must not be empty".to_string()));
        }
        if self.dest.trim().is_empty() {
            return Err(ProvisionError::Validation("dest must not be empty".to_string()));
        }
        Ok(())
    }

    /// Placeholders in the destination path. The template body is checked
    /// separately, once per template.
    pub fn placeholders(&self) -> Result<Vec<String>, ProvisionError> {
        Ok(placeholders_in("dest", &self.dest)?.into_iter().collect())
    }

    fn render(&self, ctx: &StepContext<'_>) -> Result<(Utf8PathBuf, String), ProvisionError> {
        let template = ctx.templates.get(&self.template).ok_or_else(|| {
            ProvisionError::Validation(format!("unknown template '{}'", self.template))
        })?;
        let dest = Utf8PathBuf::from(render_str("dest", &self.dest, ctx.bindings)?);
        let content = template.render(ctx.bindings)?;
        Ok((dest, content))
    }

    pub fn already_satisfied(&self, ctx: &StepContext<'_>) -> Result<Option<String>> {
        let (dest, content) = self.render(ctx)?;
        if is_up_to_date(&dest, content.as_bytes(), self.mode) {
            return Ok(Some(format!("{} is up to date", dest)));
        }
        Ok(None)
    }

    pub fn execute(&self, ctx: &StepContext<'_>) -> Result<Option<String>> {
        let (dest, content) = self.render(ctx)?;
        if ctx.dry_run() {
            info!("dry run: would write {} ({} bytes)", dest, content.len());
            return Ok(Some(format!("dry run: would write {}", dest)));
        }
        let options = WriteOptions {
            mode: self.mode,
            create_dirs: self.create_dirs,
        };
        write_atomic(&dest, content.as_bytes(), options)?;
        info!("wrote {} from template '{}'", dest, self.template);
        Ok(None)
    }
}
