//! Package installation step.

use std::time::Duration;

use anyhow::Result;
use serde::Deserialize;
use tracing::info;

use super::StepContext;
use super::execution::Tolerance;
use crate::error::ProvisionError;

/// Installs packages through the host's package manager.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct PackagesStep {
    pub names: Vec<String>,
    /// Refresh package indexes before installing.
    #[serde(default)]
    pub update: bool,
}

impl PackagesStep {
    pub fn validate(&self) -> Result<(), ProvisionError> {
        if self.names.is_empty() {
            return Err(ProvisionError::Validation("names must list at least one package".to_string()));
        }
        if let Some(bad) = self.names.iter().find(|n| n.trim().is_empty() || n.starts_with('-')) {
            return Err(ProvisionError::Validation(format!("invalid package name '{}'", bad)));
        }
        Ok(())
    }

    pub fn already_satisfied(
        &self,
        ctx: &StepContext<'_>,
        timeout: Option<Duration>,
    ) -> Result<Option<String>> {
        if ctx.packages.missing(ctx.executor, &self.names, timeout)?.is_empty() {
            return Ok(Some("all packages installed".to_string()));
        }
        Ok(None)
    }

    pub fn execute(&self, ctx: &StepContext<'_>, tolerance: &Tolerance) -> Result<Option<String>> {
        let missing = ctx.packages.missing(ctx.executor, &self.names, tolerance.timeout)?;
        if missing.is_empty() {
            return Ok(None);
        }
        if self.update {
            ctx.run(ctx.packages.update_spec(), tolerance)?;
        }
        info!("installing {} with {}: {}", missing.len(), ctx.packages, missing.join(" "));
        ctx.run(ctx.packages.install_spec(&missing), tolerance)
    }
}
