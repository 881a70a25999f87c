//! Step sequencer.
//!
//! Runs steps strictly in declaration order. For each step the precondition
//! is evaluated first; a satisfied step is recorded as skipped, otherwise its
//! action runs and is recorded as applied or failed. A failing `fatal` step
//! ends the run immediately; a failing `warn` step is recorded and the run
//! continues. There are no retries.

use std::fmt;
use std::sync::Arc;

use strum::Display;
use tracing::{debug, error, info, warn};

use crate::error::ProvisionError;
use crate::executor::CommandExecutor;
use crate::package::PackageManager;
use crate::step::{FailurePolicy, Step, StepContext};
use crate::template::{Bindings, TemplateSet};

/// Terminal state of a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum StepOutcome {
    Skipped,
    Applied,
    Failed,
}

/// One line of the run report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepRecord {
    pub name: String,
    pub outcome: StepOutcome,
    /// Skip reason, tolerance note or verbatim error text.
    pub detail: Option<String>,
}

/// Ordered outcomes of a sequencer run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Report {
    entries: Vec<StepRecord>,
    aborted: bool,
}

impl Report {
    pub fn entries(&self) -> &[StepRecord] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// True if a fatal step failure stopped the run.
    pub fn is_aborted(&self) -> bool {
        self.aborted
    }

    /// The record of the step that aborted the run.
    pub fn fatal_failure(&self) -> Option<&StepRecord> {
        if self.aborted { self.entries.last() } else { None }
    }

    /// Number of entries with the given outcome.
    pub fn count(&self, outcome: StepOutcome) -> usize {
        self.entries.iter().filter(|e| e.outcome == outcome).count()
    }

    /// Converts an aborted run into the failing step's error.
    pub fn ensure_success(&self) -> Result<(), ProvisionError> {
        match self.fatal_failure() {
            Some(record) => Err(ProvisionError::StepActionFailed {
                step: record.name.clone(),
                message: record.detail.clone().unwrap_or_default(),
            }),
            None => Ok(()),
        }
    }

    fn push(&mut self, name: &str, outcome: StepOutcome, detail: Option<String>) {
        self.entries.push(StepRecord {
            name: name.to_string(),
            outcome,
            detail,
        });
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for entry in &self.entries {
            write!(f, "  {:<8} {}", entry.outcome, entry.name)?;
            if let Some(detail) = &entry.detail {
                write!(f, " ({})", detail)?;
            }
            writeln!(f)?;
        }
        if self.aborted {
            writeln!(f, "  run aborted after {} step(s)", self.entries.len())?;
        }
        Ok(())
    }
}

/// Runs steps against the host.
pub struct StepExecutor<'a> {
    executor: Arc<dyn CommandExecutor>,
    bindings: &'a Bindings,
    templates: &'a TemplateSet,
    packages: PackageManager,
}

impl<'a> StepExecutor<'a> {
    pub fn new(
        executor: Arc<dyn CommandExecutor>,
        bindings: &'a Bindings,
        templates: &'a TemplateSet,
        packages: PackageManager,
    ) -> Self {
        Self {
            executor,
            bindings,
            templates,
            packages,
        }
    }

    /// Runs `steps` in order and returns the report.
    ///
    /// The report of an aborted run ends with the fatal step; steps after it
    /// have no entry.
    pub fn run(&self, steps: &[Step]) -> Report {
        let ctx = StepContext {
            executor: self.executor.as_ref(),
            bindings: self.bindings,
            templates: self.templates,
            packages: self.packages,
        };
        let mut report = Report::default();
        info!("running {} step(s)", steps.len());

        for (index, step) in steps.iter().enumerate() {
            info!("step {}/{}: {} ({})", index + 1, steps.len(), step.name, step.action.kind());
            let result = step.skip_reason(&ctx).and_then(|reason| match reason {
                Some(reason) => Ok((StepOutcome::Skipped, Some(reason))),
                None => step.execute(&ctx).map(|note| (StepOutcome::Applied, note)),
            });

            let secrets = self.bindings.secrets();
            match result {
                Ok((outcome, detail)) => {
                    let detail = detail.map(|d| secrets.redact(&d));
                    match (&outcome, &detail) {
                        (StepOutcome::Skipped, Some(reason)) => {
                            info!("skipped {}: {}", step.name, reason)
                        }
                        _ => debug!("{} {}", outcome, step.name),
                    }
                    report.push(&step.name, outcome, detail);
                }
                Err(e) => {
                    let message = secrets.redact(&format!("{:#}", e));
                    match step.on_failure {
                        FailurePolicy::Fatal => {
                            error!("step '{}' failed: {}", step.name, message);
                            report.push(&step.name, StepOutcome::Failed, Some(message));
                            report.aborted = true;
                            return report;
                        }
                        FailurePolicy::Warn => {
                            warn!("step '{}' failed, continuing: {}", step.name, message);
                            report.push(&step.name, StepOutcome::Failed, Some(message));
                        }
                    }
                }
            }
        }

        info!(
            "steps finished: {} applied, {} skipped, {} failed",
            report.count(StepOutcome::Applied),
            report.count(StepOutcome::Skipped),
            report.count(StepOutcome::Failed)
        );
        report
    }
}
