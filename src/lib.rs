pub mod cli;
pub mod config;
pub mod error;
pub mod executor;
pub mod facts;
pub mod package;
pub mod sequencer;
pub mod service;
pub mod settings;
pub mod step;
pub mod template;

use std::fmt;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info};
use tracing_subscriber::{FmtSubscriber, filter::LevelFilter};

pub use error::ProvisionError;

use crate::config::Profile;
use crate::executor::CommandExecutor;
use crate::facts::{FactProber, Facts};
use crate::sequencer::{Report, StepExecutor};
use crate::service::{ServiceController, ServiceReport};
use crate::settings::Settings;
use crate::template::{Bindings, TemplateSet};

pub fn init_logging(log_level: cli::LogLevel) -> Result<()> {
    let filter = match log_level {
        cli::LogLevel::Trace => LevelFilter::TRACE,
        cli::LogLevel::Debug => LevelFilter::DEBUG,
        cli::LogLevel::Info => LevelFilter::INFO,
        cli::LogLevel::Warn => LevelFilter::WARN,
        cli::LogLevel::Error => LevelFilter::ERROR,
    };

    tracing::subscriber::set_global_default(
        FmtSubscriber::builder().with_max_level(filter).finish(),
    )
    .context("failed to set global default tracing subscriber")
}

/// Outcome of a successful `apply`.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub steps: Report,
    pub services: ServiceReport,
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "steps:")?;
        write!(f, "{}", self.steps)?;
        if !self.services.is_empty() {
            writeln!(f, "services:")?;
            write!(f, "{}", self.services)?;
        }
        Ok(())
    }
}

/// Loads settings for `profile`, honoring command-line overrides.
///
/// Fails with `MissingConfig` naming every missing or invalid key.
fn load_settings(profile: &Profile, args: &cli::SettingsArgs) -> Result<Settings> {
    let overrides = settings::parse_overrides(&args.overrides)?;
    let path = args.settings.as_deref().or(profile.settings.file.as_deref());
    let settings = settings::load(path, &profile.settings.schema, overrides)?;
    info!("loaded {} setting(s)", settings.len());
    Ok(settings)
}

/// Applies a manifest: settings, facts, steps, then services.
///
/// Nothing is executed unless every required setting is present and valid
/// and every required fact was discovered. A fatal step failure stops the
/// run before services are touched.
pub fn run_apply(opts: &cli::ApplyArgs, executor: Arc<dyn CommandExecutor>) -> Result<RunSummary> {
    let profile = config::load_and_validate(&opts.common.file)?;
    let settings = load_settings(&profile, &opts.settings)?;

    if opts.dry_run {
        info!("dry run: no changes will be made");
    }

    let facts = FactProber::new(Arc::clone(&executor))
        .probe_all(&profile.facts, &settings)
        .context("fact discovery failed")?;
    let templates = TemplateSet::load(&profile.templates)?;
    let bindings = Bindings::from_settings_and_facts(&settings, &facts);

    let report = StepExecutor::new(
        Arc::clone(&executor),
        &bindings,
        &templates,
        profile.package_manager,
    )
    .run(&profile.steps);
    if let Err(e) = report.ensure_success() {
        error!("run aborted:\n{}", report);
        return Err(e.into());
    }

    let services =
        ServiceController::new(executor, profile.package_manager).apply(&profile.services);
    if let Err(e) = services.ensure_success() {
        error!("critical service failed:\n{}", services);
        return Err(e.into());
    }

    Ok(RunSummary {
        steps: report,
        services,
    })
}

/// Validates the manifest and, unless `manifest_only`, the settings.
pub fn run_validate(opts: &cli::ValidateArgs) -> Result<()> {
    let profile = config::load_and_validate(&opts.common.file)?;
    if !opts.manifest_only {
        load_settings(&profile, &opts.settings)?;
    }
    info!(
        "validation successful: {} fact(s), {} template(s), {} step(s), {} service(s)",
        profile.facts.len(),
        profile.templates.len(),
        profile.steps.len(),
        profile.services.len()
    );
    Ok(())
}

/// Probes the manifest's facts without running any step.
pub fn run_facts(opts: &cli::FactsArgs, executor: Arc<dyn CommandExecutor>) -> Result<Facts> {
    let profile = config::load_and_validate(&opts.common.file)?;
    let settings = load_settings(&profile, &opts.settings)?;
    let facts = FactProber::new(executor).probe_all(&profile.facts, &settings)?;
    Ok(facts)
}
