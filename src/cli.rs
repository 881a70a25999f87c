use anyhow::Result;
use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;

#[derive(Parser, Debug)]
#[command(
    name = env!("CARGO_PKG_NAME"),
    version = env!("CARGO_PKG_VERSION"),
    about = env!("CARGO_PKG_DESCRIPTION"),
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Apply the given manifest to this host
    Apply(ApplyArgs),

    /// Validate the given YAML manifest and settings
    Validate(ValidateArgs),

    /// Probe and print the facts declared by the manifest
    Facts(FactsArgs),

    /// Generate shell completion scripts
    Completions(CompletionsArgs),
}

/// Arguments shared by every command that reads a manifest.
#[derive(Args, Debug)]
pub struct CommonArgs {
    /// Path to the YAML manifest
    #[arg(short, long, default_value = "provision.yaml")]
    pub file: Utf8PathBuf,

    /// Set the log level
    #[arg(short, long, default_value = "info")]
    pub log_level: LogLevel,
}

/// Where settings come from.
#[derive(Args, Debug, Default)]
pub struct SettingsArgs {
    /// Settings file (overrides `settings.file` in the manifest)
    #[arg(short, long)]
    pub settings: Option<Utf8PathBuf>,

    /// Override a setting, as KEY=VALUE (repeatable)
    #[arg(long = "set", value_name = "KEY=VALUE")]
    pub overrides: Vec<String>,
}

#[derive(Args, Debug)]
pub struct ApplyArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    #[command(flatten)]
    pub settings: SettingsArgs,

    /// Do not change the host, just show what would be done
    #[arg(long)]
    pub dry_run: bool,
}

#[derive(Args, Debug)]
pub struct ValidateArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    #[command(flatten)]
    pub settings: SettingsArgs,

    /// Only check the manifest; do not load settings
    #[arg(long)]
    pub manifest_only: bool,
}

#[derive(Args, Debug)]
pub struct FactsArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    #[command(flatten)]
    pub settings: SettingsArgs,
}

#[derive(Args, Debug)]
pub struct CompletionsArgs {
    /// Shell to generate completions for
    pub shell: Shell,
}

/// Represents log levels for controlling the verbosity of logging output.
///
/// This enum maps directly to the log levels used by the `tracing` crate:
/// - `Trace`: Designates very detailed application-level information.
/// - `Debug`: Designates information useful for debugging.
/// - `Info`: Designates general operational messages.
/// - `Warn`: Designates potentially harmful situations.
/// - `Error`: Designates error events that might still allow the application to continue running.
///
/// For example, specifying `--log-level debug` will also show guard
/// evaluation and fact discovery details.
#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl Commands {
    /// Log level requested by the command, if it takes one.
    pub fn log_level(&self) -> Option<LogLevel> {
        match self {
            Self::Apply(opts) => Some(opts.common.log_level),
            Self::Validate(opts) => Some(opts.common.log_level),
            Self::Facts(opts) => Some(opts.common.log_level),
            Self::Completions(_) => None,
        }
    }
}

pub fn parse_args() -> Result<Cli> {
    Ok(Cli::parse())
}
