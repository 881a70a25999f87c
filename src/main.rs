use std::io;
use std::process;
use std::sync::Arc;

use anyhow::Result;
use clap::CommandFactory;
use clap_complete::generate;
use tracing::error;

use rsprovision::cli::{self, Commands};
use rsprovision::executor::{CommandExecutor, RealCommandExecutor};
use rsprovision::{init_logging, run_apply, run_facts, run_validate};

fn run(args: &cli::Cli) -> Result<()> {
    match &args.command {
        Commands::Apply(opts) => {
            let executor: Arc<dyn CommandExecutor> = Arc::new(RealCommandExecutor {
                dry_run: opts.dry_run,
            });
            let summary = run_apply(opts, executor)?;
            print!("{}", summary);
        }
        Commands::Validate(opts) => run_validate(opts)?,
        Commands::Facts(opts) => {
            let executor: Arc<dyn CommandExecutor> =
                Arc::new(RealCommandExecutor { dry_run: true });
            for (name, value) in run_facts(opts, executor)?.iter() {
                println!("{}={}", name, value);
            }
        }
        Commands::Completions(opts) => {
            let mut cmd = cli::Cli::command();
            let name = cmd.get_name().to_string();
            generate(opts.shell, &mut cmd, name, &mut io::stdout());
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = cli::parse_args()?;

    if let Some(log_level) = args.command.log_level() {
        init_logging(log_level)?;
    }

    if let Err(e) = run(&args) {
        error!("{:#}", e);
        process::exit(1);
    }
    Ok(())
}
