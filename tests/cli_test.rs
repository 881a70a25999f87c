use anyhow::Result;
use clap::Parser;
use rsprovision::cli::{Cli, Commands, LogLevel};

#[test]
fn test_parse_apply_command() -> Result<()> {
    let args = Cli::parse_from(["rsprovision", "apply", "--file", "radius.yaml"]);

    match args.command {
        Commands::Apply(opts) => {
            assert_eq!(opts.common.file, "radius.yaml");
            assert_eq!(opts.common.log_level, LogLevel::Info);
            assert!(!opts.dry_run);
            assert!(opts.settings.settings.is_none());
            assert!(opts.settings.overrides.is_empty());
        }
        _ => panic!("Expected Apply command"),
    }

    Ok(())
}

#[test]
fn test_parse_apply_command_with_flags() -> Result<()> {
    let args = Cli::parse_from([
        "rsprovision",
        "apply",
        "-f",
        "radius.yaml",
        "--settings",
        "/etc/rsprovision/radius.env",
        "--set",
        "DB_PASS=s3cret",
        "--set",
        "DB_USER=radius",
        "--dry-run",
        "--log-level",
        "debug",
    ]);

    match args.command {
        Commands::Apply(opts) => {
            assert_eq!(opts.common.file, "radius.yaml");
            assert_eq!(opts.common.log_level, LogLevel::Debug);
            assert!(opts.dry_run);
            assert_eq!(
                opts.settings.settings.as_deref().map(|p| p.as_str()),
                Some("/etc/rsprovision/radius.env")
            );
            assert_eq!(opts.settings.overrides, vec!["DB_PASS=s3cret", "DB_USER=radius"]);
        }
        _ => panic!("Expected Apply command"),
    }

    Ok(())
}

#[test]
fn test_parse_apply_uses_default_manifest() -> Result<()> {
    let args = Cli::parse_from(["rsprovision", "apply"]);

    match args.command {
        Commands::Apply(opts) => assert_eq!(opts.common.file, "provision.yaml"),
        _ => panic!("Expected Apply command"),
    }

    Ok(())
}

#[test]
fn test_parse_validate_command() -> Result<()> {
    let args = Cli::parse_from(["rsprovision", "validate", "--file", "radius.yaml", "--manifest-only"]);

    match args.command {
        Commands::Validate(opts) => {
            assert_eq!(opts.common.file, "radius.yaml");
            assert!(opts.manifest_only);
        }
        _ => panic!("Expected Validate command"),
    }

    Ok(())
}

#[test]
fn test_parse_facts_command() -> Result<()> {
    let args = Cli::parse_from(["rsprovision", "facts", "-f", "radius.yaml", "-l", "warn"]);

    assert_eq!(args.command.log_level(), Some(LogLevel::Warn));
    match args.command {
        Commands::Facts(opts) => assert_eq!(opts.common.file, "radius.yaml"),
        _ => panic!("Expected Facts command"),
    }

    Ok(())
}

#[test]
fn test_invalid_log_level_rejected() {
    let result = Cli::try_parse_from(["rsprovision", "apply", "--log-level", "verbose"]);
    assert!(result.is_err());
}

#[test]
fn test_missing_subcommand_rejected() {
    let result = Cli::try_parse_from(["rsprovision"]);
    assert!(result.is_err());
}
