//! Package manager abstraction.
//!
//! Maps install/query/update operations onto the host's package manager
//! commands. Used by package steps and by the service controller.

use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use strum::Display;

use crate::executor::{CommandExecutor, CommandSpec};

/// Supported package managers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum PackageManager {
    /// Debian/Ubuntu `apt-get` with `dpkg-query` for status
    #[default]
    Apt,
    /// Fedora/RHEL `dnf` with `rpm` for status
    Dnf,
}

impl PackageManager {
    /// Builds the command that refreshes package indexes.
    pub fn update_spec(&self) -> CommandSpec {
        match self {
            Self::Apt => CommandSpec::new("apt-get", vec!["update".to_string()])
                .with_env("DEBIAN_FRONTEND", "noninteractive"),
            Self::Dnf => CommandSpec::new("dnf", vec!["makecache".to_string()]),
        }
    }

    /// Builds the command that installs `names` non-interactively.
    pub fn install_spec(&self, names: &[String]) -> CommandSpec {
        match self {
            Self::Apt => {
                let mut args = vec!["install".to_string(), "-y".to_string()];
                args.extend(names.iter().cloned());
                CommandSpec::new("apt-get", args).with_env("DEBIAN_FRONTEND", "noninteractive")
            }
            Self::Dnf => {
                let mut args = vec!["install".to_string(), "-y".to_string()];
                args.extend(names.iter().cloned());
                CommandSpec::new("dnf", args)
            }
        }
    }

    /// Builds the read-only query for a single package's install state.
    pub fn query_spec(&self, name: &str) -> CommandSpec {
        match self {
            Self::Apt => CommandSpec::query(
                "dpkg-query",
                vec!["-W".to_string(), "-f=${Status}".to_string(), name.to_string()],
            ),
            Self::Dnf => CommandSpec::query("rpm", vec!["-q".to_string(), name.to_string()]),
        }
    }

    /// Returns true if `name` is installed.
    ///
    /// A package the manager does not know about counts as not installed.
    /// In dry-run mode a query that did not run also counts as not installed.
    pub fn is_installed(
        &self,
        executor: &dyn CommandExecutor,
        name: &str,
        timeout: Option<Duration>,
    ) -> Result<bool> {
        let spec = self.query_spec(name).with_timeout(timeout);
        let result = executor
            .execute(&spec)
            .with_context(|| format!("failed to query package {}", name))?;
        if !result.confirmed_success() {
            return Ok(false);
        }
        Ok(match self {
            Self::Apt => result.stdout.contains("install ok installed"),
            Self::Dnf => true,
        })
    }

    /// Returns the subset of `names` that is not installed, preserving order.
    pub fn missing(
        &self,
        executor: &dyn CommandExecutor,
        names: &[String],
        timeout: Option<Duration>,
    ) -> Result<Vec<String>> {
        let mut missing = Vec::new();
        for name in names {
            if !self.is_installed(executor, name, timeout)? {
                missing.push(name.clone());
            }
        }
        Ok(missing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apt_install_spec() {
        let spec = PackageManager::Apt.install_spec(&["freeradius".to_string(), "php".to_string()]);
        assert_eq!(spec.command, "apt-get");
        assert_eq!(spec.args, vec!["install", "-y", "freeradius", "php"]);
        assert!(spec.env.contains(&("DEBIAN_FRONTEND".to_string(), "noninteractive".to_string())));
        assert!(!spec.query);
    }

    #[test]
    fn test_dnf_query_spec_is_query() {
        let spec = PackageManager::Dnf.query_spec("httpd");
        assert_eq!(spec.command, "rpm");
        assert_eq!(spec.args, vec!["-q", "httpd"]);
        assert!(spec.query);
        assert!(spec.capture);
    }

    #[test]
    fn test_display_and_deserialize() {
        assert_eq!(PackageManager::Apt.to_string(), "apt");
        let manager: PackageManager = serde_yaml::from_str("dnf").unwrap();
        assert_eq!(manager, PackageManager::Dnf);
    }
}
