//! Service controller.
//!
//! Converges long-running services to their declared end state through
//! systemd: install the package, set the boot state, then start, restart or
//! stop the unit. The observed state is queried afterwards and compared with
//! the request. A service that does not get there is recorded and the
//! controller moves on; only services marked `critical` fail the run, and
//! only after every service has been processed.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::Deserialize;
use strum::Display;
use tracing::{info, warn};

use crate::error::ProvisionError;
use crate::executor::{CommandExecutor, CommandSpec};
use crate::package::PackageManager;
use crate::step::Tolerance;
use crate::step::execution::execute_and_check;

const SYSTEMCTL: &str = "systemctl";

/// Requested run state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum RunState {
    /// Running; started only if not already active.
    Started,
    /// Restarted unconditionally so new configuration is picked up.
    Restarted,
    Stopped,
}

/// Desired end state for one service.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ServiceDefinition {
    /// systemd unit name.
    pub name: String,
    /// Package that provides the unit.
    #[serde(default)]
    pub package: Option<String>,
    /// Boot state; unchanged when absent.
    #[serde(default)]
    pub enabled: Option<bool>,
    /// Run state; unchanged when absent.
    #[serde(default)]
    pub state: Option<RunState>,
    /// Fail the run if this service does not reach its state.
    #[serde(default)]
    pub critical: bool,
    /// Per-command timeout in seconds, queries included.
    #[serde(default)]
    pub timeout: Option<u64>,
}

impl ServiceDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            package: None,
            enabled: None,
            state: None,
            critical: false,
            timeout: None,
        }
    }

    pub fn validate(&self) -> Result<(), ProvisionError> {
        if self.name.trim().is_empty() || self.name.starts_with('-') {
            return Err(ProvisionError::Validation(format!(
                "invalid service name '{}'",
                self.name
            )));
        }
        if self.timeout == Some(0) {
            return Err(ProvisionError::Validation(format!(
                "service '{}': timeout must be at least one second",
                self.name
            )));
        }
        Ok(())
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout.map(Duration::from_secs)
    }
}

/// What was observed after converging a service.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObservedState {
    /// `None` when the service declares no package.
    pub installed: Option<bool>,
    pub enabled: bool,
    pub active: bool,
}

/// Outcome for one service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceStatus {
    pub name: String,
    pub critical: bool,
    /// `None` in dry-run mode, where nothing is verified.
    pub observed: Option<ObservedState>,
    /// Why the service did not reach its requested state.
    pub error: Option<String>,
}

impl ServiceStatus {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Per-service outcomes, in declaration order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceReport {
    statuses: Vec<ServiceStatus>,
}

impl ServiceReport {
    pub fn statuses(&self) -> &[ServiceStatus] {
        &self.statuses
    }

    pub fn len(&self) -> usize {
        self.statuses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statuses.is_empty()
    }

    /// Services that did not reach their requested state.
    pub fn failures(&self) -> impl Iterator<Item = &ServiceStatus> {
        self.statuses.iter().filter(|s| !s.is_ok())
    }

    /// Fails with the first critical service that did not reach its state.
    pub fn ensure_success(&self) -> Result<(), ProvisionError> {
        match self.failures().find(|s| s.critical) {
            Some(status) => Err(ProvisionError::ServiceStateUnreachable {
                service: status.name.clone(),
                message: status.error.clone().unwrap_or_default(),
            }),
            None => Ok(()),
        }
    }
}

impl fmt::Display for ServiceReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for status in &self.statuses {
            write!(f, "  {}", status.name)?;
            if let Some(observed) = &status.observed {
                write!(
                    f,
                    ": {}, {}",
                    if observed.enabled { "enabled" } else { "disabled" },
                    if observed.active { "active" } else { "inactive" }
                )?;
                if observed.installed == Some(false) {
                    write!(f, ", not installed")?;
                }
            }
            if let Some(error) = &status.error {
                write!(f, " [unreachable: {}]", error)?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

fn systemctl(verb: &str, unit: &str) -> CommandSpec {
    CommandSpec::new(SYSTEMCTL, vec![verb.to_string(), unit.to_string()])
}

/// Applies service end states through systemd.
pub struct ServiceController {
    executor: Arc<dyn CommandExecutor>,
    packages: PackageManager,
}

impl ServiceController {
    pub fn new(executor: Arc<dyn CommandExecutor>, packages: PackageManager) -> Self {
        Self { executor, packages }
    }

    /// Converges every service and reports what was observed.
    pub fn apply(&self, services: &[ServiceDefinition]) -> ServiceReport {
        let mut report = ServiceReport::default();
        for service in services {
            info!("converging service {}", service.name);
            let status = match self.converge(service) {
                Ok(()) if self.executor.dry_run() => ServiceStatus {
                    name: service.name.clone(),
                    critical: service.critical,
                    observed: None,
                    error: None,
                },
                Ok(()) => match self.observe(service) {
                    Ok(observed) => ServiceStatus {
                        name: service.name.clone(),
                        critical: service.critical,
                        error: verify(service, &observed).err(),
                        observed: Some(observed),
                    },
                    Err(e) => ServiceStatus {
                        name: service.name.clone(),
                        critical: service.critical,
                        observed: None,
                        error: Some(format!("failed to query state: {:#}", e)),
                    },
                },
                Err(e) => ServiceStatus {
                    name: service.name.clone(),
                    critical: service.critical,
                    observed: self.observe(service).ok(),
                    error: Some(format!("{:#}", e)),
                },
            };
            if let Some(error) = &status.error {
                warn!("service {} did not reach its requested state: {}", service.name, error);
            }
            report.statuses.push(status);
        }
        report
    }

    fn run(&self, spec: CommandSpec, timeout: Option<Duration>) -> Result<()> {
        let tolerance = Tolerance {
            timeout,
            ..Tolerance::default()
        };
        execute_and_check(self.executor.as_ref(), spec, &tolerance).map(|_| ())
    }

    fn converge(&self, service: &ServiceDefinition) -> Result<()> {
        let executor = self.executor.as_ref();
        let timeout = service.timeout();
        if let Some(package) = &service.package
            && !self.packages.is_installed(executor, package, timeout)?
        {
            info!("installing package {} for service {}", package, service.name);
            self.run(self.packages.install_spec(std::slice::from_ref(package)), timeout)?;
        }

        if let Some(want) = service.enabled
            && self.is_enabled(&service.name, timeout)? != want
        {
            let verb = if want { "enable" } else { "disable" };
            info!("{} {}", verb, service.name);
            self.run(systemctl(verb, &service.name), timeout)?;
        }

        match service.state {
            Some(RunState::Started) if !self.is_active(&service.name, timeout)? => {
                self.run(systemctl("start", &service.name), timeout)?
            }
            Some(RunState::Restarted) => self.run(systemctl("restart", &service.name), timeout)?,
            Some(RunState::Stopped) if self.is_active(&service.name, timeout)? => {
                self.run(systemctl("stop", &service.name), timeout)?
            }
            _ => {}
        }
        Ok(())
    }

    fn query(&self, verb: &str, unit: &str, timeout: Option<Duration>) -> Result<String> {
        let spec = CommandSpec::query(SYSTEMCTL, vec![verb.to_string(), unit.to_string()])
            .with_timeout(timeout);
        Ok(self.executor.execute(&spec)?.stdout)
    }

    fn is_enabled(&self, unit: &str, timeout: Option<Duration>) -> Result<bool> {
        let state = self.query("is-enabled", unit, timeout)?;
        Ok(matches!(state.trim(), "enabled" | "enabled-runtime"))
    }

    fn is_active(&self, unit: &str, timeout: Option<Duration>) -> Result<bool> {
        Ok(self.query("is-active", unit, timeout)?.trim() == "active")
    }

    fn observe(&self, service: &ServiceDefinition) -> Result<ObservedState> {
        let timeout = service.timeout();
        let installed = match &service.package {
            Some(package) => {
                Some(self.packages.is_installed(self.executor.as_ref(), package, timeout)?)
            }
            None => None,
        };
        Ok(ObservedState {
            installed,
            enabled: self.is_enabled(&service.name, timeout)?,
            active: self.is_active(&service.name, timeout)?,
        })
    }
}

/// Compares the observed state with the request.
fn verify(service: &ServiceDefinition, observed: &ObservedState) -> Result<(), String> {
    let mut problems = Vec::new();
    if observed.installed == Some(false) {
        problems.push("package is not installed".to_string());
    }
    if let Some(want) = service.enabled
        && observed.enabled != want
    {
        problems.push(format!(
            "expected {}, observed {}",
            if want { "enabled" } else { "disabled" },
            if observed.enabled { "enabled" } else { "disabled" }
        ));
    }
    match service.state {
        Some(RunState::Started | RunState::Restarted) if !observed.active => {
            problems.push("not active".to_string())
        }
        Some(RunState::Stopped) if observed.active => problems.push("still active".to_string()),
        _ => {}
    }
    if problems.is_empty() {
        Ok(())
    } else {
        Err(problems.join("; "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_definition_deserializes() {
        let yaml = "name: freeradius\npackage: freeradius\nenabled: true\nstate: restarted\ncritical: true\n";
        let def: ServiceDefinition = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(def.state, Some(RunState::Restarted));
        assert_eq!(def.enabled, Some(true));
        assert!(def.critical);
    }

    #[test]
    fn test_verify_reports_every_mismatch() {
        let def = ServiceDefinition {
            enabled: Some(true),
            state: Some(RunState::Started),
            package: Some("apache2".to_string()),
            ..ServiceDefinition::new("apache2")
        };
        let observed = ObservedState {
            installed: Some(true),
            enabled: false,
            active: false,
        };
        assert_eq!(
            verify(&def, &observed).unwrap_err(),
            "expected enabled, observed disabled; not active"
        );

        let good = ObservedState {
            installed: Some(true),
            enabled: true,
            active: true,
        };
        assert!(verify(&def, &good).is_ok());
    }

    #[test]
    fn test_ensure_success_ignores_non_critical_failures() {
        let report = ServiceReport {
            statuses: vec![
                ServiceStatus {
                    name: "apache2".to_string(),
                    critical: false,
                    observed: None,
                    error: Some("not active".to_string()),
                },
                ServiceStatus {
                    name: "freeradius".to_string(),
                    critical: true,
                    observed: None,
                    error: None,
                },
            ],
        };
        assert!(report.ensure_success().is_ok());
        assert_eq!(report.failures().count(), 1);
    }

    #[test]
    fn test_validate_rejects_option_like_names() {
        assert!(ServiceDefinition::new("--now").validate().is_err());
        assert!(ServiceDefinition::new("mariadb").validate().is_ok());
    }

    #[test]
    fn test_timeout_must_be_positive() {
        let def: ServiceDefinition = serde_yaml::from_str("name: mariadb
timeout: 0
").unwrap();
        assert!(def.validate().unwrap_err().to_string().contains("at least one second"));
        let def: ServiceDefinition = serde_yaml::from_str("name: mariadb
timeout: 30
").unwrap();
        assert_eq!(def.timeout(), Some(Duration::from_secs(30)));
    }
}
