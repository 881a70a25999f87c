//! Tests for the systemd service controller.

mod helpers;

use std::sync::Arc;
use std::time::Duration;

use helpers::{MockExecutor, Reply};
use rsprovision::ProvisionError;
use rsprovision::executor::CommandExecutor;
use rsprovision::package::PackageManager;
use rsprovision::service::{RunState, ServiceController, ServiceDefinition};

fn controller(mock: &Arc<MockExecutor>) -> ServiceController {
    let executor: Arc<dyn CommandExecutor> = mock.clone();
    ServiceController::new(executor, PackageManager::Apt)
}

fn freeradius() -> ServiceDefinition {
    ServiceDefinition {
        package: Some("freeradius".to_string()),
        enabled: Some(true),
        state: Some(RunState::Restarted),
        critical: true,
        ..ServiceDefinition::new("freeradius")
    }
}

#[test]
fn test_converges_and_observes_service() {
    let mock = Arc::new(
        MockExecutor::new()
            .on_seq(
                "dpkg-query",
                vec![Reply::fail(1, "not installed"), Reply::ok("install ok installed")],
            )
            .on_seq(
                "systemctl is-enabled freeradius",
                vec![Reply::fail(1, "disabled\n"), Reply::ok("enabled\n")],
            )
            .on("systemctl is-active freeradius", Reply::ok("active\n")),
    );

    let report = controller(&mock).apply(&[freeradius()]);

    let status = &report.statuses()[0];
    assert!(status.is_ok(), "got: {:?}", status.error);
    let observed = status.observed.as_ref().unwrap();
    assert!(observed.enabled);
    assert!(observed.active);
    assert_eq!(observed.installed, Some(true));

    let mutations: Vec<String> = mock
        .calls()
        .into_iter()
        .filter(|c| c.starts_with("apt-get") || c.starts_with("systemctl enable") || c.starts_with("systemctl restart"))
        .collect();
    assert_eq!(
        mutations,
        vec![
            "apt-get install -y freeradius",
            "systemctl enable freeradius",
            "systemctl restart freeradius"
        ]
    );
    assert!(report.ensure_success().is_ok());
}

#[test]
fn test_already_enabled_service_is_not_re_enabled() {
    let mock = Arc::new(
        MockExecutor::new()
            .on("dpkg-query", Reply::ok("install ok installed"))
            .on("systemctl is-enabled", Reply::ok("enabled\n"))
            .on("systemctl is-active", Reply::ok("active\n")),
    );
    let service = ServiceDefinition {
        enabled: Some(true),
        state: Some(RunState::Started),
        ..ServiceDefinition::new("apache2")
    };

    let report = controller(&mock).apply(&[service]);

    assert!(report.statuses()[0].is_ok());
    assert!(mock.calls_starting_with("systemctl enable").is_empty());
    assert!(mock.calls_starting_with("systemctl start").is_empty());
}

#[test]
fn test_unreachable_service_is_reported_and_others_continue() {
    let mock = Arc::new(
        MockExecutor::new()
            .on("dpkg-query", Reply::ok("install ok installed"))
            .on("systemctl is-enabled", Reply::ok("enabled\n"))
            .on("systemctl is-active apache2", Reply::fail(3, "inactive\n"))
            .on("systemctl is-active", Reply::ok("active\n"))
            .on("systemctl start apache2", Reply::fail(1, "Job for apache2.service failed")),
    );
    let apache = ServiceDefinition {
        state: Some(RunState::Started),
        ..ServiceDefinition::new("apache2")
    };

    let report = controller(&mock).apply(&[apache, freeradius()]);

    assert_eq!(report.len(), 2);
    let apache = &report.statuses()[0];
    assert!(!apache.is_ok());
    assert!(apache.error.as_deref().unwrap().contains("Job for apache2.service failed"));
    assert!(report.statuses()[1].is_ok());
    assert!(!mock.calls_starting_with("systemctl restart freeradius").is_empty());

    // apache2 is not critical
    assert!(report.ensure_success().is_ok());
}

#[test]
fn test_critical_failure_fails_the_run() {
    let mock = Arc::new(
        MockExecutor::new()
            .on("dpkg-query", Reply::ok("install ok installed"))
            .on("systemctl is-enabled", Reply::ok("enabled\n"))
            .on("systemctl is-active", Reply::fail(3, "failed\n")),
    );

    let report = controller(&mock).apply(&[freeradius()]);

    let err = report.ensure_success().unwrap_err();
    match err {
        ProvisionError::ServiceStateUnreachable { service, message } => {
            assert_eq!(service, "freeradius");
            assert!(message.contains("not active"), "got: {}", message);
        }
        other => panic!("expected ServiceStateUnreachable, got {:?}", other),
    }
}

#[test]
fn test_dry_run_changes_nothing_and_verifies_nothing() {
    let mock = Arc::new(
        MockExecutor::new()
            .in_dry_run()
            .on("dpkg-query", Reply::fail(1, ""))
            .on("systemctl is-enabled", Reply::ok("disabled\n"))
            .on("systemctl is-active", Reply::ok("inactive\n")),
    );

    let report = controller(&mock).apply(&[freeradius()]);

    let status = &report.statuses()[0];
    assert!(status.is_ok());
    assert_eq!(status.observed, None);
    assert!(report.ensure_success().is_ok());
}

#[test]
fn test_service_timeout_bounds_queries_and_actions() {
    let mock = Arc::new(
        MockExecutor::new()
            .on("dpkg-query", Reply::ok("install ok installed"))
            .on("systemctl is-enabled", Reply::ok("enabled\n"))
            .on("systemctl is-active", Reply::ok("active\n")),
    );
    let service = ServiceDefinition {
        timeout: Some(20),
        ..freeradius()
    };

    let report = controller(&mock).apply(&[service]);

    assert!(report.statuses()[0].is_ok());
    let bound = Some(Duration::from_secs(20));
    for prefix in ["dpkg-query", "systemctl is-enabled", "systemctl is-active", "systemctl restart"] {
        let timeouts = mock.timeouts_for(prefix);
        assert!(!timeouts.is_empty(), "no {} call", prefix);
        assert!(timeouts.iter().all(|t| *t == bound), "{}: {:?}", prefix, timeouts);
    }
}
