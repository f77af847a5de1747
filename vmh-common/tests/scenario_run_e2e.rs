//! Whole scenarios against the in-memory backends.
//!
//! These drive the runner the way a real suite does: a TOML plan, a fresh
//! set of backends per scenario, a report at the end. The mocks stand in
//! for the hypervisor, the framebuffer and the capture.

use std::sync::Arc;
use std::time::Duration;
use vmh_common::config::HarnessConfig;
use vmh_common::mock::{MockCapture, MockHypervisor, MockScreen};
use vmh_common::scenario::{Backends, Scenario, ScenarioRunner, StepRegistry, StepStatus};
use vmh_common::screen::{Key, Region};
use vmh_common::testing::init_global_test_logging;

#[ctor::ctor]
fn init() {
    init_global_test_logging();
}

struct Rig {
    hv: Arc<MockHypervisor>,
    screen: Arc<MockScreen>,
    backends: Backends,
}

fn rig() -> Rig {
    let hv = Arc::new(MockHypervisor::new());
    let screen = Arc::new(MockScreen::new(1024, 768));
    let backends = Backends {
        hypervisor: hv.clone(),
        screen: screen.clone(),
        capture: Arc::new(MockCapture::new()),
    };
    Rig { hv, screen, backends }
}

const DOMAIN: &str = "e2e";

fn runner() -> ScenarioRunner {
    let config = HarnessConfig {
        poll_interval: Duration::from_millis(5),
        min_poll_sleep: Duration::from_millis(1),
        ..HarnessConfig::default()
    };
    ScenarioRunner::new(StepRegistry::with_builtin_steps(), config).with_domain(DOMAIN)
}

/// A boot menu that leads to the greeter once Enter is pressed.
fn boot_screens(screen: &MockScreen) {
    screen.show("BootMenu.png", Region::new(300, 200, 400, 300));
    screen.reveal_on_key(Key::Enter, "Greeter.png", Region::new(0, 0, 1024, 768));
    screen.show("LoginButton.png", Region::new(480, 600, 64, 24));
}

#[test]
fn test_boot_login_and_persistent_storage() {
    let rig = rig();
    boot_screens(&rig.screen);
    rig.hv.open_session(DOMAIN, "user");

    let plan = Scenario::from_toml_str(
        r#"
name = "Boot and use a USB drive"

[[step]]
verb = "a_computer"

[[step]]
verb = "create_disk"
args = { name = "usb-stick", size = 4, unit = "GiB", temporary = true }

[[step]]
verb = "intend_boot_options"
args = { options = "nopersistence" }

[[step]]
verb = "start_system"
args = { login = true }

[[step]]
verb = "plug_drive"
args = { name = "usb-stick", bus = "usb" }

[[step]]
verb = "command_outcome"
args = { command = "true", outcome = "succeeds" }

[[step]]
verb = "shutdown_and_wait"
"#,
    )
    .unwrap();

    let report = runner().run(&plan, rig.backends.clone());
    assert!(report.passed, "{:#?}", report);
    assert!(report.steps.iter().all(|s| s.status == StepStatus::Passed));
    assert_eq!(rig.screen.typed_text(), " nopersistence");

    let cleanup: Vec<_> = report.cleanup.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(cleanup, vec!["delete volume usb-stick", "destroy computer"]);
    assert!(report.cleanup.iter().all(|c| c.succeeded()));
}

#[test]
fn test_failure_mid_plan_still_cleans_up() {
    let rig = rig();
    rig.screen.show("BootMenu.png", Region::new(0, 0, 10, 10));

    let plan = Scenario::from_toml_str(
        r#"
name = "Greeter never shows"

[[step]]
verb = "a_computer"

[[step]]
verb = "create_disk"
args = { name = "scratch", size = 64, unit = "MiB", temporary = true }

[[step]]
verb = "start_computer"

[[step]]
verb = "capture_traffic"

[[step]]
verb = "see"
args = { landmark = "Greeter.png", timeout = "30ms" }

[[step]]
verb = "power_off"
"#,
    )
    .unwrap();

    let report = runner().run(&plan, rig.backends.clone());
    assert!(!report.passed);

    let failed = report.failed_step().unwrap();
    assert_eq!(failed.index, 4);
    assert!(failed.error.as_deref().unwrap().contains("Greeter.png"));
    assert_eq!(report.steps[5].status, StepStatus::Skipped);

    // Newest hook first, VM last.
    let cleanup: Vec<_> = report.cleanup.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(
        cleanup,
        vec!["stop capture on vnet-e2e", "delete volume scratch", "destroy computer"]
    );
    assert!(!rig.hv.is_defined(DOMAIN));
}

#[test]
fn test_scenarios_do_not_share_state() {
    let first = rig();
    let second = rig();
    let plan = Scenario::from_toml_str(
        r#"
name = "Write a file"

[[step]]
verb = "a_computer"

[[step]]
verb = "start_computer"

[[step]]
verb = "execute"
args = { command = "printf %s hello > /tmp/greeting" }

[[step]]
verb = "file_exists"
args = { path = "/tmp/greeting" }
"#,
    )
    .unwrap();

    // Default runners pick a fresh domain per run.
    let runner = ScenarioRunner::new(StepRegistry::with_builtin_steps(), HarnessConfig::default());
    let a = runner.run(&plan, first.backends.clone());
    let b = runner.run(&plan, second.backends.clone());
    assert!(a.passed && b.passed, "{a:#?}\n{b:#?}");
    assert_ne!(a.run_id, b.run_id);
}
