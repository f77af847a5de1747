use crate::common::{TestWorkspace, assert_contains, assert_not_contains, init_test_logging, vmh};

const GOOD_PLAN: &str = r#"
name = "Tor traffic stays on relays"

[[step]]
verb = "a_computer"

[[step]]
verb = "capture_traffic"

[[step]]
verb = "start_system"
args = { login = true }

[[step]]
verb = "allowed_hosts_from_guest"
args = { path = "/etc/tor/relays" }

[[step]]
verb = "traffic_only_to_allowed_hosts"
"#;

const BAD_PLAN: &str = r#"
name = "Broken"

[[step]]
verb = "a_computer"

[[step]]
verb = "teleport"

[[step]]
verb = "file_exists"
args = { timeout = "10s" }
"#;

#[test]
fn test_plan_check_accepts_valid_plan() {
    init_test_logging();
    let ws = TestWorkspace::new();
    let plan = ws.write("good.toml", GOOD_PLAN);

    let output = vmh(&["plan", "check", plan.to_str().unwrap()]);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(output.status.success(), "stdout: {stdout}");
    assert_contains(&stdout, "ok");
    assert_contains(&stdout, "5 steps");
    assert_not_contains(&stdout, "FAIL");
}

#[test]
fn test_plan_check_reports_every_issue() {
    init_test_logging();
    let ws = TestWorkspace::new();
    let good = ws.write("good.toml", GOOD_PLAN);
    let bad = ws.write("bad.toml", BAD_PLAN);

    let output = vmh(&["plan", "check", good.to_str().unwrap(), bad.to_str().unwrap()]);
    assert!(!output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert_contains(&stdout, "step 2 (teleport): usage error: unknown step 'teleport'");
    assert_contains(&stdout, "step 3 (file_exists)");
    assert_contains(&String::from_utf8_lossy(&output.stderr), "1 of 2 plan(s) invalid");
}

#[test]
fn test_plan_check_json_and_unparseable_file() {
    init_test_logging();
    let ws = TestWorkspace::new();
    let broken = ws.write("broken.toml", "name = [");

    let output = vmh(&["plan", "check", "--json", broken.to_str().unwrap()]);
    assert!(!output.status.success());
    let reports: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(reports[0]["scenario"], serde_json::Value::Null);
    assert_eq!(reports[0]["issues"].as_array().unwrap().len(), 1);
}
