use crate::common::{TestWorkspace, assert_contains, assert_path_exists, init_test_logging, vmh};

#[test]
fn test_vmh_help_includes_description() {
    init_test_logging();
    crate::test_log!("TEST START: test_vmh_help_includes_description");

    let output = vmh(&["--help"]);
    assert!(output.status.success(), "vmh --help failed");
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert_contains(&stdout, "VM Harness");
    for subcommand in ["steps", "plan", "traffic", "config"] {
        assert_contains(&stdout, subcommand);
    }

    crate::test_log!("TEST PASS: test_vmh_help_includes_description");
}

#[test]
fn test_steps_lists_catalog() {
    init_test_logging();

    let output = vmh(&["steps"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert_contains(&stdout, "a_computer");
    assert_contains(&stdout, "traffic_only_to_allowed_hosts");
    assert_contains(&stdout, "    timeout?: duration");
}

#[test]
fn test_steps_json_is_parseable() {
    init_test_logging();

    let output = vmh(&["steps", "--json"]);
    assert!(output.status.success());
    let steps: serde_json::Value = serde_json::from_slice(&output.stdout).expect("steps --json is not JSON");
    let steps = steps.as_array().expect("expected an array");
    let create_disk = steps
        .iter()
        .find(|s| s["verb"] == "create_disk")
        .expect("create_disk missing");
    let params = create_disk["params"].as_array().unwrap();
    assert!(params.iter().any(|p| p["name"] == "size" && p["required"] == true && p["kind"] == "int"));
}

#[test]
fn test_log_dir_receives_json_logs() {
    init_test_logging();
    let ws = TestWorkspace::new();
    let logs = ws.dir.path().join("logs");

    let output = vmh(&["--verbose", "--log-dir", logs.to_str().unwrap(), "steps"]);
    assert!(output.status.success());
    assert_path_exists(&logs.join("vmh.jsonl"));
}
