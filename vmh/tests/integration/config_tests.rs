use crate::common::{TestWorkspace, assert_contains, init_test_logging, vmh};
use vmh_common::config::HarnessConfig;

#[test]
fn test_default_config_is_patient_enough() {
    init_test_logging();
    crate::test_log!("TEST START: test_default_config_is_patient_enough");

    let config = HarnessConfig::default();
    assert!(config.patience >= 1.0);
    assert_eq!(config.default_user, "root");

    crate::test_log!("TEST PASS: test_default_config_is_patient_enough");
}

#[test]
fn test_config_show_marks_file_values() {
    init_test_logging();
    let ws = TestWorkspace::new();
    let path = ws.write("config.toml", "patience = 2.5\nlive_user = \"amnesia\"\n");

    let output = vmh(&["--config", path.to_str().unwrap(), "config", "show"]);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(output.status.success(), "stdout: {stdout}");
    assert_contains(&stdout, "# file:");
    assert_contains(&stdout, "amnesia");
    let patience_row = stdout
        .lines()
        .find(|l| l.starts_with("patience"))
        .expect("no patience row");
    assert!(patience_row.trim_end().ends_with("file"), "{patience_row}");
}

#[test]
fn test_config_show_json_env_override() {
    init_test_logging();
    let ws = TestWorkspace::new();
    let path = ws.write("config.toml", "");

    let output = std::process::Command::new(env!("CARGO_BIN_EXE_vmh"))
        .args(["--json", "--config", path.to_str().unwrap(), "config", "show"])
        .env("VMH_PATIENCE", "3")
        .output()
        .unwrap();
    assert!(output.status.success());
    let shown: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(shown["config"]["patience"], 3.0);
    let row = shown["sources"]
        .as_array()
        .unwrap()
        .iter()
        .find(|r| r["key"] == "patience")
        .unwrap()
        .clone();
    assert_eq!(row["source"], "environment");
    assert_eq!(row["env_var"], "VMH_PATIENCE");
}

#[test]
fn test_config_validate_fails_on_errors() {
    init_test_logging();
    let ws = TestWorkspace::new();
    let path = ws.write("config.toml", "patience = 0.5\n");

    let output = vmh(&["--config", path.to_str().unwrap(), "config", "validate"]);
    assert!(!output.status.success());
    assert_contains(&String::from_utf8_lossy(&output.stdout), "error: patience");
}

#[test]
fn test_missing_config_file_is_reported() {
    init_test_logging();
    let output = vmh(&["--config", "/nonexistent/vmh.toml", "config", "show"]);
    assert!(!output.status.success());
    assert_contains(&String::from_utf8_lossy(&output.stderr), "config file not found");
}
