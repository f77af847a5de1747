use crate::common::{TestWorkspace, assert_contains, init_test_logging, vmh};

fn flow(at: &str, daddr: &str, dport: u16) -> String {
    format!(r#"{{"timestamp":"{at}","protocol":"tcp","source":"10.2.1.2","daddr":"{daddr}","dport":{dport}}}"#)
}

fn dump(ws: &TestWorkspace) -> std::path::PathBuf {
    let lines = [
        flow("2024-05-01T10:00:00Z", "10.2.1.1", 9050),
        flow("2024-05-01T10:00:01Z", "10.2.1.1", 9050),
        flow("2024-05-01T10:00:02Z", "192.0.2.7", 443),
    ];
    ws.write("flows.jsonl", &format!("{}\n", lines.join("\n")))
}

#[test]
fn test_traffic_check_passes_with_full_allow_list() {
    init_test_logging();
    let ws = TestWorkspace::new();
    let flows = dump(&ws);
    let allow = ws.write("allowed.txt", "# relays\n10.2.1.1:9050\n192.0.2.7:443\n");

    let output = vmh(&["traffic", "check", flows.to_str().unwrap(), "--allow-file", allow.to_str().unwrap()]);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(output.status.success(), "stdout: {stdout}");
    assert_contains(&stdout, "2 connection(s) in 3 flow(s)");
}

#[test]
fn test_traffic_check_names_offending_endpoint() {
    init_test_logging();
    let ws = TestWorkspace::new();
    let flows = dump(&ws);

    let output = vmh(&["traffic", "check", flows.to_str().unwrap(), "--allow", "10.2.1.1:9050"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert_contains(&stderr, "VMH-E400");
    assert_contains(&stderr, "192.0.2.7:443");
}

#[test]
fn test_traffic_check_json_report() {
    init_test_logging();
    let ws = TestWorkspace::new();
    let flows = dump(&ws);

    let output = vmh(&[
        "traffic",
        "check",
        "--json",
        "--strict",
        flows.to_str().unwrap(),
        "--allow",
        "10.2.1.1:9050",
        "--allow",
        "192.0.2.7:443",
    ]);
    assert!(output.status.success());
    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report["passed"], true);
    assert_eq!(report["strict"], true);
    assert_eq!(report["allowed_hosts"], 2);
}

#[test]
fn test_traffic_check_rejects_bad_dump() {
    init_test_logging();
    let ws = TestWorkspace::new();
    let flows = ws.write("flows.jsonl", "{not json}\n");

    let output = vmh(&["traffic", "check", flows.to_str().unwrap()]);
    assert!(!output.status.success());
    assert_contains(&String::from_utf8_lossy(&output.stderr), "flow line 1");
}
