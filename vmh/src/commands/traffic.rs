use super::helpers::print_json;
use anyhow::{Context, Result, bail};
use serde::Serialize;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use vmh_common::traffic::{
    AllowedHostSet, Endpoint, PolicyTimeline, assert_all_flows_against, assert_connections_against,
    read_flows_jsonl,
};

#[derive(Debug, Serialize)]
struct TrafficReport {
    flows: usize,
    connections: usize,
    allowed_hosts: usize,
    strict: bool,
    passed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    violation: Option<String>,
}

fn allowed_set(allow: &[String], allow_files: &[PathBuf]) -> Result<AllowedHostSet> {
    let mut set = AllowedHostSet::new();
    for entry in allow {
        let endpoint: Endpoint = entry
            .parse()
            .with_context(|| format!("invalid --allow value '{entry}'"))?;
        set.insert(endpoint);
    }
    for path in allow_files {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read allow-list {}", path.display()))?;
        let from_file = AllowedHostSet::from_lines(&text)
            .with_context(|| format!("invalid allow-list {}", path.display()))?;
        set.extend(from_file.iter().copied());
    }
    Ok(set)
}

pub fn check_traffic(
    flows_path: &Path,
    allow: &[String],
    allow_files: &[PathBuf],
    strict: bool,
    json: bool,
) -> Result<()> {
    let allowed = allowed_set(allow, allow_files)?;
    let file = File::open(flows_path).with_context(|| format!("cannot open {}", flows_path.display()))?;
    let traffic = read_flows_jsonl(BufReader::new(file))
        .with_context(|| format!("cannot read flows from {}", flows_path.display()))?;

    let allowed_hosts = allowed.len();
    let timeline = PolicyTimeline::new(allowed);
    let verdict = if strict {
        assert_all_flows_against(&traffic, &timeline)
    } else {
        assert_connections_against(&traffic, &timeline)
    };

    let report = TrafficReport {
        flows: traffic.len(),
        connections: traffic.connections().len(),
        allowed_hosts,
        strict,
        passed: verdict.is_ok(),
        violation: verdict.as_ref().err().map(ToString::to_string),
    };

    if json {
        print_json(&report)?;
    } else if report.passed {
        println!(
            "ok: {} connection(s) in {} flow(s), all to allowed endpoints",
            report.connections, report.flows
        );
    }

    if let Err(err) = verdict {
        bail!("[{}] {err}", err.code().code_string());
    }
    Ok(())
}
