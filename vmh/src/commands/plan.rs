use super::helpers::print_json;
use anyhow::{Context, Result, bail};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use vmh_common::scenario::{PlanIssue, Scenario, StepRegistry};

#[derive(Debug, Serialize)]
struct PlanReport {
    file: PathBuf,
    scenario: Option<String>,
    steps: usize,
    issues: Vec<String>,
}

impl PlanReport {
    fn ok(&self) -> bool {
        self.issues.is_empty()
    }
}

fn check_one(registry: &StepRegistry, path: &Path) -> PlanReport {
    let scenario = match Scenario::load(path) {
        Ok(scenario) => scenario,
        Err(err) => {
            return PlanReport {
                file: path.to_path_buf(),
                scenario: None,
                steps: 0,
                issues: vec![err.to_string()],
            };
        }
    };
    let issues: Vec<PlanIssue> = registry.check_plan(&scenario.steps);
    debug!(file = %path.display(), steps = scenario.steps.len(), issues = issues.len(), "plan checked");
    PlanReport {
        file: path.to_path_buf(),
        scenario: Some(scenario.name),
        steps: scenario.steps.len(),
        issues: issues.iter().map(ToString::to_string).collect(),
    }
}

pub fn check_plans(files: &[PathBuf], json: bool) -> Result<()> {
    let registry = StepRegistry::with_builtin_steps();
    let reports: Vec<PlanReport> = files.iter().map(|f| check_one(&registry, f)).collect();

    if json {
        print_json(&reports).context("cannot print plan report")?;
    } else {
        for report in &reports {
            let name = report.scenario.as_deref().unwrap_or("?");
            if report.ok() {
                println!("ok    {} ({name}, {} steps)", report.file.display(), report.steps);
            } else {
                println!("FAIL  {} ({name})", report.file.display());
                for issue in &report.issues {
                    println!("      {issue}");
                }
            }
        }
    }

    let failed = reports.iter().filter(|r| !r.ok()).count();
    info!(files = reports.len(), failed, "plans checked");
    if failed > 0 {
        bail!("{failed} of {} plan(s) invalid", reports.len());
    }
    Ok(())
}
