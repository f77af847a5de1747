//! Plan loading and execution.

use super::cleanup::CleanupRecord;
use super::context::{Backends, ScenarioContext};
use super::registry::{StepCall, StepRegistry};
use crate::config::HarnessConfig;
use crate::errors::{HarnessError, HarnessResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{error, info, warn};
use uuid::Uuid;

/// A named, ordered list of step calls.
///
/// ```toml
/// name = "persistent volume survives reboot"
/// tags = ["storage"]
///
/// [[step]]
/// verb = "a_computer"
///
/// [[step]]
/// verb = "create_disk"
/// args = { size = 8, unit = "GiB", temporary = true }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scenario {
    pub name: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, rename = "step")]
    pub steps: Vec<StepCall>,
}

impl Scenario {
    pub fn new(name: impl Into<String>, steps: Vec<StepCall>) -> Self {
        Self {
            name: name.into(),
            tags: Vec::new(),
            steps,
        }
    }

    pub fn from_toml_str(text: &str) -> HarnessResult<Self> {
        toml::from_str(text).map_err(|e| HarnessError::usage(format!("invalid scenario: {e}")))
    }

    pub fn load(path: &Path) -> HarnessResult<Self> {
        let text = fs::read_to_string(path)?;
        Self::from_toml_str(&text)
            .map_err(|e| HarnessError::usage(format!("{}: {e}", path.display())))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Passed,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRecord {
    pub index: usize,
    pub step: String,
    pub status: StepStatus,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
}

/// Everything that happened during one scenario run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioReport {
    pub run_id: Uuid,
    pub scenario: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub passed: bool,
    pub steps: Vec<StepRecord>,
    pub cleanup: Vec<CleanupRecord>,
    /// First failure: a step, invalid plan, or cleanup.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ScenarioReport {
    pub fn failed_step(&self) -> Option<&StepRecord> {
        self.steps.iter().find(|s| s.status == StepStatus::Failed)
    }

    /// Write `<dir>/<scenario>-<run id>.json` and return its path.
    pub fn write_json(&self, dir: &Path) -> HarnessResult<PathBuf> {
        fs::create_dir_all(dir)?;
        let slug: String = self
            .scenario
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '-' })
            .collect();
        let path = dir.join(format!("{}-{}.json", slug.trim_matches('-'), self.run_id.simple()));
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| HarnessError::Config(format!("cannot serialize report: {e}")))?;
        fs::write(&path, json)?;
        Ok(path)
    }
}

/// Runs scenarios against a set of backends.
#[derive(Debug, Clone)]
pub struct ScenarioRunner {
    registry: StepRegistry,
    config: HarnessConfig,
    write_artifacts: bool,
    domain: Option<String>,
}

impl ScenarioRunner {
    pub fn new(registry: StepRegistry, config: HarnessConfig) -> Self {
        Self {
            registry,
            config,
            write_artifacts: false,
            domain: None,
        }
    }

    /// Use a fixed domain name instead of one derived from the run id.
    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    /// Write each report below the configured artifacts directory.
    pub fn with_artifacts(mut self, enabled: bool) -> Self {
        self.write_artifacts = enabled;
        self
    }

    pub fn registry(&self) -> &StepRegistry {
        &self.registry
    }

    /// Run every step until the first failure, then tear down.
    ///
    /// An invalid plan runs no step at all. Teardown happens whatever the
    /// outcome; a teardown failure fails an otherwise passing run.
    pub fn run(&self, scenario: &Scenario, backends: Backends) -> ScenarioReport {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(scenario = %scenario.name, %run_id, steps = scenario.steps.len(), "scenario started");

        let mut steps = Vec::with_capacity(scenario.steps.len());
        let mut failure: Option<String> = None;

        let issues = self.registry.check_plan(&scenario.steps);
        if !issues.is_empty() {
            let listed: Vec<String> = issues.iter().map(ToString::to_string).collect();
            failure = Some(format!("invalid plan: {}", listed.join("; ")));
        }

        let domain = match &self.domain {
            Some(domain) => domain.clone(),
            None => format!("vmh-{}", &run_id.simple().to_string()[..12]),
        };
        let mut ctx = ScenarioContext::new(self.config.clone(), backends, domain);

        for (index, call) in scenario.steps.iter().enumerate() {
            if failure.is_some() {
                steps.push(StepRecord {
                    index,
                    step: call.to_string(),
                    status: StepStatus::Skipped,
                    duration_ms: 0,
                    error: None,
                    error_code: None,
                });
                continue;
            }

            let started = Instant::now();
            let outcome = self.registry.run(&mut ctx, call);
            let duration_ms = started.elapsed().as_millis() as u64;
            let record = match outcome {
                Ok(()) => {
                    info!(index, step = %call, duration_ms, "step passed");
                    StepRecord {
                        index,
                        step: call.to_string(),
                        status: StepStatus::Passed,
                        duration_ms,
                        error: None,
                        error_code: None,
                    }
                }
                Err(err) => {
                    error!(index, step = %call, duration_ms, error = %err, code = %err.code().code_string(), "step failed");
                    failure = Some(format!("step {} ({}): {err}", index + 1, call.verb));
                    StepRecord {
                        index,
                        step: call.to_string(),
                        status: StepStatus::Failed,
                        duration_ms,
                        error: Some(err.to_string()),
                        error_code: Some(err.code().code_string()),
                    }
                }
            };
            steps.push(record);
        }

        let (cleanup, teardown) = ctx.teardown();
        if let Err(err) = teardown {
            warn!(scenario = %scenario.name, error = %err, "teardown failed");
            failure.get_or_insert_with(|| err.to_string());
        }

        let report = ScenarioReport {
            run_id,
            scenario: scenario.name.clone(),
            started_at,
            finished_at: Utc::now(),
            passed: failure.is_none(),
            steps,
            cleanup,
            error: failure,
        };
        info!(scenario = %report.scenario, passed = report.passed, "scenario finished");

        if self.write_artifacts {
            match report.write_json(&self.config.artifacts_path()) {
                Ok(path) => info!(path = %path.display(), "scenario report written"),
                Err(err) => warn!(error = %err, "cannot write scenario report"),
            }
        }
        report
    }
}
