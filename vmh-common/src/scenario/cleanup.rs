//! After-scenario hooks.

use crate::errors::{HarnessError, HarnessResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Instant;
use tracing::{debug, info, warn};

type Hook = Box<dyn FnOnce() -> HarnessResult<()> + Send>;

/// Outcome of one hook, as written to the scenario report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupRecord {
    pub name: String,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CleanupRecord {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Hooks registered while a scenario runs.
///
/// Every hook runs exactly once, newest first. A failing hook never stops
/// the ones registered before it; failures are collected into
/// [`HarnessError::Cleanup`]. Hooks still pending when the stack is dropped
/// run then.
#[derive(Default)]
pub struct CleanupStack {
    hooks: Vec<(String, Hook)>,
}

impl fmt::Debug for CleanupStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.hooks.iter().map(|(name, _)| name)).finish()
    }
}

impl CleanupStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push<F>(&mut self, name: impl Into<String>, hook: F)
    where
        F: FnOnce() -> HarnessResult<()> + Send + 'static,
    {
        let name = name.into();
        debug!(hook = %name, depth = self.hooks.len() + 1, "cleanup hook registered");
        self.hooks.push((name, Box::new(hook)));
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Names of pending hooks, in the order they will run.
    pub fn pending(&self) -> Vec<&str> {
        self.hooks.iter().rev().map(|(name, _)| name.as_str()).collect()
    }

    /// Run and drain every pending hook.
    pub fn run_all(&mut self) -> (Vec<CleanupRecord>, HarnessResult<()>) {
        let mut records = Vec::with_capacity(self.hooks.len());
        let mut failures = Vec::new();

        while let Some((name, hook)) = self.hooks.pop() {
            let started = Instant::now();
            let outcome = hook();
            let duration_ms = started.elapsed().as_millis() as u64;
            let error = match outcome {
                Ok(()) => {
                    debug!(hook = %name, duration_ms, "cleanup hook done");
                    None
                }
                Err(err) => {
                    warn!(hook = %name, error = %err, "cleanup hook failed");
                    failures.push(format!("{name}: {err}"));
                    Some(err.to_string())
                }
            };
            records.push(CleanupRecord {
                name,
                duration_ms,
                error,
            });
        }

        if !records.is_empty() {
            info!(hooks = records.len(), failed = failures.len(), "cleanup finished");
        }
        let result = if failures.is_empty() {
            Ok(())
        } else {
            Err(HarnessError::Cleanup(failures))
        };
        (records, result)
    }
}

impl Drop for CleanupStack {
    fn drop(&mut self) {
        if !self.hooks.is_empty() {
            let (_, result) = self.run_all();
            if let Err(err) = result {
                warn!(error = %err, "cleanup on drop failed");
            }
        }
    }
}
