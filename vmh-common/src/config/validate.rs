//! Sanity checks on an effective configuration.

use super::{HarnessConfig, MAX_PATIENCE, MIN_PATIENCE};
use serde::Serialize;
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConfigWarning {
    pub field: &'static str,
    pub message: String,
    pub severity: Severity,
}

impl ConfigWarning {
    fn new(field: &'static str, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
            severity,
        }
    }
}

impl fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let level = match self.severity {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
        };
        write!(f, "{level}: {}: {}", self.field, self.message)
    }
}

/// Check a configuration for values that would make waits misbehave.
pub fn validate_config(config: &HarnessConfig) -> Vec<ConfigWarning> {
    let mut warnings = Vec::new();

    if config.patience.is_nan() || !(MIN_PATIENCE..=MAX_PATIENCE).contains(&config.patience) {
        warnings.push(ConfigWarning::new(
            "patience",
            Severity::Error,
            format!("must be between {MIN_PATIENCE} and {MAX_PATIENCE}, got {}", config.patience),
        ));
    } else if config.patience > 10.0 {
        warnings.push(ConfigWarning::new(
            "patience",
            Severity::Warning,
            format!("{} makes failing waits very slow", config.patience),
        ));
    }

    if config.min_poll_sleep.is_zero() {
        warnings.push(ConfigWarning::new(
            "min_poll_sleep",
            Severity::Error,
            "zero minimum sleep busy-spins poll loops",
        ));
    }
    if config.poll_interval >= Duration::from_secs(1) {
        warnings.push(ConfigWarning::new(
            "poll_interval",
            Severity::Warning,
            "intervals of a second or more delay every synchronization",
        ));
    }
    if config.min_poll_sleep > config.poll_interval {
        warnings.push(ConfigWarning::new(
            "min_poll_sleep",
            Severity::Warning,
            "exceeds poll_interval; poll_interval is effectively ignored",
        ));
    }
    if config.remote_shell_timeout < Duration::from_secs(10) {
        warnings.push(ConfigWarning::new(
            "remote_shell_timeout",
            Severity::Warning,
            "guests rarely boot that fast",
        ));
    }

    if config.default_user.trim().is_empty() {
        warnings.push(ConfigWarning::new("default_user", Severity::Error, "must not be empty"));
    }
    if config.live_user.trim().is_empty() {
        warnings.push(ConfigWarning::new("live_user", Severity::Error, "must not be empty"));
    }
    if config.network_check_command.trim().is_empty() {
        warnings.push(ConfigWarning::new(
            "network_check_command",
            Severity::Error,
            "must not be empty",
        ));
    }

    let lan = &config.lan_server;
    if lan.command.is_empty() {
        warnings.push(ConfigWarning::new("lan_server.command", Severity::Error, "must not be empty"));
    } else if !lan.command.iter().any(|arg| arg.contains("{port}")) {
        warnings.push(ConfigWarning::new(
            "lan_server.command",
            Severity::Info,
            "does not reference {port}; the server must listen on lan_server.port itself",
        ));
    }
    if lan.port == 0 {
        warnings.push(ConfigWarning::new("lan_server.port", Severity::Error, "must not be 0"));
    }

    warnings
}
