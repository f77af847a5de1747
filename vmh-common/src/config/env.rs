//! `VMH_*` environment variable parsing.
//!
//! Errors are accumulated instead of returned so that one run can report
//! every bad override at once.

use super::source::Sourced;
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during environment variable parsing.
#[derive(Debug, Error)]
pub enum EnvError {
    #[error("Invalid value for {var}: expected {expected}, got '{value}'")]
    InvalidValue {
        var: String,
        expected: String,
        value: String,
    },

    #[error("Invalid duration for {var}: '{value}' ({reason})")]
    InvalidDuration {
        var: String,
        value: String,
        reason: String,
    },

    #[error("Value out of range for {var}: {value} (valid: {min}..={max})")]
    OutOfRange {
        var: String,
        value: String,
        min: String,
        max: String,
    },

    #[error("Cannot expand path for {var}: {reason}")]
    PathExpansion { var: String, reason: String },
}

/// Environment parser bound to a variable prefix.
pub struct EnvParser {
    prefix: &'static str,
    errors: Vec<EnvError>,
}

impl EnvParser {
    /// Create a parser with the `VMH_` prefix.
    pub fn new() -> Self {
        Self::with_prefix("VMH_")
    }

    pub fn with_prefix(prefix: &'static str) -> Self {
        Self {
            prefix,
            errors: Vec::new(),
        }
    }

    pub fn errors(&self) -> &[EnvError] {
        &self.errors
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn take_errors(&mut self) -> Vec<EnvError> {
        std::mem::take(&mut self.errors)
    }

    /// Record an error found while interpreting a value read through this parser.
    pub fn push_error(&mut self, error: EnvError) {
        self.errors.push(error);
    }

    fn var_name(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name)
    }

    /// Raw lookup; unset and non-UTF-8 values both read as absent.
    fn lookup(&self, name: &str) -> (String, Option<String>) {
        let var_name = self.var_name(name);
        let value = env::var(&var_name).ok();
        (var_name, value)
    }

    pub fn get_string(&mut self, name: &str, default: &str) -> Sourced<String> {
        match self.lookup(name) {
            (var, Some(value)) => Sourced::from_env(value, var),
            (_, None) => Sourced::default_value(default.to_string()),
        }
    }

    /// Optional string; set-but-empty reads as `None`.
    pub fn get_optional_string(&mut self, name: &str) -> Sourced<Option<String>> {
        match self.lookup(name) {
            (var, Some(value)) if value.is_empty() => Sourced::from_env(None, var),
            (var, Some(value)) => Sourced::from_env(Some(value), var),
            (_, None) => Sourced::default_value(None),
        }
    }

    /// Boolean with default.
    ///
    /// Accepts: 1, true, yes, on (for true)
    ///          0, false, no, off, "" (for false)
    pub fn get_bool(&mut self, name: &str, default: bool) -> Sourced<bool> {
        let (var, value) = self.lookup(name);
        let Some(value) = value else {
            return Sourced::default_value(default);
        };
        match parse_bool(&value) {
            Some(parsed) => Sourced::from_env(parsed, var),
            None => {
                self.errors.push(EnvError::InvalidValue {
                    var: var.clone(),
                    expected: "boolean (true/false/1/0/yes/no)".to_string(),
                    value,
                });
                Sourced::default_value(default)
            }
        }
    }

    pub fn get_u64_range(&mut self, name: &str, default: u64, min: u64, max: u64) -> Sourced<u64> {
        let (var, value) = self.lookup(name);
        let Some(value) = value else {
            return Sourced::default_value(default);
        };
        match value.trim().parse::<u64>() {
            Ok(n) if (min..=max).contains(&n) => Sourced::from_env(n, var),
            Ok(n) => {
                self.errors.push(EnvError::OutOfRange {
                    var,
                    value: n.to_string(),
                    min: min.to_string(),
                    max: max.to_string(),
                });
                Sourced::default_value(default)
            }
            Err(_) => {
                self.errors.push(EnvError::InvalidValue {
                    var,
                    expected: "unsigned integer".to_string(),
                    value,
                });
                Sourced::default_value(default)
            }
        }
    }

    pub fn get_f64_range(&mut self, name: &str, default: f64, min: f64, max: f64) -> Sourced<f64> {
        let (var, value) = self.lookup(name);
        let Some(value) = value else {
            return Sourced::default_value(default);
        };
        match value.trim().parse::<f64>() {
            Ok(n) if n >= min && n <= max => Sourced::from_env(n, var),
            Ok(n) => {
                self.errors.push(EnvError::OutOfRange {
                    var,
                    value: n.to_string(),
                    min: min.to_string(),
                    max: max.to_string(),
                });
                Sourced::default_value(default)
            }
            Err(_) => {
                self.errors.push(EnvError::InvalidValue {
                    var,
                    expected: "floating-point number".to_string(),
                    value,
                });
                Sourced::default_value(default)
            }
        }
    }

    /// Duration in humantime notation ("250ms", "3m", "1h 30s").
    pub fn get_duration(&mut self, name: &str, default: Duration) -> Sourced<Duration> {
        let (var, value) = self.lookup(name);
        let Some(value) = value else {
            return Sourced::default_value(default);
        };
        match humantime::parse_duration(value.trim()) {
            Ok(d) => Sourced::from_env(d, var),
            Err(e) => {
                self.errors.push(EnvError::InvalidDuration {
                    var,
                    value,
                    reason: e.to_string(),
                });
                Sourced::default_value(default)
            }
        }
    }

    /// Path with `~` and `$VAR` expansion.
    pub fn get_path(&mut self, name: &str, default: &str) -> Sourced<PathBuf> {
        let (var, value) = self.lookup(name);
        let from_env = value.is_some();
        let raw = value.unwrap_or_else(|| default.to_string());
        let expanded = match shellexpand::full(&raw) {
            Ok(s) => PathBuf::from(s.as_ref()),
            Err(e) => {
                self.errors.push(EnvError::PathExpansion {
                    var: var.clone(),
                    reason: e.to_string(),
                });
                PathBuf::from(&raw)
            }
        };
        if from_env {
            Sourced::from_env(expanded, var)
        } else {
            Sourced::default_value(expanded)
        }
    }
}

impl Default for EnvParser {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
#[allow(unsafe_code)]
mod tests {
    use super::*;
    use crate::config::ConfigSource;
    use crate::config::env_test_lock;

    fn cleanup_env(vars: &[&str]) {
        for var in vars {
            // SAFETY: serialized by env_test_lock
            unsafe { env::remove_var(var) };
        }
    }

    fn set_env(key: &str, value: &str) {
        // SAFETY: serialized by env_test_lock
        unsafe { env::set_var(key, value) };
    }

    #[test]
    fn test_get_bool_values() {
        let _guard = env_test_lock();
        let vars = ["VMH_TEST_BOOL"];
        for (val, expected) in [("1", true), ("YES", true), ("on", true), ("0", false), ("off", false), ("", false)] {
            set_env("VMH_TEST_BOOL", val);
            let mut parser = EnvParser::new();
            assert_eq!(parser.get_bool("TEST_BOOL", !expected).value, expected, "{val}");
            assert!(!parser.has_errors());
        }
        cleanup_env(&vars);
    }

    #[test]
    fn test_get_bool_invalid_uses_default() {
        let _guard = env_test_lock();
        set_env("VMH_BAD_BOOL", "maybe");
        let mut parser = EnvParser::new();
        let result = parser.get_bool("BAD_BOOL", true);
        assert!(result.value);
        assert_eq!(result.source, ConfigSource::Default);
        assert_eq!(parser.errors().len(), 1);
        cleanup_env(&["VMH_BAD_BOOL"]);
    }

    #[test]
    fn test_get_u64_range() {
        let _guard = env_test_lock();
        set_env("VMH_TEST_PORT", "8080");
        set_env("VMH_TEST_PORT_OOR", "70000");
        set_env("VMH_TEST_PORT_BAD", "eighty");
        let mut parser = EnvParser::new();
        assert_eq!(parser.get_u64_range("TEST_PORT", 8000, 1, 65535).value, 8080);
        assert_eq!(parser.get_u64_range("TEST_PORT_OOR", 8000, 1, 65535).value, 8000);
        assert_eq!(parser.get_u64_range("TEST_PORT_BAD", 8000, 1, 65535).value, 8000);
        let errors = parser.take_errors();
        assert_eq!(errors.len(), 2);
        assert!(matches!(errors[0], EnvError::OutOfRange { .. }));
        assert!(matches!(errors[1], EnvError::InvalidValue { .. }));
        cleanup_env(&["VMH_TEST_PORT", "VMH_TEST_PORT_OOR", "VMH_TEST_PORT_BAD"]);
    }

    #[test]
    fn test_get_f64_range() {
        let _guard = env_test_lock();
        set_env("VMH_TEST_PATIENCE", "2.5");
        let mut parser = EnvParser::new();
        let result = parser.get_f64_range("TEST_PATIENCE", 1.0, 1.0, 100.0);
        assert_eq!(result.value, 2.5);
        assert!(result.is_from_env());

        set_env("VMH_TEST_PATIENCE", "0.1");
        let mut parser = EnvParser::new();
        assert_eq!(parser.get_f64_range("TEST_PATIENCE", 1.0, 1.0, 100.0).value, 1.0);
        assert!(parser.has_errors());
        cleanup_env(&["VMH_TEST_PATIENCE"]);
    }

    #[test]
    fn test_get_duration() {
        let _guard = env_test_lock();
        set_env("VMH_TEST_DUR", "250ms");
        let mut parser = EnvParser::new();
        assert_eq!(
            parser.get_duration("TEST_DUR", Duration::from_secs(1)).value,
            Duration::from_millis(250)
        );

        set_env("VMH_TEST_DUR", "soon");
        let mut parser = EnvParser::new();
        let result = parser.get_duration("TEST_DUR", Duration::from_secs(1));
        assert_eq!(result.value, Duration::from_secs(1));
        assert!(matches!(parser.errors()[0], EnvError::InvalidDuration { .. }));
        cleanup_env(&["VMH_TEST_DUR"]);
    }

    #[test]
    fn test_get_path_expands_home() {
        let _guard = env_test_lock();
        set_env("VMH_TEST_PATH", "~/artifacts");
        let mut parser = EnvParser::new();
        let result = parser.get_path("TEST_PATH", "/tmp");
        if let Some(home) = dirs::home_dir() {
            assert_eq!(result.value, home.join("artifacts"));
        }
        assert!(result.is_from_env());
        cleanup_env(&["VMH_TEST_PATH"]);
    }

    #[test]
    fn test_get_optional_string() {
        let _guard = env_test_lock();
        cleanup_env(&["VMH_TEST_OPT"]);
        let mut parser = EnvParser::new();
        assert_eq!(parser.get_optional_string("TEST_OPT").value, None);

        set_env("VMH_TEST_OPT", "");
        let result = parser.get_optional_string("TEST_OPT");
        assert_eq!(result.value, None);
        assert!(result.is_from_env());

        set_env("VMH_TEST_OPT", "virbr0");
        assert_eq!(
            parser.get_optional_string("TEST_OPT").value.as_deref(),
            Some("virbr0")
        );
        cleanup_env(&["VMH_TEST_OPT"]);
    }

    #[test]
    fn test_source_tracking() {
        let _guard = env_test_lock();
        cleanup_env(&["VMH_TEST_SRC"]);
        let mut parser = EnvParser::new();
        let result = parser.get_string("TEST_SRC", "default");
        assert_eq!(result.source, ConfigSource::Default);
        assert!(result.env_var.is_none());

        set_env("VMH_TEST_SRC", "from_env");
        let result = parser.get_string("TEST_SRC", "default");
        assert_eq!(result.source, ConfigSource::Environment);
        assert_eq!(result.env_var.as_deref(), Some("VMH_TEST_SRC"));
        cleanup_env(&["VMH_TEST_SRC"]);
    }

    mod proptest_parsing {
        use super::super::parse_bool;
        use proptest::prelude::*;

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(300))]

            #[test]
            fn test_parse_bool_no_panic(s in ".*") {
                let _ = parse_bool(&s);
            }

            #[test]
            fn test_parse_bool_valid_only(s in "[a-zA-Z0-9_-]{0,20}") {
                let valid = ["1", "true", "yes", "on", "0", "false", "no", "off", ""];
                let is_valid = valid.iter().any(|v| s.eq_ignore_ascii_case(v));
                prop_assert_eq!(parse_bool(&s).is_some(), is_valid);
            }
        }
    }
}
