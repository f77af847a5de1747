//! Error Catalog for VMH
//!
//! Every failure the harness can report maps to a stable code with a
//! message template and remediation steps. The operator cannot inspect the
//! guest directly, so the catalog entry plus the failure message is the
//! whole diagnostic surface.
//!
//! # Error Code Ranges
//!
//! | Range      | Category    | Description                               |
//! |------------|-------------|-------------------------------------------|
//! | E001-E099  | Config      | Configuration and environment errors      |
//! | E100-E199  | Timing      | Bounded waits and exhausted retries       |
//! | E200-E299  | Screen      | Visual landmarks and input dispatch       |
//! | E300-E399  | Vm          | VM state machine, guest commands, storage |
//! | E400-E499  | Traffic     | Packet capture and connection policy      |
//! | E500-E599  | Scenario    | Steps, cleanup, helpers, internal errors  |
//!
//! # Example
//!
//! ```rust
//! use vmh_common::errors::catalog::ErrorCode;
//!
//! let entry = ErrorCode::LandmarkNotFound.entry();
//! println!("{}", entry.format_full());
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

/// Error code enumeration covering all VMH failure classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[non_exhaustive]
pub enum ErrorCode {
    // =========================================================================
    // Config Errors (E001-E099)
    // =========================================================================
    /// Configuration file not found
    ConfigNotFound,
    /// Configuration file could not be read
    ConfigReadError,
    /// Configuration file contains invalid TOML syntax
    ConfigParseError,
    /// Configuration contains invalid values
    ConfigValidationError,
    /// Environment variable has invalid value
    ConfigEnvError,

    // =========================================================================
    // Timing Errors (E100-E199)
    // =========================================================================
    /// A bounded wait exceeded its deadline
    WaitTimeout,

    // =========================================================================
    // Screen Errors (E200-E299)
    // =========================================================================
    /// Landmark did not appear in time
    LandmarkNotFound,
    /// Landmark did not vanish in time
    LandmarkStillPresent,

    // =========================================================================
    // VM Errors (E300-E399)
    // =========================================================================
    /// VM state machine violation
    VmInvalidState,
    /// Guest command exited non-zero where success was required
    GuestCommandFailed,
    /// Hypervisor backend reported a failure
    HypervisorFailed,

    // =========================================================================
    // Traffic Errors (E400-E499)
    // =========================================================================
    /// A connection was made to an endpoint outside the allow-list
    TrafficPolicyViolation,
    /// Packet capture backend failed
    CaptureFailed,

    // =========================================================================
    // Scenario Errors (E500-E599)
    // =========================================================================
    /// Step usage error (unknown verb, bad arguments, authoring mistake)
    StepUsage,
    /// One or more cleanup hooks failed
    CleanupFailed,
    /// Auxiliary host process failed to start or stay healthy
    ProcessFailed,
    /// Host I/O error
    InternalIo,
}

impl ErrorCode {
    /// Returns all error codes, in catalog order.
    #[must_use]
    pub const fn all() -> &'static [ErrorCode] {
        &[
            Self::ConfigNotFound,
            Self::ConfigReadError,
            Self::ConfigParseError,
            Self::ConfigValidationError,
            Self::ConfigEnvError,
            Self::WaitTimeout,
            Self::LandmarkNotFound,
            Self::LandmarkStillPresent,
            Self::VmInvalidState,
            Self::GuestCommandFailed,
            Self::HypervisorFailed,
            Self::TrafficPolicyViolation,
            Self::CaptureFailed,
            Self::StepUsage,
            Self::CleanupFailed,
            Self::ProcessFailed,
            Self::InternalIo,
        ]
    }

    /// Returns the numeric part of the code.
    #[must_use]
    pub const fn code_number(&self) -> u16 {
        match self {
            Self::ConfigNotFound => 1,
            Self::ConfigReadError => 2,
            Self::ConfigParseError => 3,
            Self::ConfigValidationError => 4,
            Self::ConfigEnvError => 5,

            Self::WaitTimeout => 100,

            Self::LandmarkNotFound => 200,
            Self::LandmarkStillPresent => 201,

            Self::VmInvalidState => 300,
            Self::GuestCommandFailed => 301,
            Self::HypervisorFailed => 302,

            Self::TrafficPolicyViolation => 400,
            Self::CaptureFailed => 401,

            Self::StepUsage => 500,
            Self::CleanupFailed => 501,
            Self::ProcessFailed => 502,
            Self::InternalIo => 503,
        }
    }

    /// Returns the code in `VMH-Exxx` form.
    #[must_use]
    pub fn code_string(&self) -> String {
        format!("VMH-E{:03}", self.code_number())
    }

    /// Returns the error category.
    #[must_use]
    pub const fn category(&self) -> ErrorCategory {
        match self.code_number() {
            1..=99 => ErrorCategory::Config,
            100..=199 => ErrorCategory::Timing,
            200..=299 => ErrorCategory::Screen,
            300..=399 => ErrorCategory::Vm,
            400..=499 => ErrorCategory::Traffic,
            _ => ErrorCategory::Scenario,
        }
    }

    /// Returns the error message template.
    #[must_use]
    pub const fn message(&self) -> &'static str {
        match self {
            Self::ConfigNotFound => "Configuration file not found",
            Self::ConfigReadError => "Failed to read configuration file",
            Self::ConfigParseError => "Configuration file contains invalid TOML syntax",
            Self::ConfigValidationError => "Configuration contains invalid values",
            Self::ConfigEnvError => "Environment variable has invalid value",

            Self::WaitTimeout => "Condition did not become true before the deadline",

            Self::LandmarkNotFound => "Expected screen landmark never appeared",
            Self::LandmarkStillPresent => "Screen landmark did not vanish",

            Self::VmInvalidState => "Operation is not valid in the VM's current power state",
            Self::GuestCommandFailed => "Guest command exited with a non-zero status",
            Self::HypervisorFailed => "Hypervisor backend reported a failure",

            Self::TrafficPolicyViolation => "Guest connected to an endpoint outside the allow-list",
            Self::CaptureFailed => "Packet capture backend reported a failure",

            Self::StepUsage => "Step was invoked incorrectly",
            Self::CleanupFailed => "One or more cleanup hooks failed",
            Self::ProcessFailed => "Auxiliary host process failed",
            Self::InternalIo => "Host I/O error",
        }
    }

    /// Returns remediation steps for the error.
    #[must_use]
    pub const fn remediation(&self) -> &'static [&'static str] {
        match self {
            Self::ConfigNotFound => &[
                "Create ~/.config/vmh/config.toml or pass --config",
                "Run `vmh config show` to see the effective defaults",
            ],
            Self::ConfigReadError => &["Check file permissions on the configuration file"],
            Self::ConfigParseError => &[
                "Validate the TOML syntax of the configuration file",
                "Check for unquoted strings and misplaced tables",
            ],
            Self::ConfigValidationError => &[
                "Run `vmh config show` to inspect the effective values",
                "Keep patience >= 1.0 and poll intervals sub-second",
            ],
            Self::ConfigEnvError => &["Check VMH_* environment variables for typos or bad values"],

            Self::WaitTimeout => &[
                "Inspect the guest state at failure time (screenshot, journal)",
                "Increase VMH_PATIENCE on slow hosts",
            ],

            Self::LandmarkNotFound => &[
                "Compare the current framebuffer with the landmark image",
                "Re-capture the landmark if the guest's theme or resolution changed",
                "Increase VMH_PATIENCE on slow hosts",
            ],
            Self::LandmarkStillPresent => &[
                "Check whether the preceding input reached the guest",
                "Look for a modal dialog blocking the expected transition",
            ],

            Self::VmInvalidState => &[
                "Fix the scenario: power the VM off before reconfiguring boot or clock",
                "Do not start a VM that is already running",
            ],
            Self::GuestCommandFailed => &[
                "Read the attached stdout/stderr",
                "Re-run the command manually in the guest console",
            ],
            Self::HypervisorFailed => &[
                "Check that the hypervisor service is running and reachable",
                "Inspect the hypervisor log for the domain",
            ],

            Self::TrafficPolicyViolation => &[
                "Inspect the capture for the offending endpoint",
                "Update the allow-list only if the connection is expected",
            ],
            Self::CaptureFailed => &[
                "Check capture permissions on the network link",
                "Verify the VM's network link name",
            ],

            Self::StepUsage => &[
                "Run `vmh steps` to list verbs and parameters",
                "Run `vmh plan check` against the scenario plan",
            ],
            Self::CleanupFailed => &[
                "Remove leftover volumes and processes manually",
                "Check the scenario report for the failing hook",
            ],
            Self::ProcessFailed => &[
                "Run the helper command manually to see its output",
                "Check that the bind address and port are free",
            ],
            Self::InternalIo => &["Check disk space and permissions of the artifacts directory"],
        }
    }

    /// Returns the documentation URL for the error, if any.
    #[must_use]
    pub const fn doc_url(&self) -> Option<&'static str> {
        match self.category() {
            ErrorCategory::Config => Some("https://github.com/vmh-project/vmh/blob/main/docs/config.md"),
            ErrorCategory::Traffic => Some("https://github.com/vmh-project/vmh/blob/main/docs/traffic.md"),
            _ => None,
        }
    }

    /// Builds a full catalog entry for the code.
    #[must_use]
    pub fn entry(&self) -> ErrorEntry {
        ErrorEntry {
            code: self.code_string(),
            category: self.category(),
            message: self.message().to_string(),
            remediation: self
                .remediation()
                .iter()
                .map(|s| (*s).to_string())
                .collect(),
            doc_url: self.doc_url().map(String::from),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code_string())
    }
}

/// Error categories matching the code ranges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Configuration and environment errors (E001-E099)
    Config,
    /// Bounded waits (E100-E199)
    Timing,
    /// Visual landmarks (E200-E299)
    Screen,
    /// VM control and guest commands (E300-E399)
    Vm,
    /// Capture and connection policy (E400-E499)
    Traffic,
    /// Steps, cleanup and internal errors (E500-E599)
    Scenario,
}

impl ErrorCategory {
    /// Returns a human-readable name for the category.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Config => "Configuration",
            Self::Timing => "Timing",
            Self::Screen => "Screen",
            Self::Vm => "Virtual machine",
            Self::Traffic => "Traffic",
            Self::Scenario => "Scenario",
        }
    }
}

/// A resolved catalog entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEntry {
    /// Error code string (e.g., "VMH-E200")
    pub code: String,
    /// Error category
    pub category: ErrorCategory,
    /// Human-readable error message
    pub message: String,
    /// Steps to remediate the error
    pub remediation: Vec<String>,
    /// Documentation URL, if available
    pub doc_url: Option<String>,
}

impl ErrorEntry {
    /// Formats the error for display with full remediation steps.
    #[must_use]
    pub fn format_full(&self) -> String {
        let mut output = format!("[{}] {}\n\n", self.code, self.message);

        if !self.remediation.is_empty() {
            output.push_str("Remediation steps:\n");
            for (i, step) in self.remediation.iter().enumerate() {
                output.push_str(&format!("  {}. {}\n", i + 1, step));
            }
        }

        if let Some(url) = &self.doc_url {
            output.push_str(&format!("\nFor more information: {}\n", url));
        }

        output
    }

    /// Formats the error as a single line.
    #[must_use]
    pub fn format_brief(&self) -> String {
        format!("[{}] {}", self.code, self.message)
    }
}

impl fmt::Display for ErrorEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.format_brief())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_numbers_are_unique() {
        let mut seen = std::collections::HashSet::new();
        for code in ErrorCode::all() {
            let num = code.code_number();
            assert!(
                seen.insert(num),
                "Duplicate error code number: {} for {:?}",
                num,
                code
            );
        }
    }

    #[test]
    fn test_error_code_format() {
        assert_eq!(ErrorCode::ConfigNotFound.code_string(), "VMH-E001");
        assert_eq!(ErrorCode::WaitTimeout.code_string(), "VMH-E100");
        assert_eq!(ErrorCode::LandmarkNotFound.code_string(), "VMH-E200");
        assert_eq!(ErrorCode::VmInvalidState.code_string(), "VMH-E300");
        assert_eq!(ErrorCode::TrafficPolicyViolation.code_string(), "VMH-E400");
        assert_eq!(ErrorCode::StepUsage.code_string(), "VMH-E500");
    }

    #[test]
    fn test_error_categories() {
        assert_eq!(ErrorCode::ConfigEnvError.category(), ErrorCategory::Config);
        assert_eq!(ErrorCode::WaitTimeout.category(), ErrorCategory::Timing);
        assert_eq!(
            ErrorCode::LandmarkStillPresent.category(),
            ErrorCategory::Screen
        );
        assert_eq!(ErrorCode::HypervisorFailed.category(), ErrorCategory::Vm);
        assert_eq!(ErrorCode::CaptureFailed.category(), ErrorCategory::Traffic);
        assert_eq!(ErrorCode::CleanupFailed.category(), ErrorCategory::Scenario);
    }

    #[test]
    fn test_every_code_has_remediation() {
        for code in ErrorCode::all() {
            assert!(
                !code.remediation().is_empty(),
                "{:?} has no remediation steps",
                code
            );
        }
    }

    #[test]
    fn test_entry_formatting() {
        let entry = ErrorCode::TrafficPolicyViolation.entry();
        assert_eq!(entry.format_brief(), format!("[VMH-E400] {}", entry.message));
        let full = entry.format_full();
        assert!(full.contains("Remediation steps:"));
        assert!(full.contains("For more information"));
    }
}
