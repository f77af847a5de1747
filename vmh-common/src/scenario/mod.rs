//! Scenario execution: context, cleanup, step registry and step library.

pub mod cleanup;
pub mod context;
pub mod registry;
pub mod runner;
pub mod steps;

pub use cleanup::{CleanupRecord, CleanupStack};
pub use context::{Backends, ScenarioContext};
pub use registry::{Param, ParamKind, PlanIssue, StepArg, StepArgs, StepCall, StepDefinition, StepRegistry};
pub use runner::{Scenario, ScenarioReport, ScenarioRunner, StepRecord, StepStatus};
pub use steps::builtin_steps;
