//! Subcommand implementations.

mod config;
mod helpers;
mod plan;
mod steps;
mod traffic;

pub use config::{show_config, validate_config};
pub use plan::check_plans;
pub use steps::list_steps;
pub use traffic::check_traffic;
