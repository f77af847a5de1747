//! Test support shared by unit and integration tests.

mod log;

pub use log::{find_target_dir, init_global_test_logging};
