use tracing_subscriber::{EnvFilter, fmt};

/// Compact logs in the captured test output; `RUST_LOG` adds directives.
pub fn init_test_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"))
        .add_directive("vmh=debug".parse().unwrap())
        .add_directive("vmh_common=debug".parse().unwrap());
    let _ = fmt().with_test_writer().with_env_filter(filter).compact().try_init();
}

/// Log a test milestone under the `vmh_test` target.
#[macro_export]
macro_rules! test_log {
    ($($arg:tt)*) => {
        tracing::info!(target: "vmh_test", $($arg)*);
    };
}
