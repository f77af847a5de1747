use std::fs;
use std::path::PathBuf;
use std::process::{Command, Output};
use tempfile::TempDir;

/// Scratch directory for plans, flow dumps and config files.
pub struct TestWorkspace {
    pub dir: TempDir,
}

impl TestWorkspace {
    pub fn new() -> Self {
        crate::test_log!("FIXTURE: creating test workspace");
        Self {
            dir: TempDir::new().expect("Failed to create temp dir"),
        }
    }

    pub fn write(&self, name: &str, content: &str) -> PathBuf {
        let path = self.dir.path().join(name);
        fs::write(&path, content).expect("Failed to write fixture file");
        path
    }
}

/// Run the `vmh` binary with an isolated configuration environment.
pub fn vmh(args: &[&str]) -> Output {
    let mut command = Command::new(env!("CARGO_BIN_EXE_vmh"));
    command.args(args).env("RUST_LOG", "warn");
    for (key, _) in std::env::vars() {
        if key.starts_with("VMH_") {
            command.env_remove(key);
        }
    }
    command.output().expect("Failed to run vmh")
}
