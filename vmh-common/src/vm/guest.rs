//! Guest command results and quoting.

use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use std::time::Duration;

/// Outcome of one command run inside the guest.
///
/// A non-zero exit is an ordinary result here; only
/// [`Vm::execute_successfully`](super::Vm::execute_successfully) turns it
/// into an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteCommandResult {
    pub command: String,
    pub user: String,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    #[serde(default)]
    pub duration: Duration,
}

impl RemoteCommandResult {
    pub fn new(command: impl Into<String>, user: impl Into<String>, exit_code: i32, stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            user: user.into(),
            exit_code,
            stdout: stdout.into(),
            stderr: stderr.into(),
            duration: Duration::ZERO,
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn failure(&self) -> bool {
        !self.success()
    }

    pub fn stdout_contains(&self, pattern: &str) -> bool {
        self.stdout.contains(pattern)
    }

    /// Stdout without the trailing newline.
    pub fn stdout_trimmed(&self) -> &str {
        self.stdout.trim_end_matches(['\n', '\r'])
    }

    pub fn combined_output(&self) -> String {
        format!("{}\n{}", self.stdout, self.stderr)
    }
}

impl fmt::Display for RemoteCommandResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Return status: {}", self.exit_code)?;
        writeln!(f, "STDOUT:\n{}", self.stdout)?;
        write!(f, "STDERR:\n{}", self.stderr)
    }
}

/// Quote one argument for the guest's POSIX shell.
pub fn quote(arg: &str) -> Cow<'_, str> {
    shell_escape::unix::escape(Cow::Borrowed(arg))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_and_trim() {
        let ok = RemoteCommandResult::new("echo hi", "root", 0, "hi\n", "");
        assert!(ok.success());
        assert_eq!(ok.stdout_trimmed(), "hi");
        let bad = RemoteCommandResult::new("false", "root", 1, "", "nope");
        assert!(bad.failure());
        assert!(bad.to_string().contains("Return status: 1"));
    }

    #[test]
    fn test_quote_neutralizes_shell_syntax() {
        assert_eq!(quote("plain"), "plain");
        assert_eq!(quote("it's; rm -rf /"), r#"'it'\''s; rm -rf /'"#);
        assert_eq!(quote("/home/user/Tor Browser"), "'/home/user/Tor Browser'");
    }
}
