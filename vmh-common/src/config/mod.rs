//! Harness configuration.
//!
//! Values are layered: built-in defaults, then `~/.config/vmh/config.toml`
//! (or an explicit path), then `VMH_*` environment overrides. Every
//! effective value keeps track of which layer produced it.

pub mod env;
pub mod source;
pub mod validate;

pub use env::{EnvError, EnvParser};
pub use source::{ConfigSource, ConfigValueSource, Sourced};
pub use validate::{ConfigWarning, Severity, validate_config};

use crate::errors::HarnessError;
use crate::screen::UiMode;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const MIN_PATIENCE: f64 = 1.0;
pub const MAX_PATIENCE: f64 = 100.0;

/// Errors loading the configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found: {0}")]
    NotFound(PathBuf),

    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("invalid environment overrides: {}", .0.iter().map(ToString::to_string).collect::<Vec<_>>().join("; "))]
    Env(Vec<EnvError>),

    #[error("invalid configuration: {}", .0.iter().map(ToString::to_string).collect::<Vec<_>>().join("; "))]
    Invalid(Vec<ConfigWarning>),
}

impl ConfigError {
    pub fn code(&self) -> crate::errors::ErrorCode {
        use crate::errors::ErrorCode;
        match self {
            Self::NotFound(_) => ErrorCode::ConfigNotFound,
            Self::Read { .. } => ErrorCode::ConfigReadError,
            Self::Parse { .. } => ErrorCode::ConfigParseError,
            Self::Env(_) => ErrorCode::ConfigEnvError,
            Self::Invalid(_) => ErrorCode::ConfigValidationError,
        }
    }
}

impl From<ConfigError> for HarnessError {
    fn from(err: ConfigError) -> Self {
        HarnessError::Config(err.to_string())
    }
}

/// Durations in config files are written in humantime notation ("200ms").
mod duration_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&humantime::format_duration(*d).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(d)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

/// Settings for the host-side LAN web server helper.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LanServerConfig {
    /// Command line; `{address}` and `{port}` are substituted.
    pub command: Vec<String>,
    pub port: u16,
    /// Host address reachable from the guest. Defaults to the VM's bridge
    /// address as reported by the hypervisor.
    pub bind_address: Option<String>,
    #[serde(with = "duration_str")]
    pub startup_timeout: Duration,
    #[serde(with = "duration_str")]
    pub shutdown_timeout: Duration,
}

impl Default for LanServerConfig {
    fn default() -> Self {
        Self {
            command: vec![
                "python3".to_string(),
                "-m".to_string(),
                "http.server".to_string(),
                "{port}".to_string(),
                "--bind".to_string(),
                "{address}".to_string(),
            ],
            port: 8000,
            bind_address: None,
            startup_timeout: Duration::from_secs(10),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

/// Effective harness configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    /// Multiplier applied to screen and installer timeouts on slow hosts.
    pub patience: f64,
    #[serde(with = "duration_str")]
    pub poll_interval: Duration,
    #[serde(with = "duration_str")]
    pub min_poll_sleep: Duration,
    #[serde(with = "duration_str")]
    pub remote_shell_timeout: Duration,
    /// User for guest commands when a step names none.
    pub default_user: String,
    /// Unprivileged desktop user of the live session.
    pub live_user: String,
    pub ui_mode: UiMode,
    /// Network link to capture on; the VM's own link when unset.
    pub capture_link: Option<String>,
    /// Guest command that exits 0 once networking is usable.
    pub network_check_command: String,
    /// Where scenario reports are written; `~` and `$VAR` are expanded.
    pub artifacts_dir: String,
    pub lan_server: LanServerConfig,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            patience: 1.0,
            poll_interval: Duration::from_millis(200),
            min_poll_sleep: Duration::from_millis(10),
            remote_shell_timeout: Duration::from_secs(180),
            default_user: "root".to_string(),
            live_user: "user".to_string(),
            ui_mode: UiMode::Gui,
            capture_link: None,
            network_check_command: "ip route show default | grep -q default".to_string(),
            artifacts_dir: "~/.cache/vmh/artifacts".to_string(),
            lan_server: LanServerConfig::default(),
        }
    }
}

/// Configuration plus provenance of every value.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: HarnessConfig,
    /// File that was read, if any.
    pub path: Option<PathBuf>,
    pub sources: Vec<ConfigValueSource>,
}

impl HarnessConfig {
    /// `~/.config/vmh/config.toml` on Linux.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("vmh").join("config.toml"))
    }

    pub fn from_toml_str(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Scale a base timeout by the patience factor, clamped to 1..=100.
    pub fn scaled(&self, base: Duration) -> Duration {
        let patience = if self.patience.is_nan() {
            1.0
        } else {
            self.patience.clamp(MIN_PATIENCE, MAX_PATIENCE)
        };
        Duration::try_from_secs_f64(base.as_secs_f64() * patience).unwrap_or(Duration::MAX)
    }

    /// Artifacts directory with `~` and `$VAR` expanded.
    pub fn artifacts_path(&self) -> PathBuf {
        match shellexpand::full(&self.artifacts_dir) {
            Ok(expanded) => PathBuf::from(expanded.as_ref()),
            Err(_) => PathBuf::from(&self.artifacts_dir),
        }
    }

    /// Load defaults, file and environment, then reject any value
    /// [`validate_config`] reports as an error.
    ///
    /// An explicit `path` must exist; the default path is optional.
    pub fn load(path: Option<&Path>) -> Result<LoadedConfig, ConfigError> {
        let loaded = Self::load_unchecked(path)?;
        let errors: Vec<ConfigWarning> = validate_config(&loaded.config)
            .into_iter()
            .filter(|w| w.severity == Severity::Error)
            .collect();
        if !errors.is_empty() {
            return Err(ConfigError::Invalid(errors));
        }
        Ok(loaded)
    }

    /// Like [`HarnessConfig::load`], without validation. For tools that
    /// report problems instead of running with them.
    pub fn load_unchecked(path: Option<&Path>) -> Result<LoadedConfig, ConfigError> {
        let (file, file_keys) = match path {
            Some(p) => {
                if !p.exists() {
                    return Err(ConfigError::NotFound(p.to_path_buf()));
                }
                let (cfg, keys) = Self::read_file(p)?;
                (Some((p.to_path_buf(), cfg)), keys)
            }
            None => match Self::default_path().filter(|p| p.exists()) {
                Some(p) => {
                    let (cfg, keys) = Self::read_file(&p)?;
                    (Some((p, cfg)), keys)
                }
                None => (None, BTreeSet::new()),
            },
        };

        let (path, base) = match file {
            Some((p, cfg)) => (Some(p), cfg),
            None => (None, HarnessConfig::default()),
        };

        let mut parser = EnvParser::new();
        let (config, sources) = base.with_env_overrides(&mut parser, &file_keys);
        if parser.has_errors() {
            return Err(ConfigError::Env(parser.take_errors()));
        }
        tracing::debug!(path = ?path, overrides = sources.iter().filter(|s| s.source == ConfigSource::Environment).count(), "configuration loaded");
        Ok(LoadedConfig {
            config,
            path,
            sources,
        })
    }

    fn read_file(path: &Path) -> Result<(Self, BTreeSet<String>), ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let parse_err = |source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        };
        let table: toml::Table = toml::from_str(&text).map_err(parse_err)?;
        let config = Self::from_toml_str(&text).map_err(parse_err)?;
        Ok((config, table.keys().cloned().collect()))
    }

    /// Apply `VMH_*` overrides on top of `self`.
    pub fn with_env_overrides(
        mut self,
        parser: &mut EnvParser,
        file_keys: &BTreeSet<String>,
    ) -> (Self, Vec<ConfigValueSource>) {
        let mut rows = Vec::new();
        let mut track = |key: &str, value: String, source: ConfigSource, env_var: Option<String>| {
            let source = match source {
                ConfigSource::Default if file_keys.contains(key) => ConfigSource::File,
                other => other,
            };
            rows.push(ConfigValueSource {
                key: key.to_string(),
                value,
                source,
                env_var,
            });
        };

        let patience = parser.get_f64_range("PATIENCE", self.patience, MIN_PATIENCE, MAX_PATIENCE);
        self.patience = patience.value;
        track("patience", patience.value.to_string(), patience.source, patience.env_var);

        let interval = parser.get_duration("POLL_INTERVAL", self.poll_interval);
        self.poll_interval = interval.value;
        track(
            "poll_interval",
            humantime::format_duration(interval.value).to_string(),
            interval.source,
            interval.env_var,
        );

        let min_sleep = parser.get_duration("MIN_POLL_SLEEP", self.min_poll_sleep);
        self.min_poll_sleep = min_sleep.value;
        track(
            "min_poll_sleep",
            humantime::format_duration(min_sleep.value).to_string(),
            min_sleep.source,
            min_sleep.env_var,
        );

        let shell = parser.get_duration("REMOTE_SHELL_TIMEOUT", self.remote_shell_timeout);
        self.remote_shell_timeout = shell.value;
        track(
            "remote_shell_timeout",
            humantime::format_duration(shell.value).to_string(),
            shell.source,
            shell.env_var,
        );

        let user = parser.get_string("DEFAULT_USER", &self.default_user);
        self.default_user = user.value.clone();
        track("default_user", user.value, user.source, user.env_var);

        let live = parser.get_string("LIVE_USER", &self.live_user);
        self.live_user = live.value.clone();
        track("live_user", live.value, live.source, live.env_var);

        let mode = parser.get_string("UI_MODE", self.ui_mode.as_str());
        match mode.value.parse::<UiMode>() {
            Ok(parsed) => self.ui_mode = parsed,
            Err(_) => {
                if let Some(var) = mode.env_var.clone() {
                    parser_error(parser, var, "gui or text", &mode.value);
                }
            }
        }
        track("ui_mode", self.ui_mode.to_string(), mode.source, mode.env_var);

        let link = parser.get_optional_string("CAPTURE_LINK");
        if link.is_from_env() {
            self.capture_link = link.value;
        }
        track(
            "capture_link",
            self.capture_link.clone().unwrap_or_default(),
            link.source,
            link.env_var,
        );

        let check = parser.get_string("NETWORK_CHECK_COMMAND", &self.network_check_command);
        self.network_check_command = check.value.clone();
        track("network_check_command", check.value, check.source, check.env_var);

        let artifacts = parser.get_string("ARTIFACTS_DIR", &self.artifacts_dir);
        self.artifacts_dir = artifacts.value.clone();
        track("artifacts_dir", artifacts.value, artifacts.source, artifacts.env_var);

        let port = parser.get_u64_range("LAN_PORT", u64::from(self.lan_server.port), 1, 65535);
        self.lan_server.port = u16::try_from(port.value).unwrap_or(self.lan_server.port);
        let lan_source = if port.source == ConfigSource::Default && file_keys.contains("lan_server") {
            ConfigSource::File
        } else {
            port.source
        };
        track("lan_server.port", port.value.to_string(), lan_source, port.env_var);

        (self, rows)
    }
}

fn parser_error(parser: &mut EnvParser, var: String, expected: &str, value: &str) {
    parser.push_error(EnvError::InvalidValue {
        var,
        expected: expected.to_string(),
        value: value.to_string(),
    });
}

#[cfg(test)]
pub(crate) fn env_test_lock() -> std::sync::MutexGuard<'static, ()> {
    use std::sync::{Mutex, OnceLock};

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    ENV_LOCK
        .get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}
