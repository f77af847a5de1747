//! VM control facade.
//!
//! [`Vm`] wraps one hypervisor domain and enforces its power-state machine:
//!
//! ```text
//! Undefined -> Defined -> Running <-> Stopped -> Destroyed
//! ```
//!
//! Everything the harness knows about the guest's insides comes from
//! commands run over the remote shell ([`Vm::execute`]). Invariant
//! violations fail fast; transient guest-communication failures are
//! surfaced to the caller unchanged.

pub mod guest;
pub mod storage;

pub use guest::{RemoteCommandResult, quote};
pub use storage::{SizeUnit, StoragePool, Volume, VolumeFormat, convert_to_bytes};

use crate::config::HarnessConfig;
use crate::errors::{HarnessError, HarnessResult};
use crate::poll::Poller;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmState {
    Undefined,
    Defined,
    Running,
    Stopped,
    Destroyed,
}

impl fmt::Display for VmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Undefined => "undefined",
            Self::Defined => "defined",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Destroyed => "destroyed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkState {
    Plugged,
    Unplugged,
}

/// Bus a drive is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiskBus {
    Ide,
    Sata,
    Usb,
    Virtio,
}

impl FromStr for DiskBus {
    type Err = HarnessError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ide" => Ok(Self::Ide),
            "sata" => Ok(Self::Sata),
            "usb" => Ok(Self::Usb),
            "virtio" | "pci" => Ok(Self::Virtio),
            other => Err(HarnessError::usage(format!("unsupported disk bus '{other}'"))),
        }
    }
}

impl fmt::Display for DiskBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Ide => "ide",
            Self::Sata => "sata",
            Self::Usb => "usb",
            Self::Virtio => "virtio",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BootSource {
    Cdrom(PathBuf),
    Disk { volume: String, bus: DiskBus },
}

/// A drive currently attached to the VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PluggedDrive {
    pub volume: String,
    pub bus: DiskBus,
}

/// Hypervisor operations for one host. Implementations live outside the
/// harness; [`crate::mock::MockHypervisor`] is the in-memory one.
pub trait HypervisorBackend: Send + Sync {
    fn define(&self, domain: &str) -> HarnessResult<()>;
    fn undefine(&self, domain: &str) -> HarnessResult<()>;
    fn start(&self, domain: &str) -> HarnessResult<()>;
    /// Hard power-off, no guest cooperation.
    fn power_off(&self, domain: &str) -> HarnessResult<()>;
    fn is_running(&self, domain: &str) -> HarnessResult<bool>;

    fn set_boot_source(&self, domain: &str, source: &BootSource) -> HarnessResult<()>;
    /// Remove the medium the domain booted from while it runs: eject the
    /// CD-ROM, or detach the boot disk.
    fn eject_boot_medium(&self, domain: &str, source: &BootSource) -> HarnessResult<()>;
    fn set_hardware_clock(&self, domain: &str, time: DateTime<Utc>) -> HarnessResult<()>;

    fn set_link_state(&self, domain: &str, state: LinkState) -> HarnessResult<()>;
    /// Host-side name of the VM's network link, for packet capture.
    fn network_link(&self, domain: &str) -> HarnessResult<String>;
    /// Host address on the VM's network (the bridge).
    fn bridge_address(&self, domain: &str) -> HarnessResult<String>;

    fn attach_disk(&self, domain: &str, volume: &str, bus: DiskBus) -> HarnessResult<()>;
    fn detach_disk(&self, domain: &str, volume: &str) -> HarnessResult<()>;
    /// Guest block device of an attached volume, e.g. `/dev/sdb`.
    fn disk_dev(&self, domain: &str, volume: &str) -> HarnessResult<Option<String>>;

    /// Run `command` through the guest's shell as `user` and wait for it.
    fn guest_exec(&self, domain: &str, command: &str, user: &str) -> HarnessResult<RemoteCommandResult>;
    /// Start `command` in the guest without waiting for it.
    fn guest_spawn(&self, domain: &str, command: &str, user: &str) -> HarnessResult<()>;

    fn create_volume(&self, volume: &Volume) -> HarnessResult<()>;
    fn delete_volume(&self, name: &str) -> HarnessResult<()>;
    fn list_volumes(&self) -> HarnessResult<Vec<Volume>>;
}

/// Options fixed when a [`Vm`] is defined.
#[derive(Debug, Clone)]
pub struct VmOptions {
    pub poller: Poller,
    pub default_user: String,
    pub network_check_command: String,
}

impl Default for VmOptions {
    fn default() -> Self {
        Self::from_config(&HarnessConfig::default())
    }
}

impl VmOptions {
    pub fn from_config(config: &HarnessConfig) -> Self {
        Self {
            poller: Poller::from_config(config),
            default_user: config.default_user.clone(),
            network_check_command: config.network_check_command.clone(),
        }
    }
}

/// One test target.
pub struct Vm {
    domain: String,
    backend: Arc<dyn HypervisorBackend>,
    storage: StoragePool,
    options: VmOptions,
    state: VmState,
    link: LinkState,
    boot: Option<BootSource>,
    drives: Vec<PluggedDrive>,
    hardware_clock: Option<DateTime<Utc>>,
}

impl fmt::Debug for Vm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Vm")
            .field("domain", &self.domain)
            .field("state", &self.state)
            .field("link", &self.link)
            .field("boot", &self.boot)
            .field("drives", &self.drives)
            .finish_non_exhaustive()
    }
}

impl Vm {
    /// Define a new domain named `domain`.
    pub fn define(domain: &str, backend: Arc<dyn HypervisorBackend>, options: VmOptions) -> HarnessResult<Self> {
        backend.define(domain)?;
        info!(domain, "VM defined");
        Ok(Self {
            domain: domain.to_string(),
            storage: StoragePool::new(backend.clone()),
            backend,
            options,
            state: VmState::Defined,
            link: LinkState::Plugged,
            boot: None,
            drives: Vec::new(),
            hardware_clock: None,
        })
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Last known state; see [`Vm::is_running`] for a refreshed answer.
    pub fn state(&self) -> VmState {
        self.state
    }

    pub fn link_state(&self) -> LinkState {
        self.link
    }

    pub fn boot_source(&self) -> Option<&BootSource> {
        self.boot.as_ref()
    }

    pub fn plugged_drives(&self) -> &[PluggedDrive] {
        &self.drives
    }

    pub fn hardware_clock(&self) -> Option<DateTime<Utc>> {
        self.hardware_clock
    }

    pub fn storage(&self) -> &StoragePool {
        &self.storage
    }

    pub fn default_user(&self) -> &str {
        &self.options.default_user
    }

    fn require_alive(&self, operation: &str) -> HarnessResult<()> {
        match self.state {
            VmState::Undefined | VmState::Destroyed => Err(HarnessError::invalid_state(operation, self.state)),
            _ => Ok(()),
        }
    }

    fn require_not_running(&mut self, operation: &str) -> HarnessResult<()> {
        self.require_alive(operation)?;
        if self.is_running()? {
            return Err(HarnessError::invalid_state(operation, self.state));
        }
        Ok(())
    }

    fn require_running(&self, operation: &str) -> HarnessResult<()> {
        if self.state != VmState::Running {
            return Err(HarnessError::invalid_state(operation, self.state));
        }
        Ok(())
    }

    /// Power on. Starting a running VM is an [`HarnessError::InvalidState`].
    pub fn start(&mut self) -> HarnessResult<()> {
        self.require_not_running("start")?;
        self.backend.start(&self.domain)?;
        self.state = VmState::Running;
        info!(domain = %self.domain, boot = ?self.boot, "VM started");
        Ok(())
    }

    pub fn power_off(&mut self) -> HarnessResult<()> {
        self.require_alive("power off")?;
        if !self.is_running()? {
            return Err(HarnessError::invalid_state("power off", self.state));
        }
        self.backend.power_off(&self.domain)?;
        self.state = VmState::Stopped;
        info!(domain = %self.domain, "VM powered off");
        Ok(())
    }

    /// Tear the domain down. Safe to call any number of times.
    pub fn destroy_and_undefine(&mut self) -> HarnessResult<()> {
        if matches!(self.state, VmState::Destroyed | VmState::Undefined) {
            debug!(domain = %self.domain, state = %self.state, "nothing to destroy");
            return Ok(());
        }
        if self.backend.is_running(&self.domain)? {
            self.backend.power_off(&self.domain)?;
        }
        self.backend.undefine(&self.domain)?;
        self.state = VmState::Destroyed;
        self.drives.clear();
        info!(domain = %self.domain, "VM destroyed and undefined");
        Ok(())
    }

    /// Ask the hypervisor; the guest may have powered itself off.
    pub fn is_running(&mut self) -> HarnessResult<bool> {
        if matches!(self.state, VmState::Destroyed | VmState::Undefined) {
            return Ok(false);
        }
        let running = self.backend.is_running(&self.domain)?;
        match (self.state, running) {
            (VmState::Running, false) => {
                info!(domain = %self.domain, "guest powered off on its own");
                self.state = VmState::Stopped;
            }
            (VmState::Defined | VmState::Stopped, true) => self.state = VmState::Running,
            _ => {}
        }
        Ok(running)
    }

    pub fn wait_until_remote_shell_is_up(&self, timeout: Duration) -> HarnessResult<Duration> {
        self.require_running("wait for the remote shell")?;
        let elapsed = self.options.poller.wait_until_ok(timeout, "remote shell to respond", || {
            Ok(self
                .backend
                .guest_exec(&self.domain, "true", &self.options.default_user)?
                .success())
        })?;
        info!(domain = %self.domain, elapsed_ms = elapsed.as_millis() as u64, "remote shell is up");
        Ok(elapsed)
    }

    /// Run `command` as the default user. Non-zero exit is not an error.
    pub fn execute(&self, command: &str) -> HarnessResult<RemoteCommandResult> {
        self.execute_as(command, &self.options.default_user)
    }

    pub fn execute_as(&self, command: &str, user: &str) -> HarnessResult<RemoteCommandResult> {
        self.require_running("execute a command")?;
        let result = self.backend.guest_exec(&self.domain, command, user)?;
        debug!(command, user, exit_code = result.exit_code, "guest command finished");
        Ok(result)
    }

    /// Run `command`; a non-zero exit becomes [`HarnessError::CommandFailed`].
    pub fn execute_successfully(&self, command: &str) -> HarnessResult<RemoteCommandResult> {
        self.execute_successfully_as(command, &self.options.default_user)
    }

    pub fn execute_successfully_as(&self, command: &str, user: &str) -> HarnessResult<RemoteCommandResult> {
        let result = self.execute_as(command, user)?;
        if result.failure() {
            return Err(HarnessError::CommandFailed {
                command: command.to_string(),
                exit_code: result.exit_code,
                stdout: result.stdout,
                stderr: result.stderr,
            });
        }
        Ok(result)
    }

    /// Start `command` in the guest and return immediately.
    pub fn spawn(&self, command: &str, user: &str) -> HarnessResult<()> {
        self.require_running("spawn a command")?;
        self.backend.guest_spawn(&self.domain, command, user)?;
        debug!(command, user, "guest command spawned");
        Ok(())
    }

    pub fn has_process(&self, name: &str) -> HarnessResult<bool> {
        Ok(self.execute(&format!("pidof -x {}", quote(name)))?.success())
    }

    pub fn file_exist(&self, path: &str) -> HarnessResult<bool> {
        Ok(self.execute(&format!("test -e {}", quote(path)))?.success())
    }

    pub fn directory_exist(&self, path: &str) -> HarnessResult<bool> {
        Ok(self.execute(&format!("test -d {}", quote(path)))?.success())
    }

    pub fn file_content(&self, path: &str) -> HarnessResult<String> {
        Ok(self.execute_successfully(&format!("cat {}", quote(path)))?.stdout)
    }

    pub fn file_overwrite(&self, path: &str, content: &str) -> HarnessResult<()> {
        self.execute_successfully(&format!("printf '%s' {} > {}", quote(content), quote(path)))?;
        Ok(())
    }

    pub fn plug_network(&mut self) -> HarnessResult<()> {
        self.set_link(LinkState::Plugged)
    }

    pub fn unplug_network(&mut self) -> HarnessResult<()> {
        self.set_link(LinkState::Unplugged)
    }

    fn set_link(&mut self, state: LinkState) -> HarnessResult<()> {
        self.require_alive("change the network link")?;
        self.backend.set_link_state(&self.domain, state)?;
        self.link = state;
        info!(domain = %self.domain, link = ?state, "network link changed");
        Ok(())
    }

    /// Whether the guest's network check command succeeds right now.
    pub fn has_network(&self) -> HarnessResult<bool> {
        if self.link == LinkState::Unplugged {
            return Ok(false);
        }
        Ok(self.execute(&self.options.network_check_command)?.success())
    }

    pub fn network_link(&self) -> HarnessResult<String> {
        self.backend.network_link(&self.domain)
    }

    pub fn bridge_address(&self) -> HarnessResult<String> {
        self.backend.bridge_address(&self.domain)
    }

    pub fn plug_drive(&mut self, volume: &str, bus: DiskBus) -> HarnessResult<()> {
        self.require_alive("plug a drive")?;
        if !self.storage.volume_exists(volume)? {
            return Err(HarnessError::usage(format!("cannot plug '{volume}': no such volume")));
        }
        if self.drives.iter().any(|d| d.volume == volume) {
            return Err(HarnessError::usage(format!("drive '{volume}' is already plugged")));
        }
        self.backend.attach_disk(&self.domain, volume, bus)?;
        self.drives.push(PluggedDrive {
            volume: volume.to_string(),
            bus,
        });
        info!(domain = %self.domain, volume, %bus, "drive plugged");
        Ok(())
    }

    pub fn unplug_drive(&mut self, volume: &str) -> HarnessResult<()> {
        self.require_alive("unplug a drive")?;
        let Some(index) = self.drives.iter().position(|d| d.volume == volume) else {
            return Err(HarnessError::usage(format!("drive '{volume}' is not plugged")));
        };
        self.backend.detach_disk(&self.domain, volume)?;
        self.drives.remove(index);
        info!(domain = %self.domain, volume, "drive unplugged");
        Ok(())
    }

    /// Guest block device for a plugged volume.
    pub fn disk_dev(&self, volume: &str) -> HarnessResult<String> {
        self.backend
            .disk_dev(&self.domain, volume)?
            .ok_or_else(|| HarnessError::backend("hypervisor", format!("volume '{volume}' is not attached")))
    }

    /// Whether the guest currently sees the volume's block device.
    pub fn disk_detected(&self, volume: &str) -> HarnessResult<bool> {
        let dev = self.disk_dev(volume)?;
        Ok(self.execute(&format!("test -b {}", quote(&dev)))?.success())
    }

    pub fn set_cdrom_boot(&mut self, image: &Path) -> HarnessResult<()> {
        self.set_boot(BootSource::Cdrom(image.to_path_buf()))
    }

    pub fn set_disk_boot(&mut self, volume: &str, bus: DiskBus) -> HarnessResult<()> {
        if !self.storage.volume_exists(volume)? {
            return Err(HarnessError::usage(format!("cannot boot from '{volume}': no such volume")));
        }
        self.set_boot(BootSource::Disk {
            volume: volume.to_string(),
            bus,
        })
    }

    fn set_boot(&mut self, source: BootSource) -> HarnessResult<()> {
        self.require_not_running("change the boot source")?;
        self.backend.set_boot_source(&self.domain, &source)?;
        info!(domain = %self.domain, boot = ?source, "boot source set");
        self.boot = Some(source);
        Ok(())
    }

    /// Pull the boot medium out from under a running guest.
    pub fn eject_boot_medium(&mut self) -> HarnessResult<()> {
        self.require_running("eject the boot medium")?;
        let Some(source) = self.boot.take() else {
            return Err(HarnessError::usage("no boot medium to eject"));
        };
        if let Err(err) = self.backend.eject_boot_medium(&self.domain, &source) {
            self.boot = Some(source);
            return Err(err);
        }
        if let BootSource::Disk { volume, .. } = &source {
            self.drives.retain(|d| &d.volume != volume);
        }
        info!(domain = %self.domain, boot = ?source, "boot medium ejected");
        Ok(())
    }

    pub fn set_hardware_clock(&mut self, time: DateTime<Utc>) -> HarnessResult<()> {
        self.require_not_running("set the hardware clock")?;
        self.backend.set_hardware_clock(&self.domain, time)?;
        self.hardware_clock = Some(time);
        info!(domain = %self.domain, clock = %time.to_rfc3339(), "hardware clock set");
        Ok(())
    }

    /// Set the guest's system clock to the host's current time.
    pub fn host_to_guest_time_sync(&self) -> HarnessResult<()> {
        let now = Utc::now().timestamp();
        let result = self.execute_successfully_as(&format!("date -s '@{now}'"), "root");
        if let Err(err) = &result {
            warn!(domain = %self.domain, error = %err, "time sync failed");
        }
        result.map(|_| ())
    }
}
