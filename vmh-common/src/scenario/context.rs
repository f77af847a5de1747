//! Per-scenario state.
//!
//! Everything a step touches lives here: the VM, the screen, the capture,
//! the policy and the cleanup hooks. Contexts share nothing mutable, so
//! separate scenarios can run side by side against separate backends.

use super::cleanup::{CleanupRecord, CleanupStack};
use crate::config::HarnessConfig;
use crate::errors::{HarnessError, HarnessResult};
use crate::poll::Poller;
use crate::process::LanWebServer;
use crate::screen::{Landmark, ScreenBackend, ScreenSync, UiMode, landmark_for};
use crate::traffic::{AllowedHostSet, CaptureBackend, Endpoint, PolicyTimeline, TrafficCapture};
use crate::vm::{HypervisorBackend, Vm, VmOptions};
use chrono::Utc;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// The three external systems a scenario drives.
#[derive(Clone)]
pub struct Backends {
    pub hypervisor: Arc<dyn HypervisorBackend>,
    pub screen: Arc<dyn ScreenBackend>,
    pub capture: Arc<dyn CaptureBackend>,
}

impl fmt::Debug for Backends {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backends").finish_non_exhaustive()
    }
}

pub struct ScenarioContext {
    config: HarnessConfig,
    backends: Backends,
    domain: String,
    poller: Poller,
    vm: Option<Vm>,
    screen: ScreenSync,
    cleanup: CleanupStack,
    capture: Option<TrafficCapture>,
    policy: PolicyTimeline,
    lan_hosts: AllowedHostSet,
    lan_server: Option<Arc<LanWebServer>>,
    ui_mode: UiMode,
    boot_options: Option<String>,
}

impl fmt::Debug for ScenarioContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScenarioContext")
            .field("domain", &self.domain)
            .field("vm", &self.vm)
            .field("capture", &self.capture)
            .field("cleanup", &self.cleanup)
            .field("ui_mode", &self.ui_mode)
            .finish_non_exhaustive()
    }
}

impl ScenarioContext {
    /// Fresh context for one scenario targeting `domain`.
    pub fn new(config: HarnessConfig, backends: Backends, domain: impl Into<String>) -> Self {
        let poller = Poller::from_config(&config);
        let screen = ScreenSync::new(backends.screen.clone(), poller);
        let ui_mode = config.ui_mode;
        Self {
            config,
            backends,
            domain: domain.into(),
            poller,
            vm: None,
            screen,
            cleanup: CleanupStack::new(),
            capture: None,
            policy: PolicyTimeline::new(AllowedHostSet::new()),
            lan_hosts: AllowedHostSet::new(),
            lan_server: None,
            ui_mode,
            boot_options: None,
        }
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    pub fn backends(&self) -> &Backends {
        &self.backends
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn poller(&self) -> Poller {
        self.poller
    }

    /// `base` stretched by the configured patience factor.
    pub fn timeout(&self, base: Duration) -> Duration {
        self.config.scaled(base)
    }

    pub fn screen(&self) -> &ScreenSync {
        &self.screen
    }

    /// Replace the current VM with a freshly defined one.
    pub fn new_computer(&mut self) -> HarnessResult<&mut Vm> {
        if let Some(mut old) = self.vm.take() {
            old.destroy_and_undefine()?;
        }
        let vm = Vm::define(
            &self.domain,
            self.backends.hypervisor.clone(),
            VmOptions::from_config(&self.config),
        )?;
        Ok(self.vm.insert(vm))
    }

    pub fn has_vm(&self) -> bool {
        self.vm.is_some()
    }

    pub fn vm(&self) -> HarnessResult<&Vm> {
        self.vm.as_ref().ok_or_else(no_computer)
    }

    pub fn vm_mut(&mut self) -> HarnessResult<&mut Vm> {
        self.vm.as_mut().ok_or_else(no_computer)
    }

    pub fn ui_mode(&self) -> UiMode {
        self.ui_mode
    }

    pub fn set_ui_mode(&mut self, mode: UiMode) {
        self.ui_mode = mode;
    }

    /// Installer landmark for the current UI mode.
    pub fn mode_landmark(&self, base: &str) -> Landmark {
        landmark_for(base, self.ui_mode)
    }

    pub fn boot_options(&self) -> Option<&str> {
        self.boot_options.as_deref()
    }

    pub fn set_boot_options(&mut self, options: impl Into<String>) {
        self.boot_options = Some(options.into());
    }

    /// Register a hook that runs when the scenario ends.
    pub fn add_cleanup<F>(&mut self, name: impl Into<String>, hook: F)
    where
        F: FnOnce() -> HarnessResult<()> + Send + 'static,
    {
        self.cleanup.push(name, hook);
    }

    pub fn pending_cleanup(&self) -> Vec<&str> {
        self.cleanup.pending()
    }

    /// Start capturing on the configured link, or on the VM's own link.
    ///
    /// A capture that is already running is stopped and replaced.
    pub fn start_capture(&mut self) -> HarnessResult<TrafficCapture> {
        let link = match &self.config.capture_link {
            Some(link) => link.clone(),
            None => self.vm()?.network_link()?,
        };
        if let Some(previous) = self.capture.take() {
            previous.stop()?;
        }
        let capture = TrafficCapture::start(self.backends.capture.as_ref(), &link)?;
        let hook_handle = capture.clone();
        self.add_cleanup(format!("stop capture on {link}"), move || {
            let stopped = hook_handle.stop();
            hook_handle.clear();
            stopped
        });
        self.capture = Some(capture.clone());
        Ok(capture)
    }

    pub fn capture(&self) -> HarnessResult<&TrafficCapture> {
        self.capture
            .as_ref()
            .ok_or_else(|| HarnessError::usage("no traffic is being captured"))
    }

    pub fn policy(&self) -> &PolicyTimeline {
        &self.policy
    }

    /// Put `hosts` (plus any LAN hosts) in force from now on.
    pub fn set_allowed_hosts(&mut self, hosts: AllowedHostSet) -> HarnessResult<()> {
        let mut effective = hosts;
        effective.extend(self.lan_hosts.iter().copied());
        info!(hosts = effective.len(), "allowed hosts updated");
        self.policy.update(Utc::now(), effective)
    }

    /// Allow `endpoint` for the rest of the scenario.
    pub fn add_lan_host(&mut self, endpoint: Endpoint) -> HarnessResult<()> {
        self.lan_hosts.insert(endpoint);
        let mut current = self.policy.current().clone();
        current.insert(endpoint);
        self.policy.update(Utc::now(), current)
    }

    pub fn lan_server(&self) -> Option<&Arc<LanWebServer>> {
        self.lan_server.as_ref()
    }

    pub(crate) fn set_lan_server(&mut self, server: Arc<LanWebServer>) {
        self.lan_server = Some(server);
    }

    /// Run every cleanup hook, then destroy the VM.
    ///
    /// Safe to call more than once; later calls find nothing left to do.
    pub fn teardown(&mut self) -> (Vec<CleanupRecord>, HarnessResult<()>) {
        let (mut records, mut result) = self.cleanup.run_all();
        self.capture = None;
        self.lan_server = None;

        if let Some(mut vm) = self.vm.take() {
            let started = std::time::Instant::now();
            let destroyed = vm.destroy_and_undefine();
            let error = destroyed.as_ref().err().map(ToString::to_string);
            if let Some(err) = &error {
                warn!(domain = %self.domain, error = %err, "failed to destroy VM");
                let mut failures = match result {
                    Err(HarnessError::Cleanup(failures)) => failures,
                    _ => Vec::new(),
                };
                failures.push(format!("destroy computer: {err}"));
                result = Err(HarnessError::Cleanup(failures));
            }
            records.push(CleanupRecord {
                name: "destroy computer".to_string(),
                duration_ms: started.elapsed().as_millis() as u64,
                error,
            });
        }
        (records, result)
    }
}

impl Drop for ScenarioContext {
    fn drop(&mut self) {
        let (_, result) = self.teardown();
        if let Err(err) = result {
            warn!(error = %err, "teardown on drop failed");
        }
    }
}

fn no_computer() -> HarnessError {
    HarnessError::invalid_state("use the computer", "no computer defined (run `a_computer` first)")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockCapture, MockHypervisor, MockScreen};
    use crate::vm::VmState;

    fn context() -> (Arc<MockHypervisor>, ScenarioContext) {
        let hv = Arc::new(MockHypervisor::new());
        let backends = Backends {
            hypervisor: hv.clone(),
            screen: Arc::new(MockScreen::new(800, 600)),
            capture: Arc::new(MockCapture::new()),
        };
        (hv, ScenarioContext::new(HarnessConfig::default(), backends, "ctx"))
    }

    #[test]
    fn test_vm_required() {
        let (_hv, ctx) = context();
        assert!(matches!(ctx.vm(), Err(HarnessError::InvalidState { .. })));
    }

    #[test]
    fn test_new_computer_replaces_previous() {
        let (hv, mut ctx) = context();
        ctx.new_computer().unwrap().start().unwrap();
        let vm = ctx.new_computer().unwrap();
        assert_eq!(vm.state(), VmState::Defined);
        assert!(hv.is_defined("ctx"));
    }

    #[test]
    fn test_teardown_destroys_vm_after_hooks() {
        let (hv, mut ctx) = context();
        ctx.new_computer().unwrap();
        ctx.add_cleanup("noop", || Ok(()));
        let (records, result) = ctx.teardown();
        result.unwrap();
        let names: Vec<_> = records.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["noop", "destroy computer"]);
        assert!(!hv.is_defined("ctx"));
        assert!(ctx.teardown().0.is_empty());
    }

    #[test]
    fn test_lan_hosts_survive_policy_updates() {
        let (_hv, mut ctx) = context();
        let lan: Endpoint = "10.2.1.1:8000".parse().unwrap();
        ctx.add_lan_host(lan).unwrap();
        ctx.set_allowed_hosts(["10.2.1.1:9050".parse().unwrap()].into_iter().collect())
            .unwrap();
        assert!(ctx.policy().current().contains(&lan));
        assert_eq!(ctx.policy().current().len(), 2);
    }
}
