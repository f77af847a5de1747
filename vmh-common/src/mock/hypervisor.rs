//! In-memory hypervisor with a scripted guest.

use super::shell::split_words;
use crate::config::HarnessConfig;
use crate::errors::{HarnessError, HarnessResult};
use crate::vm::{BootSource, DiskBus, HypervisorBackend, LinkState, RemoteCommandResult, Volume};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
struct Scripted {
    exit_code: i32,
    stdout: String,
    stderr: String,
}

#[derive(Debug, Clone)]
struct Attached {
    volume: String,
    bus: DiskBus,
    dev: String,
}

#[derive(Debug)]
struct Domain {
    defined: bool,
    running: bool,
    link: LinkState,
    network_ready: bool,
    boot: Option<BootSource>,
    hardware_clock: Option<DateTime<Utc>>,
    guest_clock: Option<i64>,
    disks: Vec<Attached>,
    shell_ready_at: Option<Instant>,
    files: BTreeMap<String, String>,
    dirs: BTreeSet<String>,
    processes: BTreeSet<String>,
    packages: BTreeSet<String>,
    sessions: Vec<String>,
    scripted: HashMap<String, Scripted>,
    executed: Vec<(String, String)>,
    spawned: Vec<String>,
    temp_counter: u32,
}

impl Default for Domain {
    fn default() -> Self {
        Self {
            defined: false,
            running: false,
            link: LinkState::Plugged,
            network_ready: true,
            boot: None,
            hardware_clock: None,
            guest_clock: None,
            disks: Vec::new(),
            shell_ready_at: None,
            files: BTreeMap::new(),
            dirs: ["/", "/tmp", "/home", "/etc"].into_iter().map(String::from).collect(),
            processes: BTreeSet::new(),
            packages: BTreeSet::new(),
            sessions: Vec::new(),
            scripted: HashMap::new(),
            executed: Vec::new(),
            spawned: Vec::new(),
            temp_counter: 0,
        }
    }
}

#[derive(Debug, Default)]
struct State {
    domains: HashMap<String, Domain>,
    volumes: Vec<Volume>,
    failures: HashMap<&'static str, String>,
}

/// In-memory [`HypervisorBackend`].
///
/// Guests understand a handful of commands (`true`, `false`, `echo`,
/// `test -e/-d/-f/-b`, `cat`, `printf '%s' ... > file`, `pidof`,
/// `killall`, `cp`, `date`, `dpkg -s`, `loginctl`, `mktemp -d`, `curl`)
/// against an in-memory file system; anything else can be scripted with
/// [`MockHypervisor::script`].
#[derive(Debug)]
pub struct MockHypervisor {
    state: Mutex<State>,
    network_check: String,
    bridge_address: String,
}

impl Default for MockHypervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl MockHypervisor {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            network_check: HarnessConfig::default().network_check_command,
            bridge_address: "127.0.0.1".to_string(),
        }
    }

    /// Treat `command` as the guest's network check.
    pub fn with_network_check(mut self, command: impl Into<String>) -> Self {
        self.network_check = command.into();
        self
    }

    pub fn with_bridge_address(mut self, address: impl Into<String>) -> Self {
        self.bridge_address = address.into();
        self
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn with_domain<T>(&self, domain: &str, f: impl FnOnce(&mut Domain) -> T) -> T {
        let mut state = self.lock();
        f(state.domains.entry(domain.to_string()).or_default())
    }

    /// Make every later call of `operation` fail with `message`.
    pub fn fail_operation(&self, operation: &'static str, message: impl Into<String>) {
        self.lock().failures.insert(operation, message.into());
    }

    pub fn clear_failures(&self) {
        self.lock().failures.clear();
    }

    fn check(state: &State, operation: &'static str) -> HarnessResult<()> {
        match state.failures.get(operation) {
            Some(message) => Err(HarnessError::backend("hypervisor", format!("{operation}: {message}"))),
            None => Ok(()),
        }
    }

    fn defined<'a>(state: &'a mut State, domain: &str) -> HarnessResult<&'a mut Domain> {
        match state.domains.get_mut(domain) {
            Some(d) if d.defined => Ok(d),
            _ => Err(HarnessError::backend("hypervisor", format!("no such domain '{domain}'"))),
        }
    }

    fn running<'a>(state: &'a mut State, domain: &str) -> HarnessResult<&'a mut Domain> {
        let d = Self::defined(state, domain)?;
        if !d.running {
            return Err(HarnessError::backend("hypervisor", format!("domain '{domain}' is not running")));
        }
        if d.shell_ready_at.is_some_and(|at| Instant::now() < at) {
            return Err(HarnessError::backend("hypervisor", "remote shell is not responding"));
        }
        Ok(d)
    }

    pub fn is_defined(&self, domain: &str) -> bool {
        self.lock().domains.get(domain).is_some_and(|d| d.defined)
    }

    /// The guest shuts itself down.
    pub fn simulate_guest_poweroff(&self, domain: &str) {
        self.with_domain(domain, |d| d.running = false);
    }

    /// The remote shell answers only after `delay` from now.
    pub fn set_shell_ready_after(&self, domain: &str, delay: Duration) {
        self.with_domain(domain, |d| d.shell_ready_at = Some(Instant::now() + delay));
    }

    pub fn set_network_ready(&self, domain: &str, ready: bool) {
        self.with_domain(domain, |d| d.network_ready = ready);
    }

    pub fn add_guest_file(&self, domain: &str, path: &str, content: &str) {
        self.with_domain(domain, |d| {
            d.files.insert(path.to_string(), content.to_string());
        });
    }

    pub fn add_guest_dir(&self, domain: &str, path: &str) {
        self.with_domain(domain, |d| {
            d.dirs.insert(path.to_string());
        });
    }

    pub fn add_guest_process(&self, domain: &str, name: &str) {
        self.with_domain(domain, |d| {
            d.processes.insert(name.to_string());
        });
    }

    pub fn remove_guest_process(&self, domain: &str, name: &str) {
        self.with_domain(domain, |d| {
            d.processes.remove(name);
        });
    }

    pub fn install_package(&self, domain: &str, package: &str) {
        self.with_domain(domain, |d| {
            d.packages.insert(package.to_string());
        });
    }

    /// Open a logind session on seat0 for `user`.
    pub fn open_session(&self, domain: &str, user: &str) {
        self.with_domain(domain, |d| d.sessions.push(user.to_string()));
    }

    /// Answer `command` with a fixed result instead of the built-ins.
    pub fn script(&self, domain: &str, command: &str, exit_code: i32, stdout: &str, stderr: &str) {
        self.with_domain(domain, |d| {
            d.scripted.insert(
                command.to_string(),
                Scripted {
                    exit_code,
                    stdout: stdout.to_string(),
                    stderr: stderr.to_string(),
                },
            );
        });
    }

    /// `(user, command)` pairs run through `guest_exec`, oldest first.
    pub fn executed_commands(&self, domain: &str) -> Vec<(String, String)> {
        self.with_domain(domain, |d| d.executed.clone())
    }

    pub fn spawned_commands(&self, domain: &str) -> Vec<String> {
        self.with_domain(domain, |d| d.spawned.clone())
    }

    pub fn guest_file(&self, domain: &str, path: &str) -> Option<String> {
        self.with_domain(domain, |d| d.files.get(path).cloned())
    }

    pub fn guest_has_process(&self, domain: &str, name: &str) -> bool {
        self.with_domain(domain, |d| d.processes.contains(name))
    }

    pub fn link_state(&self, domain: &str) -> LinkState {
        self.with_domain(domain, |d| d.link)
    }

    pub fn boot_source(&self, domain: &str) -> Option<BootSource> {
        self.with_domain(domain, |d| d.boot.clone())
    }

    pub fn hardware_clock(&self, domain: &str) -> Option<DateTime<Utc>> {
        self.with_domain(domain, |d| d.hardware_clock)
    }

    pub fn guest_clock(&self, domain: &str) -> Option<i64> {
        self.with_domain(domain, |d| d.guest_clock)
    }

    pub fn attached_volumes(&self, domain: &str) -> Vec<(String, DiskBus)> {
        self.with_domain(domain, |d| d.disks.iter().map(|a| (a.volume.clone(), a.bus)).collect())
    }

    fn run(&self, d: &mut Domain, command: &str, user: &str) -> RemoteCommandResult {
        let reply = |exit: i32, out: String, err: String| RemoteCommandResult::new(command, user, exit, out, err);

        if let Some(s) = d.scripted.get(command) {
            return reply(s.exit_code, s.stdout.clone(), s.stderr.clone());
        }
        if command == self.network_check {
            let up = d.link == LinkState::Plugged && d.network_ready;
            return reply(if up { 0 } else { 1 }, String::new(), String::new());
        }

        let words = split_words(command);
        let args: Vec<&str> = words.iter().map(String::as_str).collect();
        let ok = |out: String| reply(0, out, String::new());
        let status = |success: bool| reply(if success { 0 } else { 1 }, String::new(), String::new());

        match args.as_slice() {
            ["true"] => status(true),
            ["false"] => status(false),
            ["echo", rest @ ..] => ok(format!("{}\n", rest.join(" "))),
            ["test", "-e", path] => status(d.files.contains_key(*path) || d.dirs.contains(*path)),
            ["test", "-f", path] => status(d.files.contains_key(*path)),
            ["test", "-d", path] => status(d.dirs.contains(*path)),
            ["test", "-b", path] => status(d.disks.iter().any(|a| a.dev == *path)),
            ["cat", path] => match d.files.get(*path) {
                Some(content) => ok(content.clone()),
                None => reply(1, String::new(), format!("cat: {path}: No such file or directory\n")),
            },
            ["printf", "%s", content, ">", path] => {
                d.files.insert((*path).to_string(), (*content).to_string());
                status(true)
            }
            ["pidof", "-x", name] | ["pidof", name] => match d.processes.contains(*name) {
                true => ok("4242\n".to_string()),
                false => status(false),
            },
            ["killall", name] => {
                if d.processes.remove(*name) {
                    status(true)
                } else {
                    reply(1, String::new(), format!("{name}: no process found\n"))
                }
            }
            ["cp", src, dst] => match d.files.get(*src).cloned() {
                Some(content) => {
                    let target = if d.dirs.contains(*dst) {
                        let base = src.rsplit('/').next().unwrap_or(src);
                        format!("{}/{}", dst.trim_end_matches('/'), base)
                    } else {
                        (*dst).to_string()
                    };
                    d.files.insert(target, content);
                    status(true)
                }
                None => reply(1, String::new(), format!("cp: cannot stat '{src}': No such file or directory\n")),
            },
            ["date", "-s", stamp] => match stamp.strip_prefix('@').and_then(|s| s.parse::<i64>().ok()) {
                Some(secs) => {
                    d.guest_clock = Some(secs);
                    ok(format!("{secs}\n"))
                }
                None => reply(1, String::new(), format!("date: invalid date '{stamp}'\n")),
            },
            ["date", "+%s"] => ok(format!("{}\n", d.guest_clock.unwrap_or_else(|| Utc::now().timestamp()))),
            ["dpkg", "-s", package, ..] => status(d.packages.contains(*package)),
            ["loginctl"] => {
                let mut out = String::from("SESSION  UID USER             SEAT  TTY\n");
                for (i, session_user) in d.sessions.iter().enumerate() {
                    out.push_str(&format!("     c{} {} {:<16} seat0 tty{}\n", i + 1, 1000 + i, session_user, i + 2));
                }
                out.push_str(&format!("\n{} sessions listed.\n", d.sessions.len()));
                ok(out)
            }
            ["mktemp", "-d"] => {
                d.temp_counter += 1;
                let dir = format!("/tmp/tmp.mock{:04}", d.temp_counter);
                d.dirs.insert(dir.clone());
                ok(format!("{dir}\n"))
            }
            ["curl", url] | ["curl", "--silent", url] | ["curl", "-s", url] => match http_get(url) {
                Ok(body) => ok(body),
                Err(err) => reply(7, String::new(), format!("curl: (7) {err}\n")),
            },
            [] => status(true),
            [program, ..] => reply(127, String::new(), format!("sh: 1: {program}: not found\n")),
        }
    }
}

/// Plain HTTP/1.0 GET returning the response body.
fn http_get(url: &str) -> Result<String, String> {
    let rest = url
        .strip_prefix("http://")
        .ok_or_else(|| format!("unsupported URL '{url}'"))?;
    let (authority, path) = match rest.find('/') {
        Some(i) => (&rest[..i], &rest[i..]),
        None => (rest, "/"),
    };
    let addr = authority
        .to_socket_addrs()
        .map_err(|e| e.to_string())?
        .next()
        .ok_or_else(|| format!("cannot resolve '{authority}'"))?;
    let mut stream = TcpStream::connect_timeout(&addr, Duration::from_secs(2)).map_err(|e| format!("Failed to connect to {authority}: {e}"))?;
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .map_err(|e| e.to_string())?;
    write!(stream, "GET {path} HTTP/1.0\r\nHost: {authority}\r\n\r\n").map_err(|e| e.to_string())?;
    let mut response = String::new();
    stream.read_to_string(&mut response).map_err(|e| e.to_string())?;
    Ok(response
        .split_once("\r\n\r\n")
        .map_or(String::new(), |(_, body)| body.to_string()))
}

fn next_dev(disks: &[Attached], bus: DiskBus) -> String {
    let prefix = match bus {
        DiskBus::Virtio => "/dev/vd",
        _ => "/dev/sd",
    };
    // sda / vda is the system disk
    ('b'..='z')
        .map(|letter| format!("{prefix}{letter}"))
        .find(|dev| !disks.iter().any(|a| &a.dev == dev))
        .unwrap_or_else(|| format!("{prefix}zz"))
}

impl HypervisorBackend for MockHypervisor {
    fn define(&self, domain: &str) -> HarnessResult<()> {
        let mut state = self.lock();
        Self::check(&state, "define")?;
        let d = state.domains.entry(domain.to_string()).or_default();
        if d.defined {
            return Err(HarnessError::backend("hypervisor", format!("domain '{domain}' already defined")));
        }
        d.defined = true;
        d.running = false;
        Ok(())
    }

    fn undefine(&self, domain: &str) -> HarnessResult<()> {
        let mut state = self.lock();
        Self::check(&state, "undefine")?;
        let d = Self::defined(&mut state, domain)?;
        d.defined = false;
        d.running = false;
        d.disks.clear();
        Ok(())
    }

    fn start(&self, domain: &str) -> HarnessResult<()> {
        let mut state = self.lock();
        Self::check(&state, "start")?;
        let d = Self::defined(&mut state, domain)?;
        if d.running {
            return Err(HarnessError::backend("hypervisor", format!("domain '{domain}' is already running")));
        }
        d.running = true;
        Ok(())
    }

    fn power_off(&self, domain: &str) -> HarnessResult<()> {
        let mut state = self.lock();
        Self::check(&state, "power_off")?;
        let d = Self::defined(&mut state, domain)?;
        d.running = false;
        d.sessions.clear();
        Ok(())
    }

    fn is_running(&self, domain: &str) -> HarnessResult<bool> {
        let mut state = self.lock();
        Self::check(&state, "is_running")?;
        Ok(Self::defined(&mut state, domain)?.running)
    }

    fn set_boot_source(&self, domain: &str, source: &BootSource) -> HarnessResult<()> {
        let mut state = self.lock();
        Self::check(&state, "set_boot_source")?;
        let d = Self::defined(&mut state, domain)?;
        if let BootSource::Disk { volume, bus } = source
            && !d.disks.iter().any(|a| &a.volume == volume)
        {
            let dev = next_dev(&d.disks, *bus);
            d.disks.push(Attached {
                volume: volume.clone(),
                bus: *bus,
                dev,
            });
        }
        d.boot = Some(source.clone());
        Ok(())
    }

    fn eject_boot_medium(&self, domain: &str, source: &BootSource) -> HarnessResult<()> {
        let mut state = self.lock();
        Self::check(&state, "eject_boot_medium")?;
        let d = Self::defined(&mut state, domain)?;
        if !d.running {
            return Err(HarnessError::backend("hypervisor", format!("domain '{domain}' is not running")));
        }
        if let BootSource::Disk { volume, .. } = source {
            d.disks.retain(|a| &a.volume != volume);
        }
        d.boot = None;
        Ok(())
    }

    fn set_hardware_clock(&self, domain: &str, time: DateTime<Utc>) -> HarnessResult<()> {
        let mut state = self.lock();
        Self::check(&state, "set_hardware_clock")?;
        Self::defined(&mut state, domain)?.hardware_clock = Some(time);
        Ok(())
    }

    fn set_link_state(&self, domain: &str, link: LinkState) -> HarnessResult<()> {
        let mut state = self.lock();
        Self::check(&state, "set_link_state")?;
        Self::defined(&mut state, domain)?.link = link;
        Ok(())
    }

    fn network_link(&self, domain: &str) -> HarnessResult<String> {
        let mut state = self.lock();
        Self::defined(&mut state, domain)?;
        Ok(format!("vnet-{domain}"))
    }

    fn bridge_address(&self, _domain: &str) -> HarnessResult<String> {
        Ok(self.bridge_address.clone())
    }

    fn attach_disk(&self, domain: &str, volume: &str, bus: DiskBus) -> HarnessResult<()> {
        let mut state = self.lock();
        Self::check(&state, "attach_disk")?;
        if !state.volumes.iter().any(|v| v.name == volume) {
            return Err(HarnessError::backend("hypervisor", format!("no such volume '{volume}'")));
        }
        let d = Self::defined(&mut state, domain)?;
        let dev = next_dev(&d.disks, bus);
        d.disks.push(Attached {
            volume: volume.to_string(),
            bus,
            dev,
        });
        Ok(())
    }

    fn detach_disk(&self, domain: &str, volume: &str) -> HarnessResult<()> {
        let mut state = self.lock();
        Self::check(&state, "detach_disk")?;
        let d = Self::defined(&mut state, domain)?;
        let before = d.disks.len();
        d.disks.retain(|a| a.volume != volume);
        if d.disks.len() == before {
            return Err(HarnessError::backend("hypervisor", format!("volume '{volume}' is not attached")));
        }
        Ok(())
    }

    fn disk_dev(&self, domain: &str, volume: &str) -> HarnessResult<Option<String>> {
        let mut state = self.lock();
        let d = Self::defined(&mut state, domain)?;
        Ok(d.disks.iter().find(|a| a.volume == volume).map(|a| a.dev.clone()))
    }

    fn guest_exec(&self, domain: &str, command: &str, user: &str) -> HarnessResult<RemoteCommandResult> {
        let mut state = self.lock();
        Self::check(&state, "guest_exec")?;
        let d = Self::running(&mut state, domain)?;
        d.executed.push((user.to_string(), command.to_string()));
        if command.trim() == "poweroff" {
            d.running = false;
            return Ok(RemoteCommandResult::new(command, user, 0, "", ""));
        }
        let started = Instant::now();
        let mut result = self.run(d, command, user);
        result.duration = started.elapsed();
        Ok(result)
    }

    fn guest_spawn(&self, domain: &str, command: &str, user: &str) -> HarnessResult<()> {
        let mut state = self.lock();
        Self::check(&state, "guest_spawn")?;
        let d = Self::running(&mut state, domain)?;
        d.spawned.push(command.to_string());
        match command.trim() {
            "poweroff" => {
                d.running = false;
                d.sessions.clear();
            }
            "reboot" => d.sessions.clear(),
            _ => {
                let _ = self.run(d, command, user);
            }
        }
        Ok(())
    }

    fn create_volume(&self, volume: &Volume) -> HarnessResult<()> {
        let mut state = self.lock();
        Self::check(&state, "create_volume")?;
        if state.volumes.iter().any(|v| v.name == volume.name) {
            return Err(HarnessError::backend("hypervisor", format!("volume '{}' exists", volume.name)));
        }
        state.volumes.push(volume.clone());
        Ok(())
    }

    fn delete_volume(&self, name: &str) -> HarnessResult<()> {
        let mut state = self.lock();
        Self::check(&state, "delete_volume")?;
        let before = state.volumes.len();
        state.volumes.retain(|v| v.name != name);
        if state.volumes.len() == before {
            return Err(HarnessError::backend("hypervisor", format!("no such volume '{name}'")));
        }
        Ok(())
    }

    fn list_volumes(&self) -> HarnessResult<Vec<Volume>> {
        let state = self.lock();
        Self::check(&state, "list_volumes")?;
        Ok(state.volumes.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn running() -> MockHypervisor {
        let hv = MockHypervisor::new();
        hv.define("d").unwrap();
        hv.start("d").unwrap();
        hv
    }

    #[test]
    fn test_builtins() {
        let hv = running();
        assert_eq!(hv.guest_exec("d", "echo hi", "root").unwrap().stdout, "hi\n");
        assert_eq!(hv.guest_exec("d", "nosuchtool --flag", "root").unwrap().exit_code, 127);
        hv.guest_exec("d", "printf '%s' 'a b' > /tmp/x", "root").unwrap();
        assert_eq!(hv.guest_file("d", "/tmp/x").as_deref(), Some("a b"));
        hv.guest_exec("d", "cp /tmp/x /home", "user").unwrap();
        assert_eq!(hv.guest_file("d", "/home/x").as_deref(), Some("a b"));
    }

    #[test]
    fn test_scripted_overrides_builtins() {
        let hv = running();
        hv.script("d", "echo hi", 3, "scripted", "");
        let result = hv.guest_exec("d", "echo hi", "root").unwrap();
        assert_eq!((result.exit_code, result.stdout.as_str()), (3, "scripted"));
    }

    #[test]
    fn test_loginctl_lists_sessions() {
        let hv = running();
        hv.open_session("d", "amnesia");
        let out = hv.guest_exec("d", "loginctl", "root").unwrap().stdout;
        let re = regex::Regex::new(r"(?m)^\s*\S+\s+\d+\s+amnesia\s+seat\d+\s+\S+\s*$").unwrap();
        assert!(re.is_match(&out));
    }

    #[test]
    fn test_guest_poweroff_via_spawn() {
        let hv = running();
        hv.guest_spawn("d", "poweroff", "root").unwrap();
        assert!(!hv.is_running("d").unwrap());
        assert!(hv.guest_exec("d", "true", "root").is_err());
    }

    #[test]
    fn test_injected_failure() {
        let hv = running();
        hv.fail_operation("guest_exec", "agent crashed");
        let err = hv.guest_exec("d", "true", "root").unwrap_err();
        assert!(err.to_string().contains("agent crashed"));
        hv.clear_failures();
        assert!(hv.guest_exec("d", "true", "root").is_ok());
    }

    #[test]
    fn test_disk_devices() {
        let hv = running();
        for name in ["a", "b"] {
            hv.create_volume(&Volume {
                name: name.to_string(),
                size: 1,
                unit: crate::vm::SizeUnit::MiB,
                format: crate::vm::VolumeFormat::Raw,
                temporary: false,
            })
            .unwrap();
        }
        hv.attach_disk("d", "a", DiskBus::Usb).unwrap();
        hv.attach_disk("d", "b", DiskBus::Sata).unwrap();
        assert_eq!(hv.disk_dev("d", "a").unwrap().as_deref(), Some("/dev/sdb"));
        assert_eq!(hv.disk_dev("d", "b").unwrap().as_deref(), Some("/dev/sdc"));
        assert_eq!(hv.guest_exec("d", "test -b /dev/sdc", "root").unwrap().exit_code, 0);
    }
}
