//! Host-side helper processes owned by a scenario.
//!
//! A [`ManagedProcess`] is spawned by a step, health-checked with a bounded
//! wait, and stopped by a cleanup hook. Stopping is idempotent so the hook
//! and an explicit stop can both run.

use crate::config::LanServerConfig;
use crate::errors::{HarnessError, HarnessResult};
use crate::poll::Poller;
use crate::traffic::Endpoint;
use std::net::{IpAddr, SocketAddr, TcpStream};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_millis(500);

/// A child process with a name for logs and errors.
#[derive(Debug)]
pub struct ManagedProcess {
    name: String,
    pid: u32,
    started_at: Instant,
    child: Mutex<Option<Child>>,
}

impl ManagedProcess {
    /// Spawn `program` with `args`; output is discarded.
    pub fn spawn(name: &str, program: &str, args: &[String]) -> HarnessResult<Self> {
        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| HarnessError::Process {
                name: name.to_string(),
                message: format!("failed to spawn '{program}': {e}"),
            })?;
        let pid = child.id();
        info!(name, pid, program, "process spawned");
        Ok(Self {
            name: name.to_string(),
            pid,
            started_at: Instant::now(),
            child: Mutex::new(Some(child)),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Option<Child>> {
        self.child.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Whether the process has neither exited nor been stopped.
    pub fn is_running(&self) -> bool {
        match self.lock().as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Exit status, if the process has already exited on its own.
    pub fn try_exit_status(&self) -> Option<ExitStatus> {
        self.lock().as_mut().and_then(|child| child.try_wait().ok().flatten())
    }

    /// Alive and accepting TCP connections on `addr`.
    pub fn health_check(&self, addr: SocketAddr) -> bool {
        self.is_running() && TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT).is_ok()
    }

    /// Ask the process to terminate, then kill it after `grace`.
    ///
    /// Stopping an already stopped process is a no-op.
    pub fn stop(&self, grace: Duration) -> HarnessResult<()> {
        let Some(mut child) = self.lock().take() else {
            return Ok(());
        };
        if let Ok(Some(status)) = child.try_wait() {
            debug!(name = %self.name, pid = self.pid, ?status, "process had already exited");
            return Ok(());
        }

        info!(name = %self.name, pid = self.pid, "stopping process");
        let terminated = Command::new("kill")
            .args(["-TERM", &self.pid.to_string()])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .is_ok_and(|s| s.success());

        if terminated {
            let deadline = Instant::now() + grace;
            while Instant::now() < deadline {
                if let Ok(Some(status)) = child.try_wait() {
                    debug!(name = %self.name, ?status, "process exited");
                    return Ok(());
                }
                std::thread::sleep(Duration::from_millis(20));
            }
            warn!(name = %self.name, grace_ms = grace.as_millis() as u64, "process ignored SIGTERM, killing");
        }

        child.kill().map_err(|e| HarnessError::Process {
            name: self.name.clone(),
            message: format!("failed to kill pid {}: {e}", self.pid),
        })?;
        child.wait().map_err(|e| HarnessError::Process {
            name: self.name.clone(),
            message: format!("failed to reap pid {}: {e}", self.pid),
        })?;
        Ok(())
    }
}

impl Drop for ManagedProcess {
    fn drop(&mut self) {
        let slot = self.child.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(mut child) = slot.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

/// Fill `{port}` and `{address}` placeholders in a command template.
pub fn render_command(template: &[String], address: &str, port: u16) -> Vec<String> {
    template
        .iter()
        .map(|arg| arg.replace("{port}", &port.to_string()).replace("{address}", address))
        .collect()
}

/// Web server on the host side of the VM network.
#[derive(Debug)]
pub struct LanWebServer {
    process: ManagedProcess,
    endpoint: Endpoint,
    shutdown_timeout: Duration,
}

impl LanWebServer {
    /// Start the configured server on `bridge_address` and wait until it
    /// accepts connections.
    pub fn start(config: &LanServerConfig, bridge_address: &str, poller: &Poller) -> HarnessResult<Self> {
        let address = config.bind_address.as_deref().unwrap_or(bridge_address);
        let ip: IpAddr = address
            .parse()
            .map_err(|_| HarnessError::usage(format!("LAN server address '{address}' is not an IP address")))?;
        let endpoint = Endpoint {
            address: ip,
            port: config.port,
        };

        let argv = render_command(&config.command, address, config.port);
        let Some((program, args)) = argv.split_first() else {
            return Err(HarnessError::Config("LAN server command is empty".to_string()));
        };
        let process = ManagedProcess::spawn("lan-web-server", program, args)?;
        let server = Self {
            process,
            endpoint,
            shutdown_timeout: config.shutdown_timeout,
        };

        let addr = SocketAddr::new(ip, config.port);
        let waited = poller.wait_until(config.startup_timeout, "LAN web server to accept connections", || {
            server.process.health_check(addr) || server.process.try_exit_status().is_some()
        });
        if let Some(status) = server.process.try_exit_status() {
            return Err(HarnessError::Process {
                name: server.process.name().to_string(),
                message: format!("exited during startup with {status}"),
            });
        }
        waited?;
        info!(endpoint = %server.endpoint, pid = server.process.pid(), "LAN web server is up");
        Ok(server)
    }

    pub fn endpoint(&self) -> Endpoint {
        self.endpoint
    }

    pub fn url(&self) -> String {
        format!("http://{}/", self.endpoint)
    }

    pub fn process(&self) -> &ManagedProcess {
        &self.process
    }

    pub fn is_healthy(&self) -> bool {
        self.process
            .health_check(SocketAddr::new(self.endpoint.address, self.endpoint.port))
    }

    pub fn stop(&self) -> HarnessResult<()> {
        self.process.stop(self.shutdown_timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    fn fast() -> Poller {
        Poller::new(Duration::from_millis(10), Duration::from_millis(1))
    }

    #[test]
    fn test_render_command() {
        let template = vec!["serve".to_string(), "--bind={address}".to_string(), "{port}".to_string()];
        assert_eq!(
            render_command(&template, "10.2.1.1", 8000),
            vec!["serve", "--bind=10.2.1.1", "8000"]
        );
    }

    #[test]
    fn test_stop_is_idempotent() {
        let process = ManagedProcess::spawn("sleeper", "sleep", &["30".to_string()]).unwrap();
        assert!(process.is_running());
        process.stop(Duration::from_secs(2)).unwrap();
        assert!(!process.is_running());
        process.stop(Duration::from_secs(2)).unwrap();
    }

    #[test]
    fn test_spawn_missing_program() {
        let err = ManagedProcess::spawn("ghost", "/nonexistent/vmh-test-binary", &[]).unwrap_err();
        assert!(matches!(err, HarnessError::Process { .. }));
    }

    #[test]
    fn test_health_check_needs_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let process = ManagedProcess::spawn("sleeper", "sleep", &["30".to_string()]).unwrap();
        assert!(process.health_check(addr));
        drop(listener);
        assert!(!process.health_check(addr));
        process.stop(Duration::from_secs(1)).unwrap();
        assert!(!process.health_check(addr));
    }

    #[test]
    fn test_lan_server_that_exits_early() {
        let config = LanServerConfig {
            command: vec!["false".to_string()],
            port: 1,
            startup_timeout: Duration::from_secs(2),
            ..LanServerConfig::default()
        };
        let err = LanWebServer::start(&config, "127.0.0.1", &fast()).unwrap_err();
        assert!(matches!(err, HarnessError::Process { .. }));
    }

    #[test]
    fn test_lan_server_rejects_bad_address() {
        let err = LanWebServer::start(&LanServerConfig::default(), "bridge0", &fast()).unwrap_err();
        assert!(matches!(err, HarnessError::Usage(_)));
    }

    #[test]
    fn test_lan_server_up_when_port_answers() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let config = LanServerConfig {
            command: vec!["sleep".to_string(), "30".to_string()],
            port,
            startup_timeout: Duration::from_secs(2),
            shutdown_timeout: Duration::from_secs(1),
            ..LanServerConfig::default()
        };
        let server = LanWebServer::start(&config, "127.0.0.1", &fast()).unwrap();
        assert_eq!(server.url(), format!("http://127.0.0.1:{port}/"));
        assert!(server.is_healthy());
        server.stop().unwrap();
        assert!(!server.process().is_running());
    }
}
