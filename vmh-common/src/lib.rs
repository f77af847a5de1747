//! VMH common library.
//!
//! Orchestration core for end-to-end tests of a full operating system running
//! inside a virtual machine. The system under test only exposes a framebuffer,
//! a remote command channel and raw network traffic, so everything here is
//! about synchronizing on visual and traffic state:
//!
//! - [`poll`]: bounded waits and retry-with-recovery
//! - [`screen`]: landmark waits and pointer/keyboard input on the framebuffer
//! - [`vm`]: the VM control facade, storage pool and guest helpers
//! - [`traffic`]: packet capture sinks and connection policy assertions
//! - [`scenario`]: scenario context, cleanup stack, step registry and library
//!
//! Image matching, hypervisor control and packet capture are consumed through
//! the backend traits in those modules; [`mock`] provides deterministic
//! in-memory implementations for tests and dry runs.

pub mod config;
pub mod errors;
pub mod mock;
pub mod poll;
pub mod process;
pub mod scenario;
pub mod screen;
pub mod testing;
pub mod traffic;
pub mod util;
pub mod vm;

pub use errors::{ErrorCode, HarnessError, HarnessResult};
pub use poll::{Poller, retry_with_recovery, wait_until, wait_until_ok};
pub use scenario::{Scenario, ScenarioContext, ScenarioReport, ScenarioRunner, StepCall};
pub use screen::{Landmark, Presence, Region, ScreenSync, UiMode, landmark_for};
pub use traffic::{AllowedHostSet, CapturedTraffic, Endpoint, Flow, PolicyTimeline, TrafficCapture};
pub use vm::{RemoteCommandResult, Vm, VmState};
