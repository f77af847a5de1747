//! Deterministic in-memory backends.
//!
//! Used by the unit and end-to-end tests and by `vmh plan check`. None of
//! them touch a real hypervisor, framebuffer or network link; the only
//! real I/O is the guest `curl` built-in, which performs a plain HTTP GET
//! so host-side helpers can be exercised end to end.

mod capture;
mod hypervisor;
mod screen;
mod shell;

pub use capture::MockCapture;
pub use hypervisor::MockHypervisor;
pub use screen::{InputEvent, MockScreen};
pub use shell::split_words;
