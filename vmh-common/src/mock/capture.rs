//! Capture backend fed by the test itself.

use crate::errors::{HarnessError, HarnessResult};
use crate::traffic::{CaptureBackend, CaptureSession, Flow};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Default)]
struct State {
    /// Pending flows per active link.
    active: HashMap<String, Vec<Flow>>,
    preloaded: HashMap<String, Vec<Flow>>,
    starts: Vec<String>,
    fail_start: Option<String>,
}

/// [`CaptureBackend`] whose frames come from [`MockCapture::emit`].
#[derive(Debug, Clone, Default)]
pub struct MockCapture {
    state: Arc<Mutex<State>>,
}

fn lock(state: &Mutex<State>) -> MutexGuard<'_, State> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MockCapture {
    pub fn new() -> Self {
        Self::default()
    }

    /// Flows handed to the next session started on `link`.
    pub fn preload(&self, link: &str, flows: impl IntoIterator<Item = Flow>) {
        lock(&self.state)
            .preloaded
            .entry(link.to_string())
            .or_default()
            .extend(flows);
    }

    /// A frame crosses `link`. Dropped when nothing is capturing there.
    pub fn emit(&self, link: &str, flow: Flow) {
        if let Some(pending) = lock(&self.state).active.get_mut(link) {
            pending.push(flow);
        }
    }

    /// Links on which a capture was started, in order.
    pub fn starts(&self) -> Vec<String> {
        lock(&self.state).starts.clone()
    }

    pub fn is_capturing(&self, link: &str) -> bool {
        lock(&self.state).active.contains_key(link)
    }

    pub fn fail_start(&self, message: impl Into<String>) {
        lock(&self.state).fail_start = Some(message.into());
    }
}

impl CaptureBackend for MockCapture {
    fn start(&self, link: &str) -> HarnessResult<Box<dyn CaptureSession>> {
        let mut state = lock(&self.state);
        if let Some(message) = &state.fail_start {
            return Err(HarnessError::backend("capture", message.clone()));
        }
        if state.active.contains_key(link) {
            return Err(HarnessError::backend("capture", format!("already capturing on '{link}'")));
        }
        let pending = state.preloaded.remove(link).unwrap_or_default();
        state.active.insert(link.to_string(), pending);
        state.starts.push(link.to_string());
        Ok(Box::new(MockSession {
            link: link.to_string(),
            state: Arc::clone(&self.state),
        }))
    }
}

struct MockSession {
    link: String,
    state: Arc<Mutex<State>>,
}

impl CaptureSession for MockSession {
    fn drain(&mut self) -> HarnessResult<Vec<Flow>> {
        Ok(lock(&self.state)
            .active
            .get_mut(&self.link)
            .map(std::mem::take)
            .unwrap_or_default())
    }

    fn stop(&mut self) -> HarnessResult<()> {
        lock(&self.state).active.remove(&self.link);
        Ok(())
    }
}
