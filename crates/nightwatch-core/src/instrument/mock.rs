//! Scriptable instrumentation backend for testing.
//!
//! [`MockBackend`] records every attach/load/start/unload/detach, can be told
//! to fail (or panic in) the next occurrence of any step, and lets a test push
//! agent messages into whichever handler is currently registered.

use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::json;

use super::session::{Agent, AgentMessage, InstrumentationBackend, MessageHandler, TargetSession};
use crate::error::{Error, Result};
use crate::memory::ProcessTarget;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    Attach,
    /// `attach` panics instead of returning an error
    AttachPanic,
    Load,
    Start,
    Unload,
    /// `unload` panics instead of returning an error
    UnloadPanic,
    Detach,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MockStats {
    pub attaches: u32,
    pub loads: u32,
    pub starts: u32,
    pub unloads: u32,
    pub detaches: u32,
    /// Session values not yet dropped
    pub live_sessions: u32,
    /// Agent values not yet dropped
    pub live_agents: u32,
}

#[derive(Default)]
struct MockState {
    target_running: bool,
    /// Started agents stop reporting themselves loaded right away
    agents_exit: bool,
    pending: Vec<Failure>,
    epoch: u64,
    handler: Option<MessageHandler>,
    stats: MockStats,
}

impl MockState {
    fn take_failure(&mut self, failure: Failure) -> bool {
        match self.pending.iter().position(|f| *f == failure) {
            Some(i) => {
                self.pending.remove(i);
                true
            }
            None => false,
        }
    }
}

#[derive(Clone)]
pub struct MockBackend {
    state: Arc<Mutex<MockState>>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                target_running: true,
                ..Default::default()
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make the next occurrence of `failure`'s step fail.
    pub fn fail_next(&self, failure: Failure) {
        self.lock().pending.push(failure);
    }

    /// While not running, every attach fails with `ProcessNotFound`.
    pub fn set_target_running(&self, running: bool) {
        self.lock().target_running = running;
    }

    /// Make every agent exit immediately after `start`, as one that loses its
    /// connection back to the host would.
    pub fn set_agents_exit(&self, exit: bool) {
        self.lock().agents_exit = exit;
    }

    /// Simulate the target dying: every existing session and agent stops
    /// reporting itself usable.
    pub fn crash(&self) {
        let mut state = self.lock();
        state.epoch += 1;
        state.handler = None;
    }

    /// Deliver `message` to the started agent's handler.
    ///
    /// Returns `false` if no agent is currently started.
    pub fn push(&self, message: AgentMessage) -> bool {
        let handler = self.lock().handler.clone();
        match handler {
            Some(handler) => {
                handler(message);
                true
            }
            None => false,
        }
    }

    pub fn push_snapshot(&self, buff: &[u32], debuff: &[u32]) -> bool {
        self.push(AgentMessage::Send {
            payload: json!({ "buff": buff, "debuff": debuff }),
        })
    }

    pub fn stats(&self) -> MockStats {
        self.lock().stats.clone()
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl InstrumentationBackend for MockBackend {
    type Session = MockSession;

    fn attach(&self, target: &ProcessTarget) -> Result<MockSession> {
        let mut state = self.lock();
        if !state.target_running {
            return Err(Error::ProcessNotFound(target.to_string()));
        }
        state.stats.attaches += 1;
        if state.take_failure(Failure::Attach) {
            return Err(Error::Instrumentation("attach refused".to_string()));
        }
        if state.take_failure(Failure::AttachPanic) {
            drop(state);
            panic!("attach panicked");
        }
        state.stats.live_sessions += 1;
        Ok(MockSession {
            state: Arc::clone(&self.state),
            epoch: state.epoch,
            detached: false,
        })
    }
}

pub struct MockSession {
    state: Arc<Mutex<MockState>>,
    epoch: u64,
    detached: bool,
}

impl MockSession {
    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl TargetSession for MockSession {
    type Agent = MockAgent;

    fn load_agent(&mut self, handler: MessageHandler) -> Result<MockAgent> {
        let mut state = self.lock();
        state.stats.loads += 1;
        if state.take_failure(Failure::Load) {
            return Err(Error::Instrumentation("agent failed to load".to_string()));
        }
        state.stats.live_agents += 1;
        Ok(MockAgent {
            state: Arc::clone(&self.state),
            epoch: self.epoch,
            handler,
            loaded: true,
        })
    }

    fn is_attached(&self) -> bool {
        !self.detached && self.lock().epoch == self.epoch
    }

    fn detach(&mut self) -> Result<()> {
        let mut state = self.lock();
        state.stats.detaches += 1;
        if state.take_failure(Failure::Detach) {
            return Err(Error::Instrumentation("session already gone".to_string()));
        }
        drop(state);
        self.detached = true;
        Ok(())
    }
}

impl Drop for MockSession {
    fn drop(&mut self) {
        let mut state = self.lock();
        state.stats.live_sessions = state.stats.live_sessions.saturating_sub(1);
    }
}

pub struct MockAgent {
    state: Arc<Mutex<MockState>>,
    epoch: u64,
    handler: MessageHandler,
    loaded: bool,
}

impl MockAgent {
    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Agent for MockAgent {
    fn start(&mut self) -> Result<()> {
        let mut state = self.lock();
        state.stats.starts += 1;
        if state.take_failure(Failure::Start) {
            return Err(Error::Instrumentation("agent start failed".to_string()));
        }
        if state.agents_exit {
            drop(state);
            self.loaded = false;
            return Ok(());
        }
        // Messages flow only after an explicit start
        state.handler = Some(Arc::clone(&self.handler));
        Ok(())
    }

    fn is_loaded(&self) -> bool {
        self.loaded && self.lock().epoch == self.epoch
    }

    fn unload(&mut self) -> Result<()> {
        let mut state = self.lock();
        state.stats.unloads += 1;
        if state.epoch == self.epoch {
            state.handler = None;
        }
        let panic_now = state.take_failure(Failure::UnloadPanic);
        let fail_now = state.take_failure(Failure::Unload);
        drop(state);

        self.loaded = false;
        if panic_now {
            panic!("agent unload panicked");
        }
        if fail_now {
            return Err(Error::Instrumentation("script already destroyed".to_string()));
        }
        Ok(())
    }
}

impl Drop for MockAgent {
    fn drop(&mut self) {
        let mut state = self.lock();
        state.stats.live_agents = state.stats.live_agents.saturating_sub(1);
    }
}
