//! Attach/agent seam and the owned session pair.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::memory::ProcessTarget;

/// A message pushed by the injected agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum AgentMessage {
    Send { payload: Value },
    Error { description: String },
}

/// Callback receiving agent messages, invoked on the backend's delivery thread.
pub type MessageHandler = Arc<dyn Fn(AgentMessage) + Send + Sync>;

/// Something that can attach to a target process.
pub trait InstrumentationBackend: Send + Sync + 'static {
    type Session: TargetSession + 'static;

    fn attach(&self, target: &ProcessTarget) -> Result<Self::Session>;
}

/// An attached target.
pub trait TargetSession: Send {
    type Agent: Agent + 'static;

    /// Load the agent and route its messages to `handler`. The agent stays
    /// passive until [`Agent::start`] is called.
    fn load_agent(&mut self, handler: MessageHandler) -> Result<Self::Agent>;

    fn is_attached(&self) -> bool;

    fn detach(&mut self) -> Result<()>;
}

/// An agent loaded into the target.
pub trait Agent: Send {
    fn start(&mut self) -> Result<()>;

    fn is_loaded(&self) -> bool;

    fn unload(&mut self) -> Result<()>;
}

/// Failures collected while tearing a session down.
#[derive(Debug, Default)]
pub struct TeardownReport {
    pub failures: Vec<Error>,
}

impl TeardownReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// An attached session and its loaded agent, torn down together.
pub struct InstrumentationSession<S: TargetSession> {
    session: S,
    agent: S::Agent,
}

impl<S: TargetSession> InstrumentationSession<S> {
    /// Attach, load the agent, then start it.
    ///
    /// Whatever was acquired is released again if a later step fails.
    pub fn establish<B>(backend: &B, target: &ProcessTarget, handler: MessageHandler) -> Result<Self>
    where
        B: InstrumentationBackend<Session = S>,
    {
        let mut session = backend.attach(target)?;
        let agent = match session.load_agent(handler) {
            Ok(agent) => agent,
            Err(e) => {
                if let Err(detach_err) = session.detach() {
                    warn!("Detach after failed load: {}", detach_err);
                }
                return Err(e);
            }
        };

        let mut pair = Self { session, agent };
        if let Err(e) = pair.agent.start() {
            let report = pair.teardown();
            debug!("Teardown after failed start: {:?}", report);
            return Err(e);
        }
        Ok(pair)
    }

    /// Both the session and the agent still report themselves usable.
    pub fn is_present(&self) -> bool {
        self.session.is_attached() && self.agent.is_loaded()
    }

    /// Unload the agent and detach. Both are attempted regardless of the other's
    /// outcome, including a panic in either.
    pub fn teardown(self) -> TeardownReport {
        let Self {
            mut session,
            mut agent,
        } = self;
        let mut report = TeardownReport::default();

        if let Some(e) = attempt("unload", || agent.unload()) {
            report.failures.push(e);
        }
        drop(agent);

        if let Some(e) = attempt("detach", || session.detach()) {
            report.failures.push(e);
        }
        drop(session);

        report
    }
}

fn attempt(step: &str, f: impl FnOnce() -> Result<()>) -> Option<Error> {
    let error = match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(())) => return None,
        Ok(Err(e)) => Error::TeardownFailed(format!("{step}: {e}")),
        Err(_) => Error::TeardownFailed(format!("{step} panicked")),
    };
    warn!("{}", error);
    Some(error)
}
