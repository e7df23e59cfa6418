//! Supervision loop for [`InstrumentationChannel`](super::InstrumentationChannel).

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use tracing::{debug, info};

use super::session::{
    InstrumentationBackend, InstrumentationSession, MessageHandler, TargetSession,
};
use super::{ChannelConfig, ChannelState, SOURCE, Shared};
use crate::error::{Error, Result};
use crate::memory::ProcessTarget;
use crate::retry::{Backoff, LogThrottle};
use crate::signal::StopSignal;
use crate::status::StatusSink;

pub(super) struct Supervisor<B: InstrumentationBackend> {
    pub backend: Arc<B>,
    pub target: ProcessTarget,
    pub config: ChannelConfig,
    pub stop: Arc<StopSignal>,
    pub shared: Arc<Shared>,
    pub sink: StatusSink,
}

/// A live session and what has been reported about it.
struct Attached<S: TargetSession> {
    session: InstrumentationSession<S>,
    /// Survived at least one healthy tick
    confirmed: bool,
    /// "Connected" was reported, so its loss is reported too
    announced: bool,
}

impl<B: InstrumentationBackend> Supervisor<B> {
    pub fn run(self) {
        let handler: MessageHandler = {
            let shared = Arc::clone(&self.shared);
            Arc::new(move |message| shared.deliver(message))
        };
        let mut backoff = Backoff::new(self.config.backoff.clone());
        let mut connecting = LogThrottle::new(self.config.log_window);
        let mut link = LogThrottle::new(self.config.log_window);
        let mut current: Option<Attached<B::Session>> = None;

        while !self.stop.is_stopped() {
            if let Some(attached) = current.as_mut()
                && attached.session.is_present()
            {
                if self.stop.wait(self.config.healthy_tick) {
                    break;
                }
                if !attached.confirmed && attached.session.is_present() {
                    attached.confirmed = true;
                    backoff.reset();
                    connecting.reset();
                    link.reset();
                }
                continue;
            }

            // Never reattach over a half-torn-down session
            if let Some(stale) = current.take() {
                self.shared.set_state(ChannelState::Detached);
                if stale.announced {
                    self.sink
                        .error(SOURCE, format!("Lost connection to {}", self.target));
                }
                let report = stale.session.teardown();
                debug!("Teardown of stale session: {:?}", report);

                // Lost before its first healthy tick: the attach did not hold
                if !stale.confirmed {
                    let delay = backoff.next_delay();
                    debug!("Session lost right after attach (next attempt in {:?})", delay.duration());
                    if self.stop.wait(delay.duration()) {
                        break;
                    }
                }
            }

            self.shared.set_state(ChannelState::Attaching);
            if connecting.ready() {
                self.sink
                    .info(SOURCE, format!("Connecting to {}...", self.target));
            }

            match self.establish(&handler) {
                Ok(session) => {
                    let announced = link.ready();
                    if announced {
                        self.sink
                            .info(SOURCE, format!("Connected to {}", self.target));
                    }
                    current = Some(Attached {
                        session,
                        confirmed: false,
                        announced,
                    });
                    self.shared.set_state(ChannelState::Attached);
                }
                Err(e) => {
                    self.shared.set_state(ChannelState::Detached);
                    let delay = backoff.next_delay();
                    debug!("Attach failed: {} (next attempt in {:?})", e, delay.duration());
                    if self.stop.wait(delay.duration()) {
                        break;
                    }
                }
            }
        }

        if let Some(attached) = current.take() {
            let report = attached.session.teardown();
            if !report.is_clean() {
                debug!("Teardown on stop: {:?}", report);
            }
        }
        self.shared.set_state(ChannelState::Detached);
        info!("Supervision loop exited");
    }

    /// Attach, load and start, with a panicking backend reported as an error.
    fn establish(&self, handler: &MessageHandler) -> Result<InstrumentationSession<B::Session>> {
        panic::catch_unwind(AssertUnwindSafe(|| {
            InstrumentationSession::establish(&*self.backend, &self.target, Arc::clone(handler))
        }))
        .unwrap_or_else(|_| Err(Error::Instrumentation("attach panicked".to_string())))
    }
}
