//! Background loop for [`ValuePinner`](super::ValuePinner).

use std::sync::Arc;

use tracing::{debug, info};

use super::{PinState, PinnedValue, PinnerConfig, SOURCE, Shared};
use crate::error::{Error, Result};
use crate::memory::{ProcessMemory, ProcessProvider, ProcessTarget};
use crate::resolver::PointerResolver;
use crate::retry::{Backoff, LogThrottle};
use crate::signal::StopSignal;
use crate::status::StatusSink;

pub(super) struct PinLoop<P: ProcessProvider> {
    pub provider: Arc<P>,
    pub target: ProcessTarget,
    pub process: Option<P::Process>,
    pub resolver: PointerResolver,
    pub values: Arc<[PinnedValue]>,
    pub config: PinnerConfig,
    pub stop: Arc<StopSignal>,
    pub shared: Arc<Shared>,
    pub sink: StatusSink,
}

impl<P: ProcessProvider> PinLoop<P> {
    pub fn run(mut self) {
        let mut backoff = Backoff::new(self.config.backoff.clone());
        let mut throttle = LogThrottle::new(self.config.log_window);
        // A reopened handle counts as recovered only once a write pass lands
        let mut healthy = true;
        let mut reopened: Option<u32> = None;

        while !self.stop.is_stopped() {
            if self.process.is_some() {
                match self.write_pass() {
                    Ok(()) => {
                        if let Some(pid) = reopened.take() {
                            self.shared.set_state(PinState::Pinning);
                            self.sink.info(
                                SOURCE,
                                format!("Reconnected to {} (pid {})", self.target, pid),
                            );
                        }
                        if !healthy {
                            healthy = true;
                            backoff.reset();
                            throttle.reset();
                        }
                        if self.stop.wait(self.config.interval) {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!("Pin write failed: {}", e);
                        self.disconnect();
                        if healthy {
                            healthy = false;
                            self.sink
                                .error(SOURCE, format!("Lost connection to {}: {}", self.target, e));
                            continue;
                        }
                        reopened = None;
                        if throttle.ready() {
                            self.sink
                                .info(SOURCE, format!("Waiting for {}: {}", self.target, e));
                        }
                        let delay = backoff.next_delay();
                        if self.stop.wait(delay.duration()) {
                            break;
                        }
                    }
                }
                continue;
            }

            match self.reconnect() {
                Ok(pid) => {
                    debug!("Reopened {} (pid {})", self.target, pid);
                    reopened = Some(pid);
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    debug!("Reconnect failed: {} (next attempt in {:?})", e, delay.duration());
                    if throttle.ready() {
                        self.sink.info(
                            SOURCE,
                            format!("Waiting for {}: {}", self.target, e),
                        );
                    }
                    if self.stop.wait(delay.duration()) {
                        break;
                    }
                }
            }
        }

        // Release the handle before the owner observes the stop
        self.process = None;
        self.resolver.clear();
        info!("Pin loop exited");
    }

    /// Write every pinned value once.
    fn write_pass(&mut self) -> Result<()> {
        let Some(process) = self.process.as_ref() else {
            return Err(Error::StaleReference("no process handle".to_string()));
        };
        if !process.is_alive() {
            return Err(Error::StaleReference(format!(
                "{} (pid {}) exited",
                self.target,
                process.pid()
            )));
        }
        for pinned in self.values.iter() {
            self.resolver.write(process, &pinned.field, pinned.value)?;
        }
        Ok(())
    }

    fn disconnect(&mut self) {
        self.process = None;
        self.resolver.clear();
        self.shared.set_state(PinState::Reconnecting);
    }

    /// Reopen the target and re-resolve every field. The pinned values are
    /// kept as captured.
    fn reconnect(&mut self) -> Result<u32> {
        let process = self.provider.open(&self.target)?;
        self.resolver.clear();
        for pinned in self.values.iter() {
            if self.resolver.resolve(&process, &pinned.field).is_none() {
                return Err(Error::Unresolved(pinned.field.name.clone()));
            }
        }
        let pid = process.pid();
        self.process = Some(process);
        Ok(pid)
    }
}
