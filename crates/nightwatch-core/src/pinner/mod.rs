//! Value pinning.
//!
//! A [`ValuePinner`] captures the live values of a set of fields once and
//! keeps writing them back on a short interval, so in-game spending never
//! sticks. The write loop runs on its own thread and survives a game restart:
//! when a write fails it drops the handle, reconnects with backoff and resumes
//! with the values captured at `start()`.
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use nightwatch_core::memory::{layout, ProcessTarget, SystemProcessProvider};
//! use nightwatch_core::pinner::ValuePinner;
//!
//! let mut pinner = ValuePinner::new(
//!     Arc::new(SystemProcessProvider),
//!     ProcessTarget::name(layout::PROCESS_NAME),
//!     layout::player::BASE_POINTER,
//!     config.pinned_fields(),
//! );
//! pinner.start()?;
//! // ...
//! pinner.stop();
//! ```

mod pin_loop;

use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use strum::{Display, IntoStaticStr};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::memory::layout::timing;
use crate::memory::{ProcessProvider, ProcessTarget};
use crate::resolver::{FieldSpec, PointerResolver};
use crate::retry::ExponentialBackoff;
use crate::signal::StopSignal;
use crate::status::StatusSink;

use pin_loop::PinLoop;

const SOURCE: &str = "pinner";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, IntoStaticStr)]
pub enum PinState {
    Idle,
    /// `start()` is opening the target and reading the values to pin
    Resolving,
    Pinning,
    /// The last write failed; the loop is reacquiring the target
    Reconnecting,
}

/// A field together with the value it is held at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PinnedValue {
    pub field: FieldSpec,
    pub value: i64,
}

#[derive(Debug, Clone)]
pub struct PinnerConfig {
    /// Delay between write passes
    pub interval: Duration,
    /// Policy for reconnect attempts
    pub backoff: ExponentialBackoff,
    /// Minimum spacing of repeated "still reconnecting" status lines
    pub log_window: Duration,
}

impl Default for PinnerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(timing::PIN_INTERVAL_MS),
            backoff: ExponentialBackoff::reconnect(),
            log_window: Duration::from_millis(timing::RECONNECT_LOG_WINDOW_MS),
        }
    }
}

/// State visible to both the owner and the loop thread.
#[derive(Debug)]
struct Shared {
    state: Mutex<PinState>,
    values: RwLock<Option<Arc<[PinnedValue]>>>,
}

impl Shared {
    fn new() -> Self {
        Self {
            state: Mutex::new(PinState::Idle),
            values: RwLock::new(None),
        }
    }

    fn state(&self) -> PinState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: PinState) {
        let mut current = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if *current != state {
            debug!("Pin state {} -> {}", *current, state);
            *current = state;
        }
    }

    fn values(&self) -> Option<Arc<[PinnedValue]>> {
        self.values.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn set_values(&self, values: Option<Arc<[PinnedValue]>>) {
        *self.values.write().unwrap_or_else(|e| e.into_inner()) = values;
    }
}

struct Worker {
    stop: Arc<StopSignal>,
    handle: JoinHandle<()>,
}

/// Holds a set of fields at fixed values.
///
/// The first field is the primary one: a zero there means the save is not
/// loaded yet, and `start()` refuses to pin.
pub struct ValuePinner<P: ProcessProvider> {
    provider: Arc<P>,
    target: ProcessTarget,
    base_pointer_offset: u64,
    fields: Arc<[FieldSpec]>,
    config: PinnerConfig,
    sink: StatusSink,
    shared: Arc<Shared>,
    worker: Option<Worker>,
}

impl<P: ProcessProvider> ValuePinner<P> {
    pub fn new(
        provider: Arc<P>,
        target: ProcessTarget,
        base_pointer_offset: u64,
        fields: impl Into<Arc<[FieldSpec]>>,
    ) -> Self {
        Self {
            provider,
            target,
            base_pointer_offset,
            fields: fields.into(),
            config: PinnerConfig::default(),
            sink: StatusSink::default(),
            shared: Arc::new(Shared::new()),
            worker: None,
        }
    }

    pub fn with_config(mut self, config: PinnerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_sink(mut self, sink: StatusSink) -> Self {
        self.sink = sink;
        self
    }

    pub fn state(&self) -> PinState {
        self.shared.state()
    }

    /// Values being held, or `None` while idle.
    pub fn pinned_values(&self) -> Option<Arc<[PinnedValue]>> {
        self.shared.values()
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }

    /// Capture the current values and start holding them.
    ///
    /// Does nothing if already running. Fails without starting the loop if the
    /// target is absent, a field cannot be resolved, or the primary field is
    /// still zero.
    pub fn start(&mut self) -> Result<()> {
        if self.worker.is_some() {
            return Ok(());
        }
        let Some(primary) = self.fields.first() else {
            return Err(Error::InvalidConfig("no fields to pin".to_string()));
        };

        self.shared.set_state(PinState::Resolving);
        let captured = match self.capture(primary) {
            Ok(captured) => captured,
            Err(e) => {
                self.shared.set_state(PinState::Idle);
                self.sink.error(SOURCE, format!("Pin not started: {e}"));
                return Err(e);
            }
        };
        let (process, resolver, values) = captured;

        self.shared.set_values(Some(Arc::clone(&values)));
        self.shared.set_state(PinState::Pinning);
        self.sink
            .info(SOURCE, format!("Pin started: {}", describe(&values)));

        let stop = Arc::new(StopSignal::new());
        let pin_loop = PinLoop {
            provider: Arc::clone(&self.provider),
            target: self.target.clone(),
            process: Some(process),
            resolver,
            values,
            config: self.config.clone(),
            stop: Arc::clone(&stop),
            shared: Arc::clone(&self.shared),
            sink: self.sink.clone(),
        };
        let spawned = thread::Builder::new()
            .name("nightwatch-pinner".to_string())
            .spawn(move || pin_loop.run());
        match spawned {
            Ok(handle) => {
                self.worker = Some(Worker { stop, handle });
                Ok(())
            }
            Err(e) => {
                self.shared.set_values(None);
                self.shared.set_state(PinState::Idle);
                Err(Error::Io(e))
            }
        }
    }

    /// Open the target, resolve every field and read the values to hold.
    fn capture(
        &self,
        primary: &FieldSpec,
    ) -> Result<(P::Process, PointerResolver, Arc<[PinnedValue]>)> {
        let process = self.provider.open(&self.target)?;
        let mut resolver = PointerResolver::new(self.base_pointer_offset);

        let values = self
            .fields
            .iter()
            .map(|field| {
                let value = resolver.read(&process, field)?;
                Ok(PinnedValue {
                    field: field.clone(),
                    value,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        if values.first().is_some_and(|v| v.value == 0) {
            return Err(Error::UninitializedField(primary.name.clone()));
        }
        Ok((process, resolver, values.into()))
    }

    /// Stop holding values and release the target.
    ///
    /// Returns once the loop thread has exited.
    pub fn stop(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        worker.stop.trigger();
        if worker.handle.join().is_err() {
            warn!("Pin loop thread panicked");
        }
        self.shared.set_values(None);
        self.shared.set_state(PinState::Idle);
        self.sink.info(SOURCE, "Pin stopped");
    }

    /// Start when idle, stop otherwise. Returns whether pinning is now active.
    pub fn toggle(&mut self) -> Result<bool> {
        if self.is_running() {
            self.stop();
            Ok(false)
        } else {
            self.start()?;
            Ok(true)
        }
    }
}

impl<P: ProcessProvider> Drop for ValuePinner<P> {
    fn drop(&mut self) {
        self.stop();
    }
}

fn describe(values: &[PinnedValue]) -> String {
    values
        .iter()
        .map(|v| format!("{}={}", v.field.name, v.value))
        .collect::<Vec<_>>()
        .join(", ")
}
