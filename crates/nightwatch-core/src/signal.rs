//! Interruptible stop signal shared between a component and its worker thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// A stop request that background loops observe between steps.
///
/// Waits on this signal return as soon as [`StopSignal::trigger`] is called,
/// so a loop sleeping between pin ticks or reconnect attempts reacts to
/// `stop()` immediately instead of after the full delay.
#[derive(Debug, Default)]
pub struct StopSignal {
    stopped: AtomicBool,
    condvar: Condvar,
    mutex: Mutex<()>,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a stop and wake every waiting thread.
    pub fn trigger(&self) {
        // Hold the mutex so a waiter cannot miss the notification between
        // checking the flag and parking.
        let _guard = self.mutex.lock().unwrap_or_else(|e| e.into_inner());
        self.stopped.store(true, Ordering::SeqCst);
        self.condvar.notify_all();
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Wait for `duration` or until a stop is requested.
    ///
    /// Returns `true` if a stop was requested.
    pub fn wait(&self, duration: Duration) -> bool {
        if self.is_stopped() {
            return true;
        }

        let guard = self.mutex.lock().unwrap_or_else(|e| e.into_inner());
        match self
            .condvar
            .wait_timeout_while(guard, duration, |_| !self.is_stopped())
        {
            Ok((_, timeout)) => !timeout.timed_out(),
            Err(poisoned) => !poisoned.into_inner().1.timed_out(),
        }
    }
}
