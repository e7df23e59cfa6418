//! In-process instrumentation channel.
//!
//! An agent loaded into the target pushes [`Snapshot`]s of the player's
//! active effects. [`InstrumentationChannel`] keeps an attached session alive
//! on a supervision thread, tears it down completely and reattaches whenever
//! it stops being usable, and stores the latest snapshot for callers to poll.
//!
//! The attach mechanism sits behind [`InstrumentationBackend`]; the Windows
//! [`InjectorBackend`] loads a DLL agent that reports over a loopback
//! [`MessagePump`].

mod inject;
#[cfg(test)]
mod mock;
mod pump;
mod session;
mod snapshot;
mod supervisor;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use strum::{Display, IntoStaticStr};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::memory::ProcessTarget;
use crate::memory::layout::timing;
use crate::retry::ExponentialBackoff;
use crate::signal::StopSignal;
use crate::status::StatusSink;

pub use inject::{InjectedAgent, InjectedSession, InjectorBackend, InjectorConfig};
pub use pump::MessagePump;
pub use session::{
    Agent, AgentMessage, InstrumentationBackend, InstrumentationSession, MessageHandler,
    TargetSession, TeardownReport,
};
pub use snapshot::{MAX_ENTRIES, Snapshot};

use supervisor::Supervisor;

const SOURCE: &str = "hook";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, IntoStaticStr)]
pub enum ChannelState {
    Detached,
    Attaching,
    Attached,
}

#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Supervision tick while the session is healthy
    pub healthy_tick: Duration,
    /// Wait between failed attach attempts
    pub backoff: ExponentialBackoff,
    /// Minimum spacing of repeated "connecting" status lines
    pub log_window: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            healthy_tick: Duration::from_millis(timing::HEALTHY_TICK_MS),
            backoff: ExponentialBackoff::fast(),
            log_window: Duration::from_millis(timing::RECONNECT_LOG_WINDOW_MS),
        }
    }
}

#[derive(Debug)]
struct Shared {
    state: Mutex<ChannelState>,
    snapshot: RwLock<Option<Arc<Snapshot>>>,
    sequence: AtomicU64,
}

impl Shared {
    fn new() -> Self {
        Self {
            state: Mutex::new(ChannelState::Detached),
            snapshot: RwLock::new(None),
            sequence: AtomicU64::new(0),
        }
    }

    fn state(&self) -> ChannelState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: ChannelState) {
        let mut current = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if *current != state {
            debug!("Channel state {} -> {}", *current, state);
            *current = state;
        }
    }

    fn snapshot(&self) -> Option<Arc<Snapshot>> {
        self.snapshot.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn replace_snapshot(&self, snapshot: Option<Arc<Snapshot>>) {
        *self.snapshot.write().unwrap_or_else(|e| e.into_inner()) = snapshot;
    }

    /// Handle one agent message. Each `send` replaces the stored snapshot.
    fn deliver(&self, message: AgentMessage) {
        match message {
            AgentMessage::Send { payload } => {
                let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
                match Snapshot::from_payload(payload, sequence) {
                    Ok(snapshot) => self.replace_snapshot(Some(Arc::new(snapshot))),
                    Err(e) => debug!("Ignoring agent payload: {}", e),
                }
            }
            AgentMessage::Error { description } => warn!("Agent error: {}", description),
        }
    }
}

struct Worker {
    stop: Arc<StopSignal>,
    handle: JoinHandle<()>,
}

/// Supervised instrumentation session with a latest-snapshot store.
pub struct InstrumentationChannel<B: InstrumentationBackend> {
    backend: Arc<B>,
    target: ProcessTarget,
    config: ChannelConfig,
    sink: StatusSink,
    shared: Arc<Shared>,
    worker: Option<Worker>,
}

impl<B: InstrumentationBackend> InstrumentationChannel<B> {
    pub fn new(backend: Arc<B>, target: ProcessTarget) -> Self {
        Self {
            backend,
            target,
            config: ChannelConfig::default(),
            sink: StatusSink::default(),
            shared: Arc::new(Shared::new()),
            worker: None,
        }
    }

    pub fn with_config(mut self, config: ChannelConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_sink(mut self, sink: StatusSink) -> Self {
        self.sink = sink;
        self
    }

    pub fn state(&self) -> ChannelState {
        self.shared.state()
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }

    /// Latest snapshot, or `None` if nothing arrived since `start()`.
    pub fn snapshot(&self) -> Option<Arc<Snapshot>> {
        self.shared.snapshot()
    }

    /// Start the supervision thread. Does nothing if already running.
    pub fn start(&mut self) -> Result<()> {
        if self.worker.is_some() {
            return Ok(());
        }
        self.shared.replace_snapshot(None);

        let stop = Arc::new(StopSignal::new());
        let supervisor = Supervisor {
            backend: Arc::clone(&self.backend),
            target: self.target.clone(),
            config: self.config.clone(),
            stop: Arc::clone(&stop),
            shared: Arc::clone(&self.shared),
            sink: self.sink.clone(),
        };
        let handle = thread::Builder::new()
            .name("nightwatch-hook".to_string())
            .spawn(move || supervisor.run())
            .map_err(Error::Io)?;

        self.worker = Some(Worker { stop, handle });
        self.sink.info(SOURCE, "Hook started");
        Ok(())
    }

    /// Stop supervising and tear the session down. Returns once the session
    /// has been released.
    pub fn stop(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        worker.stop.trigger();
        if worker.handle.join().is_err() {
            warn!("Supervision thread panicked");
        }
        self.shared.set_state(ChannelState::Detached);
        self.sink.info(SOURCE, "Hook stopped");
    }
}

impl<B: InstrumentationBackend> Drop for InstrumentationChannel<B> {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::RecordingSink;
    use super::mock::{Failure, MockBackend};
    use std::time::Instant;

    fn test_config() -> ChannelConfig {
        ChannelConfig {
            healthy_tick: Duration::from_millis(10),
            backoff: ExponentialBackoff {
                initial: Duration::from_millis(5),
                ceiling: Duration::from_millis(20),
                attempts_before_cooldown: 50,
                cooldown: Duration::from_millis(50),
            },
            log_window: Duration::from_secs(10),
        }
    }

    fn channel(backend: &MockBackend) -> InstrumentationChannel<MockBackend> {
        InstrumentationChannel::new(
            Arc::new(backend.clone()),
            ProcessTarget::name("nightreign.exe"),
        )
        .with_config(test_config())
        .with_sink(StatusSink::silent())
    }

    fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        condition()
    }

    #[test]
    fn test_latest_snapshot_wins() {
        let backend = MockBackend::new();
        let mut channel = channel(&backend);
        assert!(channel.snapshot().is_none());
        channel.start().unwrap();

        assert!(wait_until(|| backend.push_snapshot(&[1], &[])));
        backend.push_snapshot(&[2], &[20]);
        backend.push_snapshot(&[3, 4], &[30]);

        let snapshot = channel.snapshot().unwrap();
        assert_eq!(snapshot.buff, vec![3, 4]);
        assert_eq!(snapshot.debuff, vec![30]);
        assert_eq!(snapshot.sequence, 3);
        channel.stop();
    }

    #[test]
    fn test_agent_passive_until_started() {
        let backend = MockBackend::new();
        backend.fail_next(Failure::Start);
        let mut channel = channel(&backend);
        channel.start().unwrap();

        assert!(wait_until(|| backend.stats().starts >= 2));
        assert!(wait_until(|| channel.state() == ChannelState::Attached));
        assert!(backend.push_snapshot(&[5], &[]));
        assert_eq!(channel.snapshot().unwrap().buff, vec![5]);
        channel.stop();
    }

    #[test]
    fn test_reattaches_after_crash() {
        let backend = MockBackend::new();
        let mut channel = channel(&backend);
        channel.start().unwrap();
        assert!(wait_until(|| channel.state() == ChannelState::Attached));

        backend.crash();
        assert!(wait_until(|| backend.stats().attaches == 2));
        assert!(wait_until(|| channel.state() == ChannelState::Attached));

        let stats = backend.stats();
        assert_eq!(stats.unloads, 1);
        assert_eq!(stats.detaches, 1);
        assert_eq!(stats.live_sessions, 1);
        assert_eq!(stats.live_agents, 1);
        channel.stop();
    }

    #[test]
    fn test_panicking_unload_does_not_leak_session() {
        let backend = MockBackend::new();
        let mut channel = channel(&backend);
        channel.start().unwrap();
        assert!(wait_until(|| channel.state() == ChannelState::Attached));

        backend.fail_next(Failure::UnloadPanic);
        backend.crash();
        assert!(wait_until(|| backend.stats().attaches == 2));
        assert!(wait_until(|| channel.state() == ChannelState::Attached));
        assert_eq!(backend.stats().live_sessions, 1);
        assert_eq!(backend.stats().live_agents, 1);
        channel.stop();
        assert_eq!(backend.stats().live_sessions, 0);
    }

    #[test]
    fn test_waits_for_target() {
        let backend = MockBackend::new();
        backend.set_target_running(false);
        let mut channel = channel(&backend);
        channel.start().unwrap();

        thread::sleep(Duration::from_millis(50));
        assert_ne!(channel.state(), ChannelState::Attached);
        assert_eq!(backend.stats().attaches, 0);

        backend.set_target_running(true);
        assert!(wait_until(|| channel.state() == ChannelState::Attached));
        channel.stop();
    }

    #[test]
    fn test_stop_releases_session() {
        let backend = MockBackend::new();
        let mut channel = channel(&backend);
        channel.start().unwrap();
        channel.start().unwrap();
        assert!(wait_until(|| channel.state() == ChannelState::Attached));

        channel.stop();
        channel.stop();
        let stats = backend.stats();
        assert_eq!(stats.attaches, 1);
        assert_eq!(stats.live_sessions, 0);
        assert_eq!(stats.live_agents, 0);
        assert_eq!(channel.state(), ChannelState::Detached);
        assert!(!backend.push_snapshot(&[1], &[]));
    }

    #[test]
    fn test_restart_clears_snapshot() {
        let backend = MockBackend::new();
        let mut channel = channel(&backend);
        channel.start().unwrap();
        assert!(wait_until(|| backend.push_snapshot(&[1], &[])));
        channel.stop();
        assert!(channel.snapshot().is_some());

        channel.start().unwrap();
        assert!(channel.snapshot().is_none());
        channel.stop();
    }

    #[test]
    fn test_snapshot_reads_never_tear() {
        let backend = MockBackend::new();
        let mut channel = channel(&backend);
        channel.start().unwrap();
        assert!(wait_until(|| backend.push_snapshot(&[0], &[0])));

        let shared = Arc::clone(&channel.shared);
        let reader = thread::spawn(move || {
            for _ in 0..2_000 {
                if let Some(s) = shared.snapshot() {
                    assert_eq!(s.buff, s.debuff);
                }
            }
        });
        for i in 1..500u32 {
            backend.push_snapshot(&[i], &[i]);
        }
        reader.join().unwrap();
        channel.stop();
    }

    #[test]
    fn test_agent_error_keeps_snapshot() {
        let backend = MockBackend::new();
        let mut channel = channel(&backend);
        channel.start().unwrap();
        assert!(wait_until(|| backend.push_snapshot(&[9], &[])));
        backend.push(AgentMessage::Error {
            description: "pattern not found".to_string(),
        });
        assert_eq!(channel.snapshot().unwrap().buff, vec![9]);
        channel.stop();
    }

    #[test]
    fn test_status_lines() {
        let backend = MockBackend::new();
        let recorder = RecordingSink::default();
        let mut channel = channel(&backend).with_sink(recorder.sink());
        channel.start().unwrap();
        assert!(wait_until(|| recorder.contains("Connected to nightreign.exe")));

        backend.crash();
        assert!(wait_until(|| recorder.contains("Lost connection")));
        channel.stop();
        assert!(recorder.contains("Hook stopped"));
    }

    #[test]
    fn test_agent_exiting_after_start_backs_off() {
        let backend = MockBackend::new();
        backend.set_agents_exit(true);
        let recorder = RecordingSink::default();
        let mut channel = channel(&backend)
            .with_config(ChannelConfig {
                backoff: ExponentialBackoff {
                    initial: Duration::from_millis(100),
                    ceiling: Duration::from_millis(100),
                    attempts_before_cooldown: 50,
                    cooldown: Duration::from_millis(100),
                },
                ..test_config()
            })
            .with_sink(recorder.sink());
        channel.start().unwrap();

        thread::sleep(Duration::from_millis(350));
        let attaches = backend.stats().attaches;
        assert!((1..=5).contains(&attaches), "attaches = {attaches}");
        // Hook started, Connecting, then one Connected/Lost pair per log window
        assert!(recorder.lines().len() <= 4, "{:?}", recorder.lines());

        backend.set_agents_exit(false);
        assert!(wait_until(|| backend.push_snapshot(&[1], &[])));
        channel.stop();
        assert_eq!(backend.stats().live_sessions, 0);
    }

    #[test]
    fn test_reported_loss_after_healthy_session() {
        let backend = MockBackend::new();
        let recorder = RecordingSink::default();
        let mut channel = channel(&backend).with_sink(recorder.sink());
        channel.start().unwrap();
        assert!(wait_until(|| channel.state() == ChannelState::Attached));
        thread::sleep(Duration::from_millis(50));

        backend.crash();
        assert!(wait_until(|| backend.stats().attaches == 2));
        assert!(wait_until(|| channel.state() == ChannelState::Attached));
        channel.stop();

        let count = |needle: &str| {
            recorder
                .lines()
                .iter()
                .filter(|l| l.message.starts_with(needle))
                .count()
        };
        assert_eq!(count("Connected to"), 2);
        assert_eq!(count("Lost connection"), 1);
    }

    #[test]
    fn test_panicking_attach_keeps_supervising() {
        let backend = MockBackend::new();
        backend.fail_next(Failure::AttachPanic);
        let mut channel = channel(&backend);
        channel.start().unwrap();

        assert!(wait_until(|| channel.state() == ChannelState::Attached));
        assert_eq!(backend.stats().attaches, 2);
        assert!(backend.push_snapshot(&[3], &[]));
        channel.stop();
    }
}
