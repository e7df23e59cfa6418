use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tracing::debug;

use super::reader::{ReadMemory, WriteMemory};
use crate::error::Result;
use crate::signal::StopSignal;

/// Identity of one opened process instance.
///
/// Every successful open gets a fresh generation, so an address resolved
/// under one handle can be recognised as foreign to any later handle, even
/// if the OS reuses the pid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Generation(u64);

static NEXT_GENERATION: AtomicU64 = AtomicU64::new(1);

impl Generation {
    pub fn next() -> Self {
        Self(NEXT_GENERATION.fetch_add(1, Ordering::Relaxed))
    }

    pub fn value(self) -> u64 {
        self.0
    }
}

/// How to find the target process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessTarget {
    /// Executable name, matched case-insensitively
    Name(String),
    Pid(u32),
}

impl ProcessTarget {
    pub fn name(name: impl Into<String>) -> Self {
        ProcessTarget::Name(name.into())
    }
}

impl fmt::Display for ProcessTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessTarget::Name(name) => f.write_str(name),
            ProcessTarget::Pid(pid) => write!(f, "pid {pid}"),
        }
    }
}

/// An open connection to one process instance.
///
/// Dropping the value closes the connection. A handle is never revived:
/// once [`ProcessMemory::is_alive`] turns false the owner must discard it
/// and open a new one.
pub trait ProcessMemory: ReadMemory + WriteMemory + Send {
    fn pid(&self) -> u32;

    fn generation(&self) -> Generation;

    /// Load address of the main executable image
    fn module_base(&self) -> u64;

    /// Cheap liveness check on the handle itself, no memory read
    fn is_alive(&self) -> bool;
}

/// Opens handles to processes.
pub trait ProcessProvider: Send + Sync + 'static {
    type Process: ProcessMemory + 'static;

    /// Single-shot open. Fails with
    /// [`Error::ProcessNotFound`](crate::error::Error::ProcessNotFound) when the
    /// target is not running.
    fn open(&self, target: &ProcessTarget) -> Result<Self::Process>;
}

/// Whether [`open_process`] waits for the target to appear.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Fail immediately if the target is absent
    Once,
    /// Poll until the target appears or a stop is requested
    Wait { poll: Duration },
}

/// Open the target in the requested mode.
///
/// Returns `Ok(None)` only when a stop was requested while waiting.
pub fn open_process<P: ProcessProvider + ?Sized>(
    provider: &P,
    target: &ProcessTarget,
    mode: OpenMode,
    stop: &StopSignal,
) -> Result<Option<P::Process>> {
    loop {
        match provider.open(target) {
            Ok(process) => return Ok(Some(process)),
            Err(e) => match mode {
                OpenMode::Once => return Err(e),
                OpenMode::Wait { poll } => {
                    debug!("{} not available ({}), polling", target, e);
                    if stop.wait(poll) {
                        return Ok(None);
                    }
                }
            },
        }
    }
}

/// Provider backed by the operating system.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemProcessProvider;

impl ProcessProvider for SystemProcessProvider {
    type Process = super::ProcessHandle;

    fn open(&self, target: &ProcessTarget) -> Result<Self::Process> {
        super::ProcessHandle::open(target)
    }
}

#[cfg(not(any(target_os = "windows", target_os = "linux")))]
mod unsupported {
    use super::*;
    use crate::error::Error;

    /// Placeholder handle on platforms without a memory backend.
    #[derive(Debug)]
    pub struct ProcessHandle {
        never: std::convert::Infallible,
    }

    impl ProcessHandle {
        pub fn open(target: &ProcessTarget) -> Result<Self> {
            Err(Error::Unsupported(format!(
                "cannot open {target}: process memory access is only implemented for Windows and Linux"
            )))
        }
    }

    impl ReadMemory for ProcessHandle {
        fn read_bytes(&self, _address: u64, _size: usize) -> Result<Vec<u8>> {
            match self.never {}
        }
    }

    impl WriteMemory for ProcessHandle {
        fn write_bytes(&self, _address: u64, _data: &[u8]) -> Result<()> {
            match self.never {}
        }
    }

    impl ProcessMemory for ProcessHandle {
        fn pid(&self) -> u32 {
            match self.never {}
        }
        fn generation(&self) -> Generation {
            match self.never {}
        }
        fn module_base(&self) -> u64 {
            match self.never {}
        }
        fn is_alive(&self) -> bool {
            match self.never {}
        }
    }
}

#[cfg(not(any(target_os = "windows", target_os = "linux")))]
pub use unsupported::ProcessHandle;
