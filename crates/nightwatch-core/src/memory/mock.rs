//! In-memory stand-in for the target process.
//!
//! A [`MockTarget`] models one game installation: it can be running or not,
//! it can be killed and relaunched (each launch is a new instance, so old
//! handles die), and tests can poke its memory as an external actor would.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use super::process::{Generation, ProcessMemory, ProcessProvider, ProcessTarget};
use super::reader::{ReadMemory, WriteMemory};
use crate::error::{Error, Result};

#[derive(Debug)]
struct MockInner {
    memory: HashMap<u64, u8>,
    module_base: u64,
    running: bool,
    instance: u64,
    pid: u32,
    fail_writes: bool,
    writes: u64,
}

/// Shared, cloneable handle to the simulated process.
#[derive(Debug, Clone)]
pub struct MockTarget {
    inner: Arc<Mutex<MockInner>>,
}

impl MockTarget {
    /// A running target with its main module loaded at `module_base`.
    pub fn new(module_base: u64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(MockInner {
                memory: HashMap::new(),
                module_base,
                running: true,
                instance: 1,
                pid: 1000,
                fail_writes: false,
                writes: 0,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MockInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Store a pointer at `module_base + offset`.
    pub fn with_pointer(self, offset: u64, value: u64) -> Self {
        let base = self.module_base();
        self.set_u64(base + offset, value);
        self
    }

    pub fn with_i32(self, address: u64, value: i32) -> Self {
        self.set_i32(address, value);
        self
    }

    pub fn with_i64(self, address: u64, value: i64) -> Self {
        self.set_i64(address, value);
        self
    }

    pub fn set_bytes(&self, address: u64, data: &[u8]) {
        let mut inner = self.lock();
        for (i, b) in data.iter().enumerate() {
            inner.memory.insert(address + i as u64, *b);
        }
    }

    pub fn set_u64(&self, address: u64, value: u64) {
        self.set_bytes(address, &value.to_le_bytes());
    }

    pub fn set_i32(&self, address: u64, value: i32) {
        self.set_bytes(address, &value.to_le_bytes());
    }

    pub fn set_i64(&self, address: u64, value: i64) {
        self.set_bytes(address, &value.to_le_bytes());
    }

    /// Store a pointer at `module_base + offset` of the current instance.
    pub fn set_pointer(&self, offset: u64, value: u64) {
        let base = self.module_base();
        self.set_u64(base + offset, value);
    }

    /// Remove `size` bytes at `address` so reads there fail.
    pub fn unmap(&self, address: u64, size: usize) {
        let mut inner = self.lock();
        for i in 0..size as u64 {
            inner.memory.remove(&(address + i));
        }
    }

    fn peek<const N: usize>(&self, address: u64) -> Option<[u8; N]> {
        let inner = self.lock();
        let mut out = [0u8; N];
        for (i, slot) in out.iter_mut().enumerate() {
            *slot = *inner.memory.get(&(address + i as u64))?;
        }
        Some(out)
    }

    pub fn peek_i32(&self, address: u64) -> Option<i32> {
        self.peek(address).map(i32::from_le_bytes)
    }

    pub fn peek_i64(&self, address: u64) -> Option<i64> {
        self.peek(address).map(i64::from_le_bytes)
    }

    pub fn module_base(&self) -> u64 {
        self.lock().module_base
    }

    pub fn is_running(&self) -> bool {
        self.lock().running
    }

    /// Terminate the process. Existing handles die.
    pub fn kill(&self) {
        self.lock().running = false;
    }

    /// Start a fresh instance at the same module base with empty memory.
    pub fn relaunch(&self) {
        let base = self.module_base();
        self.relaunch_at(base);
    }

    /// Start a fresh instance at a new module base with empty memory.
    pub fn relaunch_at(&self, module_base: u64) {
        let mut inner = self.lock();
        inner.running = true;
        inner.instance += 1;
        inner.pid += 1;
        inner.module_base = module_base;
        inner.memory.clear();
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.lock().fail_writes = fail;
    }

    /// Number of successful writes through any handle.
    pub fn write_count(&self) -> u64 {
        self.lock().writes
    }
}

/// Provider opening handles to a [`MockTarget`].
#[derive(Debug)]
pub struct MockProvider {
    target: MockTarget,
    opens: AtomicU32,
}

impl MockProvider {
    pub fn new(target: MockTarget) -> Self {
        Self {
            target,
            opens: AtomicU32::new(0),
        }
    }

    pub fn target(&self) -> &MockTarget {
        &self.target
    }

    /// Number of successful opens so far.
    pub fn opens(&self) -> u32 {
        self.opens.load(Ordering::SeqCst)
    }
}

impl ProcessProvider for MockProvider {
    type Process = MockProcess;

    fn open(&self, target: &ProcessTarget) -> Result<MockProcess> {
        let inner = self.target.lock();
        if !inner.running {
            return Err(Error::ProcessNotFound(target.to_string()));
        }
        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(MockProcess {
            target: self.target.clone(),
            instance: inner.instance,
            pid: inner.pid,
            module_base: inner.module_base,
            generation: Generation::next(),
        })
    }
}

/// Handle to one instance of a [`MockTarget`].
#[derive(Debug)]
pub struct MockProcess {
    target: MockTarget,
    instance: u64,
    pid: u32,
    module_base: u64,
    generation: Generation,
}

impl MockProcess {
    fn alive(&self, inner: &MockInner) -> bool {
        inner.running && inner.instance == self.instance
    }
}

impl ReadMemory for MockProcess {
    fn read_bytes(&self, address: u64, size: usize) -> Result<Vec<u8>> {
        let inner = self.target.lock();
        if !self.alive(&inner) {
            return Err(Error::read_failed(address, "process exited"));
        }
        (0..size as u64)
            .map(|i| {
                inner
                    .memory
                    .get(&(address + i))
                    .copied()
                    .ok_or_else(|| Error::read_failed(address, "unmapped"))
            })
            .collect()
    }
}

impl WriteMemory for MockProcess {
    fn write_bytes(&self, address: u64, data: &[u8]) -> Result<()> {
        let mut inner = self.target.lock();
        if !self.alive(&inner) {
            return Err(Error::write_failed(address, "process exited"));
        }
        if inner.fail_writes {
            return Err(Error::write_failed(address, "access denied"));
        }
        for (i, b) in data.iter().enumerate() {
            inner.memory.insert(address + i as u64, *b);
        }
        inner.writes += 1;
        Ok(())
    }
}

impl ProcessMemory for MockProcess {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn generation(&self) -> Generation {
        self.generation
    }

    fn module_base(&self) -> u64 {
        self.module_base
    }

    fn is_alive(&self) -> bool {
        let inner = self.target.lock();
        self.alive(&inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_dies_on_relaunch() {
        let target = MockTarget::new(0x1000).with_i32(0x2000, 7);
        let provider = MockProvider::new(target.clone());
        let old = provider.open(&ProcessTarget::Pid(1)).unwrap();
        assert_eq!(old.read_i32(0x2000).unwrap(), 7);

        target.relaunch();
        assert!(!old.is_alive());
        assert!(old.read_i32(0x2000).is_err());

        let new = provider.open(&ProcessTarget::Pid(1)).unwrap();
        assert!(new.is_alive());
        assert_ne!(new.generation(), old.generation());
        assert!(new.read_i32(0x2000).is_err(), "memory is fresh after relaunch");
    }

    #[test]
    fn test_failing_writes() {
        let target = MockTarget::new(0x1000);
        let provider = MockProvider::new(target.clone());
        let process = provider.open(&ProcessTarget::Pid(1)).unwrap();

        process.write_i32(0x10, 1).unwrap();
        target.set_fail_writes(true);
        assert!(process.write_i32(0x10, 2).is_err());
        assert_eq!(target.peek_i32(0x10), Some(1));
        assert_eq!(target.write_count(), 1);
    }
}
