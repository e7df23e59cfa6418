//! On-demand field access.
//!
//! [`FieldReader`] serves one-off reads and writes from the host (a hotkey, a
//! CLI command) without a background loop. The process is opened lazily on
//! first use and dropped as soon as it stops answering, so every call after a
//! game restart starts from a clean handle and cache.

use std::sync::Arc;

use tracing::debug;

use crate::error::{Error, Result};
use crate::memory::{ProcessMemory, ProcessProvider, ProcessTarget, ReadMemory};
use crate::resolver::{FieldSpec, PointerResolver};

pub struct FieldReader<P: ProcessProvider> {
    provider: Arc<P>,
    target: ProcessTarget,
    resolver: PointerResolver,
    process: Option<P::Process>,
}

impl<P: ProcessProvider> FieldReader<P> {
    pub fn new(provider: Arc<P>, target: ProcessTarget, base_pointer_offset: u64) -> Self {
        Self {
            provider,
            target,
            resolver: PointerResolver::new(base_pointer_offset),
            process: None,
        }
    }

    fn ensure_open(&mut self) -> Result<()> {
        if self.process.as_ref().is_some_and(|p| !p.is_alive()) {
            debug!("Dropping dead handle to {}", self.target);
            self.reset();
        }
        if self.process.is_none() {
            self.process = Some(self.provider.open(&self.target)?);
        }
        Ok(())
    }

    /// Read the live value of `field`.
    pub fn get(&mut self, field: &FieldSpec) -> Result<i64> {
        self.ensure_open()?;
        let result = match self.process.as_ref() {
            Some(process) => self.resolver.read(process, field),
            None => Err(Error::ProcessNotFound(self.target.to_string())),
        };
        self.after_failure(&result);
        result
    }

    /// Write `value` to `field`. Negative values are rejected.
    pub fn set(&mut self, field: &FieldSpec, value: i64) -> Result<()> {
        if value < 0 {
            return Err(Error::InvalidValue {
                field: field.name.clone(),
                value,
            });
        }

        self.ensure_open()?;
        let Some(process) = self.process.as_ref() else {
            return Err(Error::ProcessNotFound(self.target.to_string()));
        };

        // A cached address must still be readable before it is written to
        if let Some(cached) = self.resolver.cached(&field.name)
            && cached.generation == process.generation()
            && process.read_bytes(cached.address, 1).is_err()
        {
            self.resolver.invalidate(&field.name);
        }

        let result = self.resolver.write(process, field, value);
        self.after_failure(&result);
        result
    }

    /// Drop the handle and every cached address.
    pub fn reset(&mut self) {
        self.process = None;
        self.resolver.clear();
    }

    pub fn is_connected(&self) -> bool {
        self.process.as_ref().is_some_and(|p| p.is_alive())
    }

    fn after_failure<T>(&mut self, result: &Result<T>) {
        if result.is_err() && !self.is_connected() {
            self.reset();
        }
    }
}

/// What a [`FieldLatch::toggle`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LatchAction {
    Captured(i64),
    Restored(i64),
}

/// Two-step "remember, then restore" for a single field.
#[derive(Debug, Clone)]
pub struct FieldLatch {
    field: FieldSpec,
    captured: Option<i64>,
}

impl FieldLatch {
    pub fn new(field: FieldSpec) -> Self {
        Self {
            field,
            captured: None,
        }
    }

    pub fn field(&self) -> &FieldSpec {
        &self.field
    }

    pub fn captured(&self) -> Option<i64> {
        self.captured
    }

    /// Capture the live value, or write the captured value back.
    ///
    /// A failed restore keeps the captured value so the next toggle retries.
    pub fn toggle<P: ProcessProvider>(&mut self, reader: &mut FieldReader<P>) -> Result<LatchAction> {
        match self.captured {
            None => {
                let value = reader.get(&self.field)?;
                self.captured = Some(value);
                Ok(LatchAction::Captured(value))
            }
            Some(value) => {
                reader.set(&self.field, value)?;
                self.captured = None;
                Ok(LatchAction::Restored(value))
            }
        }
    }
}
