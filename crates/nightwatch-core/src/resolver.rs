//! Pointer resolution for player data fields.
//!
//! The target keeps its player data block behind a single pointer stored at
//! a fixed module-relative location. A field's address is that pointer plus a
//! fixed field offset. Exactly one indirection is followed; the layout is a
//! reverse-engineered constant of one game build, not a general pointer path.
//!
//! Resolved addresses are cached per field and tagged with the handle
//! generation they were computed under. A cached entry is reused only for the
//! same generation, and any failed access through it evicts it, so the next
//! access re-resolves from the module base.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::memory::{Generation, ProcessMemory, Width};

/// How a field's address is derived from the module base.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    /// `*(module_base + base_pointer) + offset`
    #[default]
    Pointer,
    /// `module_base + offset`
    Direct,
}

/// A named scalar field in the target.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    #[serde(with = "crate::config::hex")]
    pub offset: u64,
    #[serde(default)]
    pub width: Width,
    #[serde(default)]
    pub kind: FieldKind,
}

impl FieldSpec {
    pub fn pointer(name: impl Into<String>, offset: u64, width: Width) -> Self {
        Self {
            name: name.into(),
            offset,
            width,
            kind: FieldKind::Pointer,
        }
    }

    pub fn direct(name: impl Into<String>, offset: u64, width: Width) -> Self {
        Self {
            name: name.into(),
            offset,
            width,
            kind: FieldKind::Direct,
        }
    }
}

/// A field address valid only for the handle generation it was computed under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedAddress {
    pub address: u64,
    pub generation: Generation,
}

/// Follow the single pointer hop.
///
/// Returns `None` when the pointer cannot be read or is still zero, which the
/// target uses for "player data not loaded yet".
pub fn resolve_pointer<M: ProcessMemory + ?Sized>(
    process: &M,
    base_pointer_offset: u64,
    field_offset: u64,
) -> Option<u64> {
    let slot = process.module_base().checked_add(base_pointer_offset)?;
    let pointer = match process.read_u64(slot) {
        Ok(p) => p,
        Err(e) => {
            debug!("Base pointer read failed: {}", e);
            return None;
        }
    };
    if pointer == 0 {
        return None;
    }
    pointer.checked_add(field_offset)
}

/// Caching resolver for a set of fields sharing one base pointer.
#[derive(Debug, Clone)]
pub struct PointerResolver {
    base_pointer_offset: u64,
    cache: HashMap<String, ResolvedAddress>,
}

impl PointerResolver {
    pub fn new(base_pointer_offset: u64) -> Self {
        Self {
            base_pointer_offset,
            cache: HashMap::new(),
        }
    }

    pub fn base_pointer_offset(&self) -> u64 {
        self.base_pointer_offset
    }

    /// Resolve `field`, reusing a cached address from the same generation.
    pub fn resolve<M: ProcessMemory + ?Sized>(
        &mut self,
        process: &M,
        field: &FieldSpec,
    ) -> Option<ResolvedAddress> {
        let generation = process.generation();
        if let Some(cached) = self.cache.get(&field.name) {
            if cached.generation == generation {
                return Some(*cached);
            }
            self.cache.remove(&field.name);
        }

        let address = match field.kind {
            FieldKind::Pointer => resolve_pointer(process, self.base_pointer_offset, field.offset)?,
            FieldKind::Direct => process.module_base().checked_add(field.offset)?,
        };
        let resolved = ResolvedAddress {
            address,
            generation,
        };
        self.cache.insert(field.name.clone(), resolved);
        Some(resolved)
    }

    /// Read `field`. A failed read evicts its cached address.
    pub fn read<M: ProcessMemory + ?Sized>(&mut self, process: &M, field: &FieldSpec) -> Result<i64> {
        let resolved = self
            .resolve(process, field)
            .ok_or_else(|| Error::Unresolved(field.name.clone()))?;
        process
            .read_scalar(resolved.address, field.width)
            .inspect_err(|_| self.invalidate(&field.name))
    }

    /// Write `field`. A failed write evicts its cached address.
    pub fn write<M: ProcessMemory + ?Sized>(
        &mut self,
        process: &M,
        field: &FieldSpec,
        value: i64,
    ) -> Result<()> {
        let resolved = self
            .resolve(process, field)
            .ok_or_else(|| Error::Unresolved(field.name.clone()))?;
        process
            .write_scalar(resolved.address, field.width, value)
            .inspect_err(|_| self.invalidate(&field.name))
    }

    pub fn cached(&self, name: &str) -> Option<ResolvedAddress> {
        self.cache.get(name).copied()
    }

    pub fn invalidate(&mut self, name: &str) {
        if self.cache.remove(name).is_some() {
            debug!("Invalidated cached address for {}", name);
        }
    }

    /// Drop every cached address, e.g. when the handle is discarded.
    pub fn clear(&mut self) {
        self.cache.clear();
    }
}
