//! # nightwatch-core
//!
//! Core library for the NIGHTREIGN value pinner and effect monitor.
//!
//! This crate provides:
//! - Process discovery and scalar memory access (Windows, and Linux for
//!   Wine/Proton)
//! - One-hop pointer resolution with per-handle address caching
//! - A background value pinner that survives game restarts
//! - A supervised instrumentation channel that stores the latest agent snapshot
//! - The shared reconnect backoff used by both loops

pub mod config;
pub mod error;
pub mod fields;
pub mod instrument;
pub mod memory;
pub mod pinner;
pub mod prelude;
pub mod resolver;
pub mod retry;
pub mod signal;
pub mod status;

pub use config::Config;
pub use error::{Error, ErrorKind, Result};
pub use fields::{FieldLatch, FieldReader, LatchAction};
pub use instrument::{
    ChannelConfig, ChannelState, InjectorBackend, InjectorConfig, InstrumentationBackend,
    InstrumentationChannel, Snapshot,
};
pub use memory::{
    OpenMode, ProcessHandle, ProcessMemory, ProcessProvider, ProcessTarget, ReadMemory,
    SystemProcessProvider, Width, WriteMemory, open_process,
};
pub use pinner::{PinState, PinnedValue, PinnerConfig, ValuePinner};
pub use resolver::{FieldKind, FieldSpec, PointerResolver, ResolvedAddress};
pub use retry::{Backoff, ExponentialBackoff, FixedDelay, LogThrottle, RetryDelay, RetryStrategy};
pub use signal::StopSignal;
pub use status::{StatusLevel, StatusLine, StatusSink};
