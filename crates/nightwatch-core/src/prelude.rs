//! Prelude module for convenient imports
//!
//! ```ignore
//! use nightwatch_core::prelude::*;
//! ```

// Components
pub use crate::fields::{FieldLatch, FieldReader};
pub use crate::instrument::{InstrumentationChannel, Snapshot};
pub use crate::pinner::{PinState, ValuePinner};

// Process access
pub use crate::memory::{ProcessMemory, ProcessProvider, ProcessTarget, SystemProcessProvider};

// Configuration and reporting
pub use crate::config::Config;
pub use crate::resolver::FieldSpec;
pub use crate::status::StatusSink;

// Error handling
pub use crate::error::{Error, Result};
