use strum::{Display, IntoStaticStr};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Process not found: {0}")]
    ProcessNotFound(String),

    #[error("Failed to open process: {0}")]
    ProcessOpenFailed(String),

    #[error("Failed to read process memory at address {address:#x}: {message}")]
    MemoryReadFailed { address: u64, message: String },

    #[error("Failed to write process memory at address {address:#x}: {message}")]
    MemoryWriteFailed { address: u64, message: String },

    #[error("Module not found: {0}")]
    ModuleNotFound(String),

    #[error("Field '{0}' could not be resolved")]
    Unresolved(String),

    #[error("Field '{0}' has not been initialized by the target")]
    UninitializedField(String),

    #[error("Stale reference: {0}")]
    StaleReference(String),

    #[error("Invalid value for field '{field}': {value}")]
    InvalidValue { field: String, value: i64 },

    #[error("Instrumentation failed: {0}")]
    Instrumentation(String),

    #[error("Teardown failed: {0}")]
    TeardownFailed(String),

    #[error("Unsupported on this platform: {0}")]
    Unsupported(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification used by the background loops to pick a recovery path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, IntoStaticStr)]
pub enum ErrorKind {
    /// Target process absent
    NotFound,
    /// A resolved address, handle or session stopped working
    StaleReference,
    /// The pointer chain resolved but the target has not assigned a value yet
    UninitializedField,
    /// Unload/detach failed; always best-effort
    TeardownFailure,
    Other,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::ProcessNotFound(_) | Error::ModuleNotFound(_) => ErrorKind::NotFound,
            Error::MemoryReadFailed { .. }
            | Error::MemoryWriteFailed { .. }
            | Error::Unresolved(_)
            | Error::StaleReference(_)
            | Error::Instrumentation(_) => ErrorKind::StaleReference,
            Error::UninitializedField(_) => ErrorKind::UninitializedField,
            Error::TeardownFailed(_) => ErrorKind::TeardownFailure,
            _ => ErrorKind::Other,
        }
    }

    /// Check if this error means the target process is not running
    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    pub(crate) fn read_failed(address: u64, message: impl Into<String>) -> Self {
        Error::MemoryReadFailed {
            address,
            message: message.into(),
        }
    }

    pub(crate) fn write_failed(address: u64, message: impl Into<String>) -> Self {
        Error::MemoryWriteFailed {
            address,
            message: message.into(),
        }
    }
}
