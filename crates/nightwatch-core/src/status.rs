//! Operator-facing status lines.
//!
//! Components report transitions (connected, disconnected, retrying, pin
//! started/stopped) through a [`StatusSink`] supplied by the host. Per-tick
//! failures are not reported here; they go to `tracing` at debug level.

use std::fmt;
use std::sync::Arc;

use strum::{Display, IntoStaticStr};
use tracing::{error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
pub enum StatusLevel {
    Info,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusLine {
    pub level: StatusLevel,
    /// Component that produced the line, e.g. `"pinner"`
    pub source: &'static str,
    pub message: String,
}

impl fmt::Display for StatusLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.source, self.message)
    }
}

type SinkFn = dyn Fn(&StatusLine) + Send + Sync;

/// Cloneable callback receiving status lines.
#[derive(Clone)]
pub struct StatusSink(Arc<SinkFn>);

impl StatusSink {
    pub fn new(f: impl Fn(&StatusLine) + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    /// Sink that forwards every line to `tracing`.
    pub fn tracing() -> Self {
        Self::new(|line| match line.level {
            StatusLevel::Info => info!(source = line.source, "{}", line.message),
            StatusLevel::Error => error!(source = line.source, "{}", line.message),
        })
    }

    /// Sink that drops everything.
    pub fn silent() -> Self {
        Self::new(|_| {})
    }

    pub fn emit(&self, line: StatusLine) {
        (self.0)(&line);
    }

    pub fn info(&self, source: &'static str, message: impl Into<String>) {
        self.emit(StatusLine {
            level: StatusLevel::Info,
            source,
            message: message.into(),
        });
    }

    pub fn error(&self, source: &'static str, message: impl Into<String>) {
        self.emit(StatusLine {
            level: StatusLevel::Error,
            source,
            message: message.into(),
        });
    }
}

impl Default for StatusSink {
    fn default() -> Self {
        Self::tracing()
    }
}

impl fmt::Debug for StatusSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("StatusSink")
    }
}

/// Sink that records lines in memory, for tests.
#[cfg(test)]
#[derive(Debug, Clone, Default)]
pub struct RecordingSink {
    lines: Arc<std::sync::Mutex<Vec<StatusLine>>>,
}

#[cfg(test)]
impl RecordingSink {
    pub fn sink(&self) -> StatusSink {
        let lines = Arc::clone(&self.lines);
        StatusSink::new(move |line| {
            lines
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(line.clone());
        })
    }

    pub fn lines(&self) -> Vec<StatusLine> {
        self.lines.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.lines().iter().any(|l| l.message.contains(needle))
    }
}
