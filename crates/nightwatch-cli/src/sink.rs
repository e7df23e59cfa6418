//! Colored terminal output for status lines.

use nightwatch_core::{StatusLevel, StatusSink};
use owo_colors::OwoColorize;

/// Sink printing info lines in green and errors in red.
pub fn terminal() -> StatusSink {
    StatusSink::new(|line| match line.level {
        StatusLevel::Info => println!("{}", line.green()),
        StatusLevel::Error => println!("{}", line.red()),
    })
}
