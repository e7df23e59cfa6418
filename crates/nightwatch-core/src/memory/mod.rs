pub mod layout;
mod process;
mod reader;

#[cfg(target_os = "linux")]
mod procfs;
#[cfg(target_os = "windows")]
pub(crate) mod win32;

#[cfg(test)]
pub mod mock;

pub use process::*;
pub use reader::{ReadMemory, Width, WriteMemory};

#[cfg(target_os = "linux")]
pub use procfs::ProcessHandle;
#[cfg(target_os = "windows")]
pub use win32::ProcessHandle;

#[cfg(test)]
pub use mock::{MockProcess, MockProvider, MockTarget};
