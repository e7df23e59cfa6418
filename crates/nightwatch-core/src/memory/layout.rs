//! Memory layout constants for the NIGHTREIGN player data
//!
//! These offsets are reverse-engineered from one game build and are only
//! valid for it. They serve as configuration defaults.

/// Executable image name, also used as the main module name
pub const PROCESS_NAME: &str = "nightreign.exe";

/// Player data pointer, relative to the main module base
pub mod player {
    /// Module-relative location of the pointer to the player data block
    pub const BASE_POINTER: u64 = 0x03C0_78D0;

    /// Murk (暗痕) counter, i32
    pub const ANHEN: u64 = 0x530;

    /// Sovereign sigil (王证) counter, i32
    pub const WANGZHENG: u64 = 0x4BC;
}

/// Fields addressed directly from the module base
pub mod direct {
    /// Item quantity, i64
    pub const QUANTITY: u64 = 0x039A_A448;
}

/// Timing constants for the background loops
pub mod timing {
    /// Interval between pin writes (ms)
    pub const PIN_INTERVAL_MS: u64 = 50;

    /// Supervision tick while the instrumentation session is healthy (ms)
    pub const HEALTHY_TICK_MS: u64 = 1000;

    /// Poll interval while waiting for the target to launch (ms)
    pub const PROCESS_POLL_MS: u64 = 2000;

    /// Minimum spacing between repeated reconnect status lines (ms)
    pub const RECONNECT_LOG_WINDOW_MS: u64 = 10_000;
}

/// Loopback port the injected agent reports to
pub const AGENT_PORT: u16 = 27_015;

/// Export the agent library exposes as its explicit start entry point
pub const AGENT_START_EXPORT: &str = "agent_start";
