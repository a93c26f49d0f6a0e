//! Core constants for the ring-buffer runtime and the controller.

use std::time::Duration;

/// Maximum number of reader groups a single ring buffer can carry.
///
/// The ready queues for all groups are laid out in the shared region at
/// creation time, so this bounds the fan-out of one buffer.
pub const MAX_READER_GROUPS: usize = 16;

/// Maximum number of slots in a single ring buffer.
pub const MAX_SLOTS: usize = 65_536;

/// Cache line size for alignment (64 bytes on most CPUs)
pub const CACHE_LINE_SIZE: usize = 64;

/// Longest sleep a blocked endpoint takes between polls of the shared
/// flags. Bounds the wakeup latency after `pause()`/`shutdown()`.
pub const MAX_PARK_INTERVAL: Duration = Duration::from_millis(1);

/// Supervision sampling cadence of the controller.
pub const SUPERVISE_INTERVAL: Duration = Duration::from_millis(500);

/// Half-life of the commit-rate EWMA reported by `buffer_status`.
pub const RATE_HALF_LIFE_SECS: f64 = 1.0;

/// Grace period the controller allows the graph to drain after ingest
/// has been paused, before shutdown is forced.
pub const DRAIN_GRACE: Duration = Duration::from_secs(5);

/// Magic number identifying a sluice shared ring-buffer region.
pub const REGION_MAGIC: u64 = 0x534c_5543_455f_5242; // "SLUCE_RB"

/// Shared-region format version.
pub const REGION_VERSION: u32 = 1;
