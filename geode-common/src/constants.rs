//! Process-wide constants shared by module runners and managers.

/// Poll timeout for each module's mailbox loop, in milliseconds.
pub const MODULE_POLL_TIMEOUT_MS: u64 = 50;

/// Poll timeout used by test harness output channels, in milliseconds.
pub const BROKER_POLL_TIMEOUT_MS: u64 = 100;

/// Upper bound on the number of machines a deployment may address.
pub const MAX_NUM_MACHINES: u32 = 1000;

/// Maximum number of distinct keys tracked by one partition's lock table.
pub const LOCK_TABLE_SIZE_LIMIT: usize = 1_000_000;
