/// Fixed one-hour slots per calendar day.
pub const SLOTS_PER_DAY: u8 = 24;

pub const MAX_MACHINES: usize = 100_000;
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_DESCRIPTION_LEN: usize = 4096;

/// Accepted connections before new ones are turned away.
pub const DEFAULT_MAX_CONNECTIONS: usize = 256;
