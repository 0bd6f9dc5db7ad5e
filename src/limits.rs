use crate::model::Ms;

pub const MAX_COURTS: usize = 512;
pub const MAX_NAME_LEN: usize = 128;
pub const MAX_ZONE_LEN: usize = 64;
pub const MAX_HOLDER_ID_LEN: usize = 128;

/// Active holds a single holder may keep at once (one cart).
pub const MAX_HOLDS_PER_HOLDER: usize = 32;
pub const MAX_BATCH_SIZE: usize = 32;
pub const MAX_ENTRIES_PER_DAY: usize = 256;

pub const DEFAULT_RECURRING_WEEKS: u32 = 4;
pub const MAX_RECURRING_WEEKS: u32 = 12;

/// Matches the five-minute checkout countdown shown to customers.
pub const DEFAULT_HOLD_TTL_MS: Ms = 300_000;
pub const MIN_HOLD_TTL_MS: Ms = 1;
pub const MAX_HOLD_TTL_MS: Ms = 3_600_000;

/// How far ahead a slot may be held, in days.
pub const MAX_ADVANCE_DAYS: i64 = 120;

/// How long an expired hold id keeps answering `Expired` instead of `NotFound`.
pub const TOMBSTONE_RETENTION_MS: Ms = 3_600_000;
