use crate::time::Minutes;

// ── Slot shape ───────────────────────────────────────────────────

/// Length of the bookable session at the start of every slot.
pub const SESSION_MINUTES: Minutes = 60;

/// Break that follows the session inside the same slot.
pub const BREAK_MINUTES: Minutes = 30;

/// Every generated slot is exactly this long; rule windows are tiled by it.
pub const SLOT_MINUTES: Minutes = SESSION_MINUTES + BREAK_MINUTES;

/// Available slots shown per day unless configured otherwise.
pub const DEFAULT_DISPLAY_CAP: usize = 2;

// ── Input limits ─────────────────────────────────────────────────

pub const MAX_QUERY_DAYS: i64 = 92;
pub const MAX_ID_LEN: usize = 128;
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_RULES_PER_PROVIDER: usize = 64;
pub const MAX_BLACKOUTS_PER_PROVIDER: usize = 512;
pub const MAX_BOOKINGS_PER_PROVIDER: usize = 100_000;
