use crate::model::Ms;

/// Earliest accepted instant (Unix epoch).
pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;
/// Latest accepted instant, 9999-12-31T23:59:59.999Z.
pub const MAX_VALID_TIMESTAMP_MS: Ms = 253_402_300_799_999;
/// Longest single booking: 366 days.
pub const MAX_SPAN_DURATION_MS: Ms = 366 * 24 * 3_600_000;

pub const MAX_ROOMS: usize = 100_000;
pub const MAX_ROOM_NO_LEN: usize = 64;
pub const MAX_GUEST_ID_LEN: usize = 256;

pub const DEFAULT_LIST_LIMIT: usize = 100;
pub const MAX_LIST_LIMIT: usize = 500;

/// Times an update re-reserves after the booking moved under it.
pub const MAX_SCOPE_RETRIES: usize = 3;

/// Default wait for a room's write reservation.
pub const DEFAULT_LOCK_WAIT_MS: u64 = 5_000;
