use crate::model::Ms;

pub const MAX_ZONES: usize = 10_000;
pub const MAX_SPOTS_PER_ZONE: usize = 5_000;
/// Largest single `bulk_generate_spots` request.
pub const MAX_BULK_GENERATE: u32 = 1_000;
pub const MAX_NAME_LEN: usize = 100;
pub const MAX_PLATE_LEN: usize = 20;
pub const MAX_HINT_LEN: usize = 255;
pub const MAX_TOKEN_LEN: usize = 255;
/// Ids accepted by one `find_available` call.
pub const MAX_QUERY_IDS: usize = 10_000;
/// Active reservations a single spot may hold at once.
pub const MAX_ACTIVE_PER_SPOT: usize = 10_000;

pub const MAX_RESERVATION_MS: Ms = 31 * 24 * 3_600_000;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2200-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 7_258_118_400_000;

/// Largest encoded WAL record. A length prefix above this is treated as a torn tail.
pub const MAX_WAL_RECORD_BYTES: usize = 16 * 1024 * 1024;
