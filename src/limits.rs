use crate::model::Ms;

/// Earliest accepted timestamp (unix epoch).
pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;

/// Latest accepted timestamp (2100-01-01T00:00:00Z).
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;

/// Widest single booking: 30 days.
pub const MAX_SPAN_DURATION_MS: Ms = 30 * 24 * 3_600_000;

/// Cap on booking records (any status) per resource.
pub const MAX_BOOKINGS_PER_RESOURCE: usize = 10_000;
