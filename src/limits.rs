use crate::model::Ms;

pub const MS_PER_DAY: Ms = 86_400_000;
pub const MS_PER_HOUR: Ms = 3_600_000;

/// Owner decision window for manual-confirmation vehicles.
pub const OWNER_DECISION_WINDOW_MS: Ms = 3 * MS_PER_HOUR;

/// Default time a failed-but-retryable payment keeps holding its dates.
pub const DEFAULT_PAYMENT_GRACE_MS: Ms = 24 * MS_PER_HOUR;

pub const SWEEP_INTERVAL_SECS: u64 = 5;

pub const MIN_RENTER_AGE: u32 = 18;
pub const MAX_RENTER_AGE: u32 = 120;
pub const MIN_PHONE_DIGITS: usize = 7;
pub const MAX_PHONE_DIGITS: usize = 15;
pub const MAX_PHONE_LEN: usize = 32;

// 2000-01-01 .. 2200-01-01
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
pub const MAX_VALID_TIMESTAMP_MS: Ms = 7_258_118_400_000;

pub const MAX_RENTAL_DAYS: i64 = 365;

/// Largest rate, deposit or delivery fee accepted, in minor units (ten million).
/// Any price built from capped inputs over `MAX_RENTAL_DAYS` stays far inside i64.
pub const MAX_AMOUNT_MINOR: i64 = 1_000_000_000;
pub const MAX_QUERY_WINDOW_DAYS: i64 = 3 * 366;

pub const MAX_VEHICLES_PER_TENANT: usize = 100_000;
pub const MAX_LOCATIONS_PER_TENANT: usize = 10_000;
pub const MAX_RESERVATIONS_PER_VEHICLE: usize = 10_000;
pub const MAX_NAME_LEN: usize = 256;

pub const MAX_TENANTS: usize = 1024;
pub const MAX_TENANT_NAME_LEN: usize = 128;
