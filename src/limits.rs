/// Spacing of candidate slot starts in the availability grid.
pub const SLOT_GRANULARITY_MINUTES: u32 = 15;

pub const MINUTES_PER_DAY: u32 = 24 * 60;

pub const MAX_NAME_LEN: usize = 200;
pub const MAX_EMAIL_LEN: usize = 254;
pub const MAX_PHONE_LEN: usize = 32;
pub const MAX_NOTES_LEN: usize = 2_000;

pub const MAX_SERVICE_DURATION_MINUTES: u32 = 12 * 60;

/// Per employee per date.
pub const MAX_RESERVATIONS_PER_DAY: usize = 512;

/// Per bucket (category, section, or the category root).
pub const MAX_BUCKET_ITEMS: usize = 10_000;

/// SMS reminders go out this long before the appointment starts.
pub const SMS_REMINDER_LEAD_HOURS: i64 = 24;

/// Largest WAL payload. A longer length prefix is read as a corrupt tail.
pub const MAX_RECORD_LEN: u32 = 16 * 1024 * 1024;
