use time::Duration;

/// Longest single assignment or unavailability window.
pub const MAX_SPAN_DURATION: Duration = Duration::days(31);

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_ROLE_LEN: usize = 64;
pub const MAX_LOCATION_LEN: usize = 256;
pub const MAX_ROLE_ASSIGNMENTS: usize = 16;

/// Per-staff cap on stored assignments plus unavailability windows.
pub const MAX_INTERVALS_PER_STAFF: usize = 100_000;

pub const MAX_EMAIL_LEN: usize = 320;
pub const MAX_RESET_CODE_LEN: usize = 16;

/// How long a password-reset code stays valid, as stated in the email.
pub const RESET_CODE_TTL_MINUTES: u32 = 5;
