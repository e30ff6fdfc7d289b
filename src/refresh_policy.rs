//! Pure scheduling function for the next credential refresh.

use std::time::Duration;

use chrono::{DateTime, Utc};

const ONE_HOUR: i64 = 3600;
const DEFAULT_REFRESH_BUFFER_SECONDS: i64 = 240;

/// Returns the delay until the next refresh should start, given a certificate
/// expiration and the current time.
///
/// - If the remaining lifetime exceeds one hour, refresh at the halfway point.
/// - Else if it exceeds `refresh_buffer_seconds`, refresh `refresh_buffer_seconds` before expiry.
/// - Otherwise refresh immediately.
pub fn refresh_delay(expiration: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    refresh_delay_with_buffer(expiration, now, DEFAULT_REFRESH_BUFFER_SECONDS)
}

/// Same as [`refresh_delay`] but with an overridable refresh buffer, for tests that need to
/// exercise the near-expiry path without waiting on a full 4-minute floor.
pub fn refresh_delay_with_buffer(
    expiration: DateTime<Utc>,
    now: DateTime<Utc>,
    refresh_buffer_seconds: i64,
) -> Duration {
    let remaining = (expiration - now).num_seconds();

    if remaining > ONE_HOUR {
        Duration::from_secs((remaining / 2) as u64)
    } else if remaining > refresh_buffer_seconds {
        Duration::from_secs((remaining - refresh_buffer_seconds) as u64)
    } else {
        Duration::ZERO
    }
}
