//! Receipt clock for stamping feed events
//!
//! Every interval boundary written to storage comes from a single `FeedClock`,
//! so a `starting_at` and the `ending_at` that later closes it are always
//! comparable. Stamps are strictly increasing at microsecond resolution, the
//! precision storage keeps.

use chrono::{DateTime, Duration, DurationRound, Utc};

/// Strictly monotonic wall clock
#[derive(Debug, Default)]
pub struct FeedClock {
    last: Option<DateTime<Utc>>,
}

impl FeedClock {
    pub fn new() -> Self {
        Self { last: None }
    }

    /// Current time, bumped past the previous stamp if the wall clock stalled
    /// or stepped backwards
    pub fn now(&mut self) -> DateTime<Utc> {
        self.observe(Utc::now())
    }

    /// Stamp an externally supplied instant
    pub fn observe(&mut self, at: DateTime<Utc>) -> DateTime<Utc> {
        let at = truncate_micros(at);
        let stamp = match self.last {
            Some(last) if at <= last => last + Duration::microseconds(1),
            _ => at,
        };
        self.last = Some(stamp);
        stamp
    }
}

fn truncate_micros(at: DateTime<Utc>) -> DateTime<Utc> {
    at.duration_trunc(Duration::microseconds(1)).unwrap_or(at)
}
