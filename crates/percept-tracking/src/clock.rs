//! Pipeline time shared with background tasks.
//!
//! Identities and saves are stamped with frame timestamps, which can be
//! far from the wall clock when recorded input is replayed. Housekeeping
//! that compares against those stamps reads the time from here: the
//! latest frame timestamp, advanced by the wall time elapsed since that
//! frame was seen.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use chrono::{DateTime, Duration, Utc};

/// Clock that follows the timestamps of processed frames.
///
/// Reads the wall clock until the first frame is observed.
#[derive(Debug, Default)]
pub struct FrameClock {
    latest: Mutex<Option<(DateTime<Utc>, Instant)>>,
}

impl FrameClock {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Option<(DateTime<Utc>, Instant)>> {
        self.latest.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record the timestamp of a frame being processed.
    pub fn observe(&self, timestamp: DateTime<Utc>) {
        *self.lock() = Some((timestamp, Instant::now()));
    }

    /// Current pipeline time.
    pub fn now(&self) -> DateTime<Utc> {
        match *self.lock() {
            Some((timestamp, seen)) => {
                timestamp + Duration::from_std(seen.elapsed()).unwrap_or_else(|_| Duration::zero())
            }
            None => Utc::now(),
        }
    }

    /// Timestamp of the latest observed frame.
    pub fn latest_frame(&self) -> Option<DateTime<Utc>> {
        self.lock().map(|(timestamp, _)| timestamp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wall_clock_before_first_frame() {
        let clock = FrameClock::new();
        let now = clock.now();

        assert!((Utc::now() - now).num_seconds().abs() < 5);
        assert_eq!(clock.latest_frame(), None);
    }

    #[test]
    fn test_follows_recorded_timestamps() {
        let clock = FrameClock::new();
        let recorded: DateTime<Utc> = "2024-05-01T12:00:00Z".parse().unwrap();
        clock.observe(recorded);

        std::thread::sleep(std::time::Duration::from_millis(10));
        let now = clock.now();
        assert!(now >= recorded + Duration::milliseconds(10));
        assert!(now < recorded + Duration::seconds(5));
        assert_eq!(clock.latest_frame(), Some(recorded));

        let next = recorded + Duration::milliseconds(100);
        clock.observe(next);
        assert!(clock.now() >= next);
    }
}
