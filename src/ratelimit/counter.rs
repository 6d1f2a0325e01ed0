//! Fixed-window counter entries.

use std::time::Duration;
use tokio::time::Instant;

/// Requests observed for one key in its current window.
///
/// A window is expired once `now - window_start >= interval`; the next hit
/// then starts a fresh window instead of accumulating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterEntry {
    /// Requests observed in the current window
    count: u64,
    /// When the current window began
    window_start: Instant,
    /// Window length the entry was last hit with
    interval: Duration,
}

impl CounterEntry {
    /// Create an entry for the first request of a window.
    pub fn new(now: Instant, interval: Duration) -> Self {
        Self {
            count: 1,
            window_start: now,
            interval,
        }
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn window_start(&self) -> Instant {
        self.window_start
    }

    /// Whether the window has fully elapsed at `now`.
    pub fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.window_start) >= self.interval
    }

    /// Whether the entry may be evicted: its window plus one grace interval
    /// has elapsed.
    pub fn is_stale(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.window_start) >= self.interval.saturating_mul(2)
    }

    /// Record one request, resetting the window first if it has expired.
    ///
    /// Returns the post-increment count and the window start.
    pub fn hit(&mut self, now: Instant, interval: Duration) -> (u64, Instant) {
        self.interval = interval;

        if self.is_expired(now) {
            self.count = 1;
            self.window_start = now;
        } else {
            self.count = self.count.saturating_add(1);
        }

        (self.count, self.window_start)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINUTE: Duration = Duration::from_secs(60);

    #[test]
    fn test_new_entry_counts_one() {
        let now = Instant::now();
        let entry = CounterEntry::new(now, MINUTE);

        assert_eq!(entry.count(), 1);
        assert_eq!(entry.window_start(), now);
        assert!(!entry.is_expired(now));
    }

    #[test]
    fn test_hit_within_window_accumulates() {
        let start = Instant::now();
        let mut entry = CounterEntry::new(start, MINUTE);

        let (count, window_start) = entry.hit(start + Duration::from_secs(30), MINUTE);

        assert_eq!(count, 2);
        assert_eq!(window_start, start);
    }

    #[test]
    fn test_hit_at_window_boundary_resets() {
        let start = Instant::now();
        let mut entry = CounterEntry::new(start, MINUTE);
        entry.hit(start, MINUTE);
        entry.hit(start, MINUTE);

        let later = start + MINUTE;
        let (count, window_start) = entry.hit(later, MINUTE);

        assert_eq!(count, 1);
        assert_eq!(window_start, later);
    }

    #[test]
    fn test_staleness_includes_grace_interval() {
        let start = Instant::now();
        let entry = CounterEntry::new(start, MINUTE);

        assert!(entry.is_expired(start + MINUTE));
        assert!(!entry.is_stale(start + MINUTE));
        assert!(!entry.is_stale(start + Duration::from_secs(119)));
        assert!(entry.is_stale(start + Duration::from_secs(120)));
    }
}
