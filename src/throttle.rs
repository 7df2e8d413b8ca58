//! Rate-limited logging for repeated recoverable conditions.

/// Suppresses log storms from conditions that repeat at high frequency
/// (transport timeouts, duplicate rejects) while the system is under the
/// very attack it exists to mitigate.
///
/// The first `limit` occurrences are logged, then only every `repeat`-th
/// one. `reset` is called after a successful operation so the next
/// failure burst is reported from the start again.
pub struct LimitedLog {
    limit: u32,
    repeat: u32,
    total: u32,
    since_reset: u32,
}

impl LimitedLog {
    pub fn new(limit: u32, repeat: u32) -> LimitedLog {
        LimitedLog {
            limit,
            repeat,
            total: 0,
            since_reset: 0,
        }
    }

    /// Count an occurrence; log it at warn level if it is not suppressed.
    pub fn warn(&mut self, message: &str) {
        if self.since_reset < self.limit {
            log::warn!("{} (repeat {})", message, self.total);
        } else if self.since_reset == self.limit {
            log::warn!(
                "{} (repeat {}) ... suppressing, logging one in {} until reset",
                message,
                self.total,
                self.repeat
            );
        } else if self.repeat > 0 && self.total % self.repeat == 0 {
            log::warn!("{} (repeat {})", message, self.total);
        }
        self.total = self.total.wrapping_add(1);
        self.since_reset = self.since_reset.saturating_add(1);
    }

    /// Consecutive occurrences since the last reset.
    pub fn streak(&self) -> u32 {
        self.since_reset
    }

    /// Forget the current failure streak.
    pub fn reset(&mut self) {
        self.since_reset = 0;
    }
}

impl Default for LimitedLog {
    fn default() -> Self {
        LimitedLog::new(5, 1000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_streak_tracks_and_resets() {
        let mut ll = LimitedLog::new(2, 10);
        assert_eq!(ll.streak(), 0);
        ll.warn("boom");
        ll.warn("boom");
        ll.warn("boom");
        assert_eq!(ll.streak(), 3);
        ll.reset();
        assert_eq!(ll.streak(), 0);
        ll.warn("boom");
        assert_eq!(ll.streak(), 1);
    }
}
