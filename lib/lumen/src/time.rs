use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Seconds since the UNIX epoch.
#[inline]
pub fn timestamp_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before UNIX epoch")
        .as_secs()
}

/// A restartable interval timer.
///
/// All expiry checks take the caller's notion of "now" so the engine can be
/// driven with synthetic time in tests.
#[derive(Debug, Clone, Copy)]
pub struct Timer {
    interval: Duration,
    started: Instant,
}

impl Timer {
    #[inline]
    pub fn new(interval: Duration, now: Instant) -> Timer {
        Timer { interval, started: now }
    }

    #[inline]
    pub fn interval(&self) -> Duration {
        self.interval
    }

    #[inline]
    pub fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.started) >= self.interval
    }

    #[inline]
    pub fn reset(&mut self, now: Instant) {
        self.started = now;
    }

    /// Time left until expiry, zero if already expired.
    #[inline]
    pub fn remaining(&self, now: Instant) -> Duration {
        self.interval
            .checked_sub(now.duration_since(self.started))
            .unwrap_or(Duration::from_secs(0))
    }
}
