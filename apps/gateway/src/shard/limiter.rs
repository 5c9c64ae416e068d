//! Outbound send rate limiter
//!
//! Fixed-window token bucket: `capacity` sends per `window`, the window opening
//! on the first send after a refill. The limiter never sleeps itself; callers
//! ask [`SendLimiter::ready_at`] when to try again.

use std::time::Duration;
use tokio::time::Instant;

/// Sends allowed per window.
pub const SEND_CAPACITY: u32 = 120;

/// Length of a send window.
pub const SEND_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct SendLimiter {
    capacity: u32,
    window: Duration,
    remaining: u32,
    window_end: Option<Instant>,
}

impl SendLimiter {
    pub fn new(capacity: u32, window: Duration) -> Self {
        Self {
            capacity,
            window,
            remaining: capacity,
            window_end: None,
        }
    }

    /// Take a token if one is available.
    pub fn try_acquire(&mut self) -> bool {
        let now = Instant::now();
        if self.window_end.is_some_and(|end| now >= end) {
            self.remaining = self.capacity;
            self.window_end = None;
        }
        if self.remaining == 0 {
            return false;
        }
        if self.window_end.is_none() {
            self.window_end = Some(now + self.window);
        }
        self.remaining -= 1;
        true
    }

    /// When the bucket refills, if it is currently empty.
    pub fn ready_at(&self) -> Option<Instant> {
        if self.remaining == 0 {
            self.window_end
        } else {
            None
        }
    }

    pub fn remaining(&self) -> u32 {
        self.remaining
    }

    /// Full bucket, no open window. Called whenever a socket opens.
    pub fn reset(&mut self) {
        self.remaining = self.capacity;
        self.window_end = None;
    }
}

impl Default for SendLimiter {
    fn default() -> Self {
        Self::new(SEND_CAPACITY, SEND_WINDOW)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn bucket_empties_then_refills_after_the_window() {
        let mut limiter = SendLimiter::new(3, Duration::from_secs(60));
        let opened = Instant::now();

        assert!(limiter.try_acquire());
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());

        // The window started with the first send, not the last.
        assert_eq!(limiter.ready_at(), Some(opened + Duration::from_secs(60)));

        tokio::time::advance(Duration::from_secs(50)).await;
        assert!(limiter.try_acquire());
        assert_eq!(limiter.remaining(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn ready_at_is_none_while_tokens_remain() {
        let mut limiter = SendLimiter::default();
        assert_eq!(limiter.ready_at(), None);
        assert!(limiter.try_acquire());
        assert_eq!(limiter.ready_at(), None);
        assert_eq!(limiter.remaining(), SEND_CAPACITY - 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reset_restores_the_full_bucket() {
        let mut limiter = SendLimiter::new(1, Duration::from_secs(60));
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());

        limiter.reset();
        assert!(limiter.try_acquire());
    }
}
