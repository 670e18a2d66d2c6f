//! Token bucket used to throttle repeated diagnostics.
//!
//! Misconfigured northbound data produces the same warning on every pass.
//! Each node owns one limiter per message class and routes the message
//! through [`warn_rl!`](crate::warn_rl) or [`info_rl!`](crate::info_rl);
//! messages over budget are counted and the count is attached to the next
//! message that gets through.

use std::sync::Mutex;
use std::time::Instant;

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Option<Instant>,
    suppressed: u64,
}

/// Token bucket rate limiter for log messages.
#[derive(Debug)]
pub struct RateLimiter {
    /// Tokens added per second.
    rate: f64,
    /// Maximum tokens (burst capacity).
    burst: u32,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    /// Creates a limiter allowing `rate` messages per second with bursts of
    /// up to `burst` messages.
    pub fn new(rate: u32, burst: u32) -> Self {
        let burst = burst.max(1);
        Self {
            rate: f64::from(rate.max(1)),
            burst,
            bucket: Mutex::new(Bucket {
                tokens: f64::from(burst),
                last_refill: None,
                suppressed: 0,
            }),
        }
    }

    /// Checks whether a message may be emitted now.
    ///
    /// Returns `Some(n)` when the message may be emitted, `n` being the
    /// number of messages suppressed since the last emitted one, or `None`
    /// when the message must be dropped.
    pub fn check(&self) -> Option<u64> {
        self.check_at(Instant::now())
    }

    /// Same as [`check`](Self::check) with an explicit clock reading.
    pub fn check_at(&self, now: Instant) -> Option<u64> {
        let mut bucket = match self.bucket.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if let Some(last) = bucket.last_refill {
            let elapsed = now.saturating_duration_since(last).as_secs_f64();
            bucket.tokens = (bucket.tokens + elapsed * self.rate).min(f64::from(self.burst));
        }
        bucket.last_refill = Some(now);

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            Some(std::mem::take(&mut bucket.suppressed))
        } else {
            bucket.suppressed += 1;
            None
        }
    }
}

impl Default for RateLimiter {
    /// One message per second, bursts of five.
    fn default() -> Self {
        Self::new(1, 5)
    }
}

/// Emits a `tracing` warning through a [`RateLimiter`].
#[macro_export]
macro_rules! warn_rl {
    ($rl:expr, $($arg:tt)+) => {
        if let Some(suppressed) = $rl.check() {
            if suppressed > 0 {
                $crate::__tracing::warn!(suppressed, $($arg)+);
            } else {
                $crate::__tracing::warn!($($arg)+);
            }
        }
    };
}

/// Emits a `tracing` info message through a [`RateLimiter`].
#[macro_export]
macro_rules! info_rl {
    ($rl:expr, $($arg:tt)+) => {
        if let Some(suppressed) = $rl.check() {
            if suppressed > 0 {
                $crate::__tracing::info!(suppressed, $($arg)+);
            } else {
                $crate::__tracing::info!($($arg)+);
            }
        }
    };
}
