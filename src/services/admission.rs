//! Token-bucket admission control for inbound transaction requests.

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use std::num::NonZeroU32;
use std::time::Duration;

/// Process-wide token bucket. Each admission consumes one token; an empty
/// bucket rejects immediately. The underlying GCRA cell is updated with a
/// single compare-and-swap, so each available token admits exactly one caller.
pub struct AdmissionController {
    limiter: DefaultDirectRateLimiter,
    capacity: NonZeroU32,
    refill_period: Duration,
}

impl AdmissionController {
    /// Bucket of `capacity` tokens refilling at `refill_per_second` tokens/sec.
    pub fn new(capacity: NonZeroU32, refill_per_second: NonZeroU32) -> Self {
        let quota = Quota::per_second(refill_per_second).allow_burst(capacity);
        let refill_period = quota.replenish_interval();
        Self {
            limiter: RateLimiter::direct(quota),
            capacity,
            refill_period,
        }
    }

    /// Bucket of `capacity` tokens refilling one token every `period`.
    /// Returns `None` for a zero period.
    pub fn with_refill_period(capacity: NonZeroU32, period: Duration) -> Option<Self> {
        let quota = Quota::with_period(period)?.allow_burst(capacity);
        Some(Self {
            limiter: RateLimiter::direct(quota),
            capacity,
            refill_period: period,
        })
    }

    pub fn try_admit(&self) -> bool {
        let admitted = self.limiter.check().is_ok();
        if !admitted {
            tracing::debug!(capacity = self.capacity.get(), "Admission rejected, bucket empty");
        }
        admitted
    }

    pub fn capacity(&self) -> u32 {
        self.capacity.get()
    }

    /// Time to replenish a single token.
    pub fn refill_period(&self) -> Duration {
        self.refill_period
    }
}
