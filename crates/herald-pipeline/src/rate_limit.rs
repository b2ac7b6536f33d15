//! Token-bucket rate limiter shared by the SMS send workers.
//!
//! Caps provider throughput independently of the worker count and queue
//! depth. Time comes from the injected `Clock`, so tests can drain the
//! bucket without real waiting.

use std::{sync::Arc, time::{Duration, Instant}};

use herald_core::Clock;
use tokio::sync::Mutex;

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Shared token bucket.
#[derive(Debug)]
pub struct RateLimiter {
    rate_per_second: f64,
    capacity: f64,
    bucket: Mutex<Bucket>,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    /// Creates a limiter allowing `rate_per_second` permits with a burst of
    /// one second's worth.
    pub fn new(rate_per_second: u32, clock: Arc<dyn Clock>) -> Self {
        let rate = f64::from(rate_per_second.max(1));
        let bucket = Bucket { tokens: rate, last_refill: clock.now() };
        Self { rate_per_second: rate, capacity: rate, bucket: Mutex::new(bucket), clock }
    }

    /// Configured permits per second.
    pub fn rate_per_second(&self) -> f64 {
        self.rate_per_second
    }

    /// Takes a permit if one is available right now.
    pub async fn try_acquire(&self) -> bool {
        let mut bucket = self.bucket.lock().await;
        self.refill(&mut bucket);
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Waits until a permit is available and takes it.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut bucket = self.bucket.lock().await;
                self.refill(&mut bucket);
                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    return;
                }
                Duration::from_secs_f64((1.0 - bucket.tokens) / self.rate_per_second)
            };
            self.clock.sleep(wait).await;
        }
    }

    fn refill(&self, bucket: &mut Bucket) {
        let now = self.clock.now();
        let elapsed = now.saturating_duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.rate_per_second).min(self.capacity);
        bucket.last_refill = now;
    }
}
