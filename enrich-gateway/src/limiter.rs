use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

use crate::api::UnknownProviderError;
use crate::config::ProviderSettings;

/// Token bucket refilled lazily on access; no background timer.
#[derive(Debug)]
struct RateLimitBucket {
    tokens: f64,
    capacity: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl RateLimitBucket {
    fn new(capacity: f64, refill_per_sec: f64) -> Self {
        Self {
            tokens: capacity,
            capacity,
            refill_per_sec,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
    }

    fn try_take(&mut self, now: Instant) -> bool {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Time until one full token is available, assuming no other taker.
    fn time_to_next_token(&self) -> Duration {
        let deficit = (1.0 - self.tokens).max(0.0);
        Duration::from_secs_f64(deficit / self.refill_per_sec)
    }
}

/// One bucket per configured provider, each behind its own lock. Providers
/// must be configured up front; there is no silent default bucket.
pub struct RateLimiters {
    buckets: HashMap<String, Mutex<RateLimitBucket>>,
}

impl RateLimiters {
    pub fn new(settings: &[ProviderSettings]) -> Self {
        let buckets = settings
            .iter()
            .map(|provider| {
                (
                    provider.name().to_owned(),
                    Mutex::new(RateLimitBucket::new(
                        provider.rate_capacity,
                        provider.refill_per_sec,
                    )),
                )
            })
            .collect();

        Self { buckets }
    }

    fn bucket(&self, provider: &str) -> Result<&Mutex<RateLimitBucket>, UnknownProviderError> {
        self.buckets
            .get(provider)
            .ok_or_else(|| UnknownProviderError(provider.to_owned()))
    }

    /// Non-blocking token grab. A `false` here classifies the attempt as
    /// throttled; callers must not busy-loop on it.
    pub fn try_acquire(&self, provider: &str) -> Result<bool, UnknownProviderError> {
        let mut bucket = self.bucket(provider)?.lock().expect("poisoned bucket lock");
        Ok(bucket.try_take(Instant::now()))
    }

    /// Wait up to `max_wait` for a token. The bucket lock is never held
    /// across a sleep, so concurrent callers race fairly for refills.
    pub async fn acquire(
        &self,
        provider: &str,
        max_wait: Duration,
    ) -> Result<bool, UnknownProviderError> {
        let deadline = Instant::now() + max_wait;

        loop {
            let wait = {
                let mut bucket = self.bucket(provider)?.lock().expect("poisoned bucket lock");
                let now = Instant::now();
                if bucket.try_take(now) {
                    return Ok(true);
                }
                bucket.time_to_next_token()
            };

            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            tokio::time::sleep_until(now.checked_add(wait).unwrap_or(deadline).min(deadline))
                .await;
            if Instant::now() >= deadline {
                // Deadline hit while another caller drained the refill.
                let mut bucket = self.bucket(provider)?.lock().expect("poisoned bucket lock");
                return Ok(bucket.try_take(Instant::now()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::ProviderKind;

    fn limiters(capacity: f64, refill_per_sec: f64) -> RateLimiters {
        let mut settings = ProviderSettings::default_table();
        settings.truncate(1);
        settings[0].rate_capacity = capacity;
        settings[0].refill_per_sec = refill_per_sec;
        assert_eq!(settings[0].kind, ProviderKind::Musicbrainz);
        RateLimiters::new(&settings)
    }

    #[tokio::test(start_paused = true)]
    async fn burst_drains_the_bucket() {
        let limiters = limiters(3.0, 1.0);

        for _ in 0..3 {
            assert!(limiters.try_acquire("musicbrainz").unwrap());
        }
        assert!(!limiters.try_acquire("musicbrainz").unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn capacity_restores_after_capacity_over_rate_seconds() {
        let limiters = limiters(4.0, 2.0);

        for _ in 0..4 {
            assert!(limiters.try_acquire("musicbrainz").unwrap());
        }
        assert!(!limiters.try_acquire("musicbrainz").unwrap());

        // C / r = 2 seconds restores the full burst.
        tokio::time::advance(Duration::from_secs(2)).await;
        for _ in 0..4 {
            assert!(limiters.try_acquire("musicbrainz").unwrap());
        }
        assert!(!limiters.try_acquire("musicbrainz").unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn refill_is_fractional() {
        let limiters = limiters(2.0, 2.0);

        assert!(limiters.try_acquire("musicbrainz").unwrap());
        assert!(limiters.try_acquire("musicbrainz").unwrap());

        tokio::time::advance(Duration::from_millis(600)).await;
        assert!(limiters.try_acquire("musicbrainz").unwrap());
        assert!(!limiters.try_acquire("musicbrainz").unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_waits_for_a_refill() {
        let limiters = limiters(1.0, 1.0);

        assert!(limiters.try_acquire("musicbrainz").unwrap());
        assert!(limiters
            .acquire("musicbrainz", Duration::from_secs(2))
            .await
            .unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_gives_up_at_the_deadline() {
        let limiters = limiters(1.0, 0.001);

        assert!(limiters.try_acquire("musicbrainz").unwrap());
        assert!(!limiters
            .acquire("musicbrainz", Duration::from_millis(50))
            .await
            .unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn unconfigured_providers_are_an_error() {
        let limiters = limiters(1.0, 1.0);
        assert!(limiters.try_acquire("lastfm").is_err());
        assert!(limiters
            .acquire("lastfm", Duration::from_millis(10))
            .await
            .is_err());
    }
}
