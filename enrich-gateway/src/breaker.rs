use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::api::UnknownProviderError;
use crate::config::ProviderSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Per-provider breaker state. Only this module mutates it; the orchestrator
/// never sees it directly.
#[derive(Debug)]
struct CircuitState {
    state: BreakerState,
    consecutive_failures: u32,
    transitioned_at: Instant,
    /// Set while the single HALF_OPEN probe is outstanding.
    probe_in_flight: bool,
    failure_threshold: u32,
    open_timeout: Duration,
}

impl CircuitState {
    fn new(failure_threshold: u32, open_timeout: Duration) -> Self {
        Self {
            state: BreakerState::Closed,
            consecutive_failures: 0,
            transitioned_at: Instant::now(),
            probe_in_flight: false,
            failure_threshold: failure_threshold.max(1),
            open_timeout,
        }
    }

    fn transition(&mut self, state: BreakerState) {
        self.state = state;
        self.transitioned_at = Instant::now();
        self.probe_in_flight = false;
    }

    fn allow(&mut self) -> bool {
        match self.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                if self.transitioned_at.elapsed() >= self.open_timeout {
                    self.transition(BreakerState::HalfOpen);
                    self.probe_in_flight = true;
                    true
                } else {
                    false
                }
            }
            BreakerState::HalfOpen => {
                // A probe whose outcome was never recorded (cancelled caller)
                // must not wedge the breaker: re-arm after another timeout.
                if self.probe_in_flight && self.transitioned_at.elapsed() < self.open_timeout {
                    false
                } else {
                    self.transitioned_at = Instant::now();
                    self.probe_in_flight = true;
                    true
                }
            }
        }
    }

    fn record_success(&mut self) {
        self.consecutive_failures = 0;
        match self.state {
            BreakerState::Closed => {}
            BreakerState::HalfOpen | BreakerState::Open => {
                self.transition(BreakerState::Closed);
            }
        }
    }

    fn record_failure(&mut self) {
        match self.state {
            BreakerState::Closed => {
                self.consecutive_failures += 1;
                if self.consecutive_failures >= self.failure_threshold {
                    self.transition(BreakerState::Open);
                }
            }
            BreakerState::HalfOpen => {
                // Failed probe: back to OPEN, timer restarts.
                self.consecutive_failures += 1;
                self.transition(BreakerState::Open);
            }
            BreakerState::Open => {
                self.consecutive_failures += 1;
            }
        }
    }
}

/// Read-only view for the admin endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub provider: String,
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub seconds_in_state: f64,
}

/// One breaker per configured provider, each behind its own lock so that
/// contention stays per provider.
pub struct CircuitBreakers {
    providers: HashMap<String, Mutex<CircuitState>>,
}

impl CircuitBreakers {
    pub fn new(settings: &[ProviderSettings]) -> Self {
        let providers = settings
            .iter()
            .map(|provider| {
                (
                    provider.name().to_owned(),
                    Mutex::new(CircuitState::new(
                        provider.failure_threshold,
                        provider.open_timeout(),
                    )),
                )
            })
            .collect();

        Self { providers }
    }

    fn state(&self, provider: &str) -> Result<&Mutex<CircuitState>, UnknownProviderError> {
        self.providers
            .get(provider)
            .ok_or_else(|| UnknownProviderError(provider.to_owned()))
    }

    pub fn allow(&self, provider: &str) -> Result<bool, UnknownProviderError> {
        let mut state = self.state(provider)?.lock().expect("poisoned breaker lock");
        Ok(state.allow())
    }

    pub fn record_success(&self, provider: &str) -> Result<(), UnknownProviderError> {
        let mut state = self.state(provider)?.lock().expect("poisoned breaker lock");
        state.record_success();
        Ok(())
    }

    pub fn record_failure(&self, provider: &str) -> Result<(), UnknownProviderError> {
        let mut state = self.state(provider)?.lock().expect("poisoned breaker lock");
        state.record_failure();
        Ok(())
    }

    /// Force a breaker back to CLOSED. Admin action.
    pub fn reset(&self, provider: &str) -> Result<(), UnknownProviderError> {
        let mut state = self.state(provider)?.lock().expect("poisoned breaker lock");
        state.consecutive_failures = 0;
        state.transition(BreakerState::Closed);
        Ok(())
    }

    pub fn snapshot(&self) -> Vec<BreakerSnapshot> {
        let mut snapshots: Vec<BreakerSnapshot> = self
            .providers
            .iter()
            .map(|(provider, state)| {
                let state = state.lock().expect("poisoned breaker lock");
                BreakerSnapshot {
                    provider: provider.clone(),
                    state: state.state,
                    consecutive_failures: state.consecutive_failures,
                    seconds_in_state: state.transitioned_at.elapsed().as_secs_f64(),
                }
            })
            .collect();
        snapshots.sort_by(|a, b| a.provider.cmp(&b.provider));
        snapshots
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::ProviderKind;

    fn breakers(failure_threshold: u32, open_timeout_ms: u64) -> CircuitBreakers {
        let mut settings = ProviderSettings::default_table();
        settings.truncate(1);
        settings[0].failure_threshold = failure_threshold;
        settings[0].open_timeout_ms = open_timeout_ms;
        assert_eq!(settings[0].kind, ProviderKind::Musicbrainz);
        CircuitBreakers::new(&settings)
    }

    #[tokio::test(start_paused = true)]
    async fn opens_after_threshold_consecutive_failures() {
        let breakers = breakers(3, 1000);

        for _ in 0..2 {
            breakers.record_failure("musicbrainz").unwrap();
            assert!(breakers.allow("musicbrainz").unwrap());
        }
        breakers.record_failure("musicbrainz").unwrap();
        assert!(!breakers.allow("musicbrainz").unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn success_resets_the_failure_counter_while_closed() {
        let breakers = breakers(3, 1000);

        breakers.record_failure("musicbrainz").unwrap();
        breakers.record_failure("musicbrainz").unwrap();
        breakers.record_success("musicbrainz").unwrap();
        breakers.record_failure("musicbrainz").unwrap();
        breakers.record_failure("musicbrainz").unwrap();
        assert!(breakers.allow("musicbrainz").unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_allows_exactly_one_probe() {
        let breakers = breakers(1, 1000);

        breakers.record_failure("musicbrainz").unwrap();
        assert!(!breakers.allow("musicbrainz").unwrap());

        tokio::time::advance(std::time::Duration::from_millis(1001)).await;

        // One probe, and only one, until its outcome is recorded.
        assert!(breakers.allow("musicbrainz").unwrap());
        assert!(!breakers.allow("musicbrainz").unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn successful_probe_closes_the_circuit() {
        let breakers = breakers(1, 1000);

        breakers.record_failure("musicbrainz").unwrap();
        tokio::time::advance(std::time::Duration::from_millis(1001)).await;
        assert!(breakers.allow("musicbrainz").unwrap());

        breakers.record_success("musicbrainz").unwrap();
        assert!(breakers.allow("musicbrainz").unwrap());
        assert!(breakers.allow("musicbrainz").unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_probe_reopens_and_restarts_the_timer() {
        let breakers = breakers(1, 1000);

        breakers.record_failure("musicbrainz").unwrap();
        tokio::time::advance(std::time::Duration::from_millis(1001)).await;
        assert!(breakers.allow("musicbrainz").unwrap());

        breakers.record_failure("musicbrainz").unwrap();
        assert!(!breakers.allow("musicbrainz").unwrap());

        tokio::time::advance(std::time::Duration::from_millis(500)).await;
        assert!(!breakers.allow("musicbrainz").unwrap());

        tokio::time::advance(std::time::Duration::from_millis(501)).await;
        assert!(breakers.allow("musicbrainz").unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn admin_reset_closes_the_circuit() {
        let breakers = breakers(1, 60_000);

        breakers.record_failure("musicbrainz").unwrap();
        assert!(!breakers.allow("musicbrainz").unwrap());

        breakers.reset("musicbrainz").unwrap();
        assert!(breakers.allow("musicbrainz").unwrap());
        assert_eq!(breakers.snapshot()[0].state, BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_providers_are_an_error() {
        let breakers = breakers(1, 1000);
        assert!(breakers.allow("lastfm").is_err());
    }
}
