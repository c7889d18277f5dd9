use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::time::Instant;

use enrich_common::retry::RetryPolicy;
use enrich_common::types::{EnrichmentRequest, FailureKind, ProviderResult};

use crate::api::UnknownProviderError;
use crate::breaker::CircuitBreakers;
use crate::cache::{cache_key, ResponseCache};
use crate::config::ProviderSettings;
use crate::limiter::RateLimiters;
use crate::providers::AdaptedResponse;
use crate::transport::{ProviderTransport, TransportError};

/// One external provider behind the uniform request contract. Composes, in
/// order: cache lookup, circuit breaker, rate limiter, then the transport
/// with bounded retries.
pub struct ProviderClient {
    settings: ProviderSettings,
    transport: Arc<dyn ProviderTransport>,
    breakers: Arc<CircuitBreakers>,
    limiters: Arc<RateLimiters>,
    cache: Arc<ResponseCache>,
    cache_ttl: Duration,
    retry_policy: RetryPolicy,
    /// Bounds in-flight transport calls for this provider only.
    inflight: Semaphore,
}

impl ProviderClient {
    pub fn new(
        settings: ProviderSettings,
        transport: Arc<dyn ProviderTransport>,
        breakers: Arc<CircuitBreakers>,
        limiters: Arc<RateLimiters>,
        cache: Arc<ResponseCache>,
        cache_ttl: Duration,
        retry_policy: RetryPolicy,
    ) -> Self {
        let inflight = Semaphore::new(settings.max_inflight.max(1));
        Self {
            settings,
            transport,
            breakers,
            limiters,
            cache,
            cache_ttl,
            retry_policy,
            inflight,
        }
    }

    pub fn provider_name(&self) -> &'static str {
        self.settings.name()
    }

    pub fn priority(&self) -> u32 {
        self.settings.priority
    }

    pub fn retry_on_low_confidence(&self) -> bool {
        self.settings.retry_on_low_confidence
    }

    /// Fetch this provider's answer for `request`. Failures come back as
    /// failed `ProviderResult`s, never as errors; the only error here is a
    /// provider that was never configured.
    pub async fn fetch(
        &self,
        request: &EnrichmentRequest,
    ) -> Result<ProviderResult, UnknownProviderError> {
        let provider = self.provider_name();
        let key = cache_key(provider, &request.subject_key, request.min_confidence);

        // Cache first: a hit must consume no token and probe no breaker.
        if let Some(hit) = self.cache.get(&key) {
            self.count_outcome("cache_hit");
            return Ok(hit);
        }

        if !self.breakers.allow(provider)? {
            self.count_outcome("circuit_open");
            return Ok(ProviderResult::failure(
                provider,
                FailureKind::CircuitOpen,
                Duration::ZERO,
            ));
        }

        if !self
            .limiters
            .acquire(provider, self.settings.acquire_timeout())
            .await?
        {
            // Throttling is not a provider defect: the breaker is untouched.
            self.count_outcome("throttled");
            return Ok(ProviderResult::failure(
                provider,
                FailureKind::Throttled,
                Duration::ZERO,
            ));
        }

        let _permit = self
            .inflight
            .acquire()
            .await
            .expect("inflight semaphore has been closed");

        let started = Instant::now();
        let send_result = self.send_with_retries(request).await;
        let latency = started.elapsed();

        let labels = [("provider", provider.to_string())];
        metrics::histogram!("provider_fetch_duration_seconds", &labels)
            .record(latency.as_secs_f64());

        // Breaker state is recorded only past this point, after the request
        // future resolved: a cancelled attempt moves nothing.
        match send_result {
            Ok(raw) => match self.settings.kind.adapt(&raw) {
                Ok(adapted) => {
                    let adapted = self.maybe_retry_low_confidence(request, adapted).await;
                    self.breakers.record_success(provider)?;
                    let result = ProviderResult::success(
                        provider,
                        adapted.fields,
                        adapted.confidence,
                        latency,
                    );
                    self.cache.set(&key, result.clone(), self.cache_ttl);
                    self.count_outcome("success");
                    Ok(result)
                }
                Err(error) => {
                    tracing::warn!(provider, %error, "provider response failed to adapt");
                    self.breakers.record_failure(provider)?;
                    self.count_outcome("terminal");
                    Ok(ProviderResult::failure(
                        provider,
                        FailureKind::Terminal,
                        latency,
                    ))
                }
            },
            Err(TransportError::UnknownProvider(error)) => Err(error),
            Err(error) => {
                let kind = error.failure_kind();
                tracing::warn!(provider, %error, "provider request failed");
                self.breakers.record_failure(provider)?;
                self.count_outcome(match kind {
                    FailureKind::Transient => "transient",
                    _ => "terminal",
                });
                Ok(ProviderResult::failure(provider, kind, latency))
            }
        }
    }

    /// Issue the request, retrying transient failures with backoff. The
    /// provider endpoints are read-only, so retries are indistinguishable
    /// from a single call.
    async fn send_with_retries(
        &self,
        request: &EnrichmentRequest,
    ) -> Result<serde_json::Value, TransportError> {
        let mut attempt = 0u32;
        loop {
            match self.transport.send(self.provider_name(), request).await {
                Ok(raw) => return Ok(raw),
                Err(error)
                    if error.is_transient() && attempt + 1 < self.retry_policy.max_attempts() =>
                {
                    let backoff = self.retry_policy.retry_interval(attempt);
                    attempt += 1;
                    tokio::time::sleep(backoff).await;
                }
                Err(error) => return Err(error),
            }
        }
    }

    /// Optional one-shot re-ask when a success lands below the caller's
    /// threshold. Off by default; never more than one extra attempt.
    async fn maybe_retry_low_confidence(
        &self,
        request: &EnrichmentRequest,
        adapted: AdaptedResponse,
    ) -> AdaptedResponse {
        if !self.settings.retry_on_low_confidence || adapted.confidence >= request.min_confidence {
            return adapted;
        }

        match self.transport.send(self.provider_name(), request).await {
            Ok(raw) => match self.settings.kind.adapt(&raw) {
                Ok(second) if second.confidence > adapted.confidence => second,
                _ => adapted,
            },
            Err(_) => adapted,
        }
    }

    fn count_outcome(&self, outcome: &'static str) {
        let labels = [
            ("provider", self.provider_name().to_string()),
            ("outcome", outcome.to_string()),
        ];
        metrics::counter!("provider_fetch_total", &labels).increment(1);
    }
}
