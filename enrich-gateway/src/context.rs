use std::sync::Arc;
use std::time::Duration;

use crate::breaker::CircuitBreakers;
use crate::cache::ResponseCache;
use crate::client::ProviderClient;
use crate::config::{Config, ConfigError};
use crate::dlq::DeadLetterQueue;
use crate::limiter::RateLimiters;
use crate::store::RecordStore;
use crate::transport::ProviderTransport;
use crate::waterfall::Waterfall;

/// Everything the gateway shares, constructed once at startup and passed
/// around explicitly. No component reaches for process-wide globals.
#[derive(Clone)]
pub struct AppContext {
    pub breakers: Arc<CircuitBreakers>,
    pub limiters: Arc<RateLimiters>,
    pub cache: Arc<ResponseCache>,
    pub dlq: Arc<DeadLetterQueue>,
    pub store: Arc<RecordStore>,
    pub waterfall: Arc<Waterfall>,
    pub default_min_confidence: f64,
    pub dlq_retention: Duration,
}

impl AppContext {
    pub fn new(
        config: &Config,
        transport: Arc<dyn ProviderTransport>,
    ) -> Result<Self, ConfigError> {
        let providers = config.providers()?;

        let breakers = Arc::new(CircuitBreakers::new(&providers));
        let limiters = Arc::new(RateLimiters::new(&providers));
        let cache = Arc::new(ResponseCache::new(config.cache_capacity));
        let dlq = Arc::new(DeadLetterQueue::new(config.dlq_max_retries));
        let store = Arc::new(RecordStore::new());
        let retry_policy = config.retry_policy.policy();

        let clients = providers
            .iter()
            .map(|settings| {
                ProviderClient::new(
                    settings.clone(),
                    transport.clone(),
                    breakers.clone(),
                    limiters.clone(),
                    cache.clone(),
                    config.cache_ttl.0,
                    retry_policy,
                )
            })
            .collect();

        let waterfall = Arc::new(Waterfall::new(clients, store.clone(), dlq.clone()));

        Ok(Self {
            breakers,
            limiters,
            cache,
            dlq,
            store,
            waterfall,
            default_min_confidence: config.default_min_confidence,
            dlq_retention: config.dlq_retention.0,
        })
    }
}
