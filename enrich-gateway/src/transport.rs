use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use enrich_common::types::{EnrichmentRequest, FailureKind};

use crate::api::UnknownProviderError;
use crate::config::ProviderSettings;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("request to provider timed out")]
    Timeout,
    #[error("connection to provider failed: {0}")]
    Connect(String),
    #[error("provider returned server error status {0}")]
    ServerError(u16),
    #[error("provider returned client error status {0}")]
    ClientError(u16),
    #[error("provider response body is not valid json: {0}")]
    MalformedBody(String),
    #[error(transparent)]
    UnknownProvider(#[from] UnknownProviderError),
}

impl TransportError {
    /// Transient errors are retried inside the provider client; terminal
    /// ones surface immediately.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            TransportError::Timeout
            | TransportError::Connect(_)
            | TransportError::ServerError(_) => FailureKind::Transient,
            TransportError::ClientError(_)
            | TransportError::MalformedBody(_)
            | TransportError::UnknownProvider(_) => FailureKind::Terminal,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.failure_kind() == FailureKind::Transient
    }
}

/// The network seam of a provider client. Implementations perform exactly one
/// request per call: retries, caching and admission control live upstream.
#[async_trait]
pub trait ProviderTransport: Send + Sync {
    async fn send(
        &self,
        provider: &str,
        request: &EnrichmentRequest,
    ) -> Result<serde_json::Value, TransportError>;
}

/// Real transport over reqwest. Provider endpoints are fixed at startup.
pub struct HttpTransport {
    client: reqwest::Client,
    endpoints: HashMap<String, ProviderEndpoint>,
}

struct ProviderEndpoint {
    base_url: String,
    kind: crate::providers::ProviderKind,
}

impl HttpTransport {
    pub fn new(settings: &[ProviderSettings], request_timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .user_agent("enrich-gateway")
            .timeout(request_timeout)
            .build()
            .expect("failed to construct reqwest client for provider transport");

        let endpoints = settings
            .iter()
            .map(|provider| {
                (
                    provider.name().to_owned(),
                    ProviderEndpoint {
                        base_url: provider.base_url.trim_end_matches('/').to_owned(),
                        kind: provider.kind,
                    },
                )
            })
            .collect();

        Self { client, endpoints }
    }
}

#[async_trait]
impl ProviderTransport for HttpTransport {
    async fn send(
        &self,
        provider: &str,
        request: &EnrichmentRequest,
    ) -> Result<serde_json::Value, TransportError> {
        let endpoint = self
            .endpoints
            .get(provider)
            .ok_or_else(|| UnknownProviderError(provider.to_owned()))?;

        let url = format!("{}{}", endpoint.base_url, endpoint.kind.lookup_path(request));

        let response = self.client.get(&url).send().await.map_err(|error| {
            if error.is_timeout() {
                TransportError::Timeout
            } else {
                TransportError::Connect(error.to_string())
            }
        })?;

        let status = response.status();
        if status.is_server_error() || status == http::StatusCode::TOO_MANY_REQUESTS {
            return Err(TransportError::ServerError(status.as_u16()));
        }
        if status.is_client_error() {
            return Err(TransportError::ClientError(status.as_u16()));
        }

        response
            .json::<serde_json::Value>()
            .await
            .map_err(|error| TransportError::MalformedBody(error.to_string()))
    }
}

/// Scripted transport for tests: responses are popped per provider in FIFO
/// order, and every call is counted so tests can assert that cache hits or
/// open breakers performed no I/O.
#[derive(Default)]
pub struct MockTransport {
    scripts: Mutex<HashMap<String, VecDeque<Result<serde_json::Value, TransportError>>>>,
    calls: Mutex<HashMap<String, u64>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, provider: &str, response: Result<serde_json::Value, TransportError>) {
        self.scripts
            .lock()
            .expect("poisoned mock script lock")
            .entry(provider.to_owned())
            .or_default()
            .push_back(response);
    }

    pub fn calls(&self, provider: &str) -> u64 {
        *self
            .calls
            .lock()
            .expect("poisoned mock call lock")
            .get(provider)
            .unwrap_or(&0)
    }
}

#[async_trait]
impl ProviderTransport for MockTransport {
    async fn send(
        &self,
        provider: &str,
        _request: &EnrichmentRequest,
    ) -> Result<serde_json::Value, TransportError> {
        *self
            .calls
            .lock()
            .expect("poisoned mock call lock")
            .entry(provider.to_owned())
            .or_insert(0) += 1;

        self.scripts
            .lock()
            .expect("poisoned mock script lock")
            .get_mut(provider)
            .and_then(VecDeque::pop_front)
            .unwrap_or(Err(TransportError::ClientError(404)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn five_xx_and_timeouts_are_transient() {
        assert!(TransportError::Timeout.is_transient());
        assert!(TransportError::ServerError(503).is_transient());
        assert!(TransportError::Connect("refused".to_string()).is_transient());
    }

    #[test]
    fn four_xx_and_bad_bodies_are_terminal() {
        assert_eq!(
            TransportError::ClientError(404).failure_kind(),
            FailureKind::Terminal
        );
        assert_eq!(
            TransportError::MalformedBody("eof".to_string()).failure_kind(),
            FailureKind::Terminal
        );
    }

    #[tokio::test]
    async fn mock_transport_replays_its_script_in_order() {
        let transport = MockTransport::new();
        transport.script("discogs", Ok(serde_json::json!({"results": []})));
        transport.script("discogs", Err(TransportError::ServerError(502)));

        let request = EnrichmentRequest::new("x".to_string(), Default::default(), 0.8);
        assert!(transport.send("discogs", &request).await.is_ok());
        assert_eq!(
            transport.send("discogs", &request).await,
            Err(TransportError::ServerError(502))
        );
        // Exhausted scripts read as a 404.
        assert_eq!(
            transport.send("discogs", &request).await,
            Err(TransportError::ClientError(404))
        );
        assert_eq!(transport.calls("discogs"), 3);
    }
}
