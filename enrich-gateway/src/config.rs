use std::net::SocketAddr;
use std::str::FromStr;
use std::time;

use envconfig::Envconfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use enrich_common::retry::RetryPolicy;

use crate::providers::ProviderKind;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("provider table is not valid json: {0}")]
    InvalidProviderTable(#[from] serde_json::Error),
    #[error("provider {0} is configured twice")]
    DuplicateProvider(String),
    #[error("provider {0} must have a positive rate capacity and refill rate")]
    InvalidRate(String),
    #[error("no providers configured")]
    NoProviders,
}

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(default = "127.0.0.1:3400")]
    pub address: SocketAddr,

    #[envconfig(default = "true")]
    pub export_prometheus: bool,

    /// JSON array of `ProviderSettings`. Unset falls back to the built-in
    /// three-provider table.
    pub provider_table: Option<String>,

    /// Threshold applied when a request does not carry its own.
    #[envconfig(default = "0.8")]
    pub default_min_confidence: f64,

    #[envconfig(default = "512")]
    pub cache_capacity: usize,

    #[envconfig(default = "300000")]
    pub cache_ttl: EnvMsDuration,

    #[envconfig(default = "5000")]
    pub request_timeout: EnvMsDuration,

    #[envconfig(default = "3")]
    pub dlq_max_retries: u32,

    /// Archived DLQ messages older than this are purged. Active messages
    /// never expire.
    #[envconfig(default = "604800000")]
    pub dlq_retention: EnvMsDuration,

    #[envconfig(default = "60000")]
    pub replay_sweep_interval: EnvMsDuration,

    #[envconfig(nested = true)]
    pub retry_policy: RetryPolicyConfig,
}

impl Config {
    /// The provider table, in configuration order. Order matters: it is the
    /// deterministic tie-break between providers of equal priority.
    pub fn providers(&self) -> Result<Vec<ProviderSettings>, ConfigError> {
        let providers = match &self.provider_table {
            Some(table) => serde_json::from_str::<Vec<ProviderSettings>>(table)?,
            None => ProviderSettings::default_table(),
        };

        if providers.is_empty() {
            return Err(ConfigError::NoProviders);
        }

        let mut seen = std::collections::HashSet::new();
        for provider in &providers {
            if !seen.insert(provider.name()) {
                return Err(ConfigError::DuplicateProvider(provider.name().to_owned()));
            }
            if provider.rate_capacity <= 0.0 || provider.refill_per_sec <= 0.0 {
                return Err(ConfigError::InvalidRate(provider.name().to_owned()));
            }
        }

        Ok(providers)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}

#[derive(Envconfig, Clone)]
pub struct RetryPolicyConfig {
    #[envconfig(default = "2")]
    pub backoff_coefficient: u32,

    #[envconfig(default = "200")]
    pub initial_interval: EnvMsDuration,

    #[envconfig(default = "5000")]
    pub maximum_interval: EnvMsDuration,

    #[envconfig(default = "3")]
    pub max_attempts: u32,
}

impl RetryPolicyConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.backoff_coefficient,
            self.initial_interval.0,
            Some(self.maximum_interval.0),
            self.max_attempts,
        )
    }
}

/// Static per-provider configuration: priority, admission control and breaker
/// thresholds. Thresholds are deliberately per provider, not global.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSettings {
    pub kind: ProviderKind,
    pub base_url: String,
    /// Waterfall position: priority 1 is consulted first.
    pub priority: u32,
    #[serde(default = "default_rate_capacity")]
    pub rate_capacity: f64,
    #[serde(default = "default_refill_per_sec")]
    pub refill_per_sec: f64,
    /// How long `fetch` may wait for a rate limit token before the attempt is
    /// classified as throttled.
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_open_timeout_ms")]
    pub open_timeout_ms: u64,
    /// Upper bound on concurrent in-flight requests, so one slow provider
    /// cannot starve the others.
    #[serde(default = "default_max_inflight")]
    pub max_inflight: usize,
    /// One extra same-provider attempt when a success lands below the
    /// request threshold.
    #[serde(default)]
    pub retry_on_low_confidence: bool,
}

fn default_rate_capacity() -> f64 {
    10.0
}

fn default_refill_per_sec() -> f64 {
    5.0
}

fn default_acquire_timeout_ms() -> u64 {
    1000
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_open_timeout_ms() -> u64 {
    30_000
}

fn default_max_inflight() -> usize {
    16
}

impl ProviderSettings {
    pub fn name(&self) -> &'static str {
        self.kind.provider_name()
    }

    pub fn acquire_timeout(&self) -> time::Duration {
        time::Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn open_timeout(&self) -> time::Duration {
        time::Duration::from_millis(self.open_timeout_ms)
    }

    pub fn default_table() -> Vec<ProviderSettings> {
        vec![
            ProviderSettings {
                kind: ProviderKind::Musicbrainz,
                base_url: "https://musicbrainz.org/ws/2".to_owned(),
                priority: 1,
                rate_capacity: default_rate_capacity(),
                refill_per_sec: 1.0,
                acquire_timeout_ms: default_acquire_timeout_ms(),
                failure_threshold: default_failure_threshold(),
                open_timeout_ms: default_open_timeout_ms(),
                max_inflight: default_max_inflight(),
                retry_on_low_confidence: false,
            },
            ProviderSettings {
                kind: ProviderKind::Discogs,
                base_url: "https://api.discogs.com".to_owned(),
                priority: 2,
                rate_capacity: default_rate_capacity(),
                refill_per_sec: default_refill_per_sec(),
                acquire_timeout_ms: default_acquire_timeout_ms(),
                failure_threshold: default_failure_threshold(),
                open_timeout_ms: default_open_timeout_ms(),
                max_inflight: default_max_inflight(),
                retry_on_low_confidence: false,
            },
            ProviderSettings {
                kind: ProviderKind::Acousticbrainz,
                base_url: "https://acousticbrainz.org/api/v1".to_owned(),
                priority: 3,
                rate_capacity: default_rate_capacity(),
                refill_per_sec: default_refill_per_sec(),
                acquire_timeout_ms: default_acquire_timeout_ms(),
                failure_threshold: default_failure_threshold(),
                open_timeout_ms: default_open_timeout_ms(),
                max_inflight: default_max_inflight(),
                retry_on_low_confidence: false,
            },
        ]
    }
}
