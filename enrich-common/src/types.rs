use std::collections::HashMap;
use std::time::Duration;

use chrono::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Sparse attribute map returned by providers and stored on enriched records.
/// Values are provider JSON as-is; `Null` values are never inserted.
pub type FieldMap = HashMap<String, serde_json::Value>;

/// Derive the stable subject key for a free-form subject string.
/// Lowercased, trimmed, inner whitespace collapsed, so that the same logical
/// track always lands on the same key regardless of caller formatting.
pub fn subject_key_for(subject: &str) -> String {
    subject
        .split_whitespace()
        .map(|word| word.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Convenience for callers that hold artist and title separately.
pub fn subject_key(artist: &str, title: &str) -> String {
    subject_key_for(&format!("{} :: {}", artist, title))
}

/// A request to enrich one subject. Immutable once created: the orchestrator
/// never mutates it, so replays operate on the exact original input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichmentRequest {
    pub subject_key: String,
    /// Identifiers or attributes the caller already knows. Merged first, so
    /// providers only fill the gaps.
    pub known_fields: FieldMap,
    /// Minimum confidence at which the waterfall stops early. Clamped to [0, 1].
    pub min_confidence: f64,
}

impl EnrichmentRequest {
    pub fn new(subject_key: String, known_fields: FieldMap, min_confidence: f64) -> Self {
        Self {
            subject_key,
            known_fields,
            min_confidence: min_confidence.clamp(0.0, 1.0),
        }
    }
}

/// Classification of a failed provider attempt. Decides both retry behavior
/// inside the provider client and circuit breaker accounting: throttled and
/// circuit-open attempts never count against the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Rate limit bucket exhausted before a token became available.
    Throttled,
    /// The provider is isolated behind an open circuit breaker.
    CircuitOpen,
    /// Timeout, connection failure or 5xx. Retried locally with backoff.
    Transient,
    /// 4xx or a malformed response body. Never retried.
    Terminal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderOutcome {
    Success,
    Failure(FailureKind),
}

impl ProviderOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ProviderOutcome::Success)
    }
}

/// One provider's answer for one request, successful or not. Consumed by the
/// orchestrator during merge; only DLQ messages keep them around afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderResult {
    pub provider: String,
    pub fields: FieldMap,
    pub confidence: f64,
    pub latency: Duration,
    pub outcome: ProviderOutcome,
}

impl ProviderResult {
    pub fn success(provider: &str, fields: FieldMap, confidence: f64, latency: Duration) -> Self {
        Self {
            provider: provider.to_owned(),
            fields,
            confidence: confidence.clamp(0.0, 1.0),
            latency,
            outcome: ProviderOutcome::Success,
        }
    }

    pub fn failure(provider: &str, kind: FailureKind, latency: Duration) -> Self {
        Self {
            provider: provider.to_owned(),
            fields: FieldMap::new(),
            confidence: 0.0,
            latency,
            outcome: ProviderOutcome::Failure(kind),
        }
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self.outcome {
            ProviderOutcome::Success => None,
            ProviderOutcome::Failure(kind) => Some(kind),
        }
    }
}

/// Lineage entry: which provider contributed which attributes, at what
/// confidence, and when. Attribute names are kept sorted so that merging the
/// same result set twice produces byte-identical provenance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvenanceEntry {
    pub provider: String,
    pub attributes: Vec<String>,
    pub confidence: f64,
    pub recorded_at: DateTime<Utc>,
}

/// The merged output of one waterfall run. Every non-null field is traceable
/// to exactly one provenance entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichedRecord {
    pub subject_key: String,
    /// Assigned by the record store on commit, starting at 1.
    pub version: u64,
    pub fields: FieldMap,
    /// Max confidence across contributing providers.
    pub confidence: f64,
    pub provenance: Vec<ProvenanceEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DlqState {
    /// Eligible for replay, never expires.
    Active,
    /// Exceeded max retries; read-only, kept for operator inspection until
    /// the retention window purges it.
    Archived,
}

/// A failed enrichment held for replay, together with the full attempt trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DlqMessage {
    pub id: Uuid,
    pub request: EnrichmentRequest,
    pub attempts: Vec<ProviderResult>,
    pub reason: String,
    pub enqueued_at: DateTime<Utc>,
    pub retry_count: u32,
    pub state: DlqState,
}

impl DlqMessage {
    pub fn new(request: EnrichmentRequest, attempts: Vec<ProviderResult>, reason: &str) -> Self {
        Self {
            id: Uuid::now_v7(),
            request,
            attempts,
            reason: reason.to_owned(),
            enqueued_at: Utc::now(),
            retry_count: 0,
            state: DlqState::Active,
        }
    }
}

/// An entry in the raw stratum: the original request payload, untouched, kept
/// for replay and audit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub id: Uuid,
    pub subject_key: String,
    pub payload: serde_json::Value,
    pub ingested_at: DateTime<Utc>,
}
