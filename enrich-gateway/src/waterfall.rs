use std::sync::Arc;

use chrono::prelude::*;
use thiserror::Error;
use tracing::instrument;
use uuid::Uuid;

use enrich_common::types::{
    DlqMessage, EnrichedRecord, EnrichmentRequest, FieldMap, ProvenanceEntry, ProviderResult,
};

use crate::api::{EnrichStatus, GatewayError, ReplayBatchPayload, ReplayReport, UnknownProviderError};
use crate::client::ProviderClient;
use crate::dlq::{DeadLetterQueue, DlqError};
use crate::store::RecordStore;

#[derive(Error, Debug)]
pub enum ReplayError {
    #[error(transparent)]
    Dlq(#[from] DlqError),
    #[error(transparent)]
    UnknownProvider(#[from] UnknownProviderError),
}

impl From<ReplayError> for GatewayError {
    fn from(error: ReplayError) -> Self {
        match error {
            ReplayError::Dlq(DlqError::NotFound(id)) => GatewayError::DlqNotFound(id),
            ReplayError::Dlq(DlqError::Archived(id)) => GatewayError::DlqArchived(id),
            ReplayError::UnknownProvider(error) => GatewayError::UnknownProvider(error),
        }
    }
}

#[derive(Debug, Clone)]
pub enum EnrichOutcome {
    Enriched(EnrichedRecord),
    /// Zero fields populated; the request is parked for replay.
    Pending { dlq_id: Uuid },
}

impl EnrichOutcome {
    pub fn status(&self, min_confidence: f64) -> EnrichStatus {
        match self {
            EnrichOutcome::Enriched(record) if record.confidence >= min_confidence => {
                EnrichStatus::Enriched
            }
            EnrichOutcome::Enriched(_) => EnrichStatus::Partial,
            EnrichOutcome::Pending { .. } => EnrichStatus::Pending,
        }
    }
}

/// Fill-forward merge of successful provider results, in attempt order.
/// Earlier (higher-priority) contributions win conflicts; later ones only
/// fill gaps. Caller-known fields seed the merge first. Returns `None` when
/// no provider contributed a single field.
///
/// Deterministic and idempotent: the same result set always merges to the
/// same fields and the same provenance order, and every populated field is
/// owned by exactly one provenance entry.
pub fn merge_results(
    subject_key: &str,
    known_fields: &FieldMap,
    results: &[ProviderResult],
) -> Option<EnrichedRecord> {
    let now = Utc::now();
    let mut fields = FieldMap::new();
    let mut provenance: Vec<ProvenanceEntry> = Vec::new();

    let mut caller_attributes: Vec<String> = Vec::new();
    for (name, value) in known_fields {
        if !value.is_null() {
            fields.insert(name.clone(), value.clone());
            caller_attributes.push(name.clone());
        }
    }
    if !caller_attributes.is_empty() {
        caller_attributes.sort();
        provenance.push(ProvenanceEntry {
            provider: "caller".to_owned(),
            attributes: caller_attributes,
            confidence: 1.0,
            recorded_at: now,
        });
    }

    let mut confidence: f64 = 0.0;
    let mut any_provider_contributed = false;

    for result in results.iter().filter(|result| result.outcome.is_success()) {
        let mut contributed: Vec<String> = Vec::new();
        for (name, value) in &result.fields {
            if value.is_null() || fields.contains_key(name) {
                continue;
            }
            fields.insert(name.clone(), value.clone());
            contributed.push(name.clone());
        }
        if contributed.is_empty() {
            continue;
        }
        contributed.sort();
        confidence = confidence.max(result.confidence);
        any_provider_contributed = true;
        provenance.push(ProvenanceEntry {
            provider: result.provider.clone(),
            attributes: contributed,
            confidence: result.confidence,
            recorded_at: now,
        });
    }

    if !any_provider_contributed {
        return None;
    }

    Some(EnrichedRecord {
        subject_key: subject_key.to_owned(),
        version: 0,
        fields,
        confidence,
        provenance,
    })
}

/// Consults provider clients in priority order, merges what comes back, and
/// routes zero-field runs to the DLQ. Partial success is not failure: any
/// populated field yields a record, with its actual confidence.
pub struct Waterfall {
    clients: Vec<ProviderClient>,
    store: Arc<RecordStore>,
    dlq: Arc<DeadLetterQueue>,
}

impl Waterfall {
    pub fn new(
        mut clients: Vec<ProviderClient>,
        store: Arc<RecordStore>,
        dlq: Arc<DeadLetterQueue>,
    ) -> Self {
        // Stable sort: equal priorities keep configuration order, which is
        // the documented conflict tie-break.
        clients.sort_by_key(ProviderClient::priority);
        Self {
            clients,
            store,
            dlq,
        }
    }

    /// Provider names in waterfall order.
    pub fn provider_order(&self) -> Vec<&'static str> {
        self.clients
            .iter()
            .map(ProviderClient::provider_name)
            .collect()
    }

    #[instrument(skip_all, fields(subject_key = %request.subject_key))]
    pub async fn enrich(
        &self,
        request: &EnrichmentRequest,
    ) -> Result<EnrichOutcome, UnknownProviderError> {
        self.store.ingest(
            &request.subject_key,
            serde_json::to_value(request).unwrap_or(serde_json::Value::Null),
        );

        let (record, attempts) = self.run(request).await?;

        match record {
            Some(mut record) => {
                record.version = self.store.commit_enriched(record.clone());
                let outcome = EnrichOutcome::Enriched(record);
                self.count_outcome(match outcome.status(request.min_confidence) {
                    EnrichStatus::Enriched => "enriched",
                    _ => "partial",
                });
                Ok(outcome)
            }
            None => {
                tracing::warn!(
                    attempts = attempts.len(),
                    "waterfall exhausted with zero populated fields"
                );
                let message = DlqMessage::new(
                    request.clone(),
                    attempts,
                    "waterfall exhausted with zero populated fields",
                );
                let dlq_id = self.dlq.enqueue(message);
                self.count_outcome("deadlettered");
                Ok(EnrichOutcome::Pending { dlq_id })
            }
        }
    }

    /// Replay re-runs the full waterfall for the original request; provider
    /// state may have changed since the failure. Success removes the
    /// message; failure spends one unit of its retry budget.
    pub async fn replay(&self, id: Uuid) -> Result<ReplayReport, ReplayError> {
        let message = self.dlq.begin_replay(id)?;
        let (record, _attempts) = self.run(&message.request).await?;

        match record {
            Some(mut record) => {
                record.version = self.store.commit_enriched(record.clone());
                self.dlq.resolve(id)?;
                let outcome = EnrichOutcome::Enriched(record);
                let status = outcome.status(message.request.min_confidence);
                let record = match outcome {
                    EnrichOutcome::Enriched(record) => Some(record),
                    EnrichOutcome::Pending { .. } => None,
                };
                Ok(ReplayReport { id, status, record })
            }
            None => {
                self.dlq.record_failed_replay(id)?;
                Ok(ReplayReport {
                    id,
                    status: EnrichStatus::Pending,
                    record: None,
                })
            }
        }
    }

    /// Replay every active message matching the filter. Messages resolved or
    /// archived by a concurrent replay are skipped, not errors.
    pub async fn replay_batch(
        &self,
        filter: &ReplayBatchPayload,
    ) -> Result<Vec<ReplayReport>, UnknownProviderError> {
        let mut candidates = self.dlq.list(enrich_common::types::DlqState::Active);
        if let Some(subject_key) = &filter.subject_key {
            candidates.retain(|message| &message.request.subject_key == subject_key);
        }
        if let Some(limit) = filter.limit {
            candidates.truncate(limit);
        }

        let mut reports = Vec::with_capacity(candidates.len());
        for message in candidates {
            match self.replay(message.id).await {
                Ok(report) => reports.push(report),
                Err(ReplayError::Dlq(_)) => continue,
                Err(ReplayError::UnknownProvider(error)) => return Err(error),
            }
        }
        Ok(reports)
    }

    /// Providers are always attempted in priority order; the merge depends
    /// on it. Stops at the first success that reaches the threshold.
    async fn run(
        &self,
        request: &EnrichmentRequest,
    ) -> Result<(Option<EnrichedRecord>, Vec<ProviderResult>), UnknownProviderError> {
        let mut attempts: Vec<ProviderResult> = Vec::with_capacity(self.clients.len());

        for client in &self.clients {
            let result = client.fetch(request).await?;
            let reached_threshold =
                result.outcome.is_success() && result.confidence >= request.min_confidence;
            attempts.push(result);
            if reached_threshold {
                break;
            }
        }

        let record = merge_results(&request.subject_key, &request.known_fields, &attempts);
        Ok((record, attempts))
    }

    fn count_outcome(&self, outcome: &'static str) {
        let labels = [("outcome", outcome.to_string())];
        metrics::counter!("enrichment_requests_total", &labels).increment(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use enrich_common::types::FailureKind;
    use serde_json::json;
    use std::time::Duration;

    fn success(provider: &str, confidence: f64, fields: &[(&str, serde_json::Value)]) -> ProviderResult {
        ProviderResult::success(
            provider,
            fields
                .iter()
                .map(|(name, value)| (name.to_string(), value.clone()))
                .collect(),
            confidence,
            Duration::from_millis(10),
        )
    }

    #[test]
    fn merge_is_fill_forward_and_never_overwrites() {
        let results = vec![
            success("musicbrainz", 0.9, &[("title", json!("Around the World"))]),
            success(
                "discogs",
                0.7,
                &[("title", json!("around the world")), ("genre", json!("Electronic"))],
            ),
        ];

        let record = merge_results("subject", &FieldMap::new(), &results).unwrap();
        assert_eq!(record.fields["title"], json!("Around the World"));
        assert_eq!(record.fields["genre"], json!("Electronic"));
        assert_eq!(record.confidence, 0.9);

        // discogs only gets credit for the field it actually contributed.
        assert_eq!(record.provenance.len(), 2);
        assert_eq!(record.provenance[1].provider, "discogs");
        assert_eq!(record.provenance[1].attributes, vec!["genre".to_string()]);
    }

    #[test]
    fn every_field_has_exactly_one_provenance_entry() {
        let results = vec![
            success("musicbrainz", 0.9, &[("title", json!("t")), ("isrc", json!("x"))]),
            success("discogs", 0.7, &[("genre", json!("g")), ("isrc", json!("y"))]),
        ];

        let record = merge_results("subject", &FieldMap::new(), &results).unwrap();
        let mut attributed: Vec<&String> = record
            .provenance
            .iter()
            .flat_map(|entry| entry.attributes.iter())
            .collect();
        attributed.sort();
        let mut populated: Vec<&String> = record.fields.keys().collect();
        populated.sort();
        assert_eq!(attributed, populated);
    }

    #[test]
    fn merge_is_idempotent() {
        let results = vec![
            success("musicbrainz", 0.9, &[("title", json!("t"))]),
            success("discogs", 0.7, &[("genre", json!("g"))]),
        ];

        let first = merge_results("subject", &FieldMap::new(), &results).unwrap();
        let second = merge_results("subject", &FieldMap::new(), &results).unwrap();
        assert_eq!(first.fields, second.fields);
        assert_eq!(first.confidence, second.confidence);
        assert_eq!(
            first
                .provenance
                .iter()
                .map(|entry| (&entry.provider, &entry.attributes))
                .collect::<Vec<_>>(),
            second
                .provenance
                .iter()
                .map(|entry| (&entry.provider, &entry.attributes))
                .collect::<Vec<_>>(),
        );
    }

    #[test]
    fn confidence_never_exceeds_the_best_contributor() {
        let results = vec![
            success("musicbrainz", 0.65, &[("title", json!("t"))]),
            success("discogs", 0.85, &[("genre", json!("g"))]),
            success("acousticbrainz", 0.4, &[("bpm", json!(120))]),
        ];

        let record = merge_results("subject", &FieldMap::new(), &results).unwrap();
        let best = results
            .iter()
            .map(|result| result.confidence)
            .fold(0.0f64, f64::max);
        assert!(record.confidence <= best);
        assert_eq!(record.confidence, 0.85);
    }

    #[test]
    fn known_fields_seed_the_merge_and_win_conflicts() {
        let known = FieldMap::from([("title".to_string(), json!("Caller Title"))]);
        let results = vec![success("musicbrainz", 0.9, &[("title", json!("Provider Title")), ("isrc", json!("x"))])];

        let record = merge_results("subject", &known, &results).unwrap();
        assert_eq!(record.fields["title"], json!("Caller Title"));
        assert_eq!(record.provenance[0].provider, "caller");
        assert_eq!(record.provenance[1].attributes, vec!["isrc".to_string()]);
    }

    #[test]
    fn failures_and_empty_contributions_produce_no_record() {
        let results = vec![
            ProviderResult::failure("musicbrainz", FailureKind::Terminal, Duration::ZERO),
            ProviderResult::failure("discogs", FailureKind::CircuitOpen, Duration::ZERO),
        ];
        assert!(merge_results("subject", &FieldMap::new(), &results).is_none());

        // Known fields alone do not make an enriched record.
        let known = FieldMap::from([("title".to_string(), json!("t"))]);
        assert!(merge_results("subject", &known, &results).is_none());
    }

    #[test]
    fn outcome_status_distinguishes_enriched_partial_pending() {
        let record = merge_results(
            "subject",
            &FieldMap::new(),
            &[success("discogs", 0.6, &[("genre", json!("g"))])],
        )
        .unwrap();

        let outcome = EnrichOutcome::Enriched(record);
        assert_eq!(outcome.status(0.5), EnrichStatus::Enriched);
        assert_eq!(outcome.status(0.8), EnrichStatus::Partial);
        assert_eq!(
            EnrichOutcome::Pending {
                dlq_id: Uuid::now_v7()
            }
            .status(0.5),
            EnrichStatus::Pending
        );
    }
}
