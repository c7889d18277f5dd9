use std::collections::HashMap;
use std::sync::RwLock;

use chrono::prelude::*;
use serde::Serialize;
use uuid::Uuid;

use enrich_common::types::{EnrichedRecord, RawRecord};

/// Aggregate stratum snapshot: derived statistics over the enriched stratum.
/// Never authoritative; safe to discard and rebuild at any time.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregateSnapshot {
    pub rebuilt_at: DateTime<Utc>,
    pub subjects: usize,
    pub versions: usize,
    pub mean_confidence: f64,
    /// How many fields each provider contributed across current versions.
    pub fields_by_provider: HashMap<String, u64>,
}

/// The three record strata. Raw entries are append-only and never mutated;
/// enriched records are versioned appends, so prior versions stay queryable
/// for lineage audits.
pub struct RecordStore {
    raw: RwLock<HashMap<Uuid, RawRecord>>,
    enriched: RwLock<HashMap<String, Vec<EnrichedRecord>>>,
}

impl RecordStore {
    pub fn new() -> Self {
        Self {
            raw: RwLock::new(HashMap::new()),
            enriched: RwLock::new(HashMap::new()),
        }
    }

    /// Append to the raw stratum unconditionally and return the ingestion id.
    pub fn ingest(&self, subject_key: &str, payload: serde_json::Value) -> Uuid {
        let record = RawRecord {
            id: Uuid::now_v7(),
            subject_key: subject_key.to_owned(),
            payload,
            ingested_at: Utc::now(),
        };
        let id = record.id;
        self.raw
            .write()
            .expect("poisoned raw stratum lock")
            .insert(id, record);
        id
    }

    pub fn raw_record(&self, id: Uuid) -> Option<RawRecord> {
        self.raw
            .read()
            .expect("poisoned raw stratum lock")
            .get(&id)
            .cloned()
    }

    /// Append a new version for the record's subject; never overwrites. The
    /// assigned version number is returned and written into the record.
    pub fn commit_enriched(&self, mut record: EnrichedRecord) -> u64 {
        let mut enriched = self.enriched.write().expect("poisoned enriched stratum lock");
        let versions = enriched.entry(record.subject_key.clone()).or_default();
        let version = versions.len() as u64 + 1;
        record.version = version;
        versions.push(record);
        version
    }

    /// The current enriched state: latest version for the subject.
    pub fn latest(&self, subject_key: &str) -> Option<EnrichedRecord> {
        self.enriched
            .read()
            .expect("poisoned enriched stratum lock")
            .get(subject_key)
            .and_then(|versions| versions.last())
            .cloned()
    }

    /// Every committed version for the subject, oldest first.
    pub fn versions(&self, subject_key: &str) -> Vec<EnrichedRecord> {
        self.enriched
            .read()
            .expect("poisoned enriched stratum lock")
            .get(subject_key)
            .cloned()
            .unwrap_or_default()
    }

    /// Pure fold over the enriched stratum. The snapshot holds no fact that
    /// cannot be reconstructed by calling this again.
    pub fn rebuild_aggregate(&self) -> AggregateSnapshot {
        let enriched = self.enriched.read().expect("poisoned enriched stratum lock");

        let mut versions = 0;
        let mut confidence_sum = 0.0;
        let mut fields_by_provider: HashMap<String, u64> = HashMap::new();

        for subject_versions in enriched.values() {
            versions += subject_versions.len();
            if let Some(current) = subject_versions.last() {
                confidence_sum += current.confidence;
                for entry in &current.provenance {
                    *fields_by_provider.entry(entry.provider.clone()).or_insert(0) +=
                        entry.attributes.len() as u64;
                }
            }
        }

        let subjects = enriched.len();
        AggregateSnapshot {
            rebuilt_at: Utc::now(),
            subjects,
            versions,
            mean_confidence: if subjects == 0 {
                0.0
            } else {
                confidence_sum / subjects as f64
            },
            fields_by_provider,
        }
    }
}

impl Default for RecordStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use enrich_common::types::{FieldMap, ProvenanceEntry};
    use serde_json::json;

    fn record(subject: &str, confidence: f64, provider: &str) -> EnrichedRecord {
        EnrichedRecord {
            subject_key: subject.to_string(),
            version: 0,
            fields: FieldMap::from([("bpm".to_string(), json!(121))]),
            confidence,
            provenance: vec![ProvenanceEntry {
                provider: provider.to_string(),
                attributes: vec!["bpm".to_string()],
                confidence,
                recorded_at: Utc::now(),
            }],
        }
    }

    #[test]
    fn raw_records_are_retrievable_by_ingestion_id() {
        let store = RecordStore::new();
        let id = store.ingest("subject-a", json!({"subject": "Subject A"}));

        let raw = store.raw_record(id).unwrap();
        assert_eq!(raw.subject_key, "subject-a");
        assert_eq!(raw.payload, json!({"subject": "Subject A"}));
    }

    #[test]
    fn re_enrichment_appends_versions_and_latest_wins() {
        let store = RecordStore::new();
        assert_eq!(store.commit_enriched(record("subject-a", 0.6, "discogs")), 1);
        assert_eq!(
            store.commit_enriched(record("subject-a", 0.9, "musicbrainz")),
            2
        );

        let latest = store.latest("subject-a").unwrap();
        assert_eq!(latest.version, 2);
        assert_eq!(latest.confidence, 0.9);

        // Prior versions stay queryable for lineage audits.
        let versions = store.versions("subject-a");
        assert_eq!(versions.len(), 2);
        assert_eq!(versions[0].version, 1);
        assert_eq!(versions[0].confidence, 0.6);
    }

    #[test]
    fn aggregate_is_rebuilt_from_current_versions_only() {
        let store = RecordStore::new();
        store.commit_enriched(record("subject-a", 0.6, "discogs"));
        store.commit_enriched(record("subject-a", 0.9, "musicbrainz"));
        store.commit_enriched(record("subject-b", 0.7, "discogs"));

        let aggregate = store.rebuild_aggregate();
        assert_eq!(aggregate.subjects, 2);
        assert_eq!(aggregate.versions, 3);
        assert!((aggregate.mean_confidence - 0.8).abs() < 1e-9);
        assert_eq!(aggregate.fields_by_provider["musicbrainz"], 1);
        assert_eq!(aggregate.fields_by_provider["discogs"], 1);

        // Discard and recompute: same answer from the enriched stratum.
        let again = store.rebuild_aggregate();
        assert_eq!(again.subjects, aggregate.subjects);
        assert_eq!(again.fields_by_provider, aggregate.fields_by_provider);
    }
}
