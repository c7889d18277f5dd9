use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use enrich_common::types::{EnrichedRecord, FieldMap};

/// Raised whenever a provider name reaches a component it was never
/// configured for. Deliberately an error and not a silent default bucket or
/// breaker.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("provider {0} is not configured")]
pub struct UnknownProviderError(pub String);

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("request holds no subject")]
    MissingSubject,
    #[error("request batch is empty")]
    EmptyBatch,
    #[error(transparent)]
    UnknownProvider(#[from] UnknownProviderError),
    #[error("no such provider: {0}")]
    ProviderNotFound(String),
    #[error("dead letter message not found: {0}")]
    DlqNotFound(Uuid),
    #[error("dead letter message {0} is archived and read-only")]
    DlqArchived(Uuid),
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        match self {
            GatewayError::MissingSubject | GatewayError::EmptyBatch => {
                (StatusCode::BAD_REQUEST, self.to_string())
            }
            // Reaching an unconfigured provider is a deployment defect, not
            // a caller mistake.
            GatewayError::UnknownProvider(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, self.to_string())
            }
            GatewayError::ProviderNotFound(_) | GatewayError::DlqNotFound(_) => {
                (StatusCode::NOT_FOUND, self.to_string())
            }
            GatewayError::DlqArchived(_) => (StatusCode::CONFLICT, self.to_string()),
        }
        .into_response()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EnrichPayload {
    pub subject: String,
    #[serde(default)]
    pub known_fields: FieldMap,
    pub min_confidence: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrichStatus {
    /// Confidence reached the requested threshold.
    Enriched,
    /// Some fields were populated, but the threshold was not met. Partial
    /// data is always preferred over no data.
    Partial,
    /// Nothing was populated; the request is parked in the DLQ for replay.
    Pending,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichResponse {
    pub status: EnrichStatus,
    pub subject_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record: Option<EnrichedRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dlq_id: Option<Uuid>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReplayBatchPayload {
    /// Restrict the batch to one subject key.
    pub subject_key: Option<String>,
    /// Upper bound on messages replayed in one batch.
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReplayReport {
    pub id: Uuid,
    pub status: EnrichStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record: Option<EnrichedRecord>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_statuses_match_the_failure_class() {
        assert_eq!(
            GatewayError::MissingSubject.into_response().status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            GatewayError::UnknownProvider(UnknownProviderError("lastfm".to_string()))
                .into_response()
                .status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            GatewayError::DlqNotFound(Uuid::now_v7())
                .into_response()
                .status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            GatewayError::DlqArchived(Uuid::now_v7())
                .into_response()
                .status(),
            StatusCode::CONFLICT
        );
    }

    #[test]
    fn pending_responses_omit_the_record() {
        let response = EnrichResponse {
            status: EnrichStatus::Pending,
            subject_key: "x".to_string(),
            record: None,
            dlq_id: Some(Uuid::now_v7()),
        };
        let encoded = serde_json::to_value(&response).unwrap();
        assert!(encoded.get("record").is_none());
        assert_eq!(encoded["status"], "pending");
    }
}
