use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use tracing::instrument;

use enrich_common::types::{subject_key_for, EnrichmentRequest};

use crate::api::{EnrichPayload, EnrichResponse, EnrichStatus, GatewayError};
use crate::context::AppContext;
use crate::waterfall::EnrichOutcome;

#[instrument(skip_all, fields(subject = %payload.subject))]
pub async fn enrich(
    State(context): State<AppContext>,
    Json(payload): Json<EnrichPayload>,
) -> Result<Response, GatewayError> {
    let response = enrich_one(&context, payload).await?;

    // A fully failed request is accepted for replay, not served.
    let code = match response.status {
        EnrichStatus::Pending => StatusCode::ACCEPTED,
        _ => StatusCode::OK,
    };
    Ok((code, Json(response)).into_response())
}

#[instrument(skip_all, fields(batch_size = payloads.len()))]
pub async fn enrich_batch(
    State(context): State<AppContext>,
    Json(payloads): Json<Vec<EnrichPayload>>,
) -> Result<Json<Vec<EnrichResponse>>, GatewayError> {
    if payloads.is_empty() {
        return Err(GatewayError::EmptyBatch);
    }

    let mut responses = Vec::with_capacity(payloads.len());
    for payload in payloads {
        responses.push(enrich_one(&context, payload).await?);
    }
    Ok(Json(responses))
}

async fn enrich_one(
    context: &AppContext,
    payload: EnrichPayload,
) -> Result<EnrichResponse, GatewayError> {
    if payload.subject.trim().is_empty() {
        return Err(GatewayError::MissingSubject);
    }

    let subject_key = subject_key_for(&payload.subject);
    let request = EnrichmentRequest::new(
        subject_key.clone(),
        payload.known_fields,
        payload
            .min_confidence
            .unwrap_or(context.default_min_confidence),
    );

    let outcome = context.waterfall.enrich(&request).await?;
    let status = outcome.status(request.min_confidence);

    Ok(match outcome {
        EnrichOutcome::Enriched(record) => EnrichResponse {
            status,
            subject_key,
            record: Some(record),
            dlq_id: None,
        },
        EnrichOutcome::Pending { dlq_id } => EnrichResponse {
            status,
            subject_key,
            record: None,
            dlq_id: Some(dlq_id),
        },
    })
}
