use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use enrich_common::types::{EnrichmentRequest, FieldMap};

/// The fixed set of supported providers. Adding a provider means adding a
/// variant and its `adapt` arm; there is no runtime plugin registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Musicbrainz,
    Discogs,
    Acousticbrainz,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdaptError {
    #[error("provider response is not a json object")]
    NotAnObject,
    #[error("provider response holds no usable match")]
    NoMatch,
}

/// A provider response translated into the uniform attribute map. Produced by
/// the pure `adapt` step; the provider client turns it into a ProviderResult.
#[derive(Debug, Clone, PartialEq)]
pub struct AdaptedResponse {
    pub fields: FieldMap,
    pub confidence: f64,
}

impl ProviderKind {
    pub fn provider_name(&self) -> &'static str {
        match self {
            ProviderKind::Musicbrainz => "musicbrainz",
            ProviderKind::Discogs => "discogs",
            ProviderKind::Acousticbrainz => "acousticbrainz",
        }
    }

    /// Confidence assumed when a response carries no score of its own.
    pub fn default_confidence(&self) -> f64 {
        match self {
            ProviderKind::Musicbrainz => 0.9,
            ProviderKind::Discogs => 0.7,
            ProviderKind::Acousticbrainz => 0.8,
        }
    }

    /// Path and query for a lookup, relative to the configured base URL.
    /// Auth and versioning quirks stay inside the transport.
    pub fn lookup_path(&self, request: &EnrichmentRequest) -> String {
        let subject: String =
            url::form_urlencoded::byte_serialize(request.subject_key.as_bytes()).collect();
        match self {
            ProviderKind::Musicbrainz => format!("/recording?query={subject}&fmt=json&limit=1"),
            ProviderKind::Discogs => format!("/database/search?q={subject}&type=release"),
            ProviderKind::Acousticbrainz => format!("/lookup?subject={subject}"),
        }
    }

    /// Translate a raw provider body into the uniform field map. Pure: no
    /// I/O, no retries, no shared state. Null values are dropped so the
    /// merged record stays traceable field-by-field.
    pub fn adapt(&self, raw: &Value) -> Result<AdaptedResponse, AdaptError> {
        let body = raw.as_object().ok_or(AdaptError::NotAnObject)?;

        match self {
            ProviderKind::Musicbrainz => {
                let recording = body
                    .get("recordings")
                    .and_then(Value::as_array)
                    .and_then(|recordings| recordings.first())
                    .and_then(Value::as_object)
                    .ok_or(AdaptError::NoMatch)?;

                let mut fields = FieldMap::new();
                copy_field(&mut fields, recording, "title", "title");
                copy_field(&mut fields, recording, "artist", "artist");
                copy_field(&mut fields, recording, "length", "length_ms");
                copy_field(&mut fields, recording, "isrc", "isrc");
                copy_field(&mut fields, recording, "id", "musicbrainz_id");

                // Lucene match score comes back as 0-100.
                let confidence = recording
                    .get("score")
                    .and_then(Value::as_f64)
                    .map(|score| score / 100.0)
                    .unwrap_or_else(|| self.default_confidence());

                finish(fields, confidence)
            }
            ProviderKind::Discogs => {
                let release = body
                    .get("results")
                    .and_then(Value::as_array)
                    .and_then(|results| results.first())
                    .and_then(Value::as_object)
                    .ok_or(AdaptError::NoMatch)?;

                let mut fields = FieldMap::new();
                if let Some(genre) = release
                    .get("genre")
                    .and_then(Value::as_array)
                    .and_then(|genres| genres.first())
                {
                    if !genre.is_null() {
                        fields.insert("genre".to_owned(), genre.clone());
                    }
                }
                if let Some(style) = release
                    .get("style")
                    .and_then(Value::as_array)
                    .and_then(|styles| styles.first())
                {
                    if !style.is_null() {
                        fields.insert("style".to_owned(), style.clone());
                    }
                }
                copy_field(&mut fields, release, "year", "year");
                copy_field(&mut fields, release, "label", "label");

                let confidence = release
                    .get("match")
                    .and_then(Value::as_f64)
                    .unwrap_or_else(|| self.default_confidence());

                finish(fields, confidence)
            }
            ProviderKind::Acousticbrainz => {
                let mut fields = FieldMap::new();
                if let Some(bpm) = body
                    .get("rhythm")
                    .and_then(Value::as_object)
                    .and_then(|rhythm| rhythm.get("bpm"))
                {
                    if !bpm.is_null() {
                        fields.insert("bpm".to_owned(), bpm.clone());
                    }
                }
                if let Some(tonal) = body.get("tonal").and_then(Value::as_object) {
                    let key = tonal.get("key_key").and_then(Value::as_str);
                    let scale = tonal.get("key_scale").and_then(Value::as_str);
                    if let Some(key) = key {
                        let spelled = match scale {
                            Some(scale) => format!("{key} {scale}"),
                            None => key.to_owned(),
                        };
                        fields.insert("key".to_owned(), Value::String(spelled));
                    }
                }

                let confidence = body
                    .get("confidence")
                    .and_then(Value::as_f64)
                    .unwrap_or_else(|| self.default_confidence());

                finish(fields, confidence)
            }
        }
    }
}

fn copy_field(
    fields: &mut FieldMap,
    source: &serde_json::Map<String, Value>,
    from: &str,
    to: &str,
) {
    if let Some(value) = source.get(from) {
        if !value.is_null() {
            fields.insert(to.to_owned(), value.clone());
        }
    }
}

fn finish(fields: FieldMap, confidence: f64) -> Result<AdaptedResponse, AdaptError> {
    if fields.is_empty() {
        return Err(AdaptError::NoMatch);
    }
    Ok(AdaptedResponse {
        fields,
        confidence: confidence.clamp(0.0, 1.0),
    })
}
