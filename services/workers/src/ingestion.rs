//! Ingestion worker.
//!
//! Consumes batches from the ingestion queue. Each upload is decoded, checked
//! against the extension allow-list, confirmed readable in the object store and
//! recorded with an idempotent upsert. Envelopes fail independently; a failed
//! envelope is left to the queue's receive budget and dead-letter redrive.

use crate::metadata_store::{ImageRecord, MetadataStore, MetadataStoreError, UpsertOutcome};
use crate::object_store::{ObjectStore, ObjectStoreError};
use async_trait::async_trait;
use futures::future::join_all;
use percent_encoding::percent_decode_str;
use photodrop_pipeline::{BatchHandler, BatchOutcome, DeliveryEnvelope, Notification, UploadEvent};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Object key cannot be decoded: {0}")]
    InvalidKey(String),

    #[error("Unsupported file type for {key}")]
    UnsupportedType { key: String },

    #[error("Object unreadable: {0}")]
    ObjectUnreadable(#[from] ObjectStoreError),

    #[error("Failed to record image: {0}")]
    Store(#[from] MetadataStoreError),
}

impl IngestError {
    /// Validation failures will fail again on every redelivery
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            IngestError::InvalidKey(_)
                | IngestError::UnsupportedType { .. }
                | IngestError::ObjectUnreadable(ObjectStoreError::NotFound { .. })
        )
    }
}

/// Recover the literal key from notification encoding: `+` is a space, then percent-decode.
///
/// A `%` not followed by two hex digits is an error, as is invalid UTF-8.
pub fn decode_object_key(encoded: &str) -> Result<String, IngestError> {
    if let Some(position) = malformed_escape(encoded) {
        return Err(IngestError::InvalidKey(format!(
            "malformed percent escape at byte {}",
            position
        )));
    }

    let spaced = encoded.replace('+', " ");
    percent_decode_str(&spaced)
        .decode_utf8()
        .map(|key| key.into_owned())
        .map_err(|e| IngestError::InvalidKey(e.to_string()))
}

fn malformed_escape(encoded: &str) -> Option<usize> {
    let bytes = encoded.as_bytes();
    bytes.iter().enumerate().find_map(|(i, &b)| {
        let well_formed = b != b'%'
            || (bytes.get(i + 1).is_some_and(u8::is_ascii_hexdigit)
                && bytes.get(i + 2).is_some_and(u8::is_ascii_hexdigit));
        (!well_formed).then_some(i)
    })
}

/// Exact, case-sensitive suffix check against the allow-list
pub fn validate_extension(key: &str, allowed_extensions: &[String]) -> Result<(), IngestError> {
    if allowed_extensions.iter().any(|ext| key.ends_with(ext.as_str())) {
        Ok(())
    } else {
        Err(IngestError::UnsupportedType {
            key: key.to_string(),
        })
    }
}

pub struct IngestionWorker {
    objects: Arc<dyn ObjectStore>,
    store: Arc<dyn MetadataStore>,
    allowed_extensions: Vec<String>,
}

impl IngestionWorker {
    pub fn new(
        objects: Arc<dyn ObjectStore>,
        store: Arc<dyn MetadataStore>,
        allowed_extensions: Vec<String>,
    ) -> Self {
        Self {
            objects,
            store,
            allowed_extensions,
        }
    }

    /// Validate and record a single upload
    #[instrument(skip(self, event), fields(bucket = %event.bucket_id, key = %event.object_key))]
    pub async fn ingest(&self, event: &UploadEvent) -> Result<UpsertOutcome, IngestError> {
        let key = decode_object_key(&event.object_key)?;
        validate_extension(&key, &self.allowed_extensions)?;

        let data = self.objects.get(&event.bucket_id, &key).await?;
        debug!(size_bytes = data.len(), "Object readable");

        let outcome = self
            .store
            .upsert(&ImageRecord::new(key.clone(), event.bucket_id.clone()))
            .await?;

        info!(id = %key, outcome = ?outcome, "Image accepted");
        Ok(outcome)
    }

    async fn process_envelope(&self, envelope: &DeliveryEnvelope) -> Result<Processed, IngestError> {
        let events = match Notification::parse(&envelope.message.body) {
            Notification::Upload(events) => events,
            Notification::Annotation(_) | Notification::Unrecognized => {
                debug!(
                    message_id = %envelope.message.message_id,
                    "Not an upload notification, acknowledging"
                );
                return Ok(Processed::Ignored);
            }
        };

        for event in &events {
            self.ingest(event).await?;
        }
        Ok(Processed::Ingested(events.len()))
    }
}

/// What a successfully processed envelope contained
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Processed {
    Ingested(usize),
    Ignored,
}

#[async_trait]
impl BatchHandler for IngestionWorker {
    async fn handle_batch(&self, batch: Vec<DeliveryEnvelope>) -> BatchOutcome {
        let results = join_all(batch.iter().map(|envelope| self.process_envelope(envelope))).await;

        let mut outcome = BatchOutcome::success();
        for (envelope, result) in batch.iter().zip(results) {
            match result {
                Ok(Processed::Ingested(uploads)) => {
                    metrics::counter!("photodrop.ingestion.accepted").increment(uploads as u64);
                }
                Ok(Processed::Ignored) => {
                    metrics::counter!("photodrop.ingestion.ignored").increment(1);
                }
                Err(e) if e.is_validation() => {
                    warn!(
                        message_id = %envelope.message.message_id,
                        receive_count = envelope.receive_count,
                        error = %e,
                        "Upload rejected"
                    );
                    metrics::counter!("photodrop.ingestion.rejected", "reason" => "validation")
                        .increment(1);
                    outcome.fail(envelope, e.to_string());
                }
                Err(e) => {
                    error!(
                        message_id = %envelope.message.message_id,
                        receive_count = envelope.receive_count,
                        error = %e,
                        "Upload could not be recorded"
                    );
                    metrics::counter!("photodrop.ingestion.rejected", "reason" => "transient")
                        .increment(1);
                    outcome.fail(envelope, e.to_string());
                }
            }
        }

        outcome
    }
}
