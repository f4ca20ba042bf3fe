//! Metadata update worker.
//!
//! Receives annotation submissions that passed the `metadata_type` filter and
//! applies a single-field update to the matching image record. Failures are
//! logged and absorbed here; nothing is surfaced to the broker.

use crate::metadata_store::{AnnotationField, MetadataStore, MetadataStoreError};
use async_trait::async_trait;
use backoff::{backoff::Backoff, ExponentialBackoff};
use photodrop_pipeline::{AnnotationDecodeError, AnnotationEvent, BrokerError, BrokerMessage, MessageHandler};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

/// Why a message was skipped without touching the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    MissingKind,
    UnknownKind(String),
    InvalidBody(String),
}

impl From<AnnotationDecodeError> for SkipReason {
    fn from(err: AnnotationDecodeError) -> Self {
        match err {
            AnnotationDecodeError::MissingKind => SkipReason::MissingKind,
            AnnotationDecodeError::UnknownKind(kind) => SkipReason::UnknownKind(kind.0),
            AnnotationDecodeError::InvalidBody(e) => SkipReason::InvalidBody(e),
        }
    }
}

/// What happened to one annotation submission
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    Updated { field: AnnotationField },
    TargetMissing { image_id: String, attempts: u32 },
    Skipped(SkipReason),
    StoreFailed(String),
}

/// Bounded retry for updates that arrive before their record is ingested
#[derive(Debug, Clone)]
pub struct MissingTargetRetry {
    /// Extra attempts after the first; zero means a single attempt
    pub retries: u32,
    pub initial_backoff: Duration,
    /// Upper bound for any single delay
    pub max_backoff: Duration,
}

impl Default for MissingTargetRetry {
    fn default() -> Self {
        Self {
            retries: 0,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
        }
    }
}

pub struct MetadataUpdateWorker {
    store: Arc<dyn MetadataStore>,
    retry: MissingTargetRetry,
}

impl MetadataUpdateWorker {
    pub fn new(store: Arc<dyn MetadataStore>, retry: MissingTargetRetry) -> Self {
        Self { store, retry }
    }

    /// Decode and apply one submission
    #[instrument(skip(self, message), fields(message_id = %message.message_id))]
    pub async fn apply(&self, message: &BrokerMessage) -> UpdateOutcome {
        let event = match AnnotationEvent::from_message(message) {
            Ok(event) => event,
            Err(e) => return UpdateOutcome::Skipped(e.into()),
        };
        let field = AnnotationField::from(event.attribute_kind);

        let mut backoff = ExponentialBackoff {
            initial_interval: self.retry.initial_backoff,
            max_interval: self.retry.max_backoff.max(self.retry.initial_backoff),
            max_elapsed_time: None,
            ..Default::default()
        };
        // Default seeds current_interval with its own initial interval
        backoff.reset();
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            match self
                .store
                .update_field(&event.image_id, field, &event.value)
                .await
            {
                Ok(()) => return UpdateOutcome::Updated { field },
                Err(MetadataStoreError::TargetMissing { image_id }) => {
                    if attempts > self.retry.retries {
                        return UpdateOutcome::TargetMissing { image_id, attempts };
                    }
                    match backoff.next_backoff() {
                        Some(delay) => {
                            debug!(
                                image_id = %image_id,
                                attempt = attempts,
                                delay_ms = delay.as_millis() as u64,
                                "Target record not ingested yet, retrying"
                            );
                            tokio::time::sleep(delay).await;
                        }
                        None => return UpdateOutcome::TargetMissing { image_id, attempts },
                    }
                }
                Err(e) => return UpdateOutcome::StoreFailed(e.to_string()),
            }
        }
    }
}

#[async_trait]
impl MessageHandler for MetadataUpdateWorker {
    async fn handle(&self, message: BrokerMessage) -> Result<(), BrokerError> {
        match self.apply(&message).await {
            UpdateOutcome::Updated { field } => {
                info!(message_id = %message.message_id, field = field.column(), "Annotation applied");
                metrics::counter!("photodrop.annotation.updated").increment(1);
            }
            UpdateOutcome::TargetMissing { image_id, attempts } => {
                warn!(
                    message_id = %message.message_id,
                    image_id = %image_id,
                    attempts,
                    "Annotation target does not exist, dropping update"
                );
                metrics::counter!("photodrop.annotation.dropped", "reason" => "target_missing")
                    .increment(1);
            }
            UpdateOutcome::Skipped(reason) => {
                // distinct from both success and failure
                info!(message_id = %message.message_id, reason = ?reason, "Annotation skipped");
                metrics::counter!("photodrop.annotation.dropped", "reason" => "skipped").increment(1);
            }
            UpdateOutcome::StoreFailed(e) => {
                error!(message_id = %message.message_id, error = %e, "Annotation update failed");
                metrics::counter!("photodrop.annotation.dropped", "reason" => "store_failed")
                    .increment(1);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata_store::{ImageRecord, MemoryMetadataStore, MockMetadataStore};
    use photodrop_pipeline::{AttributeKind, METADATA_TYPE_ATTRIBUTE};

    fn annotation(image_id: &str, kind: AttributeKind, value: &str) -> BrokerMessage {
        AnnotationEvent {
            image_id: image_id.to_string(),
            attribute_kind: kind,
            value: value.to_string(),
        }
        .to_message()
    }

    #[tokio::test]
    async fn test_caption_update_on_existing_record() {
        let store = Arc::new(MemoryMetadataStore::new());
        store.upsert(&ImageRecord::new("img1", "images")).await.unwrap();
        let worker = MetadataUpdateWorker::new(store.clone(), MissingTargetRetry::default());

        let outcome = worker
            .apply(&annotation("img1", AttributeKind::Caption, "Sunset"))
            .await;

        assert_eq!(
            outcome,
            UpdateOutcome::Updated {
                field: AnnotationField::Caption
            }
        );
        let record = store.get("img1", "images").await.unwrap().unwrap();
        assert_eq!(record.caption.as_deref(), Some("Sunset"));
        assert_eq!(record.bucket_name, "images");
        assert_eq!(record.photographer, None);
    }

    #[tokio::test]
    async fn test_unknown_and_missing_kinds_are_skipped() {
        let mut store = MockMetadataStore::new();
        store.expect_update_field().never();
        let worker = MetadataUpdateWorker::new(Arc::new(store), MissingTargetRetry::default());

        let unknown = BrokerMessage::new(r#"{"id":"img1","value":"x"}"#)
            .with_attribute(METADATA_TYPE_ATTRIBUTE, "Location");
        assert_eq!(
            worker.apply(&unknown).await,
            UpdateOutcome::Skipped(SkipReason::UnknownKind("Location".to_string()))
        );

        let untagged = BrokerMessage::new(r#"{"id":"img1","value":"x"}"#);
        assert_eq!(
            worker.apply(&untagged).await,
            UpdateOutcome::Skipped(SkipReason::MissingKind)
        );

        let garbled = BrokerMessage::new("not json").with_attribute(METADATA_TYPE_ATTRIBUTE, "Date");
        assert!(matches!(
            worker.apply(&garbled).await,
            UpdateOutcome::Skipped(SkipReason::InvalidBody(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_target_single_attempt_by_default() {
        let mut store = MockMetadataStore::new();
        store.expect_update_field().times(1).returning(|id, _, _| {
            Err(MetadataStoreError::TargetMissing {
                image_id: id.to_string(),
            })
        });
        let worker = MetadataUpdateWorker::new(Arc::new(store), MissingTargetRetry::default());

        let message = annotation("ghost", AttributeKind::Date, "2024-06-01");
        assert_eq!(
            worker.apply(&message).await,
            UpdateOutcome::TargetMissing {
                image_id: "ghost".to_string(),
                attempts: 1
            }
        );
        // errors never reach the broker
        assert!(worker.handle(message).await.is_ok());
    }

    #[tokio::test]
    async fn test_missing_target_retry_succeeds_once_ingested() {
        let store = Arc::new(MemoryMetadataStore::new());
        let worker = MetadataUpdateWorker::new(
            store.clone(),
            MissingTargetRetry {
                retries: 5,
                initial_backoff: Duration::from_millis(20),
                max_backoff: Duration::from_millis(100),
            },
        );
        let started = tokio::time::Instant::now();

        let ingest = {
            let store = store.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                store.upsert(&ImageRecord::new("late", "images")).await.unwrap();
            })
        };

        let outcome = worker
            .apply(&annotation("late", AttributeKind::Photographer, "Ansel"))
            .await;
        ingest.await.unwrap();

        assert_eq!(
            outcome,
            UpdateOutcome::Updated {
                field: AnnotationField::Photographer
            }
        );
        // the configured backoff drives the delays, not the library default
        assert!(started.elapsed() < Duration::from_millis(400));
    }

    #[tokio::test]
    async fn test_retry_delays_stay_within_configured_bounds() {
        let mut store = MockMetadataStore::new();
        store.expect_update_field().times(4).returning(|id, _, _| {
            Err(MetadataStoreError::TargetMissing {
                image_id: id.to_string(),
            })
        });
        let worker = MetadataUpdateWorker::new(
            Arc::new(store),
            MissingTargetRetry {
                retries: 3,
                initial_backoff: Duration::from_millis(10),
                max_backoff: Duration::from_millis(20),
            },
        );

        let started = tokio::time::Instant::now();
        let outcome = worker
            .apply(&annotation("ghost", AttributeKind::Caption, "x"))
            .await;

        assert_eq!(
            outcome,
            UpdateOutcome::TargetMissing {
                image_id: "ghost".to_string(),
                attempts: 4
            }
        );
        // three delays, each at most 20ms plus jitter
        assert!(started.elapsed() < Duration::from_millis(300));
    }

    #[tokio::test]
    async fn test_store_outage_is_absorbed() {
        let store = Arc::new(MemoryMetadataStore::new());
        store.set_unavailable(true);
        let worker = MetadataUpdateWorker::new(store, MissingTargetRetry::default());

        let message = annotation("img1", AttributeKind::Caption, "Sunset");
        assert!(matches!(
            worker.apply(&message).await,
            UpdateOutcome::StoreFailed(_)
        ));
        assert!(worker.handle(message).await.is_ok());
    }
}
