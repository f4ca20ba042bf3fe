//! Wires the broker, queues, workers and notifiers into one running pipeline.
//!
//! ```text
//!                      ┌──────────────────┐
//!  notification ──────▶│ broker           │
//!                      └──────────────────┘
//!          │ (all)            │ (metadata_type)         │ (all)
//!          ▼                  ▼                         ▼
//!  ┌──────────────┐   ┌──────────────────┐   ┌──────────────────────┐
//!  │ ingestion    │   │ metadata update  │   │ confirmation mailer  │
//!  │ queue        │   │ worker           │   └──────────────────────┘
//!  └──────────────┘   └──────────────────┘
//!     │        │ (receive budget spent)
//!     ▼        ▼
//!  ingestion  dead-letter queue ──▶ rejection mailer
//!  worker
//! ```

use crate::annotation::{MetadataUpdateWorker, MissingTargetRetry};
use crate::config::Config;
use crate::ingestion::IngestionWorker;
use crate::mailer::Mailer;
use crate::metadata_store::MetadataStore;
use crate::notifier::{ConfirmationNotifier, RejectionNotifier};
use crate::object_store::ObjectStore;
use photodrop_pipeline::{
    AttributeKind, BrokerError, DeliveryQueue, EventSourceSettings, FilterPolicy,
    NotificationBroker, QueueEventSource, QueueSettings, SubscriptionEndpoint,
    METADATA_TYPE_ATTRIBUTE,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub const INGESTION_SUBSCRIPTION: &str = "ingestion-queue";
pub const METADATA_UPDATE_SUBSCRIPTION: &str = "metadata-update";
pub const CONFIRMATION_SUBSCRIPTION: &str = "confirmation-mailer";

#[derive(Debug, Clone)]
pub struct TopologySettings {
    pub topic: String,
    pub visibility_timeout: Duration,
    pub max_receive_count: u32,
    pub ingestion: EventSourceSettings,
    pub rejection: EventSourceSettings,
    pub allowed_extensions: Vec<String>,
    pub annotation_retry: MissingTargetRetry,
    pub recipient: String,
}

impl Default for TopologySettings {
    fn default() -> Self {
        Self {
            topic: "photodrop-images".to_string(),
            visibility_timeout: Duration::from_secs(30),
            max_receive_count: 1,
            ingestion: EventSourceSettings::default(),
            rejection: EventSourceSettings::default(),
            allowed_extensions: vec![".jpeg".to_string(), ".png".to_string()],
            annotation_retry: MissingTargetRetry::default(),
            recipient: "submitter@photodrop.local".to_string(),
        }
    }
}

impl TopologySettings {
    pub fn from_config(config: &Config) -> Self {
        let ingestion = &config.ingestion;
        let batch_timeout = Duration::from_secs(ingestion.batch_timeout_secs);

        Self {
            topic: config.kafka.notifications_topic.clone(),
            visibility_timeout: Duration::from_secs(ingestion.visibility_timeout_secs),
            max_receive_count: ingestion.max_receive_count,
            ingestion: EventSourceSettings {
                batch_size: ingestion.batch_size,
                batching_window: Duration::from_secs(ingestion.batching_window_secs),
                max_concurrency: ingestion.max_concurrency,
                batch_timeout,
            },
            rejection: EventSourceSettings {
                batch_size: config.rejection.batch_size,
                batching_window: Duration::from_secs(config.rejection.batching_window_secs),
                max_concurrency: 1,
                batch_timeout,
            },
            allowed_extensions: ingestion.allowed_extensions.clone(),
            annotation_retry: MissingTargetRetry {
                retries: config.annotation.missing_target_retries,
                initial_backoff: Duration::from_millis(config.annotation.retry_initial_backoff_ms),
                max_backoff: Duration::from_millis(config.annotation.retry_max_backoff_ms),
            },
            recipient: config.mail.recipient.clone(),
        }
    }
}

/// External services the pipeline writes to
#[derive(Clone)]
pub struct Collaborators {
    pub objects: Arc<dyn ObjectStore>,
    pub metadata: Arc<dyn MetadataStore>,
    pub mailer: Arc<dyn Mailer>,
}

pub struct Topology {
    broker: Arc<NotificationBroker>,
    ingestion_queue: Arc<DeliveryQueue>,
    dead_letter_queue: Arc<DeliveryQueue>,
    ingestion_source: Arc<QueueEventSource>,
    rejection_source: Arc<QueueEventSource>,
    ingestion_worker: Arc<IngestionWorker>,
    rejection_notifier: Arc<RejectionNotifier>,
}

impl Topology {
    /// Register every subscription. Must run inside a Tokio runtime.
    pub fn build(settings: TopologySettings, collaborators: Collaborators) -> Result<Self, BrokerError> {
        let dead_letter_queue = Arc::new(DeliveryQueue::new(
            format!("{}-rejected", settings.topic),
            QueueSettings {
                visibility_timeout: settings.visibility_timeout,
                ..Default::default()
            },
        ));
        let ingestion_queue = Arc::new(DeliveryQueue::new(
            format!("{}-created", settings.topic),
            QueueSettings {
                visibility_timeout: settings.visibility_timeout,
                max_receive_count: settings.max_receive_count,
                dead_letter: Some(dead_letter_queue.clone()),
            },
        ));

        let broker = Arc::new(NotificationBroker::new(settings.topic.clone()));

        broker.subscribe(
            INGESTION_SUBSCRIPTION,
            FilterPolicy::AcceptAll,
            SubscriptionEndpoint::Queue(ingestion_queue.clone()),
        )?;
        broker.subscribe(
            METADATA_UPDATE_SUBSCRIPTION,
            FilterPolicy::allow_list(METADATA_TYPE_ATTRIBUTE, AttributeKind::allow_list()),
            SubscriptionEndpoint::Handler(Arc::new(MetadataUpdateWorker::new(
                collaborators.metadata.clone(),
                settings.annotation_retry.clone(),
            ))),
        )?;
        broker.subscribe(
            CONFIRMATION_SUBSCRIPTION,
            FilterPolicy::AcceptAll,
            SubscriptionEndpoint::Handler(Arc::new(ConfirmationNotifier::new(
                collaborators.mailer.clone(),
                settings.recipient.clone(),
            ))),
        )?;

        let ingestion_worker = Arc::new(IngestionWorker::new(
            collaborators.objects.clone(),
            collaborators.metadata.clone(),
            settings.allowed_extensions.clone(),
        ));
        let rejection_notifier = Arc::new(RejectionNotifier::new(
            collaborators.mailer.clone(),
            settings.recipient.clone(),
        ));

        let ingestion_source = Arc::new(QueueEventSource::new(
            "ingestion-worker",
            ingestion_queue.clone(),
            settings.ingestion.clone(),
        ));
        let rejection_source = Arc::new(QueueEventSource::new(
            "rejection-mailer",
            dead_letter_queue.clone(),
            settings.rejection.clone(),
        ));

        info!(topic = %settings.topic, "Pipeline topology built");

        Ok(Self {
            broker,
            ingestion_queue,
            dead_letter_queue,
            ingestion_source,
            rejection_source,
            ingestion_worker,
            rejection_notifier,
        })
    }

    pub fn broker(&self) -> Arc<NotificationBroker> {
        self.broker.clone()
    }

    pub fn ingestion_queue(&self) -> Arc<DeliveryQueue> {
        self.ingestion_queue.clone()
    }

    pub fn dead_letter_queue(&self) -> Arc<DeliveryQueue> {
        self.dead_letter_queue.clone()
    }

    /// Start both queue event sources
    pub fn spawn(&self) -> Vec<JoinHandle<()>> {
        let ingestion = {
            let source = self.ingestion_source.clone();
            let worker = self.ingestion_worker.clone();
            tokio::spawn(async move { source.run(worker).await })
        };
        let rejection = {
            let source = self.rejection_source.clone();
            let notifier = self.rejection_notifier.clone();
            tokio::spawn(async move { source.run(notifier).await })
        };

        vec![ingestion, rejection]
    }

    /// Stop polling, wait for running batches, then drain broker handlers
    pub async fn shutdown(&self, handles: Vec<JoinHandle<()>>) {
        self.ingestion_source.shutdown();
        self.rejection_source.shutdown();

        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Event source task ended abnormally");
            }
        }

        self.broker.shutdown().await;
        info!("Pipeline topology stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mailer::MockMailer;
    use crate::metadata_store::MemoryMetadataStore;
    use crate::object_store::MemoryObjectStore;

    #[test]
    fn test_settings_from_config() {
        let mut config = Config::default();
        config.ingestion.max_receive_count = 3;
        config.annotation.missing_target_retries = 2;

        let settings = TopologySettings::from_config(&config);
        assert_eq!(settings.max_receive_count, 3);
        assert_eq!(settings.ingestion.batch_size, 5);
        assert_eq!(settings.ingestion.batching_window, Duration::from_secs(5));
        assert_eq!(settings.ingestion.max_concurrency, 2);
        assert_eq!(settings.ingestion.batch_timeout, Duration::from_secs(15));
        assert_eq!(settings.annotation_retry.retries, 2);
        assert_eq!(settings.annotation_retry.max_backoff, Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_subscriptions_and_filters() {
        let topology = Topology::build(
            TopologySettings::default(),
            Collaborators {
                objects: Arc::new(MemoryObjectStore::new()),
                metadata: Arc::new(MemoryMetadataStore::new()),
                mailer: Arc::new(MockMailer::new()),
            },
        )
        .unwrap();

        let subscriptions = topology.broker().subscriptions();
        let names: Vec<&str> = subscriptions.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(
            names,
            vec![
                INGESTION_SUBSCRIPTION,
                METADATA_UPDATE_SUBSCRIPTION,
                CONFIRMATION_SUBSCRIPTION
            ]
        );
        assert_eq!(
            subscriptions[1].1,
            FilterPolicy::allow_list(
                METADATA_TYPE_ATTRIBUTE,
                vec!["Caption".into(), "Date".into(), "Photographer".into()]
            )
        );
        assert_eq!(
            topology.ingestion_queue().settings().max_receive_count,
            1
        );

        topology.shutdown(Vec::new()).await;
    }
}
