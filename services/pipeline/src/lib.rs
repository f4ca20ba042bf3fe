//! Photodrop Pipeline - event distribution for the photodrop image service
//!
//! This library provides the transport half of the image pipeline:
//!
//! - A notification broker that fans each published message out to every
//!   subscription whose attribute filter matches
//! - At-least-once delivery queues with visibility timeouts, receive counting
//!   and dead-letter redrive
//! - A batch event source that feeds queue batches to handlers with bounded
//!   concurrency and partial-batch acknowledgement
//! - Kafka ingress that republishes object-created notifications and
//!   annotation submissions onto the broker
//!
//! # Example
//!
//! ```rust,no_run
//! use photodrop_pipeline::prelude::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let rejected = Arc::new(DeliveryQueue::new("img-rejected", QueueSettings::default()));
//!     let created = Arc::new(DeliveryQueue::new(
//!         "img-created",
//!         QueueSettings {
//!             dead_letter: Some(rejected.clone()),
//!             ..Default::default()
//!         },
//!     ));
//!
//!     let broker = NotificationBroker::new("new-image");
//!     broker.subscribe("ingestion", FilterPolicy::AcceptAll, SubscriptionEndpoint::Queue(created))?;
//!
//!     let body = ObjectCreatedNotification::single("images", "vacation+photo.png").to_body();
//!     broker.publish(body, Default::default())?;
//!     Ok(())
//! }
//! ```

pub mod broker;
pub mod config;
pub mod consumer;
pub mod kafka;
pub mod message;
pub mod queue;

// Re-export main types
pub use broker::{
    BrokerError, FilterPolicy, MessageHandler, NotificationBroker, PublishReceipt,
    SubscriptionEndpoint,
};
pub use config::{ConfigError, KafkaConfig, SaslConfig, SaslMechanism, SecurityProtocol, SslConfig};
pub use consumer::{BatchHandler, BatchItemFailure, BatchOutcome, EventSourceSettings, QueueEventSource};
pub use kafka::{KafkaSourceError, NotificationSource, OffsetTracker};
pub use message::{
    AnnotationDecodeError, AnnotationEvent, AnnotationPayload, AttributeKind, BrokerMessage,
    Notification, ObjectCreatedNotification, UnknownAttributeKind, UploadEvent,
    METADATA_TYPE_ATTRIBUTE,
};
pub use queue::{DeliveryEnvelope, DeliveryQueue, QueueSettings, QueueStats};

/// Async trait for handlers (re-export for convenience)
pub use async_trait::async_trait;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::broker::{FilterPolicy, MessageHandler, NotificationBroker, SubscriptionEndpoint};
    pub use crate::consumer::{BatchHandler, BatchOutcome, EventSourceSettings, QueueEventSource};
    pub use crate::message::{BrokerMessage, Notification, ObjectCreatedNotification, UploadEvent};
    pub use crate::queue::{DeliveryEnvelope, DeliveryQueue, QueueSettings};
    pub use async_trait::async_trait;
}
