//! Photodrop Workers
//!
//! Image ingestion service for the photodrop pipeline. Upload notifications
//! and annotation submissions arrive through the notification broker and fan
//! out to independent consumers:
//!
//! - **Ingestion**: the ingestion queue feeds batches to a worker that decodes
//!   the object key, checks the file type, confirms the object is readable in
//!   S3 and records the image with an idempotent upsert
//! - **Rejection**: uploads that exhaust the queue's receive budget are
//!   redriven to a dead-letter queue whose consumer emails a rejection notice
//! - **Annotation**: caption, date and photographer submissions are filtered on
//!   their `metadata_type` attribute and applied as single-field updates
//! - **Confirmation**: every upload triggers an acceptance email
//!
//! ## Architecture
//!
//! ```text
//! Kafka Topic             Broker
//! ┌──────────────┐       ┌────────────────┐
//! │ Notifications│──────▶│ photodrop-     │
//! └──────────────┘       │ images         │
//!                        └────────────────┘
//!                          │       │      │
//!          ┌───────────────┘       │      └───────────────┐
//!          ▼                       ▼                      ▼
//!  ┌──────────────┐   ┌──────────────────┐   ┌──────────────────┐
//!  │ Ingestion    │   │ Metadata Update  │   │ Confirmation     │
//!  │ Queue        │   │ (metadata_type)  │   │ Mailer           │
//!  └──────────────┘   └──────────────────┘   └──────────────────┘
//!     │        │ receive budget spent │
//!     ▼        ▼                      ▼
//!  ┌────────┐ ┌──────────────┐   ┌──────────────┐
//!  │ Worker │ │ Dead Letter  │   │ PostgreSQL   │
//!  └────────┘ │ Queue        │   │ images       │
//!     │       └──────────────┘   └──────────────┘
//!     │              │                  ▲
//!     │              ▼                  │
//!     │       Rejection Mailer          │
//!     └─────────────────────────────────┘
//! ```

pub mod annotation;
pub mod api;
pub mod config;
pub mod ingestion;
pub mod mailer;
pub mod metadata_store;
pub mod notifier;
pub mod object_store;
pub mod topology;

pub use annotation::{MetadataUpdateWorker, MissingTargetRetry, SkipReason, UpdateOutcome};
pub use api::{create_router, start_api_server, AppState};
pub use config::Config;
pub use ingestion::{decode_object_key, validate_extension, IngestError, IngestionWorker};
pub use mailer::{EmailTemplate, MailError, Mailer, RecipientContext, SmtpMailer};
pub use metadata_store::{
    AnnotationField, ImageRecord, MemoryMetadataStore, MetadataStore, MetadataStoreError,
    PgMetadataStore, UpsertOutcome,
};
pub use notifier::{ConfirmationNotifier, RejectionNotifier};
pub use object_store::{MemoryObjectStore, ObjectStore, ObjectStoreError, S3ObjectStore};
pub use topology::{Collaborators, Topology, TopologySettings};
