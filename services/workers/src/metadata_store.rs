use crate::config::{is_valid_table_name, DatabaseConfig};
use async_trait::async_trait;
use parking_lot::RwLock;
use photodrop_pipeline::AttributeKind;
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::FromRow;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tracing::{debug, info, instrument};

#[derive(Error, Debug)]
pub enum MetadataStoreError {
    #[error("No image record with id {image_id}")]
    TargetMissing { image_id: String },

    #[error("Invalid table name {0:?}")]
    InvalidTableName(String),

    #[error("Metadata store unavailable: {0}")]
    Unavailable(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Accepted image record, keyed by (id, bucket_name)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct ImageRecord {
    /// Decoded object key
    pub id: String,
    pub bucket_name: String,
    pub caption: Option<String>,
    pub date: Option<String>,
    pub photographer: Option<String>,
}

impl ImageRecord {
    pub fn new(id: impl Into<String>, bucket_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            bucket_name: bucket_name.into(),
            caption: None,
            date: None,
            photographer: None,
        }
    }
}

/// Mutable annotation column of an image record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnotationField {
    Caption,
    Date,
    Photographer,
}

impl AnnotationField {
    pub fn column(&self) -> &'static str {
        match self {
            AnnotationField::Caption => "caption",
            AnnotationField::Date => "date",
            AnnotationField::Photographer => "photographer",
        }
    }

    fn slot<'a>(&self, record: &'a mut ImageRecord) -> &'a mut Option<String> {
        match self {
            AnnotationField::Caption => &mut record.caption,
            AnnotationField::Date => &mut record.date,
            AnnotationField::Photographer => &mut record.photographer,
        }
    }
}

impl From<AttributeKind> for AnnotationField {
    fn from(kind: AttributeKind) -> Self {
        match kind {
            AttributeKind::Caption => AnnotationField::Caption,
            AttributeKind::Date => AnnotationField::Date,
            AttributeKind::Photographer => AnnotationField::Photographer,
        }
    }
}

/// Result of an idempotent upsert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created,
    /// A record with the same key was already stored and is left untouched
    AlreadyPresent,
}

/// Image record persistence
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Insert the record unless one with the same (id, bucket_name) exists
    async fn upsert(&self, record: &ImageRecord) -> Result<UpsertOutcome, MetadataStoreError>;

    /// Set one annotation field on every record with this id
    async fn update_field(
        &self,
        image_id: &str,
        field: AnnotationField,
        value: &str,
    ) -> Result<(), MetadataStoreError>;

    async fn get(&self, image_id: &str, bucket_name: &str)
        -> Result<Option<ImageRecord>, MetadataStoreError>;

    /// Connectivity check for readiness probes
    async fn ping(&self) -> Result<(), MetadataStoreError>;
}

/// PostgreSQL-backed metadata store
pub struct PgMetadataStore {
    pool: PgPool,
    table: String,
}

impl PgMetadataStore {
    /// Connect using the configured pool settings
    pub async fn connect(url: &str, config: &DatabaseConfig) -> Result<Self, MetadataStoreError> {
        if !is_valid_table_name(&config.table_name) {
            return Err(MetadataStoreError::InvalidTableName(config.table_name.clone()));
        }

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.connect_timeout())
            .idle_timeout(Some(config.idle_timeout()))
            .connect(url)
            .await?;

        info!(table = %config.table_name, "Connected to PostgreSQL database");

        Ok(Self {
            pool,
            table: config.table_name.clone(),
        })
    }

    /// Create the records table if it does not exist
    pub async fn ensure_schema(&self) -> Result<(), MetadataStoreError> {
        info!(table = %self.table, "Ensuring image record table");

        let sql = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                id TEXT NOT NULL,
                bucket_name TEXT NOT NULL,
                caption TEXT,
                date TEXT,
                photographer TEXT,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ,
                PRIMARY KEY (id, bucket_name)
            )
            "#,
            table = self.table
        );

        sqlx::query(&sql).execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl MetadataStore for PgMetadataStore {
    #[instrument(skip(self, record), fields(id = %record.id, bucket = %record.bucket_name))]
    async fn upsert(&self, record: &ImageRecord) -> Result<UpsertOutcome, MetadataStoreError> {
        let sql = format!(
            r#"
            INSERT INTO {table} (id, bucket_name, caption, date, photographer)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (id, bucket_name) DO NOTHING
            "#,
            table = self.table
        );

        let result = sqlx::query(&sql)
            .bind(&record.id)
            .bind(&record.bucket_name)
            .bind(&record.caption)
            .bind(&record.date)
            .bind(&record.photographer)
            .execute(&self.pool)
            .await?;

        let outcome = if result.rows_affected() == 0 {
            UpsertOutcome::AlreadyPresent
        } else {
            UpsertOutcome::Created
        };

        debug!(outcome = ?outcome, "Image record upserted");
        Ok(outcome)
    }

    #[instrument(skip(self, value), fields(column = field.column()))]
    async fn update_field(
        &self,
        image_id: &str,
        field: AnnotationField,
        value: &str,
    ) -> Result<(), MetadataStoreError> {
        let sql = format!(
            "UPDATE {table} SET {column} = $1, updated_at = NOW() WHERE id = $2",
            table = self.table,
            column = field.column()
        );

        let result = sqlx::query(&sql)
            .bind(value)
            .bind(image_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(MetadataStoreError::TargetMissing {
                image_id: image_id.to_string(),
            });
        }

        Ok(())
    }

    async fn get(
        &self,
        image_id: &str,
        bucket_name: &str,
    ) -> Result<Option<ImageRecord>, MetadataStoreError> {
        let sql = format!(
            r#"
            SELECT id, bucket_name, caption, date, photographer
            FROM {table}
            WHERE id = $1 AND bucket_name = $2
            "#,
            table = self.table
        );

        let record = sqlx::query_as::<_, ImageRecord>(&sql)
            .bind(image_id)
            .bind(bucket_name)
            .fetch_optional(&self.pool)
            .await?;

        Ok(record)
    }

    async fn ping(&self) -> Result<(), MetadataStoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

/// In-process metadata store used when no database is configured
#[derive(Default)]
pub struct MemoryMetadataStore {
    records: RwLock<BTreeMap<(String, String), ImageRecord>>,
    unavailable: AtomicBool,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage: every call fails with `Unavailable` until cleared
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn records(&self) -> Vec<ImageRecord> {
        self.records.read().values().cloned().collect()
    }

    fn check_available(&self) -> Result<(), MetadataStoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(MetadataStoreError::Unavailable("memory store offline".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl MetadataStore for MemoryMetadataStore {
    async fn upsert(&self, record: &ImageRecord) -> Result<UpsertOutcome, MetadataStoreError> {
        self.check_available()?;

        let key = (record.id.clone(), record.bucket_name.clone());
        let mut records = self.records.write();
        if records.contains_key(&key) {
            return Ok(UpsertOutcome::AlreadyPresent);
        }
        records.insert(key, record.clone());
        Ok(UpsertOutcome::Created)
    }

    async fn update_field(
        &self,
        image_id: &str,
        field: AnnotationField,
        value: &str,
    ) -> Result<(), MetadataStoreError> {
        self.check_available()?;

        let mut records = self.records.write();
        let mut updated = 0;
        for record in records.values_mut().filter(|r| r.id == image_id) {
            *field.slot(record) = Some(value.to_string());
            updated += 1;
        }

        if updated == 0 {
            return Err(MetadataStoreError::TargetMissing {
                image_id: image_id.to_string(),
            });
        }
        Ok(())
    }

    async fn get(
        &self,
        image_id: &str,
        bucket_name: &str,
    ) -> Result<Option<ImageRecord>, MetadataStoreError> {
        self.check_available()?;

        Ok(self
            .records
            .read()
            .get(&(image_id.to_string(), bucket_name.to_string()))
            .cloned())
    }

    async fn ping(&self) -> Result<(), MetadataStoreError> {
        self.check_available()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_upsert_is_idempotent() {
        let store = MemoryMetadataStore::new();
        let record = ImageRecord::new("vacation photo.png", "images");

        assert_eq!(store.upsert(&record).await.unwrap(), UpsertOutcome::Created);
        assert_eq!(
            store.upsert(&record).await.unwrap(),
            UpsertOutcome::AlreadyPresent
        );
        assert_eq!(store.records().len(), 1);
    }

    #[tokio::test]
    async fn test_redelivered_upsert_keeps_annotations() {
        let store = MemoryMetadataStore::new();
        let record = ImageRecord::new("img1", "images");
        store.upsert(&record).await.unwrap();
        store
            .update_field("img1", AnnotationField::Caption, "Sunset")
            .await
            .unwrap();

        store.upsert(&record).await.unwrap();

        let stored = store.get("img1", "images").await.unwrap().unwrap();
        assert_eq!(stored.caption.as_deref(), Some("Sunset"));
    }

    #[tokio::test]
    async fn test_update_touches_only_one_field() {
        let store = MemoryMetadataStore::new();
        store.upsert(&ImageRecord::new("img1", "images")).await.unwrap();

        store
            .update_field("img1", AnnotationField::Photographer, "Ansel")
            .await
            .unwrap();

        let stored = store.get("img1", "images").await.unwrap().unwrap();
        assert_eq!(stored.photographer.as_deref(), Some("Ansel"));
        assert_eq!(stored.caption, None);
        assert_eq!(stored.date, None);
        assert_eq!(stored.bucket_name, "images");
    }

    #[tokio::test]
    async fn test_update_missing_target() {
        let store = MemoryMetadataStore::new();
        let err = store
            .update_field("ghost", AnnotationField::Date, "2024-01-01")
            .await
            .unwrap_err();
        assert!(matches!(err, MetadataStoreError::TargetMissing { .. }));
    }

    #[test]
    fn test_field_mapping_from_attribute_kind() {
        assert_eq!(AnnotationField::from(AttributeKind::Caption).column(), "caption");
        assert_eq!(AnnotationField::from(AttributeKind::Date).column(), "date");
        assert_eq!(
            AnnotationField::from(AttributeKind::Photographer).column(),
            "photographer"
        );
    }
}
