//! Message model shared by the broker, the delivery queues and the workers.
//!
//! A broker message is an opaque JSON body plus string attributes. Bodies come
//! in two shapes: object-created notifications emitted by the object store, and
//! annotation submissions whose kind travels in the `metadata_type` attribute.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Attribute carrying the annotation kind of a message
pub const METADATA_TYPE_ATTRIBUTE: &str = "metadata_type";

/// A message as published to the notification broker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerMessage {
    /// Broker-assigned message ID, stable across redeliveries
    pub message_id: Uuid,
    /// Raw JSON body
    pub body: String,
    /// Message attributes used by subscription filter policies
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    /// When the message was published
    pub published_at: DateTime<Utc>,
}

impl BrokerMessage {
    /// Create a message with a fresh ID and no attributes
    pub fn new(body: impl Into<String>) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            body: body.into(),
            attributes: BTreeMap::new(),
            published_at: Utc::now(),
        }
    }

    /// Add an attribute to the message
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Get an attribute value
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(|s| s.as_str())
    }

    /// Get the annotation kind attribute, if present
    pub fn metadata_type(&self) -> Option<&str> {
        self.attribute(METADATA_TYPE_ATTRIBUTE)
    }
}

/// Object-created notification as emitted by the object store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectCreatedNotification {
    #[serde(rename = "Records")]
    pub records: Vec<ObjectCreatedRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectCreatedRecord {
    #[serde(rename = "eventName", default)]
    pub event_name: String,
    pub s3: S3Entity,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct S3Entity {
    pub bucket: S3Bucket,
    pub object: S3Object,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct S3Bucket {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct S3Object {
    /// Object key, `+`/percent encoded
    pub key: String,
    #[serde(default)]
    pub size: u64,
}

impl ObjectCreatedNotification {
    /// Build a notification for a single object
    pub fn single(bucket: impl Into<String>, encoded_key: impl Into<String>) -> Self {
        Self {
            records: vec![ObjectCreatedRecord {
                event_name: "ObjectCreated:Put".to_string(),
                s3: S3Entity {
                    bucket: S3Bucket {
                        name: bucket.into(),
                    },
                    object: S3Object {
                        key: encoded_key.into(),
                        size: 0,
                    },
                },
            }],
        }
    }

    /// Serialize the notification as a broker message body
    pub fn to_body(&self) -> String {
        // A struct of strings and integers always serializes
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Upload events carried by this notification
    pub fn upload_events(&self) -> Vec<UploadEvent> {
        self.records
            .iter()
            .map(|record| UploadEvent {
                bucket_id: record.s3.bucket.name.clone(),
                object_key: record.s3.object.key.clone(),
            })
            .collect()
    }
}

/// One uploaded object. The key is still in notification encoding.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UploadEvent {
    pub bucket_id: String,
    pub object_key: String,
}

/// Annotation field a submission targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AttributeKind {
    Caption,
    Date,
    Photographer,
}

impl AttributeKind {
    pub const ALL: [AttributeKind; 3] = [
        AttributeKind::Caption,
        AttributeKind::Date,
        AttributeKind::Photographer,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AttributeKind::Caption => "Caption",
            AttributeKind::Date => "Date",
            AttributeKind::Photographer => "Photographer",
        }
    }

    /// Attribute values accepted by the metadata-update subscription
    pub fn allow_list() -> Vec<String> {
        Self::ALL.iter().map(|k| k.as_str().to_string()).collect()
    }
}

impl fmt::Display for AttributeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unrecognized attribute kind: {0:?}")]
pub struct UnknownAttributeKind(pub String);

impl FromStr for AttributeKind {
    type Err = UnknownAttributeKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Caption" => Ok(AttributeKind::Caption),
            "Date" => Ok(AttributeKind::Date),
            "Photographer" => Ok(AttributeKind::Photographer),
            other => Err(UnknownAttributeKind(other.to_string())),
        }
    }
}

/// Body of an annotation submission
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnnotationPayload {
    /// Target image ID (the decoded object key)
    pub id: String,
    pub value: String,
}

/// A decoded annotation submission
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnotationEvent {
    pub image_id: String,
    pub attribute_kind: AttributeKind,
    pub value: String,
}

/// Why a message could not be read as an annotation
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AnnotationDecodeError {
    #[error("message has no metadata_type attribute")]
    MissingKind,

    #[error(transparent)]
    UnknownKind(#[from] UnknownAttributeKind),

    #[error("invalid annotation body: {0}")]
    InvalidBody(String),
}

impl AnnotationEvent {
    /// Decode an annotation from a broker message body and its `metadata_type` attribute
    pub fn from_message(message: &BrokerMessage) -> Result<Self, AnnotationDecodeError> {
        let kind = message
            .metadata_type()
            .ok_or(AnnotationDecodeError::MissingKind)?;
        let attribute_kind = kind.parse::<AttributeKind>()?;

        let payload: AnnotationPayload = serde_json::from_str(&message.body)
            .map_err(|e| AnnotationDecodeError::InvalidBody(e.to_string()))?;

        Ok(Self {
            image_id: payload.id,
            attribute_kind,
            value: payload.value,
        })
    }

    /// Encode as a broker message tagged with its kind
    pub fn to_message(&self) -> BrokerMessage {
        let payload = AnnotationPayload {
            id: self.image_id.clone(),
            value: self.value.clone(),
        };
        let body = serde_json::to_string(&payload).unwrap_or_default();

        BrokerMessage::new(body).with_attribute(METADATA_TYPE_ATTRIBUTE, self.attribute_kind.as_str())
    }
}

/// Classification of a broker message body
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    /// Object-created notification carrying one or more uploads
    Upload(Vec<UploadEvent>),
    /// Annotation submission body
    Annotation(AnnotationPayload),
    /// Anything else (test events, malformed JSON)
    Unrecognized,
}

impl Notification {
    pub fn parse(body: &str) -> Self {
        if let Ok(notification) = serde_json::from_str::<ObjectCreatedNotification>(body) {
            return Notification::Upload(notification.upload_events());
        }

        if let Ok(payload) = serde_json::from_str::<AnnotationPayload>(body) {
            return Notification::Annotation(payload);
        }

        Notification::Unrecognized
    }
}
