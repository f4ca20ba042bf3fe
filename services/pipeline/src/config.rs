//! Kafka ingress configuration.
//!
//! Object-created notifications and annotation submissions reach the broker
//! through a Kafka topic. These structures describe how to connect to it,
//! including SSL/SASL authentication.

use rdkafka::config::ClientConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Errors that can occur during configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required configuration: {0}")]
    MissingRequired(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Security protocol for Kafka connections
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SecurityProtocol {
    #[default]
    Plaintext,
    Ssl,
    SaslPlaintext,
    SaslSsl,
}

impl SecurityProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            SecurityProtocol::Plaintext => "plaintext",
            SecurityProtocol::Ssl => "ssl",
            SecurityProtocol::SaslPlaintext => "sasl_plaintext",
            SecurityProtocol::SaslSsl => "sasl_ssl",
        }
    }

    fn uses_sasl(&self) -> bool {
        matches!(self, SecurityProtocol::SaslPlaintext | SecurityProtocol::SaslSsl)
    }
}

/// SASL mechanism for authentication
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SaslMechanism {
    #[default]
    Plain,
    ScramSha256,
    ScramSha512,
}

impl SaslMechanism {
    pub fn as_str(&self) -> &'static str {
        match self {
            SaslMechanism::Plain => "PLAIN",
            SaslMechanism::ScramSha256 => "SCRAM-SHA-256",
            SaslMechanism::ScramSha512 => "SCRAM-SHA-512",
        }
    }
}

/// SSL/TLS configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SslConfig {
    /// Path to CA certificate file
    pub ca_location: Option<String>,
    /// Path to client certificate file
    pub certificate_location: Option<String>,
    /// Path to client private key file
    pub key_location: Option<String>,
}

/// SASL authentication configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SaslConfig {
    #[serde(default)]
    pub mechanism: SaslMechanism,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// Kafka ingress configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KafkaConfig {
    /// Comma-separated list of broker addresses
    pub bootstrap_servers: String,
    /// Client ID for this connection
    #[serde(default = "default_client_id")]
    pub client_id: String,
    /// Consumer group ID
    #[serde(default = "default_group_id")]
    pub group_id: String,
    /// Topic carrying object-created notifications and annotation submissions
    #[serde(default = "default_notifications_topic")]
    pub notifications_topic: String,
    /// Auto offset reset: earliest, latest, none
    #[serde(default = "default_auto_offset_reset")]
    pub auto_offset_reset: String,
    /// Session timeout in milliseconds
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u32,
    /// Maximum poll interval in milliseconds
    #[serde(default = "default_max_poll_interval_ms")]
    pub max_poll_interval_ms: u32,
    /// Security protocol
    #[serde(default)]
    pub security_protocol: SecurityProtocol,
    /// SSL configuration
    #[serde(default)]
    pub ssl: SslConfig,
    /// SASL configuration
    #[serde(default)]
    pub sasl: SaslConfig,
    /// Additional Kafka properties
    #[serde(default)]
    pub extra_properties: HashMap<String, String>,
}

fn default_client_id() -> String {
    "photodrop".to_string()
}

fn default_group_id() -> String {
    "photodrop-notifications".to_string()
}

fn default_notifications_topic() -> String {
    "photodrop.images.notifications".to_string()
}

fn default_auto_offset_reset() -> String {
    "earliest".to_string()
}

fn default_session_timeout_ms() -> u32 {
    30000
}

fn default_max_poll_interval_ms() -> u32 {
    300000
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self::new("localhost:9092")
    }
}

impl KafkaConfig {
    /// Create a new KafkaConfig with the specified bootstrap servers
    pub fn new(bootstrap_servers: impl Into<String>) -> Self {
        Self {
            bootstrap_servers: bootstrap_servers.into(),
            client_id: default_client_id(),
            group_id: default_group_id(),
            notifications_topic: default_notifications_topic(),
            auto_offset_reset: default_auto_offset_reset(),
            session_timeout_ms: default_session_timeout_ms(),
            max_poll_interval_ms: default_max_poll_interval_ms(),
            security_protocol: SecurityProtocol::default(),
            ssl: SslConfig::default(),
            sasl: SaslConfig::default(),
            extra_properties: HashMap::new(),
        }
    }

    /// Build a consumer ClientConfig. Offsets are committed manually after publish.
    pub fn build_consumer_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();

        config
            .set("bootstrap.servers", &self.bootstrap_servers)
            .set("client.id", &self.client_id)
            .set("group.id", &self.group_id)
            .set("auto.offset.reset", &self.auto_offset_reset)
            .set("enable.auto.commit", "false")
            .set("session.timeout.ms", self.session_timeout_ms.to_string())
            .set("max.poll.interval.ms", self.max_poll_interval_ms.to_string())
            .set("security.protocol", self.security_protocol.as_str());

        if let Some(ref ca) = self.ssl.ca_location {
            config.set("ssl.ca.location", ca);
        }
        if let Some(ref cert) = self.ssl.certificate_location {
            config.set("ssl.certificate.location", cert);
        }
        if let Some(ref key) = self.ssl.key_location {
            config.set("ssl.key.location", key);
        }

        if self.security_protocol.uses_sasl() {
            config.set("sasl.mechanism", self.sasl.mechanism.as_str());
            if let Some(ref username) = self.sasl.username {
                config.set("sasl.username", username);
            }
            if let Some(ref password) = self.sasl.password {
                config.set("sasl.password", password);
            }
        }

        for (key, value) in &self.extra_properties {
            config.set(key, value);
        }

        config
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bootstrap_servers.is_empty() {
            return Err(ConfigError::MissingRequired("kafka.bootstrap_servers".to_string()));
        }

        if self.group_id.is_empty() {
            return Err(ConfigError::MissingRequired("kafka.group_id".to_string()));
        }

        if self.notifications_topic.is_empty() {
            return Err(ConfigError::MissingRequired(
                "kafka.notifications_topic".to_string(),
            ));
        }

        match self.auto_offset_reset.as_str() {
            "earliest" | "latest" | "none" => {}
            other => {
                return Err(ConfigError::InvalidValue {
                    key: "kafka.auto_offset_reset".to_string(),
                    message: format!("unsupported value {:?}", other),
                })
            }
        }

        if self.security_protocol.uses_sasl() && self.sasl.username.is_none() {
            return Err(ConfigError::MissingRequired(
                "kafka.sasl.username (required for SASL)".to_string(),
            ));
        }

        Ok(())
    }
}
