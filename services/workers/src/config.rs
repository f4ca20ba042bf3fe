use photodrop_pipeline::{ConfigError, KafkaConfig};
use serde::Deserialize;
use std::time::Duration;

/// Main configuration for the photodrop service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// Kafka notification ingress
    pub kafka: KafkaConfig,
    /// S3 object store configuration
    #[serde(default)]
    pub s3: S3Config,
    /// Metadata store configuration
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Ingestion queue and worker configuration
    #[serde(default)]
    pub ingestion: IngestionConfig,
    /// Dead-letter queue consumer configuration
    #[serde(default)]
    pub rejection: RejectionConfig,
    /// Metadata update worker configuration
    #[serde(default)]
    pub annotation: AnnotationConfig,
    /// Outbound mail configuration
    #[serde(default)]
    pub mail: MailConfig,
    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// S3 object store configuration
#[derive(Debug, Clone, Deserialize)]
pub struct S3Config {
    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint URL (for MinIO, LocalStack, etc.)
    pub endpoint_url: Option<String>,
    /// Force path-style access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,
}

/// Metadata store configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL. Records are kept in memory when unset.
    pub url: Option<String>,
    /// Table holding image records
    #[serde(default = "default_table_name")]
    pub table_name: String,
    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Minimum number of connections in the pool
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Idle connection timeout in seconds
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Create the records table on startup
    #[serde(default = "default_true")]
    pub create_table: bool,
}

/// Ingestion queue and worker configuration
#[derive(Debug, Clone, Deserialize)]
pub struct IngestionConfig {
    /// Maximum envelopes per worker invocation
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Seconds to gather a batch
    #[serde(default = "default_batching_window_secs")]
    pub batching_window_secs: u64,
    /// Concurrent batch invocations
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Seconds before an invocation fails as a whole
    #[serde(default = "default_batch_timeout_secs")]
    pub batch_timeout_secs: u64,
    /// Seconds a received message stays hidden
    #[serde(default = "default_visibility_timeout_secs")]
    pub visibility_timeout_secs: u64,
    /// Receives before a message is moved to the dead-letter queue
    #[serde(default = "default_max_receive_count")]
    pub max_receive_count: u32,
    /// Accepted object key suffixes
    #[serde(default = "default_allowed_extensions")]
    pub allowed_extensions: Vec<String>,
}

/// Dead-letter queue consumer configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RejectionConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_batching_window_secs")]
    pub batching_window_secs: u64,
}

/// Metadata update worker configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AnnotationConfig {
    /// Extra attempts when the target record does not exist yet (0 = single attempt)
    #[serde(default)]
    pub missing_target_retries: u32,
    /// Initial backoff between those attempts in milliseconds
    #[serde(default = "default_retry_initial_backoff_ms")]
    pub retry_initial_backoff_ms: u64,
    /// Cap on any single backoff in milliseconds
    #[serde(default = "default_retry_max_backoff_ms")]
    pub retry_max_backoff_ms: u64,
}

/// Outbound mail configuration
#[derive(Debug, Clone, Deserialize)]
pub struct MailConfig {
    /// SMTP relay host. Empty disables sending (log only).
    #[serde(default)]
    pub smtp_host: String,
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,
    #[serde(default = "default_true")]
    pub use_starttls: bool,
    pub smtp_username: Option<String>,
    pub smtp_password: Option<String>,
    /// Sender mailbox
    #[serde(default = "default_mail_from")]
    pub from: String,
    /// Submitter mailbox that receives confirmations and rejections
    #[serde(default = "default_mail_recipient")]
    pub recipient: String,
}

/// API configuration for the status endpoint
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// API listen address
    #[serde(default = "default_api_host")]
    pub host: String,
    /// API listen port
    #[serde(default = "default_api_port")]
    pub port: u16,
    /// Enable CORS
    #[serde(default = "default_true")]
    pub cors_enabled: bool,
    /// Allowed CORS origins
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

// Default value functions
fn default_service_name() -> String {
    "photodrop".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_region() -> String {
    "eu-west-1".to_string()
}

fn default_table_name() -> String {
    "images".to_string()
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    2
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_idle_timeout_secs() -> u64 {
    600
}

fn default_true() -> bool {
    true
}

fn default_batch_size() -> usize {
    5
}

fn default_batching_window_secs() -> u64 {
    5
}

fn default_max_concurrency() -> usize {
    2
}

fn default_batch_timeout_secs() -> u64 {
    15
}

fn default_visibility_timeout_secs() -> u64 {
    30
}

fn default_max_receive_count() -> u32 {
    1
}

fn default_allowed_extensions() -> Vec<String> {
    vec![".jpeg".to_string(), ".png".to_string()]
}

fn default_retry_initial_backoff_ms() -> u64 {
    200
}

fn default_retry_max_backoff_ms() -> u64 {
    5000
}

fn default_smtp_port() -> u16 {
    587
}

fn default_mail_from() -> String {
    "photodrop <noreply@photodrop.local>".to_string()
}

fn default_mail_recipient() -> String {
    "submitter@photodrop.local".to_string()
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8080
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            // Start with default values
            .set_default("service.name", "photodrop")?
            .set_default("service.log_level", "info")?
            .set_default("service.metrics_port", 9090)?
            .set_default("kafka.bootstrap_servers", "localhost:9092")?
            // Add config file if present
            .add_source(config::File::with_name("config/photodrop").required(false))
            .add_source(config::File::with_name("/etc/photodrop/photodrop").required(false))
            // Override with environment variables
            // PHOTODROP__INGESTION__BATCH_SIZE -> ingestion.batch_size
            .add_source(
                config::Environment::with_prefix("PHOTODROP")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("ingestion.allowed_extensions")
                    .with_list_parse_key("api.cors_origins"),
            )
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the pipeline cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.kafka.validate()?;

        if self.ingestion.batch_size == 0 {
            return Err(invalid("ingestion.batch_size", "must be at least 1"));
        }
        if self.ingestion.max_concurrency == 0 {
            return Err(invalid("ingestion.max_concurrency", "must be at least 1"));
        }
        if self.ingestion.max_receive_count == 0 {
            return Err(invalid("ingestion.max_receive_count", "must be at least 1"));
        }
        if self.ingestion.allowed_extensions.is_empty() {
            return Err(invalid("ingestion.allowed_extensions", "must not be empty"));
        }
        if self.ingestion.visibility_timeout_secs < self.ingestion.batch_timeout_secs {
            return Err(invalid(
                "ingestion.visibility_timeout_secs",
                "must not be shorter than ingestion.batch_timeout_secs",
            ));
        }
        if self.ingestion.batching_window_secs == 0 {
            return Err(invalid("ingestion.batching_window_secs", "must be at least 1"));
        }
        if self.rejection.batch_size == 0 {
            return Err(invalid("rejection.batch_size", "must be at least 1"));
        }
        if self.rejection.batching_window_secs == 0 {
            return Err(invalid("rejection.batching_window_secs", "must be at least 1"));
        }
        if !is_valid_table_name(&self.database.table_name) {
            return Err(invalid(
                "database.table_name",
                "must be an identifier of letters, digits and underscores",
            ));
        }

        Ok(())
    }
}

impl DatabaseConfig {
    /// Pool acquire timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Idle connection timeout as Duration
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

fn invalid(key: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.to_string(),
    }
}

/// Table names are interpolated into SQL, so only plain identifiers pass
pub fn is_valid_table_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    name.len() <= 63 && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            region: default_region(),
            endpoint_url: None,
            force_path_style: false,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            table_name: default_table_name(),
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            connect_timeout_secs: default_connect_timeout_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
            create_table: true,
        }
    }
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            batching_window_secs: default_batching_window_secs(),
            max_concurrency: default_max_concurrency(),
            batch_timeout_secs: default_batch_timeout_secs(),
            visibility_timeout_secs: default_visibility_timeout_secs(),
            max_receive_count: default_max_receive_count(),
            allowed_extensions: default_allowed_extensions(),
        }
    }
}

impl Default for RejectionConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            batching_window_secs: default_batching_window_secs(),
        }
    }
}

impl Default for AnnotationConfig {
    fn default() -> Self {
        Self {
            missing_target_retries: 0,
            retry_initial_backoff_ms: default_retry_initial_backoff_ms(),
            retry_max_backoff_ms: default_retry_max_backoff_ms(),
        }
    }
}

impl Default for MailConfig {
    fn default() -> Self {
        Self {
            smtp_host: String::new(),
            smtp_port: default_smtp_port(),
            use_starttls: true,
            smtp_username: None,
            smtp_password: None,
            from: default_mail_from(),
            recipient: default_mail_recipient(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
            cors_enabled: true,
            cors_origins: Vec::new(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service: ServiceConfig::default(),
            kafka: KafkaConfig::default(),
            s3: S3Config::default(),
            database: DatabaseConfig::default(),
            ingestion: IngestionConfig::default(),
            rejection: RejectionConfig::default(),
            annotation: AnnotationConfig::default(),
            mail: MailConfig::default(),
            api: ApiConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let config = Config::default();
        assert_eq!(config.ingestion.batch_size, 5);
        assert_eq!(config.ingestion.batching_window_secs, 5);
        assert_eq!(config.ingestion.max_concurrency, 2);
        assert_eq!(config.ingestion.batch_timeout_secs, 15);
        assert_eq!(config.ingestion.max_receive_count, 1);
        assert_eq!(config.ingestion.allowed_extensions, vec![".jpeg", ".png"]);
        assert_eq!(config.annotation.missing_target_retries, 0);
        assert_eq!(config.database.table_name, "images");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_unusable_settings() {
        let mut config = Config::default();
        config.ingestion.max_receive_count = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.ingestion.allowed_extensions.clear();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.ingestion.visibility_timeout_secs = 5;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.database.table_name = "images; DROP TABLE images".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_batching_window() {
        let mut config = Config::default();
        config.ingestion.batching_window_secs = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.rejection.batching_window_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_database_durations() {
        let database = DatabaseConfig::default();
        assert_eq!(
            database.connect_timeout(),
            Duration::from_secs(database.connect_timeout_secs)
        );
        assert_eq!(
            database.idle_timeout(),
            Duration::from_secs(database.idle_timeout_secs)
        );
    }

    #[test]
    fn test_table_name_rules() {
        assert!(is_valid_table_name("images"));
        assert!(is_valid_table_name("_images_v2"));
        assert!(!is_valid_table_name("2images"));
        assert!(!is_valid_table_name("public.images"));
        assert!(!is_valid_table_name(""));
    }
}
