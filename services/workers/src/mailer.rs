//! Outbound email for acceptance and rejection notices

use crate::config::MailConfig;
use async_trait::async_trait;
use lettre::message::{header, Mailbox, Message};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Tokio1Executor};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Error, Debug)]
pub enum MailError {
    #[error("Invalid mailbox {address:?}: {message}")]
    InvalidAddress { address: String, message: String },

    #[error("Failed to configure SMTP transport: {0}")]
    Transport(String),

    #[error("Failed to build email message: {0}")]
    Build(String),

    #[error("Failed to send email: {0}")]
    Send(String),
}

/// Who an email is about and to whom it goes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecipientContext {
    pub recipient: String,
    pub bucket: String,
    /// Decoded object key
    pub object_key: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmailTemplate {
    Confirmation,
    Rejection,
}

impl EmailTemplate {
    pub fn subject(&self) -> &'static str {
        match self {
            EmailTemplate::Confirmation => "New Image Upload",
            EmailTemplate::Rejection => "Image Upload Rejected",
        }
    }

    pub fn render(&self, context: &RecipientContext) -> String {
        match self {
            EmailTemplate::Confirmation => format!(
                "We received your image upload.\n\nFile: {}\nBucket: {}\n\nIt will be validated shortly.",
                context.object_key, context.bucket
            ),
            EmailTemplate::Rejection => format!(
                "Your image upload was rejected.\n\nFile: {}\nBucket: {}\n\nOnly .jpeg and .png images are accepted.",
                context.object_key, context.bucket
            ),
        }
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, template: EmailTemplate, context: &RecipientContext) -> Result<(), MailError>;
}

/// SMTP mailer, or a no-op that only logs when no host is configured
#[derive(Clone)]
pub struct SmtpMailer {
    transport: Option<Arc<AsyncSmtpTransport<Tokio1Executor>>>,
    from: Mailbox,
}

impl SmtpMailer {
    pub fn new(config: &MailConfig) -> Result<Self, MailError> {
        let from = parse_mailbox(&config.from)?;

        let transport = if config.smtp_host.trim().is_empty() {
            warn!("SMTP host not configured; mailer will operate in no-op mode");
            None
        } else {
            let builder = if config.use_starttls {
                AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.smtp_host)
            } else {
                AsyncSmtpTransport::<Tokio1Executor>::relay(&config.smtp_host)
            }
            .map_err(|e| MailError::Transport(e.to_string()))?
            .port(config.smtp_port);

            let builder = if let (Some(username), Some(password)) =
                (&config.smtp_username, &config.smtp_password)
            {
                builder.credentials(Credentials::new(username.to_string(), password.to_string()))
            } else {
                builder
            };

            Some(Arc::new(builder.build()))
        };

        Ok(Self { transport, from })
    }

    pub fn is_enabled(&self) -> bool {
        self.transport.is_some()
    }
}

fn parse_mailbox(address: &str) -> Result<Mailbox, MailError> {
    address.parse::<Mailbox>().map_err(|e| MailError::InvalidAddress {
        address: address.to_string(),
        message: e.to_string(),
    })
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn send(&self, template: EmailTemplate, context: &RecipientContext) -> Result<(), MailError> {
        let subject = template.subject();

        let Some(transport) = &self.transport else {
            info!(
                subject,
                recipient = %context.recipient,
                key = %context.object_key,
                "Mailer running in no-op mode; skipping actual send"
            );
            return Ok(());
        };

        let email = Message::builder()
            .from(self.from.clone())
            .to(parse_mailbox(&context.recipient)?)
            .subject(subject)
            .header(header::ContentType::TEXT_PLAIN)
            .body(template.render(context))
            .map_err(|e| MailError::Build(e.to_string()))?;

        transport
            .send(email)
            .await
            .map_err(|e| MailError::Send(e.to_string()))?;

        info!(subject, key = %context.object_key, "Email sent");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> RecipientContext {
        RecipientContext {
            recipient: "someone@example.com".to_string(),
            bucket: "images".to_string(),
            object_key: "doc.pdf".to_string(),
        }
    }

    #[test]
    fn test_templates_name_the_file() {
        let body = EmailTemplate::Rejection.render(&context());
        assert!(body.contains("doc.pdf"));
        assert!(body.contains("rejected"));
        assert_ne!(
            EmailTemplate::Confirmation.subject(),
            EmailTemplate::Rejection.subject()
        );
    }

    #[tokio::test]
    async fn test_no_op_mode_without_host() {
        let mailer = SmtpMailer::new(&MailConfig::default()).unwrap();
        assert!(!mailer.is_enabled());
        tokio_test::assert_ok!(mailer.send(EmailTemplate::Confirmation, &context()).await);
    }

    #[test]
    fn test_invalid_sender_rejected() {
        let config = MailConfig {
            from: "not a mailbox".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            SmtpMailer::new(&config),
            Err(MailError::InvalidAddress { .. })
        ));
    }
}
