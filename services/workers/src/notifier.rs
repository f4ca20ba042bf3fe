//! Acceptance and rejection notices.

use crate::ingestion::decode_object_key;
use crate::mailer::{EmailTemplate, Mailer, RecipientContext};
use async_trait::async_trait;
use photodrop_pipeline::{
    BatchHandler, BatchOutcome, BrokerError, BrokerMessage, DeliveryEnvelope, MessageHandler,
    Notification, UploadEvent,
};
use std::sync::Arc;
use tracing::{debug, warn};

/// Send one email per upload in the message, returning how many went out
async fn notify_uploads(
    mailer: &dyn Mailer,
    template: EmailTemplate,
    recipient: &str,
    message: &BrokerMessage,
) -> usize {
    let events = match Notification::parse(&message.body) {
        Notification::Upload(events) => events,
        _ => {
            debug!(message_id = %message.message_id, "No uploads in message, nothing to notify");
            return 0;
        }
    };

    let mut sent = 0;
    for event in &events {
        let context = recipient_context(recipient, event);
        match mailer.send(template, &context).await {
            Ok(()) => {
                sent += 1;
                metrics::counter!("photodrop.mail.sent", "template" => template_label(template))
                    .increment(1);
            }
            Err(e) => {
                warn!(
                    message_id = %message.message_id,
                    key = %context.object_key,
                    template = ?template,
                    error = %e,
                    "Failed to send notification email"
                );
                metrics::counter!("photodrop.mail.failed", "template" => template_label(template))
                    .increment(1);
            }
        }
    }
    sent
}

fn recipient_context(recipient: &str, event: &UploadEvent) -> RecipientContext {
    RecipientContext {
        recipient: recipient.to_string(),
        bucket: event.bucket_id.clone(),
        object_key: decode_object_key(&event.object_key).unwrap_or_else(|_| event.object_key.clone()),
    }
}

fn template_label(template: EmailTemplate) -> &'static str {
    match template {
        EmailTemplate::Confirmation => "confirmation",
        EmailTemplate::Rejection => "rejection",
    }
}

/// Emails an acceptance notice for every upload published to the broker
pub struct ConfirmationNotifier {
    mailer: Arc<dyn Mailer>,
    recipient: String,
}

impl ConfirmationNotifier {
    pub fn new(mailer: Arc<dyn Mailer>, recipient: impl Into<String>) -> Self {
        Self {
            mailer,
            recipient: recipient.into(),
        }
    }
}

#[async_trait]
impl MessageHandler for ConfirmationNotifier {
    async fn handle(&self, message: BrokerMessage) -> Result<(), BrokerError> {
        notify_uploads(
            self.mailer.as_ref(),
            EmailTemplate::Confirmation,
            &self.recipient,
            &message,
        )
        .await;
        Ok(())
    }
}

/// Emails a rejection notice for every dead-lettered upload.
///
/// Never reports batch failures, so each dead letter is consumed once even
/// when the mail relay is down.
pub struct RejectionNotifier {
    mailer: Arc<dyn Mailer>,
    recipient: String,
}

impl RejectionNotifier {
    pub fn new(mailer: Arc<dyn Mailer>, recipient: impl Into<String>) -> Self {
        Self {
            mailer,
            recipient: recipient.into(),
        }
    }
}

#[async_trait]
impl BatchHandler for RejectionNotifier {
    async fn handle_batch(&self, batch: Vec<DeliveryEnvelope>) -> BatchOutcome {
        for envelope in &batch {
            notify_uploads(
                self.mailer.as_ref(),
                EmailTemplate::Rejection,
                &self.recipient,
                &envelope.message,
            )
            .await;
        }
        BatchOutcome::success()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mailer::{MailError, MockMailer};
    use mockall::predicate::eq;
    use photodrop_pipeline::ObjectCreatedNotification;
    use uuid::Uuid;

    fn upload_message(key: &str) -> BrokerMessage {
        BrokerMessage::new(ObjectCreatedNotification::single("images", key).to_body())
    }

    #[tokio::test]
    async fn test_confirmation_uses_decoded_key() {
        let mut mailer = MockMailer::new();
        mailer
            .expect_send()
            .withf(|template, context| {
                *template == EmailTemplate::Confirmation
                    && context.object_key == "vacation photo.png"
                    && context.recipient == "owner@example.com"
            })
            .times(1)
            .returning(|_, _| Ok(()));

        let notifier = ConfirmationNotifier::new(Arc::new(mailer), "owner@example.com");
        assert!(notifier.handle(upload_message("vacation+photo.png")).await.is_ok());
    }

    #[tokio::test]
    async fn test_confirmation_ignores_annotations() {
        let mut mailer = MockMailer::new();
        mailer.expect_send().never();

        let notifier = ConfirmationNotifier::new(Arc::new(mailer), "owner@example.com");
        let annotation = BrokerMessage::new(r#"{"id":"img1","value":"Sunset"}"#);
        assert!(notifier.handle(annotation).await.is_ok());
    }

    #[tokio::test]
    async fn test_rejection_never_fails_the_batch() {
        let mut mailer = MockMailer::new();
        mailer
            .expect_send()
            .with(eq(EmailTemplate::Rejection), mockall::predicate::always())
            .times(2)
            .returning(|_, _| Err(MailError::Send("relay down".to_string())));

        let notifier = RejectionNotifier::new(Arc::new(mailer), "owner@example.com");
        let batch = ["doc.pdf", "notes.txt"]
            .iter()
            .map(|key| DeliveryEnvelope {
                message: upload_message(key),
                receive_count: 1,
                receipt_handle: Uuid::new_v4(),
                first_received_at: chrono::Utc::now(),
            })
            .collect();

        let outcome = notifier.handle_batch(batch).await;
        assert!(outcome.failures.is_empty());
    }
}
