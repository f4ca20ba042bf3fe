//! At-least-once delivery queue with dead-letter redrive.
//!
//! Received messages stay in flight until acknowledged. An unacknowledged
//! message becomes visible again once its visibility timeout expires, with its
//! receive count preserved. When a message whose receive count has reached
//! `max_receive_count` comes up for delivery again, it is moved to the
//! configured dead-letter queue instead.
//!
//! A queue can report settlements: the id of every message that leaves it for
//! good, whether acknowledged or redriven. Upstream sources use this to hold
//! their own commits until the work is done.

use crate::message::BrokerMessage;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

/// Delivery settings for a queue
#[derive(Debug, Clone)]
pub struct QueueSettings {
    /// How long a received message stays invisible before redelivery
    pub visibility_timeout: Duration,
    /// Receives allowed before a message is redriven to the dead-letter queue
    pub max_receive_count: u32,
    /// Companion dead-letter queue
    pub dead_letter: Option<Arc<DeliveryQueue>>,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            visibility_timeout: Duration::from_secs(30),
            max_receive_count: 1,
            dead_letter: None,
        }
    }
}

/// A message handed to a consumer, with delivery metadata
#[derive(Debug, Clone)]
pub struct DeliveryEnvelope {
    pub message: BrokerMessage,
    /// Number of times this message has been received, this delivery included
    pub receive_count: u32,
    /// Handle identifying this particular delivery, used to acknowledge it
    pub receipt_handle: Uuid,
    /// When the message was first received from this queue
    pub first_received_at: DateTime<Utc>,
}

/// Point-in-time queue counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub visible: usize,
    pub in_flight: usize,
    pub dead_lettered: u64,
}

#[derive(Debug)]
struct StoredMessage {
    message: BrokerMessage,
    receive_count: u32,
    first_received_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct InFlight {
    stored: StoredMessage,
    visible_at: Instant,
}

#[derive(Debug, Default)]
struct QueueState {
    visible: VecDeque<StoredMessage>,
    in_flight: HashMap<Uuid, InFlight>,
    dead_lettered: u64,
}

/// In-process durable-semantics queue
#[derive(Debug)]
pub struct DeliveryQueue {
    name: String,
    settings: QueueSettings,
    state: Mutex<QueueState>,
    notify: Notify,
    settlements: Mutex<Option<mpsc::UnboundedSender<Uuid>>>,
}

impl DeliveryQueue {
    pub fn new(name: impl Into<String>, settings: QueueSettings) -> Self {
        Self {
            name: name.into(),
            settings,
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            settlements: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    /// Report the id of every message acknowledged or redriven from now on.
    ///
    /// Replaces any earlier receiver.
    pub fn settlements(&self) -> mpsc::UnboundedReceiver<Uuid> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.settlements.lock() = Some(tx);
        rx
    }

    fn settled(&self, message_id: Uuid) {
        let mut settlements = self.settlements.lock();
        if let Some(tx) = settlements.as_ref() {
            if tx.send(message_id).is_err() {
                *settlements = None;
            }
        }
    }

    /// Enqueue a message
    pub fn send(&self, message: BrokerMessage) {
        debug!(queue = %self.name, message_id = %message.message_id, "Message enqueued");

        self.state.lock().visible.push_back(StoredMessage {
            message,
            receive_count: 0,
            first_received_at: None,
        });
        self.notify.notify_waiters();
    }

    /// Receive up to `max_batch` messages, waiting at most `wait_window`.
    ///
    /// Returns early once the batch is full. May return an empty batch.
    pub async fn receive(&self, max_batch: usize, wait_window: Duration) -> Vec<DeliveryEnvelope> {
        self.receive_until(max_batch, wait_window, &CancellationToken::new())
            .await
    }

    /// Like [`receive`](Self::receive), but stops waiting once `cancel` fires.
    ///
    /// Messages already taken are returned, never dropped.
    pub async fn receive_until(
        &self,
        max_batch: usize,
        wait_window: Duration,
        cancel: &CancellationToken,
    ) -> Vec<DeliveryEnvelope> {
        let max_batch = max_batch.max(1);
        let deadline = Instant::now() + wait_window;
        let mut batch = Vec::with_capacity(max_batch);

        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next_expiry = self.take_visible(max_batch - batch.len(), &mut batch);

            if batch.len() >= max_batch || Instant::now() >= deadline || cancel.is_cancelled() {
                break;
            }

            let wake_at = next_expiry.map_or(deadline, |expiry| expiry.min(deadline));

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(wake_at) => {}
                _ = cancel.cancelled() => {}
            }
        }

        batch
    }

    /// Delete an in-flight message. Returns false when the receipt is stale.
    pub fn ack(&self, envelope: &DeliveryEnvelope) -> bool {
        let removed = self
            .state
            .lock()
            .in_flight
            .remove(&envelope.receipt_handle)
            .is_some();

        if removed {
            self.settled(envelope.message.message_id);
        } else {
            warn!(
                queue = %self.name,
                message_id = %envelope.message.message_id,
                "Acknowledged a stale receipt handle"
            );
        }
        removed
    }

    /// Make an in-flight message visible again immediately
    pub fn release(&self, envelope: &DeliveryEnvelope) -> bool {
        let released = {
            let mut state = self.state.lock();
            match state.in_flight.remove(&envelope.receipt_handle) {
                Some(in_flight) => {
                    state.visible.push_back(in_flight.stored);
                    true
                }
                None => false,
            }
        };

        if released {
            self.notify.notify_waiters();
        }
        released
    }

    /// Hand back an in-flight message that no consumer processed.
    ///
    /// Unlike [`release`](Self::release), the delivery does not count against
    /// the receive budget.
    pub fn restore(&self, envelope: &DeliveryEnvelope) -> bool {
        let restored = {
            let mut state = self.state.lock();
            match state.in_flight.remove(&envelope.receipt_handle) {
                Some(in_flight) => {
                    let mut stored = in_flight.stored;
                    stored.receive_count = stored.receive_count.saturating_sub(1);
                    if stored.receive_count == 0 {
                        stored.first_received_at = None;
                    }
                    state.visible.push_front(stored);
                    true
                }
                None => false,
            }
        };

        if restored {
            self.notify.notify_waiters();
        }
        restored
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.state.lock();
        QueueStats {
            visible: state.visible.len(),
            in_flight: state.in_flight.len(),
            dead_lettered: state.dead_lettered,
        }
    }

    /// Move up to `want` deliverable messages into `batch`.
    ///
    /// Returns the earliest instant at which an in-flight message becomes
    /// visible again, so a waiting receiver can wake for it.
    fn take_visible(&self, want: usize, batch: &mut Vec<DeliveryEnvelope>) -> Option<Instant> {
        let now = Instant::now();
        let max_receive_count = self.settings.max_receive_count.max(1);
        let mut redriven = Vec::new();

        let next_expiry = {
            let mut state = self.state.lock();

            let expired: Vec<Uuid> = state
                .in_flight
                .iter()
                .filter(|(_, in_flight)| in_flight.visible_at <= now)
                .map(|(handle, _)| *handle)
                .collect();
            for handle in expired {
                if let Some(in_flight) = state.in_flight.remove(&handle) {
                    state.visible.push_back(in_flight.stored);
                }
            }

            let mut taken = 0;
            while taken < want {
                let Some(mut stored) = state.visible.pop_front() else {
                    break;
                };

                if stored.receive_count >= max_receive_count && self.settings.dead_letter.is_some() {
                    state.dead_lettered += 1;
                    redriven.push(stored);
                    continue;
                }

                stored.receive_count += 1;
                let first_received_at = *stored.first_received_at.get_or_insert_with(Utc::now);
                let receipt_handle = Uuid::new_v4();

                batch.push(DeliveryEnvelope {
                    message: stored.message.clone(),
                    receive_count: stored.receive_count,
                    receipt_handle,
                    first_received_at,
                });
                state.in_flight.insert(
                    receipt_handle,
                    InFlight {
                        stored,
                        visible_at: now + self.settings.visibility_timeout,
                    },
                );
                taken += 1;
            }

            state.in_flight.values().map(|in_flight| in_flight.visible_at).min()
        };

        if let Some(dead_letter) = &self.settings.dead_letter {
            for stored in redriven {
                warn!(
                    queue = %self.name,
                    dead_letter_queue = %dead_letter.name(),
                    message_id = %stored.message.message_id,
                    receive_count = stored.receive_count,
                    "Receive budget exhausted, moving message to dead-letter queue"
                );
                metrics::counter!("photodrop.queue.dead_lettered", "queue" => self.name.clone())
                    .increment(1);
                let message_id = stored.message.message_id;
                dead_letter.send(stored.message);
                self.settled(message_id);
            }
        }

        next_expiry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHORT_WAIT: Duration = Duration::from_millis(20);

    fn queue_with_dlq(max_receive_count: u32) -> (DeliveryQueue, Arc<DeliveryQueue>) {
        let dlq = Arc::new(DeliveryQueue::new("rejected", QueueSettings::default()));
        let queue = DeliveryQueue::new(
            "created",
            QueueSettings {
                visibility_timeout: Duration::ZERO,
                max_receive_count,
                dead_letter: Some(dlq.clone()),
            },
        );
        (queue, dlq)
    }

    #[tokio::test]
    async fn test_receive_respects_batch_size() {
        let queue = DeliveryQueue::new("q", QueueSettings::default());
        for i in 0..7 {
            queue.send(BrokerMessage::new(format!("{{\"n\":{}}}", i)));
        }

        let batch = queue.receive(5, SHORT_WAIT).await;
        assert_eq!(batch.len(), 5);
        assert!(batch.iter().all(|e| e.receive_count == 1));

        let rest = queue.receive(5, SHORT_WAIT).await;
        assert_eq!(rest.len(), 2);
        assert_eq!(queue.stats().in_flight, 7);
    }

    #[tokio::test]
    async fn test_ack_removes_message() {
        let queue = DeliveryQueue::new("q", QueueSettings::default());
        queue.send(BrokerMessage::new("{}"));

        let batch = queue.receive(1, SHORT_WAIT).await;
        assert!(queue.ack(&batch[0]));
        assert!(!queue.ack(&batch[0]));
        assert_eq!(queue.stats(), QueueStats::default());
    }

    #[tokio::test]
    async fn test_unacked_message_is_redelivered_with_higher_count() {
        let (queue, dlq) = queue_with_dlq(3);
        let message = BrokerMessage::new("{}");
        let message_id = message.message_id;
        queue.send(message);

        for expected in 1..=3 {
            let batch = queue.receive(1, SHORT_WAIT).await;
            assert_eq!(batch.len(), 1);
            assert_eq!(batch[0].receive_count, expected);
            assert_eq!(batch[0].message.message_id, message_id);
        }

        // fourth attempt exceeds the budget
        assert!(queue.receive(1, SHORT_WAIT).await.is_empty());
        assert_eq!(queue.stats().dead_lettered, 1);
        assert_eq!(dlq.stats().visible, 1);
    }

    #[tokio::test]
    async fn test_single_receive_budget_redrives_after_one_failure() {
        let (queue, dlq) = queue_with_dlq(1);
        queue.send(BrokerMessage::new(r#"{"key":"doc.pdf"}"#));

        let first = queue.receive(1, SHORT_WAIT).await;
        assert_eq!(first.len(), 1);

        assert!(queue.receive(5, SHORT_WAIT).await.is_empty());

        let dead = dlq.receive(5, SHORT_WAIT).await;
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].message.body, r#"{"key":"doc.pdf"}"#);
        assert_eq!(dead[0].receive_count, 1);
    }

    #[tokio::test]
    async fn test_message_without_dead_letter_queue_keeps_redelivering() {
        let queue = DeliveryQueue::new(
            "q",
            QueueSettings {
                visibility_timeout: Duration::ZERO,
                max_receive_count: 1,
                dead_letter: None,
            },
        );
        queue.send(BrokerMessage::new("{}"));

        for expected in 1..=3 {
            let batch = queue.receive(1, SHORT_WAIT).await;
            assert_eq!(batch[0].receive_count, expected);
        }
    }

    #[tokio::test]
    async fn test_in_flight_message_is_hidden_until_timeout() {
        let queue = DeliveryQueue::new(
            "q",
            QueueSettings {
                visibility_timeout: Duration::from_secs(60),
                ..Default::default()
            },
        );
        queue.send(BrokerMessage::new("{}"));

        let batch = queue.receive(1, SHORT_WAIT).await;
        assert_eq!(batch.len(), 1);
        assert!(queue.receive(1, SHORT_WAIT).await.is_empty());

        assert!(queue.release(&batch[0]));
        let again = queue.receive(1, SHORT_WAIT).await;
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].receive_count, 2);
    }

    #[tokio::test]
    async fn test_settlements_report_acks_and_redrives() {
        let (queue, _dlq) = queue_with_dlq(1);
        let mut settlements = queue.settlements();

        let acked = BrokerMessage::new("ok");
        let redriven = BrokerMessage::new("bad");
        let (acked_id, redriven_id) = (acked.message_id, redriven.message_id);
        queue.send(acked);
        queue.send(redriven);

        let batch = queue.receive(2, SHORT_WAIT).await;
        assert_eq!(batch.len(), 2);
        assert!(queue.ack(&batch[0]));
        assert_eq!(settlements.try_recv().unwrap(), acked_id);
        // a failed delivery is not settled until it is redriven
        assert!(settlements.try_recv().is_err());

        assert!(queue.receive(1, SHORT_WAIT).await.is_empty());
        assert_eq!(settlements.try_recv().unwrap(), redriven_id);
    }

    #[tokio::test]
    async fn test_cancelled_receive_keeps_taken_messages() {
        let queue = Arc::new(DeliveryQueue::new("q", QueueSettings::default()));
        queue.send(BrokerMessage::new("{}"));
        let cancel = CancellationToken::new();

        let receiver = {
            let queue = queue.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { queue.receive_until(5, Duration::from_secs(5), &cancel).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        let batch = tokio::time::timeout(Duration::from_secs(1), receiver)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(queue.stats().in_flight, 1);
    }

    #[tokio::test]
    async fn test_restore_returns_receive_attempt() {
        let (queue, dlq) = queue_with_dlq(1);
        queue.send(BrokerMessage::new("first"));
        queue.send(BrokerMessage::new("second"));

        let batch = queue.receive(1, SHORT_WAIT).await;
        assert_eq!(batch[0].message.body, "first");
        assert!(queue.restore(&batch[0]));
        assert!(!queue.restore(&batch[0]));

        // back at the head with its budget intact
        let again = queue.receive(1, SHORT_WAIT).await;
        assert_eq!(again[0].message.body, "first");
        assert_eq!(again[0].receive_count, 1);
        assert_eq!(dlq.stats().visible, 0);
    }

    #[tokio::test]
    async fn test_receive_wakes_on_send() {
        let queue = Arc::new(DeliveryQueue::new("q", QueueSettings::default()));

        let receiver = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.receive(1, Duration::from_secs(5)).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.send(BrokerMessage::new("{}"));

        let batch = tokio::time::timeout(Duration::from_secs(1), receiver)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(batch.len(), 1);
    }
}
