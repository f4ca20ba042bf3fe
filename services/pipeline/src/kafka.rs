//! Kafka ingress for the notification broker.
//!
//! The object store emits object-created notifications onto a Kafka topic, and
//! the metadata-submission path produces annotation messages onto the same
//! topic with a `metadata_type` header. Each record is republished to the
//! broker with its headers as attributes.
//!
//! The broker and its queues live in process memory, so a publish alone does
//! not make a record safe to commit. When a settlement queue is attached with
//! [`NotificationSource::commit_after`], a record's offset is committed only
//! once its copy on that queue has been acknowledged or dead-lettered. Offsets
//! advance per partition up to the lowest record still outstanding, so a crash
//! replays unfinished work rather than losing it.

use crate::broker::{BrokerError, NotificationBroker, PublishReceipt};
use crate::config::KafkaConfig;
use crate::message::BrokerMessage;
use crate::queue::DeliveryQueue;
use futures::StreamExt;
use parking_lot::Mutex;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::KafkaResult;
use rdkafka::message::{BorrowedMessage, Headers, Message};
use rdkafka::{Offset, TopicPartitionList};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Errors raised by the Kafka notification source
#[derive(Error, Debug)]
pub enum KafkaSourceError {
    #[error("Failed to create consumer: {0}")]
    CreationError(String),

    #[error("Failed to subscribe to topic {topic}: {message}")]
    SubscriptionError { topic: String, message: String },

    #[error("Record has no payload")]
    EmptyPayload,

    #[error("Record payload is not UTF-8: {0}")]
    InvalidPayload(String),

    #[error(transparent)]
    Publish(#[from] BrokerError),
}

/// Build a broker message from a Kafka record's payload and headers
pub fn broker_message_from_record(
    payload: Option<&[u8]>,
    headers: impl IntoIterator<Item = (String, String)>,
) -> Result<BrokerMessage, KafkaSourceError> {
    let payload = payload.ok_or(KafkaSourceError::EmptyPayload)?;
    let body = std::str::from_utf8(payload)
        .map_err(|e| KafkaSourceError::InvalidPayload(e.to_string()))?;

    let mut message = BrokerMessage::new(body);
    message.attributes = headers.into_iter().collect::<BTreeMap<_, _>>();
    Ok(message)
}

#[derive(Debug, Default)]
struct PartitionProgress {
    outstanding: BTreeSet<i64>,
    /// One past the highest offset seen
    next_offset: i64,
    committed: Option<i64>,
}

impl PartitionProgress {
    fn advance(&mut self) -> Option<i64> {
        let position = self
            .outstanding
            .first()
            .copied()
            .unwrap_or(self.next_offset);

        if self.committed.map_or(true, |committed| position > committed) {
            self.committed = Some(position);
            Some(position)
        } else {
            None
        }
    }
}

/// Tracks which records are still being worked on, per partition.
///
/// Positions returned are Kafka commit positions: the next offset to consume.
#[derive(Debug, Default)]
pub struct OffsetTracker {
    pending: HashMap<Uuid, (i32, i64)>,
    partitions: HashMap<i32, PartitionProgress>,
}

impl OffsetTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hold `offset` open until `message_id` settles
    pub fn track(&mut self, message_id: Uuid, partition: i32, offset: i64) {
        self.pending.insert(message_id, (partition, offset));
        let progress = self.partitions.entry(partition).or_default();
        progress.outstanding.insert(offset);
        progress.next_offset = progress.next_offset.max(offset + 1);
    }

    /// Mark a tracked message done. Returns the new commit position, if any.
    pub fn settle(&mut self, message_id: Uuid) -> Option<(i32, i64)> {
        let (partition, offset) = self.pending.remove(&message_id)?;
        let progress = self.partitions.entry(partition).or_default();
        progress.outstanding.remove(&offset);
        progress.advance().map(|position| (partition, position))
    }

    /// Mark a record that needs no settlement as done
    pub fn complete(&mut self, partition: i32, offset: i64) -> Option<(i32, i64)> {
        let progress = self.partitions.entry(partition).or_default();
        progress.next_offset = progress.next_offset.max(offset + 1);
        progress.advance().map(|position| (partition, position))
    }

    /// Records published but not yet settled
    pub fn outstanding(&self) -> usize {
        self.pending.len()
    }
}

struct Settlement {
    subscription: String,
    receiver: mpsc::UnboundedReceiver<Uuid>,
}

/// Consumes the notifications topic and republishes to the broker
pub struct NotificationSource {
    consumer: StreamConsumer,
    broker: Arc<NotificationBroker>,
    topic: String,
    shutdown: CancellationToken,
    settlement: Mutex<Option<Settlement>>,
    offsets: Mutex<OffsetTracker>,
}

impl NotificationSource {
    pub fn new(config: &KafkaConfig, broker: Arc<NotificationBroker>) -> Result<Self, KafkaSourceError> {
        let consumer: StreamConsumer = config
            .build_consumer_config()
            .create()
            .map_err(|e| KafkaSourceError::CreationError(e.to_string()))?;

        consumer
            .subscribe(&[&config.notifications_topic])
            .map_err(|e| KafkaSourceError::SubscriptionError {
                topic: config.notifications_topic.clone(),
                message: e.to_string(),
            })?;

        info!(
            topic = %config.notifications_topic,
            group = %config.group_id,
            "Subscribed to Kafka notifications topic"
        );

        Ok(Self {
            consumer,
            broker,
            topic: config.notifications_topic.clone(),
            shutdown: CancellationToken::new(),
            settlement: Mutex::new(None),
            offsets: Mutex::new(OffsetTracker::new()),
        })
    }

    /// Commit a record only after its copy delivered to `subscription` settles
    /// on `queue`. Without this, offsets are committed right after publishing.
    pub fn commit_after(self, subscription: impl Into<String>, queue: &DeliveryQueue) -> Self {
        *self.settlement.lock() = Some(Settlement {
            subscription: subscription.into(),
            receiver: queue.settlements(),
        });
        self
    }

    pub fn shutdown(&self) {
        info!(topic = %self.topic, "Signaling notification source shutdown");
        self.shutdown.cancel();
    }

    /// Start consuming and republishing records
    #[instrument(skip(self), fields(topic = %self.topic))]
    pub async fn run(&self) -> Result<(), KafkaSourceError> {
        info!("Starting notification source");

        let (subscription, mut settlements) = match self.settlement.lock().take() {
            Some(settlement) => (Some(settlement.subscription), Some(settlement.receiver)),
            None => (None, None),
        };
        let mut stream = self.consumer.stream();

        loop {
            let event = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                settled = next_settlement(&mut settlements) => SourceEvent::Settled(settled),
                record = stream.next() => SourceEvent::Record(record),
            };

            match event {
                SourceEvent::Settled(Some(message_id)) => {
                    let position = self.offsets.lock().settle(message_id);
                    self.commit(position);
                }
                SourceEvent::Settled(None) => {
                    warn!("Settlement queue dropped, committing on publish from now on");
                    settlements = None;
                }
                SourceEvent::Record(Some(Ok(message))) => {
                    let (partition, offset) = (message.partition(), message.offset());
                    match self.forward(&message) {
                        Ok(receipt) => {
                            let hold = settlements.is_some()
                                && subscription
                                    .as_ref()
                                    .is_some_and(|s| receipt.delivered_to.contains(s));
                            let position = {
                                let mut offsets = self.offsets.lock();
                                if hold {
                                    offsets.track(receipt.message_id, partition, offset);
                                    None
                                } else {
                                    offsets.complete(partition, offset)
                                }
                            };
                            self.commit(position);
                        }
                        Err(KafkaSourceError::Publish(e)) => {
                            // Leave the offset uncommitted so the record is replayed
                            error!(error = %e, "Broker rejected notification, stopping source");
                            return Err(KafkaSourceError::Publish(e));
                        }
                        Err(e) => {
                            // A record that can never be decoded would block the partition
                            warn!(error = %e, partition, offset, "Skipping undecodable record");
                            metrics::counter!("photodrop.kafka.skipped").increment(1);
                            let position = self.offsets.lock().complete(partition, offset);
                            self.commit(position);
                        }
                    }
                }
                SourceEvent::Record(Some(Err(e))) => {
                    error!(error = %e, "Kafka consumer error");
                    metrics::counter!("photodrop.kafka.errors").increment(1);
                }
                SourceEvent::Record(None) => {
                    debug!("Stream ended");
                    break;
                }
            }
        }

        let outstanding = self.offsets.lock().outstanding();
        if outstanding > 0 {
            info!(outstanding, "Unsettled records will be replayed on restart");
        }
        info!("Notification source stopped");
        Ok(())
    }

    fn commit(&self, position: Option<(i32, i64)>) {
        let Some((partition, offset)) = position else {
            return;
        };

        match self.commit_position(partition, offset) {
            Ok(()) => debug!(partition, offset, "Offset committed"),
            Err(e) => warn!(error = %e, partition, offset, "Failed to commit offset"),
        }
    }

    fn commit_position(&self, partition: i32, offset: i64) -> KafkaResult<()> {
        let mut list = TopicPartitionList::new();
        list.add_partition_offset(&self.topic, partition, Offset::Offset(offset))?;
        self.consumer.commit(&list, CommitMode::Async)
    }

    fn forward(&self, record: &BorrowedMessage<'_>) -> Result<PublishReceipt, KafkaSourceError> {
        let mut headers = Vec::new();
        if let Some(h) = record.headers() {
            for header in h.iter() {
                if let Some(value) = header.value {
                    if let Ok(v) = String::from_utf8(value.to_vec()) {
                        headers.push((header.key.to_string(), v));
                    }
                }
            }
        }

        let message = broker_message_from_record(record.payload(), headers)?;
        let receipt = self.broker.publish_message(message)?;

        debug!(
            message_id = %receipt.message_id,
            partition = record.partition(),
            offset = record.offset(),
            delivered_to = ?receipt.delivered_to,
            "Notification forwarded to broker"
        );

        Ok(receipt)
    }
}

enum SourceEvent<R> {
    Record(Option<R>),
    Settled(Option<Uuid>),
}

async fn next_settlement(receiver: &mut Option<mpsc::UnboundedReceiver<Uuid>>) -> Option<Uuid> {
    match receiver {
        Some(receiver) => receiver.recv().await,
        None => std::future::pending().await,
    }
}
