//! Publish/subscribe notification broker.
//!
//! Every published message is copied to each subscription whose filter policy
//! matches it. Queue subscriptions enqueue the copy; handler subscriptions get
//! a dedicated channel and dispatch task, so a slow or failing handler never
//! affects the publisher or sibling subscriptions.

use crate::message::BrokerMessage;
use crate::queue::DeliveryQueue;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Errors raised by the broker or by subscribed handlers
#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("Subscription {0} already exists")]
    DuplicateSubscription(String),

    #[error("Broker for topic {0} is shut down")]
    Closed(String),

    #[error("Message processing error: {0}")]
    ProcessingError(String),
}

/// Handler invoked once per message delivered to its subscription
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Process a single message
    async fn handle(&self, message: BrokerMessage) -> Result<(), BrokerError>;

    /// Called when message processing fails
    async fn on_error(&self, message: BrokerMessage, error: BrokerError) {
        warn!(
            message_id = %message.message_id,
            error = %error,
            "Message processing failed"
        );
    }
}

/// Attribute-based subscription filter
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterPolicy {
    /// Every message matches
    AcceptAll,
    /// Only messages whose `attribute` is one of `values` match
    AllowList { attribute: String, values: Vec<String> },
}

impl FilterPolicy {
    pub fn allow_list(attribute: impl Into<String>, values: Vec<String>) -> Self {
        FilterPolicy::AllowList {
            attribute: attribute.into(),
            values,
        }
    }

    /// A message lacking the filtered attribute never matches an allow-list
    pub fn matches(&self, attributes: &BTreeMap<String, String>) -> bool {
        match self {
            FilterPolicy::AcceptAll => true,
            FilterPolicy::AllowList { attribute, values } => attributes
                .get(attribute)
                .map(|value| values.iter().any(|allowed| allowed == value))
                .unwrap_or(false),
        }
    }
}

/// Where a subscription delivers its copies
pub enum SubscriptionEndpoint {
    Queue(Arc<DeliveryQueue>),
    Handler(Arc<dyn MessageHandler>),
}

enum Target {
    Queue(Arc<DeliveryQueue>),
    Channel(mpsc::UnboundedSender<BrokerMessage>),
}

struct Subscription {
    name: String,
    filter: FilterPolicy,
    target: Target,
}

/// Result of a publish
#[derive(Debug, Clone)]
pub struct PublishReceipt {
    pub message_id: Uuid,
    /// Names of the subscriptions that received a copy
    pub delivered_to: Vec<String>,
}

/// A single broker topic with its subscriptions
pub struct NotificationBroker {
    topic: String,
    subscriptions: RwLock<Vec<Subscription>>,
    dispatchers: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl NotificationBroker {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            subscriptions: RwLock::new(Vec::new()),
            dispatchers: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Register a subscription. Handler endpoints spawn a dispatch task, so
    /// this must be called from within a Tokio runtime.
    pub fn subscribe(
        &self,
        name: impl Into<String>,
        filter: FilterPolicy,
        endpoint: SubscriptionEndpoint,
    ) -> Result<(), BrokerError> {
        let name = name.into();

        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Closed(self.topic.clone()));
        }

        let mut subscriptions = self.subscriptions.write();
        if subscriptions.iter().any(|s| s.name == name) {
            return Err(BrokerError::DuplicateSubscription(name));
        }

        let target = match endpoint {
            SubscriptionEndpoint::Queue(queue) => Target::Queue(queue),
            SubscriptionEndpoint::Handler(handler) => {
                let (tx, rx) = mpsc::unbounded_channel();
                let handle = tokio::spawn(dispatch(name.clone(), handler, rx));
                self.dispatchers.lock().push(handle);
                Target::Channel(tx)
            }
        };

        info!(topic = %self.topic, subscription = %name, filter = ?filter, "Subscription registered");

        subscriptions.push(Subscription {
            name,
            filter,
            target,
        });

        Ok(())
    }

    /// Publish a body with attributes
    pub fn publish(
        &self,
        body: impl Into<String>,
        attributes: BTreeMap<String, String>,
    ) -> Result<PublishReceipt, BrokerError> {
        let mut message = BrokerMessage::new(body);
        message.attributes = attributes;
        self.publish_message(message)
    }

    /// Publish a prepared message, fanning a copy out to every matching subscription
    pub fn publish_message(&self, message: BrokerMessage) -> Result<PublishReceipt, BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Closed(self.topic.clone()));
        }

        let subscriptions = self.subscriptions.read();
        let mut delivered_to = Vec::new();

        for subscription in subscriptions.iter() {
            if !subscription.filter.matches(&message.attributes) {
                debug!(
                    subscription = %subscription.name,
                    message_id = %message.message_id,
                    "Message filtered out"
                );
                continue;
            }

            match &subscription.target {
                Target::Queue(queue) => queue.send(message.clone()),
                Target::Channel(tx) => {
                    if tx.send(message.clone()).is_err() {
                        warn!(
                            subscription = %subscription.name,
                            message_id = %message.message_id,
                            "Subscription dispatcher has stopped, dropping copy"
                        );
                        continue;
                    }
                }
            }
            delivered_to.push(subscription.name.clone());
        }

        metrics::counter!("photodrop.broker.published", "topic" => self.topic.clone()).increment(1);

        debug!(
            topic = %self.topic,
            message_id = %message.message_id,
            delivered_to = ?delivered_to,
            "Message published"
        );

        Ok(PublishReceipt {
            message_id: message.message_id,
            delivered_to,
        })
    }

    /// Registered subscriptions and their filters
    pub fn subscriptions(&self) -> Vec<(String, FilterPolicy)> {
        self.subscriptions
            .read()
            .iter()
            .map(|s| (s.name.clone(), s.filter.clone()))
            .collect()
    }

    /// Stop accepting messages and wait for handler dispatchers to drain
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        // Dropping the senders ends each dispatch loop once its backlog is handled
        self.subscriptions.write().clear();

        let dispatchers: Vec<JoinHandle<()>> = std::mem::take(&mut *self.dispatchers.lock());
        for handle in dispatchers {
            if let Err(e) = handle.await {
                warn!(error = %e, "Subscription dispatcher ended abnormally");
            }
        }

        info!(topic = %self.topic, "Broker shut down");
    }
}

async fn dispatch(
    subscription: String,
    handler: Arc<dyn MessageHandler>,
    mut rx: mpsc::UnboundedReceiver<BrokerMessage>,
) {
    while let Some(message) = rx.recv().await {
        if let Err(e) = handler.handle(message.clone()).await {
            handler.on_error(message, e).await;
        }
    }
    debug!(subscription = %subscription, "Dispatcher stopped");
}
