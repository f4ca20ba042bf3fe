//! Queue-driven batch event source.
//!
//! Polls a [`DeliveryQueue`] for batches and invokes a [`BatchHandler`] with
//! bounded concurrency. Successful envelopes are acknowledged; failed ones are
//! left in flight so the queue's visibility timeout and receive budget decide
//! whether they are retried or dead-lettered.

use crate::queue::{DeliveryEnvelope, DeliveryQueue};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Pause after an empty receive when the batching window does not wait at all
const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// A single failed envelope in a batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchItemFailure {
    pub receipt_handle: Uuid,
    pub reason: String,
}

/// Partial batch response: every envelope not listed as failed is acknowledged
#[derive(Debug, Clone, Default)]
pub struct BatchOutcome {
    pub failures: Vec<BatchItemFailure>,
}

impl BatchOutcome {
    pub fn success() -> Self {
        Self::default()
    }

    pub fn fail(&mut self, envelope: &DeliveryEnvelope, reason: impl Into<String>) {
        self.failures.push(BatchItemFailure {
            receipt_handle: envelope.receipt_handle,
            reason: reason.into(),
        });
    }

    pub fn is_failed(&self, receipt_handle: Uuid) -> bool {
        self.failures.iter().any(|f| f.receipt_handle == receipt_handle)
    }
}

/// Handler invoked with each batch received from a queue
#[async_trait]
pub trait BatchHandler: Send + Sync + 'static {
    async fn handle_batch(&self, batch: Vec<DeliveryEnvelope>) -> BatchOutcome;
}

/// Batching and concurrency settings for an event source
#[derive(Debug, Clone)]
pub struct EventSourceSettings {
    /// Maximum envelopes per invocation
    pub batch_size: usize,
    /// How long to gather a batch before invoking with what is available
    pub batching_window: Duration,
    /// Maximum concurrent batch invocations
    pub max_concurrency: usize,
    /// An invocation running longer than this fails as a whole
    pub batch_timeout: Duration,
}

impl Default for EventSourceSettings {
    fn default() -> Self {
        Self {
            batch_size: 5,
            batching_window: Duration::from_secs(5),
            max_concurrency: 2,
            batch_timeout: Duration::from_secs(15),
        }
    }
}

/// Polls a queue and feeds batches to a handler
pub struct QueueEventSource {
    name: String,
    queue: Arc<DeliveryQueue>,
    settings: EventSourceSettings,
    shutdown: CancellationToken,
}

impl QueueEventSource {
    pub fn new(name: impl Into<String>, queue: Arc<DeliveryQueue>, settings: EventSourceSettings) -> Self {
        Self {
            name: name.into(),
            queue,
            settings,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Signal the polling loop to stop
    pub fn shutdown(&self) {
        info!(source = %self.name, "Signaling event source shutdown");
        self.shutdown.cancel();
    }

    /// Run until shut down. In-flight invocations are awaited before returning.
    #[instrument(skip(self, handler), fields(source = %self.name, queue = %self.queue.name()))]
    pub async fn run<H: BatchHandler>(&self, handler: Arc<H>) {
        let max_concurrency = self.settings.max_concurrency.max(1);
        let semaphore = Arc::new(Semaphore::new(max_concurrency));

        info!(
            batch_size = self.settings.batch_size,
            batching_window_ms = self.settings.batching_window.as_millis() as u64,
            max_concurrency,
            "Starting event source"
        );

        loop {
            let permit = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let batch = self
                .queue
                .receive_until(self.settings.batch_size, self.settings.batching_window, &self.shutdown)
                .await;

            if self.shutdown.is_cancelled() {
                for envelope in &batch {
                    self.queue.restore(envelope);
                }
                if !batch.is_empty() {
                    debug!(batch_len = batch.len(), "Returned unprocessed batch to the queue");
                }
                break;
            }

            if batch.is_empty() {
                if self.settings.batching_window.is_zero() {
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = tokio::time::sleep(IDLE_POLL_INTERVAL) => {}
                    }
                }
                continue;
            }

            debug!(batch_len = batch.len(), "Invoking batch handler");

            let queue = self.queue.clone();
            let handler = handler.clone();
            let timeout = self.settings.batch_timeout;
            let source = self.name.clone();

            tokio::spawn(async move {
                invoke_batch(&source, &queue, handler.as_ref(), batch, timeout).await;
                drop(permit);
            });
        }

        // Wait for running invocations to release their permits
        let _ = semaphore.acquire_many(max_concurrency as u32).await;
        info!("Event source stopped");
    }
}

async fn invoke_batch<H: BatchHandler>(
    source: &str,
    queue: &DeliveryQueue,
    handler: &H,
    batch: Vec<DeliveryEnvelope>,
    timeout: Duration,
) {
    let envelopes = batch.clone();

    let outcome = match tokio::time::timeout(timeout, handler.handle_batch(batch)).await {
        Ok(outcome) => outcome,
        Err(_) => {
            warn!(
                source = %source,
                batch_len = envelopes.len(),
                timeout_ms = timeout.as_millis() as u64,
                "Batch invocation timed out, leaving batch for redelivery"
            );
            metrics::counter!("photodrop.batch.timed_out", "source" => source.to_string())
                .increment(1);
            return;
        }
    };

    for envelope in &envelopes {
        if let Some(failure) = outcome
            .failures
            .iter()
            .find(|f| f.receipt_handle == envelope.receipt_handle)
        {
            warn!(
                source = %source,
                message_id = %envelope.message.message_id,
                receive_count = envelope.receive_count,
                reason = %failure.reason,
                "Envelope failed, leaving unacknowledged"
            );
            metrics::counter!("photodrop.batch.item_failed", "source" => source.to_string())
                .increment(1);
        } else {
            queue.ack(envelope);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::BrokerMessage;
    use crate::queue::QueueSettings;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FailBodies {
        failing_body: &'static str,
        batches: Mutex<Vec<usize>>,
    }

    #[async_trait]
    impl BatchHandler for FailBodies {
        async fn handle_batch(&self, batch: Vec<DeliveryEnvelope>) -> BatchOutcome {
            self.batches.lock().push(batch.len());
            let mut outcome = BatchOutcome::success();
            for envelope in &batch {
                if envelope.message.body == self.failing_body {
                    outcome.fail(envelope, "rejected");
                }
            }
            outcome
        }
    }

    struct Sleeper;

    #[async_trait]
    impl BatchHandler for Sleeper {
        async fn handle_batch(&self, _batch: Vec<DeliveryEnvelope>) -> BatchOutcome {
            tokio::time::sleep(Duration::from_secs(60)).await;
            BatchOutcome::success()
        }
    }

    /// Records how many invocations overlap
    #[derive(Default)]
    struct OverlapCounter {
        running: AtomicUsize,
        peak: AtomicUsize,
        handled: AtomicUsize,
        invocations: AtomicUsize,
    }

    #[async_trait]
    impl BatchHandler for OverlapCounter {
        async fn handle_batch(&self, batch: Vec<DeliveryEnvelope>) -> BatchOutcome {
            let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(running, Ordering::SeqCst);
            self.invocations.fetch_add(1, Ordering::SeqCst);

            tokio::time::sleep(Duration::from_millis(40)).await;

            self.running.fetch_sub(1, Ordering::SeqCst);
            self.handled.fetch_add(batch.len(), Ordering::SeqCst);
            BatchOutcome::success()
        }
    }

    fn fast_settings() -> EventSourceSettings {
        EventSourceSettings {
            batch_size: 5,
            batching_window: Duration::from_millis(20),
            max_concurrency: 2,
            batch_timeout: Duration::from_secs(1),
        }
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[test]
    fn test_batch_outcome_tracks_failures() {
        let envelope = DeliveryEnvelope {
            message: BrokerMessage::new("{}"),
            receive_count: 1,
            receipt_handle: Uuid::new_v4(),
            first_received_at: chrono::Utc::now(),
        };

        let mut outcome = BatchOutcome::success();
        assert!(!outcome.is_failed(envelope.receipt_handle));
        outcome.fail(&envelope, "bad");
        assert!(outcome.is_failed(envelope.receipt_handle));
    }

    #[tokio::test]
    async fn test_partial_failure_acks_siblings_and_dead_letters_failure() {
        let dlq = Arc::new(DeliveryQueue::new("rejected", QueueSettings::default()));
        let queue = Arc::new(DeliveryQueue::new(
            "created",
            QueueSettings {
                visibility_timeout: Duration::from_millis(50),
                max_receive_count: 1,
                dead_letter: Some(dlq.clone()),
            },
        ));
        queue.send(BrokerMessage::new("good-1"));
        queue.send(BrokerMessage::new("bad"));
        queue.send(BrokerMessage::new("good-2"));

        let handler = Arc::new(FailBodies {
            failing_body: "bad",
            batches: Mutex::new(Vec::new()),
        });
        let source = Arc::new(QueueEventSource::new("ingest", queue.clone(), fast_settings()));

        let task = {
            let source = source.clone();
            let handler = handler.clone();
            tokio::spawn(async move { source.run(handler).await })
        };

        wait_for(|| dlq.stats().visible == 1).await;
        source.shutdown();
        task.await.unwrap();

        let stats = queue.stats();
        assert_eq!(stats.visible, 0);
        assert_eq!(stats.in_flight, 0);
        assert_eq!(stats.dead_lettered, 1);
        assert_eq!(handler.batches.lock()[0], 3);
    }

    #[tokio::test]
    async fn test_timed_out_batch_is_not_acknowledged() {
        let queue = Arc::new(DeliveryQueue::new(
            "created",
            QueueSettings {
                visibility_timeout: Duration::from_secs(60),
                ..Default::default()
            },
        ));
        queue.send(BrokerMessage::new("slow"));

        let source = Arc::new(QueueEventSource::new(
            "ingest",
            queue.clone(),
            EventSourceSettings {
                batch_timeout: Duration::from_millis(50),
                ..fast_settings()
            },
        ));

        let task = {
            let source = source.clone();
            tokio::spawn(async move { source.run(Arc::new(Sleeper)).await })
        };

        tokio::time::sleep(Duration::from_millis(300)).await;
        source.shutdown();
        task.await.unwrap();

        // still in flight, waiting for its visibility timeout
        assert_eq!(queue.stats().in_flight, 1);
    }

    #[tokio::test]
    async fn test_concurrent_invocations_bounded() {
        let queue = Arc::new(DeliveryQueue::new("created", QueueSettings::default()));
        for i in 0..20 {
            queue.send(BrokerMessage::new(format!("{{\"n\":{}}}", i)));
        }

        let handler = Arc::new(OverlapCounter::default());
        let source = Arc::new(QueueEventSource::new(
            "ingest",
            queue.clone(),
            EventSourceSettings {
                batch_size: 2,
                ..fast_settings()
            },
        ));

        let task = {
            let source = source.clone();
            let handler = handler.clone();
            tokio::spawn(async move { source.run(handler).await })
        };

        wait_for(|| handler.handled.load(Ordering::SeqCst) == 20).await;
        source.shutdown();
        task.await.unwrap();

        assert!(handler.invocations.load(Ordering::SeqCst) >= 10);
        assert_eq!(handler.peak.load(Ordering::SeqCst), 2);
        assert_eq!(queue.stats(), crate::queue::QueueStats::default());
    }

    #[tokio::test]
    async fn test_shutdown_returns_gathering_batch_untouched() {
        let queue = Arc::new(DeliveryQueue::new(
            "created",
            QueueSettings {
                max_receive_count: 1,
                ..Default::default()
            },
        ));
        queue.send(BrokerMessage::new("pending"));

        let handler = Arc::new(OverlapCounter::default());
        let source = Arc::new(QueueEventSource::new(
            "ingest",
            queue.clone(),
            EventSourceSettings {
                batching_window: Duration::from_secs(30),
                ..fast_settings()
            },
        ));

        let task = {
            let source = source.clone();
            let handler = handler.clone();
            tokio::spawn(async move { source.run(handler).await })
        };

        // the message is taken while the window is still gathering
        wait_for(|| queue.stats().in_flight == 1).await;
        source.shutdown();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(handler.invocations.load(Ordering::SeqCst), 0);
        assert_eq!(queue.stats().visible, 1);

        let again = queue.receive(1, Duration::from_millis(20)).await;
        assert_eq!(again[0].receive_count, 1);
    }

    #[tokio::test]
    async fn test_zero_window_source_still_delivers_and_stops() {
        let queue = Arc::new(DeliveryQueue::new("created", QueueSettings::default()));
        let handler = Arc::new(OverlapCounter::default());
        let source = Arc::new(QueueEventSource::new(
            "ingest",
            queue.clone(),
            EventSourceSettings {
                batching_window: Duration::ZERO,
                ..fast_settings()
            },
        ));

        let task = {
            let source = source.clone();
            let handler = handler.clone();
            tokio::spawn(async move { source.run(handler).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        queue.send(BrokerMessage::new("late"));

        wait_for(|| handler.handled.load(Ordering::SeqCst) == 1).await;
        source.shutdown();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }
}
