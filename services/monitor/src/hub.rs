//! Broadcast hub: fans one event out to every current subscriber.

use crate::config::HubConfig;
use crate::event::CaptureEvent;
use crate::poller::EventSink;
use crate::registry::{SendError, SubscriberId, SubscriberRegistry};
use crate::stats::{BackpressureSnapshot, DeliveryStats};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Outcome of one broadcast call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Subscribers in the snapshot
    pub recipients: usize,
    pub delivered: usize,
    pub failed: usize,
}

/// Fan-out hub over a [`SubscriberRegistry`]
pub struct BroadcastHub {
    registry: Arc<SubscriberRegistry>,
    stats: Mutex<DeliveryStats>,
    send_timeout: Duration,
}

impl BroadcastHub {
    /// Create a hub delivering to the given registry
    pub fn new(registry: Arc<SubscriberRegistry>, config: &HubConfig) -> Self {
        Self {
            registry,
            stats: Mutex::new(DeliveryStats::new(config.stats_window)),
            send_timeout: config.send_timeout(),
        }
    }

    /// Registry this hub delivers to
    pub fn registry(&self) -> &Arc<SubscriberRegistry> {
        &self.registry
    }

    /// Serialize `event` once and deliver it to a snapshot of the registry.
    ///
    /// Every send runs concurrently under its own timeout; a failing
    /// subscriber is counted and never affects the others.
    #[instrument(skip(self, event), fields(batch_id = %event.captured_at))]
    pub async fn broadcast(&self, event: &CaptureEvent) -> BroadcastReport {
        let subscribers = self.registry.snapshot();
        if subscribers.is_empty() {
            debug!("No subscribers, skipping broadcast");
            return BroadcastReport::default();
        }

        let started = Instant::now();
        self.stats.lock().record_send_start(started);

        let recipients = subscribers.len();
        let payload: Arc<str> = match serde_json::to_string(event) {
            Ok(json) => json.into(),
            Err(e) => {
                error!(error = %e, "Failed to serialize capture event");
                self.record(0, recipients);
                return BroadcastReport {
                    recipients,
                    delivered: 0,
                    failed: recipients,
                };
            }
        };

        let sends = subscribers.into_iter().map(|(id, subscriber)| {
            let payload = Arc::clone(&payload);
            async move {
                let send = tokio::time::timeout(self.send_timeout, subscriber.send(payload));
                let result = match send.await {
                    Ok(result) => result,
                    Err(_) => Err(SendError::Timeout(self.send_timeout)),
                };
                (id, result)
            }
        });
        let results: Vec<(SubscriberId, Result<(), SendError>)> =
            futures::future::join_all(sends).await;

        let mut delivered = 0;
        for (id, result) in &results {
            match result {
                Ok(()) => delivered += 1,
                Err(e) => debug!(subscriber_id = %id, error = %e, "Delivery failed"),
            }
        }
        let failed = recipients - delivered;

        self.record(delivered, failed);
        metrics::histogram!("monitor.broadcast.duration_seconds")
            .record(started.elapsed().as_secs_f64());

        if failed > 0 {
            warn!(
                failed,
                recipients, "Messages failed to send (potential backpressure)"
            );
        }

        BroadcastReport {
            recipients,
            delivered,
            failed,
        }
    }

    /// Current delivery counters and derived backpressure metrics
    pub fn stats(&self) -> BackpressureSnapshot {
        let client_count = self.registry.len();
        self.stats.lock().snapshot(client_count)
    }

    /// Log the backpressure snapshot at a fixed interval until cancelled.
    pub async fn run_stats_logger(
        self: Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => self.log_stats("Delivery stats"),
            }
        }
    }

    /// Emit one log line with the current delivery stats.
    pub fn log_stats(&self, message: &str) {
        let snapshot = self.stats();
        info!(
            client_count = snapshot.client_count,
            messages_sent = snapshot.messages_sent,
            messages_failed = snapshot.messages_failed,
            failure_rate = snapshot.failure_rate,
            avg_send_delay = snapshot.avg_send_delay,
            "{}",
            message
        );
    }

    fn record(&self, delivered: usize, failed: usize) {
        self.stats
            .lock()
            .record_results(delivered as u64, failed as u64);
        metrics::counter!("monitor.messages.sent").increment(delivered as u64);
        metrics::counter!("monitor.messages.failed").increment(failed as u64);
    }
}

#[async_trait]
impl EventSink for BroadcastHub {
    async fn publish(&self, event: CaptureEvent) {
        self.broadcast(&event).await;
    }
}
