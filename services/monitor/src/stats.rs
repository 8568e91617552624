//! Delivery accounting used as a backpressure proxy.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Running delivery counters for the broadcast hub.
///
/// Reset only when the process restarts.
#[derive(Debug, Clone)]
pub struct DeliveryStats {
    pub messages_sent: u64,
    pub messages_failed: u64,
    last_send: Option<(Instant, DateTime<Utc>)>,
    send_delays: VecDeque<Duration>,
    window: usize,
}

/// Point-in-time view of [`DeliveryStats`] with derived metrics
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackpressureSnapshot {
    /// Mean delay between consecutive broadcasts in seconds
    pub avg_send_delay: f64,
    pub failure_rate: f64,
    pub client_count: usize,
    pub messages_sent: u64,
    pub messages_failed: u64,
    /// Last broadcast time in epoch milliseconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_send_at: Option<i64>,
}

impl DeliveryStats {
    /// Create empty stats keeping at most `window` delay samples
    pub fn new(window: usize) -> Self {
        Self {
            messages_sent: 0,
            messages_failed: 0,
            last_send: None,
            send_delays: VecDeque::with_capacity(window),
            window: window.max(1),
        }
    }

    /// Record the start of a broadcast, sampling the delay since the last one.
    pub fn record_send_start(&mut self, now: Instant) {
        if let Some((previous, _)) = self.last_send {
            if self.send_delays.len() == self.window {
                self.send_delays.pop_front();
            }
            self.send_delays
                .push_back(now.saturating_duration_since(previous));
        }
        self.last_send = Some((now, Utc::now()));
    }

    /// Add the outcome counts of one broadcast.
    pub fn record_results(&mut self, sent: u64, failed: u64) {
        self.messages_sent += sent;
        self.messages_failed += failed;
    }

    /// Delay samples currently in the window, oldest first
    pub fn send_delays(&self) -> impl Iterator<Item = Duration> + '_ {
        self.send_delays.iter().copied()
    }

    /// Mean inter-broadcast delay in seconds, 0 without samples.
    pub fn avg_send_delay(&self) -> f64 {
        if self.send_delays.is_empty() {
            return 0.0;
        }
        let total: f64 = self.send_delays.iter().map(Duration::as_secs_f64).sum();
        total / self.send_delays.len() as f64
    }

    /// Share of failed deliveries, 0 before any delivery attempt.
    pub fn failure_rate(&self) -> f64 {
        let attempts = self.messages_sent + self.messages_failed;
        if attempts == 0 {
            return 0.0;
        }
        self.messages_failed as f64 / attempts as f64
    }

    /// Snapshot with derived metrics rounded to four decimals.
    ///
    /// The subscriber count is owned by the registry and passed in.
    pub fn snapshot(&self, client_count: usize) -> BackpressureSnapshot {
        BackpressureSnapshot {
            avg_send_delay: round4(self.avg_send_delay()),
            failure_rate: round4(self.failure_rate()),
            client_count,
            messages_sent: self.messages_sent,
            messages_failed: self.messages_failed,
            last_send_at: self.last_send.map(|(_, at)| at.timestamp_millis()),
        }
    }
}

fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}
