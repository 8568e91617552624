//! Change detector: polls the capture root for the newest batch.
//!
//! A single "last considered" cursor is advanced as soon as a new candidate
//! is seen, before the batch is read. The cursor is a high watermark: batch
//! ids only grow, so any candidate at or below it has been considered or
//! superseded already. Each batch id is therefore considered at most once,
//! and a batch superseded before its detections file lands is never
//! broadcast, even if the newer directory later disappears.

use crate::config::PollerConfig;
use crate::event::CaptureEvent;
use crate::scanner::{CaptureError, CaptureScanner};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Destination for assembled capture events
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, event: CaptureEvent);
}

/// Why a considered batch produced no event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Detections file not written yet
    NoDetections,
    /// Detections file present but undecodable
    MalformedDetections,
}

/// Decision taken by one poll cycle
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// No batch directory under the root
    Idle,
    /// Newest batch is not past the last considered one
    Unchanged,
    /// New batch considered without producing an event
    Skipped { batch_id: String, reason: SkipReason },
    /// New batch assembled into an event
    Emitted(CaptureEvent),
}

/// Polling change detector over a capture root
pub struct Poller {
    scanner: CaptureScanner,
    min_ranker_score: f64,
    tick_interval: Duration,
    error_backoff: Duration,
    last_considered: Option<String>,
}

impl Poller {
    /// Create a poller reading through `scanner`
    pub fn new(scanner: CaptureScanner, config: &PollerConfig) -> Self {
        Self {
            scanner,
            min_ranker_score: config.min_ranker_score,
            tick_interval: config.tick_interval(),
            error_backoff: config.error_backoff(),
            last_considered: None,
        }
    }

    /// Id of the last batch considered, if any
    pub fn last_considered(&self) -> Option<&str> {
        self.last_considered.as_deref()
    }

    /// Run one poll cycle.
    ///
    /// Errors are limited to the capture tree being unreadable; problems with
    /// a single batch's detections are reported as [`TickOutcome::Skipped`].
    pub async fn tick(&mut self) -> Result<TickOutcome, CaptureError> {
        let Some(candidate) = self.scanner.latest_batch().await? else {
            return Ok(TickOutcome::Idle);
        };

        if self
            .last_considered
            .as_deref()
            .is_some_and(|last| candidate.as_str() <= last)
        {
            return Ok(TickOutcome::Unchanged);
        }
        self.last_considered = Some(candidate.clone());
        debug!(batch_id = %candidate, "Considering new batch");

        let batch = match self.scanner.load(&candidate).await {
            Ok(batch) => batch,
            Err(e) if e.is_batch_local() => {
                warn!(
                    batch_id = %candidate,
                    error = %e,
                    "Skipping batch with unusable detections"
                );
                metrics::counter!("monitor.batches.skipped").increment(1);
                return Ok(TickOutcome::Skipped {
                    batch_id: candidate,
                    reason: SkipReason::MalformedDetections,
                });
            }
            Err(e) => return Err(e),
        };

        match CaptureEvent::from_batch(batch, self.min_ranker_score) {
            Some(event) => {
                if let Some(biomass) = &event.biomass {
                    info!(
                        batch_id = %event.captured_at,
                        detections = biomass.summary.detection_count(),
                        classes = biomass.summary.class_counts.len(),
                        good_crops = biomass.summary.good_crops,
                        "Batch assembled"
                    );
                }
                metrics::counter!("monitor.batches.emitted").increment(1);
                Ok(TickOutcome::Emitted(event))
            }
            None => {
                debug!(batch_id = %candidate, "Batch has no detections yet, not broadcasting");
                metrics::counter!("monitor.batches.skipped").increment(1);
                Ok(TickOutcome::Skipped {
                    batch_id: candidate,
                    reason: SkipReason::NoDetections,
                })
            }
        }
    }

    /// Poll until `shutdown` is cancelled, publishing every emitted event.
    ///
    /// A failed cycle is logged and followed by the longer error backoff;
    /// the loop itself never terminates on error.
    #[instrument(skip_all, fields(root = %self.scanner.root().display()))]
    pub async fn run(mut self, sink: Arc<dyn EventSink>, shutdown: CancellationToken) {
        info!(
            tick_interval_ms = self.tick_interval.as_millis() as u64,
            "Capture poller started"
        );

        loop {
            let pause = match self.tick().await {
                Ok(TickOutcome::Emitted(event)) => {
                    sink.publish(event).await;
                    self.tick_interval
                }
                Ok(_) => self.tick_interval,
                Err(e) => {
                    error!(
                        error = %e,
                        backoff_ms = self.error_backoff.as_millis() as u64,
                        "Poll cycle failed"
                    );
                    metrics::counter!("monitor.poll.errors").increment(1);
                    self.error_backoff
                }
            };

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(pause) => {}
            }
        }

        info!(last_batch = ?self.last_considered, "Capture poller stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CaptureConfig;
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    const DETECTIONS: &str = r#"[
        {"left": {"class_name": "salmon"}, "biomass_ranker": [0.2, null]},
        {"left": {"class_name": "cod"}, "biomass_ranker": [null]}
    ]"#;

    fn poller_for(dir: &TempDir) -> Poller {
        let scanner = CaptureScanner::new(CaptureConfig {
            root: dir.path().to_path_buf(),
            ..Default::default()
        });
        let config = PollerConfig {
            tick_interval_ms: 5,
            error_backoff_ms: 10,
            ..Default::default()
        };
        Poller::new(scanner, &config)
    }

    fn make_batch(dir: &TempDir, id: &str, files: &[(&str, &str)]) {
        let batch_dir = dir.path().join(id);
        std::fs::create_dir_all(&batch_dir).unwrap();
        for (name, contents) in files {
            std::fs::write(batch_dir.join(name), contents).unwrap();
        }
    }

    /// Write a complete batch without the poller observing it half-built.
    fn publish_batch(root: &std::path::Path, id: &str, files: &[(&str, &str)]) {
        let staging = root.join(format!(".staging-{}", id));
        std::fs::create_dir_all(&staging).unwrap();
        for (name, contents) in files {
            std::fs::write(staging.join(name), contents).unwrap();
        }
        std::fs::rename(&staging, root.join(id)).unwrap();
    }

    struct ChannelSink(mpsc::UnboundedSender<CaptureEvent>);

    #[async_trait]
    impl EventSink for ChannelSink {
        async fn publish(&self, event: CaptureEvent) {
            let _ = self.0.send(event);
        }
    }

    #[tokio::test]
    async fn test_empty_root_is_idle() {
        let dir = TempDir::new().unwrap();
        let mut poller = poller_for(&dir);
        assert_eq!(poller.tick().await.unwrap(), TickOutcome::Idle);
        assert_eq!(poller.last_considered(), None);
    }

    #[tokio::test]
    async fn test_batch_considered_at_most_once() {
        let dir = TempDir::new().unwrap();
        make_batch(&dir, "at=1", &[("detections.json", DETECTIONS)]);
        let mut poller = poller_for(&dir);

        assert!(matches!(
            poller.tick().await.unwrap(),
            TickOutcome::Emitted(_)
        ));
        for _ in 0..3 {
            assert_eq!(poller.tick().await.unwrap(), TickOutcome::Unchanged);
        }
    }

    #[tokio::test]
    async fn test_no_broadcast_without_detections() {
        let dir = TempDir::new().unwrap();
        make_batch(
            &dir,
            "at=1",
            &[("left_frame.jpg", ""), ("right_frame.jpg", "")],
        );
        let mut poller = poller_for(&dir);

        assert_eq!(
            poller.tick().await.unwrap(),
            TickOutcome::Skipped {
                batch_id: "at=1".to_string(),
                reason: SkipReason::NoDetections,
            }
        );

        // Detections arriving later do not resurrect a considered batch
        std::fs::write(dir.path().join("at=1/detections.json"), DETECTIONS).unwrap();
        assert_eq!(poller.tick().await.unwrap(), TickOutcome::Unchanged);
    }

    #[tokio::test]
    async fn test_malformed_detections_skip_batch() {
        let dir = TempDir::new().unwrap();
        make_batch(&dir, "at=1", &[("detections.json", "{\"oops\": ")]);
        let mut poller = poller_for(&dir);

        assert_eq!(
            poller.tick().await.unwrap(),
            TickOutcome::Skipped {
                batch_id: "at=1".to_string(),
                reason: SkipReason::MalformedDetections,
            }
        );
        assert_eq!(poller.tick().await.unwrap(), TickOutcome::Unchanged);
        assert_eq!(poller.last_considered(), Some("at=1"));
    }

    #[tokio::test]
    async fn test_emitted_event_contents() {
        let dir = TempDir::new().unwrap();
        make_batch(
            &dir,
            "at=2024-05-01T10:00:00",
            &[("left_frame.jpg", ""), ("detections.json", DETECTIONS)],
        );
        let mut poller = poller_for(&dir);

        let TickOutcome::Emitted(event) = poller.tick().await.unwrap() else {
            panic!("expected an emitted event");
        };
        assert_eq!(event.captured_at, "at=2024-05-01T10:00:00");
        assert_eq!(event.left_thumb.unwrap().filename, "left_frame.jpg");
        assert!(event.right_thumb.is_none());

        let biomass = event.biomass.unwrap();
        assert_eq!(biomass.detections.len(), 2);
        assert_eq!(biomass.summary.ranks, vec![0.2, 0.0]);
        assert_eq!(biomass.summary.good_crops, 1);
    }

    #[tokio::test]
    async fn test_superseded_batch_is_not_backfilled() {
        let dir = TempDir::new().unwrap();
        make_batch(&dir, "at=1", &[]);
        let mut poller = poller_for(&dir);
        assert!(matches!(
            poller.tick().await.unwrap(),
            TickOutcome::Skipped { .. }
        ));

        std::fs::write(dir.path().join("at=1/detections.json"), DETECTIONS).unwrap();
        make_batch(&dir, "at=2", &[("detections.json", DETECTIONS)]);

        let TickOutcome::Emitted(event) = poller.tick().await.unwrap() else {
            panic!("expected an emitted event");
        };
        assert_eq!(event.captured_at, "at=2");
        assert_eq!(poller.tick().await.unwrap(), TickOutcome::Unchanged);
    }

    #[tokio::test]
    async fn test_removed_newest_batch_does_not_reemit_older_one() {
        let dir = TempDir::new().unwrap();
        make_batch(&dir, "at=1", &[("detections.json", DETECTIONS)]);
        let mut poller = poller_for(&dir);
        assert!(matches!(
            poller.tick().await.unwrap(),
            TickOutcome::Emitted(_)
        ));

        make_batch(&dir, "at=2", &[]);
        assert_eq!(
            poller.tick().await.unwrap(),
            TickOutcome::Skipped {
                batch_id: "at=2".to_string(),
                reason: SkipReason::NoDetections,
            }
        );

        std::fs::remove_dir_all(dir.path().join("at=2")).unwrap();
        assert_eq!(poller.tick().await.unwrap(), TickOutcome::Unchanged);
        assert_eq!(poller.last_considered(), Some("at=2"));

        make_batch(&dir, "at=3", &[("detections.json", DETECTIONS)]);
        let TickOutcome::Emitted(event) = poller.tick().await.unwrap() else {
            panic!("expected an emitted event");
        };
        assert_eq!(event.captured_at, "at=3");
    }

    #[tokio::test]
    async fn test_unreadable_root_is_an_error() {
        let dir = TempDir::new().unwrap();
        let scanner = CaptureScanner::new(CaptureConfig {
            root: dir.path().join("not-there"),
            ..Default::default()
        });
        let mut poller = Poller::new(scanner, &PollerConfig::default());

        assert!(matches!(
            poller.tick().await,
            Err(CaptureError::DirectoryUnavailable { .. })
        ));
    }

    #[tokio::test]
    async fn test_run_emits_in_batch_order_without_duplicates() {
        let dir = TempDir::new().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(
            poller_for(&dir).run(Arc::new(ChannelSink(tx)), shutdown.clone()),
        );

        for id in ["at=1", "at=2", "at=3"] {
            publish_batch(dir.path(), id, &[("detections.json", DETECTIONS)]);
            let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("poller did not emit in time")
                .unwrap();
            assert_eq!(event.captured_at, id);
        }

        // Give the loop a few more cycles to prove nothing is re-emitted
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_run_survives_missing_root() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("captures");
        let scanner = CaptureScanner::new(CaptureConfig {
            root: root.clone(),
            ..Default::default()
        });
        let config = PollerConfig {
            tick_interval_ms: 5,
            error_backoff_ms: 10,
            ..Default::default()
        };
        let (tx, mut rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(
            Poller::new(scanner, &config).run(Arc::new(ChannelSink(tx)), shutdown.clone()),
        );

        tokio::time::sleep(Duration::from_millis(30)).await;
        std::fs::create_dir_all(&root).unwrap();
        publish_batch(&root, "at=1", &[("detections.json", DETECTIONS)]);

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("poller did not recover")
            .unwrap();
        assert_eq!(event.captured_at, "at=1");

        shutdown.cancel();
        handle.await.unwrap();
    }
}
