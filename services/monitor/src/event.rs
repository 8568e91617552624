//! Capture batches and the events broadcast for them.

use crate::aggregator::{summarize, BiomassSummary};
use crate::detection::DetectionRecord;
use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Reference to a thumbnail inside the capture tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThumbRef {
    /// File name within the batch directory
    pub filename: String,
    /// Batch directory name
    pub directory: String,
}

/// One batch directory as observed during a poll cycle.
///
/// Side files are written incrementally, so any combination of them may be
/// missing when the batch is observed.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureBatch {
    /// Directory name; ordered chronologically by construction
    pub id: String,
    pub left_thumb: Option<ThumbRef>,
    pub right_thumb: Option<ThumbRef>,
    /// Parsed detections, `None` while the detections file is absent
    pub detections: Option<Vec<DetectionRecord>>,
}

/// Biomass section of a capture event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BiomassPayload {
    pub detections: Vec<DetectionRecord>,
    #[serde(flatten)]
    pub summary: BiomassSummary,
}

/// Event fanned out to every subscriber
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureEvent {
    /// Broadcast time in epoch milliseconds
    pub created_at: i64,
    /// Batch id
    pub captured_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub left_thumb: Option<ThumbRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub right_thumb: Option<ThumbRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub biomass: Option<BiomassPayload>,
}

impl CaptureEvent {
    /// Build the event for a batch, aggregating its detections.
    ///
    /// Returns `None` while the batch has no detections: such a batch is
    /// never broadcast.
    pub fn from_batch(batch: CaptureBatch, min_ranker_score: f64) -> Option<Self> {
        let detections = batch.detections?;
        let summary = summarize(&detections, min_ranker_score);

        Some(Self {
            created_at: Utc::now().timestamp_millis(),
            captured_at: batch.id,
            left_thumb: batch.left_thumb,
            right_thumb: batch.right_thumb,
            biomass: Some(BiomassPayload {
                detections,
                summary,
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::parse_detections;

    fn thumb(name: &str) -> ThumbRef {
        ThumbRef {
            filename: name.to_string(),
            directory: "at=2024-05-01T10:00:00".to_string(),
        }
    }

    #[test]
    fn test_event_wire_shape() {
        let detections =
            parse_detections(br#"[{"left": {"class_name": "salmon"}, "biomass_ranker": [0.3]}]"#)
                .unwrap();
        let batch = CaptureBatch {
            id: "at=2024-05-01T10:00:00".to_string(),
            left_thumb: Some(thumb("left_frame.jpg")),
            right_thumb: None,
            detections: Some(detections),
        };

        let event = CaptureEvent::from_batch(batch, 1e-5).unwrap();
        let value = serde_json::to_value(&event).unwrap();

        assert!(value["createdAt"].as_i64().unwrap() > 0);
        assert_eq!(value["capturedAt"], "at=2024-05-01T10:00:00");
        assert_eq!(value["leftThumb"]["filename"], "left_frame.jpg");
        assert_eq!(value["leftThumb"]["directory"], "at=2024-05-01T10:00:00");
        assert!(value.get("rightThumb").is_none());
        assert_eq!(value["biomass"]["classCounts"]["salmon"], 1);
        assert_eq!(value["biomass"]["goodCrops"], 1);
        assert_eq!(value["biomass"]["ranks"][0], 0.3);
        assert_eq!(value["biomass"]["detections"][0]["left"]["class_name"], "salmon");
    }

    #[test]
    fn test_batch_without_detections_has_no_event() {
        let batch = CaptureBatch {
            id: "at=2024-05-01T10:00:00".to_string(),
            left_thumb: Some(thumb("left_frame.jpg")),
            right_thumb: Some(thumb("right_frame.jpg")),
            detections: None,
        };
        assert!(CaptureEvent::from_batch(batch, 1e-5).is_none());
    }

    #[test]
    fn test_empty_detections_still_produce_event() {
        let batch = CaptureBatch {
            id: "at=2024-05-01T10:00:00".to_string(),
            left_thumb: None,
            right_thumb: None,
            detections: Some(Vec::new()),
        };
        let event = CaptureEvent::from_batch(batch, 1e-5).unwrap();
        assert_eq!(event.biomass.unwrap().summary, BiomassSummary::default());
    }

    #[test]
    fn test_event_without_biomass_omits_field() {
        let event = CaptureEvent {
            created_at: 1,
            captured_at: "at=1".to_string(),
            left_thumb: None,
            right_thumb: None,
            biomass: None,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert!(value.get("biomass").is_none());
        assert!(value.get("leftThumb").is_none());
    }
}
