//! Per-batch biomass statistics.

use crate::detection::DetectionRecord;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Aggregate statistics over one batch's detections
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BiomassSummary {
    /// Number of detections per class label
    pub class_counts: BTreeMap<String, u64>,
    /// Max rank of each detection, in detection order
    pub ranks: Vec<f64>,
    /// Detections whose max rank reaches the threshold
    pub good_crops: u64,
}

impl BiomassSummary {
    /// Number of detections the summary was built from.
    pub fn detection_count(&self) -> usize {
        self.ranks.len()
    }
}

/// Reduce a batch's detections to a [`BiomassSummary`].
///
/// Pure: the same input always yields the same summary, and an empty input
/// yields an empty summary.
pub fn summarize(detections: &[DetectionRecord], min_ranker_score: f64) -> BiomassSummary {
    let mut summary = BiomassSummary {
        ranks: Vec::with_capacity(detections.len()),
        ..Default::default()
    };

    for detection in detections {
        *summary
            .class_counts
            .entry(detection.class_name().to_string())
            .or_insert(0) += 1;

        let rank = detection.max_rank();
        if rank >= min_ranker_score {
            summary.good_crops += 1;
        }
        summary.ranks.push(rank);
    }

    summary
}
