//! Detection file decoding.
//!
//! The imaging pipeline writes one JSON array per batch, one object per
//! detected fish. Only `left.class_name` and `biomass_ranker` are read here;
//! every other field is carried through untouched so the broadcast can
//! forward the raw records.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Errors that can occur while decoding a detections file.
#[derive(Debug, Error)]
pub enum DetectionError {
    #[error("Malformed detection data: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Left-camera view of a detection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionView {
    /// Class label assigned by the detector
    pub class_name: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One detected object as written by the imaging pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionRecord {
    pub left: DetectionView,
    /// One score per ranking pass; a pass may leave its slot null
    #[serde(default)]
    pub biomass_ranker: Vec<Option<f64>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl DetectionRecord {
    /// Class label of the detection.
    pub fn class_name(&self) -> &str {
        &self.left.class_name
    }

    /// Highest ranker score, with missing scores counted as zero.
    pub fn max_rank(&self) -> f64 {
        self.biomass_ranker
            .iter()
            .map(|score| score.unwrap_or(0.0))
            .reduce(f64::max)
            .unwrap_or(0.0)
    }
}

/// Decode the raw bytes of a detections file.
pub fn parse_detections(bytes: &[u8]) -> Result<Vec<DetectionRecord>, DetectionError> {
    Ok(serde_json::from_slice(bytes)?)
}
