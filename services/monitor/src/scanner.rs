//! Read-only probing of the capture tree.
//!
//! Batch directories are named with monotonically increasing timestamps, so
//! the lexicographically greatest name is always the newest batch. The
//! scanner relies on that ordering and never writes into the tree.

use crate::config::CaptureConfig;
use crate::detection::{parse_detections, DetectionError, DetectionRecord};
use crate::event::{CaptureBatch, ThumbRef};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tracing::trace;

/// Errors raised while reading the capture tree.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("Capture directory unavailable: {path}: {source}")]
    DirectoryUnavailable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Malformed detection data in batch {batch_id}: {source}")]
    MalformedDetectionData {
        batch_id: String,
        #[source]
        source: DetectionError,
    },

    #[error("Detections file unreadable: {path}: {source}")]
    DetectionsUnreadable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl CaptureError {
    /// Whether the error concerns one batch's contents rather than the tree.
    pub fn is_batch_local(&self) -> bool {
        matches!(
            self,
            CaptureError::MalformedDetectionData { .. } | CaptureError::DetectionsUnreadable { .. }
        )
    }
}

/// Side files found in a batch directory
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SideFiles {
    pub left_thumb: Option<String>,
    pub right_thumb: Option<String>,
    pub detections: Option<PathBuf>,
}

/// Scanner over the capture root
#[derive(Debug, Clone)]
pub struct CaptureScanner {
    layout: CaptureConfig,
}

impl CaptureScanner {
    /// Create a scanner for the given capture layout
    pub fn new(layout: CaptureConfig) -> Self {
        Self { layout }
    }

    /// Capture root being scanned
    pub fn root(&self) -> &Path {
        &self.layout.root
    }

    /// Id of the newest batch directory, `None` when there is none.
    pub async fn latest_batch(&self) -> Result<Option<String>, CaptureError> {
        let root = &self.layout.root;
        let unavailable = |source: io::Error| CaptureError::DirectoryUnavailable {
            path: root.clone(),
            source,
        };

        let mut entries = fs::read_dir(root).await.map_err(unavailable)?;
        let mut latest: Option<String> = None;

        while let Some(entry) = entries.next_entry().await.map_err(unavailable)? {
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if !self.is_batch_name(&name) {
                continue;
            }
            // Follows symlinks; entries can vanish between listing and inspection
            match fs::metadata(entry.path()).await {
                Ok(metadata) if metadata.is_dir() => {}
                _ => continue,
            }
            if latest.as_deref().map_or(true, |current| name.as_str() > current) {
                latest = Some(name);
            }
        }

        trace!(latest = ?latest, "Scanned capture root");
        Ok(latest)
    }

    /// Probe which side files a batch currently has.
    pub async fn probe(&self, batch_id: &str) -> Result<SideFiles, CaptureError> {
        let batch_dir = self.layout.root.join(batch_id);
        let unavailable = |source: io::Error| CaptureError::DirectoryUnavailable {
            path: batch_dir.clone(),
            source,
        };

        let mut entries = fs::read_dir(&batch_dir).await.map_err(unavailable)?;
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(unavailable)? {
            if let Ok(name) = entry.file_name().into_string() {
                names.push(name);
            }
        }
        names.sort();

        let detections = names
            .iter()
            .any(|name| *name == self.layout.detections_file)
            .then(|| batch_dir.join(&self.layout.detections_file));

        Ok(SideFiles {
            left_thumb: self.first_thumb(&names, &self.layout.left_thumb_prefix),
            right_thumb: self.first_thumb(&names, &self.layout.right_thumb_prefix),
            detections,
        })
    }

    /// Observe a batch: probe its side files and parse detections if present.
    pub async fn load(&self, batch_id: &str) -> Result<CaptureBatch, CaptureError> {
        let side_files = self.probe(batch_id).await?;

        let detections = match side_files.detections {
            Some(path) => Some(self.read_detections(batch_id, path).await?),
            None => None,
        };

        let thumb_ref = |filename: String| ThumbRef {
            filename,
            directory: batch_id.to_string(),
        };

        Ok(CaptureBatch {
            id: batch_id.to_string(),
            left_thumb: side_files.left_thumb.map(thumb_ref),
            right_thumb: side_files.right_thumb.map(thumb_ref),
            detections,
        })
    }

    async fn read_detections(
        &self,
        batch_id: &str,
        path: PathBuf,
    ) -> Result<Vec<DetectionRecord>, CaptureError> {
        let bytes = fs::read(&path)
            .await
            .map_err(|source| CaptureError::DetectionsUnreadable { path, source })?;

        parse_detections(&bytes).map_err(|source| CaptureError::MalformedDetectionData {
            batch_id: batch_id.to_string(),
            source,
        })
    }

    fn is_batch_name(&self, name: &str) -> bool {
        !name.starts_with('.') && name.starts_with(&self.layout.batch_prefix)
    }

    fn first_thumb(&self, sorted_names: &[String], prefix: &str) -> Option<String> {
        let suffix = format!(".{}", self.layout.thumb_extension);
        sorted_names
            .iter()
            .find(|name| name.starts_with(prefix) && name.ends_with(&suffix))
            .cloned()
    }
}
