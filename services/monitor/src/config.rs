//! Configuration management for the capture monitor.
//!
//! Values are layered from optional config files and `MONITOR__*`
//! environment variables. Every field has a default so the service starts
//! with no configuration at all.

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration for the capture monitor
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// Capture tree layout
    #[serde(default)]
    pub capture: CaptureConfig,
    /// Change detector configuration
    #[serde(default)]
    pub poller: PollerConfig,
    /// Broadcast hub configuration
    #[serde(default)]
    pub hub: HubConfig,
    /// Listener configuration
    #[serde(default)]
    pub server: ServerConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Output format (json, pretty)
    #[serde(default = "default_log_format")]
    pub log_format: String,
    /// Prometheus exporter port; no exporter when unset
    #[serde(default)]
    pub metrics_port: Option<u16>,
}

/// Layout of the capture directory tree written by the imaging pipeline
#[derive(Debug, Clone, Deserialize)]
pub struct CaptureConfig {
    /// Directory holding one timestamp-named subdirectory per batch
    #[serde(default = "default_capture_root")]
    pub root: PathBuf,
    /// Prefix every batch directory name starts with (empty = any)
    #[serde(default = "default_batch_prefix")]
    pub batch_prefix: String,
    /// Name of the per-batch detections file
    #[serde(default = "default_detections_file")]
    pub detections_file: String,
    /// File name prefix of the left thumbnail
    #[serde(default = "default_left_thumb_prefix")]
    pub left_thumb_prefix: String,
    /// File name prefix of the right thumbnail
    #[serde(default = "default_right_thumb_prefix")]
    pub right_thumb_prefix: String,
    /// Thumbnail file extension, without the dot
    #[serde(default = "default_thumb_extension")]
    pub thumb_extension: String,
}

/// Change detector configuration
#[derive(Debug, Clone, Deserialize)]
pub struct PollerConfig {
    /// Sleep between poll cycles in milliseconds
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    /// Sleep after a failed poll cycle in milliseconds
    #[serde(default = "default_error_backoff_ms")]
    pub error_backoff_ms: u64,
    /// Minimum max-rank for a detection to count as a good crop
    #[serde(default = "default_min_ranker_score")]
    pub min_ranker_score: f64,
}

/// Broadcast hub configuration
#[derive(Debug, Clone, Deserialize)]
pub struct HubConfig {
    /// Per-subscriber send timeout in milliseconds
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,
    /// Number of inter-send delays kept for backpressure estimation
    #[serde(default = "default_stats_window")]
    pub stats_window: usize,
    /// Outbound message queue per subscriber connection
    #[serde(default = "default_subscriber_queue_size")]
    pub subscriber_queue_size: usize,
    /// Interval between delivery stats log lines in seconds (0 = off)
    #[serde(default = "default_stats_log_interval_secs")]
    pub stats_log_interval_secs: u64,
}

/// Listener configuration for subscribers and side endpoints
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Listen address
    #[serde(default = "default_host")]
    pub host: String,
    /// Listen port
    #[serde(default = "default_port")]
    pub port: u16,
    /// Enable CORS
    #[serde(default = "default_true")]
    pub cors_enabled: bool,
    /// Allowed CORS origins (empty = any)
    #[serde(default)]
    pub cors_origins: Vec<String>,
    /// Serve the capture root under /frames
    #[serde(default = "default_true")]
    pub serve_frames: bool,
}

// Default value functions
fn default_service_name() -> String {
    "capture-monitor".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_capture_root() -> PathBuf {
    PathBuf::from("test-data")
}

fn default_batch_prefix() -> String {
    "at=".to_string()
}

fn default_detections_file() -> String {
    "detections.json".to_string()
}

fn default_left_thumb_prefix() -> String {
    "left_frame".to_string()
}

fn default_right_thumb_prefix() -> String {
    "right_frame".to_string()
}

fn default_thumb_extension() -> String {
    "jpg".to_string()
}

fn default_tick_interval_ms() -> u64 {
    30
}

fn default_error_backoff_ms() -> u64 {
    1000
}

fn default_min_ranker_score() -> f64 {
    1e-5
}

fn default_send_timeout_ms() -> u64 {
    1000
}

fn default_stats_window() -> usize {
    100
}

fn default_subscriber_queue_size() -> usize {
    32
}

fn default_stats_log_interval_secs() -> u64 {
    30
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8765
}

fn default_true() -> bool {
    true
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            log_format: default_log_format(),
            metrics_port: None,
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            root: default_capture_root(),
            batch_prefix: default_batch_prefix(),
            detections_file: default_detections_file(),
            left_thumb_prefix: default_left_thumb_prefix(),
            right_thumb_prefix: default_right_thumb_prefix(),
            thumb_extension: default_thumb_extension(),
        }
    }
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
            error_backoff_ms: default_error_backoff_ms(),
            min_ranker_score: default_min_ranker_score(),
        }
    }
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            send_timeout_ms: default_send_timeout_ms(),
            stats_window: default_stats_window(),
            subscriber_queue_size: default_subscriber_queue_size(),
            stats_log_interval_secs: default_stats_log_interval_secs(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors_enabled: true,
            cors_origins: Vec::new(),
            serve_frames: true,
        }
    }
}

impl Config {
    /// Load configuration from config files and environment variables.
    ///
    /// Later sources override earlier ones:
    /// 1. `config/monitor.{toml,yaml,json}`
    /// 2. `/etc/ng/monitor.{toml,yaml,json}`
    /// 3. Environment variables (e.g. `MONITOR__CAPTURE__ROOT`)
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name("config/monitor").required(false))
            .add_source(config::File::with_name("/etc/ng/monitor").required(false))
            .add_source(
                config::Environment::with_prefix("MONITOR")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize().map_err(Into::into)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.capture.root.as_os_str().is_empty() {
            return Err(ConfigValidationError::MissingField(
                "capture.root".to_string(),
            ));
        }

        if self.capture.detections_file.is_empty() {
            return Err(ConfigValidationError::MissingField(
                "capture.detections_file".to_string(),
            ));
        }

        if self.poller.tick_interval_ms == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "poller.tick_interval_ms".to_string(),
                message: "Tick interval must be greater than 0".to_string(),
            });
        }

        let min_score = self.poller.min_ranker_score;
        if !min_score.is_finite() || min_score < 0.0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "poller.min_ranker_score".to_string(),
                message: format!("Expected a finite non-negative score, got {}", min_score),
            });
        }

        if self.hub.send_timeout_ms == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "hub.send_timeout_ms".to_string(),
                message: "Send timeout must be greater than 0".to_string(),
            });
        }

        if self.hub.stats_window == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "hub.stats_window".to_string(),
                message: "Stats window must hold at least one sample".to_string(),
            });
        }

        if self.hub.subscriber_queue_size == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "hub.subscriber_queue_size".to_string(),
                message: "Queue size must be greater than 0".to_string(),
            });
        }

        Ok(())
    }

    /// Listen address as `host:port`
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

impl PollerConfig {
    /// Get tick interval as Duration.
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    /// Get error backoff as Duration.
    pub fn error_backoff(&self) -> Duration {
        Duration::from_millis(self.error_backoff_ms)
    }
}

impl HubConfig {
    /// Get per-subscriber send timeout as Duration.
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    /// Get stats log interval, `None` when disabled.
    pub fn stats_log_interval(&self) -> Option<Duration> {
        (self.stats_log_interval_secs > 0)
            .then(|| Duration::from_secs(self.stats_log_interval_secs))
    }
}

/// Configuration validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}
