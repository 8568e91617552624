//! Capture Monitor
//!
//! Real-time monitor for the fish capture pipeline. The service watches a
//! capture directory that an external imaging pipeline keeps writing to,
//! aggregates the biomass statistics of every newly completed batch, and
//! fans the resulting event out to all live WebSocket subscribers.
//!
//! ## Features
//!
//! - **Highest-watermark polling**: batch directories are timestamp-named, so
//!   the newest batch is the lexicographic maximum; no filesystem
//!   notifications are needed
//! - **At-most-once consideration**: a single cursor guarantees no batch is
//!   ever broadcast twice, even across failed cycles
//! - **Isolated fan-out**: every subscriber send runs concurrently under its
//!   own timeout, and failures are only counted
//! - **Backpressure accounting**: sent/failed counters and a rolling window
//!   of inter-broadcast delays, exposed on `/stats`
//!
//! ## Architecture
//!
//! ```text
//! Capture root                                         Subscribers
//! ┌──────────────┐                                    ┌──────────────┐
//! │ at=.../      │                                    │ WebSocket    │
//! │  left_frame  │                                    │ clients      │
//! │  right_frame │                                    └──────────────┘
//! │  detections  │                                           ▲
//! └──────────────┘                                           │
//!        │                                                   │
//!        ▼                                                   │
//! ┌──────────────┐    ┌──────────────┐    ┌──────────────┐   │
//! │ Scanner      │───▶│ Poller       │───▶│ Broadcast    │───┘
//! │ + Parser     │    │ + Aggregator │    │ Hub          │
//! └──────────────┘    └──────────────┘    └──────────────┘
//!                                                ▲
//!                                                │ register / unregister
//!                                         ┌──────────────┐
//!                                         │ Listener     │
//!                                         └──────────────┘
//! ```

pub mod aggregator;
pub mod config;
pub mod detection;
pub mod event;
pub mod hub;
pub mod poller;
pub mod registry;
pub mod scanner;
pub mod server;
pub mod stats;

pub use aggregator::{summarize, BiomassSummary};
pub use config::Config;
pub use detection::{parse_detections, DetectionError, DetectionRecord};
pub use event::{BiomassPayload, CaptureBatch, CaptureEvent, ThumbRef};
pub use hub::{BroadcastHub, BroadcastReport};
pub use poller::{EventSink, Poller, SkipReason, TickOutcome};
pub use registry::{ChannelSubscriber, SendError, Subscriber, SubscriberId, SubscriberRegistry};
pub use scanner::{CaptureError, CaptureScanner};
pub use server::AppState;
pub use stats::{BackpressureSnapshot, DeliveryStats};
