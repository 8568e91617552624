//! Subscriber listener and side HTTP endpoints.
//!
//! Subscribers connect over WebSocket and only ever receive; anything they
//! send other than a close frame is ignored. The same listener serves the
//! capture root read-only under `/frames` so thumbnails named in events can
//! be fetched.

use crate::config::ServerConfig;
use crate::hub::BroadcastHub;
use crate::registry::ChannelSubscriber;
use crate::stats::BackpressureSnapshot;
use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::HeaderValue,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, trace, warn};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub service_name: String,
    pub hub: Arc<BroadcastHub>,
    pub subscriber_queue_size: usize,
}

/// Stats endpoint response
#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub service: String,
    #[serde(flatten)]
    pub backpressure: BackpressureSnapshot,
}

/// Create the listener router
pub fn create_router(state: AppState, config: &ServerConfig, capture_root: PathBuf) -> Router {
    let cors = if config.cors_enabled {
        if config.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<HeaderValue> = config
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    } else {
        CorsLayer::new()
    };

    let mut router = Router::new()
        .route("/", get(websocket_handler))
        .route("/ws", get(websocket_handler))
        .route("/health", get(health_check))
        .route("/stats", get(delivery_stats));

    if config.serve_frames {
        router = router.nest_service("/frames", ServeDir::new(capture_root));
    }

    router
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Health check endpoint
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": state.service_name,
    }))
}

/// Delivery stats endpoint
async fn delivery_stats(State(state): State<AppState>) -> Json<StatsResponse> {
    Json(StatsResponse {
        service: state.service_name.clone(),
        backpressure: state.hub.stats(),
    })
}

/// WebSocket upgrade handler
async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_subscriber(socket, state))
}

/// Serve one subscriber connection until either side closes it
async fn handle_subscriber(socket: WebSocket, state: AppState) {
    let (mut sink, mut stream) = socket.split();
    let (subscriber, mut outbound) = ChannelSubscriber::new(state.subscriber_queue_size);
    let registry = state.hub.registry().clone();
    let id = registry.register(Arc::new(subscriber));

    let mut writer = tokio::spawn(async move {
        while let Some(payload) = outbound.recv().await {
            if let Err(e) = sink.send(Message::Text(payload.to_string())).await {
                debug!(subscriber_id = %id, error = %e, "Write to subscriber failed");
                break;
            }
        }
    });

    let mut reader = tokio::spawn(async move {
        while let Some(result) = stream.next().await {
            match result {
                Ok(Message::Close(_)) => break,
                Ok(other) => {
                    trace!(subscriber_id = %id, message = ?other, "Ignoring inbound message")
                }
                Err(e) => {
                    warn!(subscriber_id = %id, error = %e, "WebSocket error");
                    break;
                }
            }
        }
    });

    tokio::select! {
        _ = &mut writer => reader.abort(),
        _ = &mut reader => writer.abort(),
    }

    registry.unregister(&id);
}

/// Start the listener and serve until `shutdown` is cancelled
pub async fn start_server(
    state: AppState,
    config: &ServerConfig,
    capture_root: PathBuf,
    shutdown: CancellationToken,
) -> Result<()> {
    let router = create_router(state, config, capture_root);
    let addr = format!("{}:{}", config.host, config.port);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    info!(address = %addr, "Subscriber listener started");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
        .context("Listener error")?;

    Ok(())
}
