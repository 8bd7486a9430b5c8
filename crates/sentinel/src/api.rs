//! External HTTP/WebSocket interface
//!
//! Snapshot endpoints for the dashboard plus a live event subscription. The
//! WebSocket sends a `bootstrap` envelope with current descriptors and
//! incidents, then streams `{type: <topic>, ...payload}` envelopes from a
//! lossy bus subscription.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use prometheus::{Encoder, TextEncoder};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};

use sentinel_lib::bus::{EventBus, ALL_TOPICS};
use sentinel_lib::incident::IncidentStore;
use sentinel_lib::registry::ContainerRegistry;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<ContainerRegistry>,
    pub store: IncidentStore,
    pub bus: EventBus,
    /// Queue capacity for each websocket subscriber
    pub ws_capacity: usize,
}

impl AppState {
    pub fn new(
        registry: Arc<ContainerRegistry>,
        store: IncidentStore,
        bus: EventBus,
        ws_capacity: usize,
    ) -> Self {
        Self {
            registry,
            store,
            bus,
            ws_capacity,
        }
    }
}

/// Liveness probe
async fn health() -> impl IntoResponse {
    Json(json!({"status": "healthy"}))
}

/// Snapshot of all container descriptors with their last samples
async fn containers(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.registry.list())
}

/// Bounded sample ring for one container
async fn container_samples(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.registry.get(&id) {
        Some(_) => Json(state.registry.samples(&id)).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// All incidents ordered by detection time
async fn incidents(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.store.snapshot())
}

#[derive(Deserialize)]
struct HistoryQuery {
    #[serde(default = "default_history_limit")]
    limit: usize,
}

fn default_history_limit() -> usize {
    100
}

/// Recent event-bus history, oldest first
async fn events(
    State(state): State<Arc<AppState>>,
    Query(query): Query<HistoryQuery>,
) -> impl IntoResponse {
    Json(state.bus.history(query.limit))
}

/// Prometheus text exposition
async fn metrics() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        warn!(error = %e, "Metric encoding failed");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        buffer,
    )
        .into_response()
}

/// Live event subscription
async fn ws(State(state): State<Arc<AppState>>, upgrade: WebSocketUpgrade) -> impl IntoResponse {
    upgrade.on_upgrade(move |socket| stream_events(socket, state))
}

async fn stream_events(socket: WebSocket, state: Arc<AppState>) {
    // subscribe before snapshotting so no event between the two is lost
    let mut subscription = state.bus.subscribe(ALL_TOPICS, state.ws_capacity);

    let bootstrap = json!({
        "type": "bootstrap",
        "containers": state.registry.list(),
        "incidents": state.store.snapshot(),
    });

    let (mut sender, mut receiver) = socket.split();
    if sender
        .send(Message::Text(bootstrap.to_string()))
        .await
        .is_err()
    {
        debug!("WebSocket closed during bootstrap");
        return;
    }

    info!("Dashboard subscriber connected");
    loop {
        tokio::select! {
            envelope = subscription.recv() => {
                let Some(envelope) = envelope else { break };
                let payload = match serde_json::to_string(&envelope.event) {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!(error = %e, "Event serialization failed");
                        continue;
                    }
                };
                if sender.send(Message::Text(payload)).await.is_err() {
                    break;
                }
            }
            message = receiver.next() => {
                match message {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    // inbound frames are otherwise ignored
                    Some(Ok(_)) => {}
                }
            }
        }
    }
    info!(dropped = subscription.dropped(), "Dashboard subscriber disconnected");
}

/// Build the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/containers", get(containers))
        .route("/containers/:id/samples", get(container_samples))
        .route("/incidents", get(incidents))
        .route("/events", get(events))
        .route("/metrics", get(metrics))
        .route("/ws", get(ws))
        .with_state(state)
}

/// Start the API server
pub async fn serve(port: u16, state: Arc<AppState>) -> anyhow::Result<()> {
    let app = create_router(state);
    let addr = format!("0.0.0.0:{port}");
    info!(addr = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
