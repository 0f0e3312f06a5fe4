use crate::broadcast::Broadcaster;
use crate::hardware::{HardwareProfile, SystemSummary};
use crate::metrics::Metrics;
use crate::state::{DeviceClass, PoolStatus};
use axum::body::Body;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{header::CONTENT_TYPE, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{routing::get, Json, Router};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Clone)]
pub struct HttpAppState {
    pub metrics: Arc<Metrics>,
    pub broadcaster: Arc<Broadcaster>,
    pub profile: Arc<HardwareProfile>,
    pub summary: Arc<SystemSummary>,
    /// Never sent on. Every websocket task owns a clone of the state, so the
    /// paired receiver sees the channel close once the last task has ended.
    pub connections: mpsc::Sender<()>,
}

/// Frame transport for [`stream_snapshots`].
pub trait SnapshotSocket: Send {
    /// Returns `false` once the peer can no longer be written to.
    fn send_frame(&mut self, frame: Message) -> impl Future<Output = bool> + Send;

    /// `None` when the peer is gone or the stream errored.
    fn next_frame(&mut self) -> impl Future<Output = Option<Message>> + Send;
}

impl SnapshotSocket for WebSocket {
    async fn send_frame(&mut self, frame: Message) -> bool {
        self.send(frame).await.is_ok()
    }

    async fn next_frame(&mut self) -> Option<Message> {
        self.recv().await.and_then(Result::ok)
    }
}

#[derive(Debug, Serialize)]
pub struct PoolsResponse {
    pub pools: Vec<PoolStatus>,
}

#[derive(Debug, Serialize)]
pub struct DeviceEntry {
    pub device: String,
    #[serde(rename = "type")]
    pub class: DeviceClass,
}

pub fn build_router(state: HttpAppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_handler))
        .route("/api/system/performance", get(performance_ws))
        .route("/api/system/info", get(system_info))
        .route("/api/storage/pools", get(storage_pools))
        .route("/api/storage/devices", get(storage_devices))
        .with_state(state)
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn metrics_handler(State(state): State<HttpAppState>) -> Response {
    state.metrics.inc_scrape_count();
    match state.metrics.encode_metrics() {
        Ok(encoded) => {
            let mut response = Response::new(Body::from(encoded));
            response.headers_mut().insert(
                CONTENT_TYPE,
                HeaderValue::from_static("text/plain; version=0.0.4"),
            );
            response
        }
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to encode metrics: {err}"),
        )
            .into_response(),
    }
}

async fn system_info(State(state): State<HttpAppState>) -> impl IntoResponse {
    Json(state.summary.as_ref().clone())
}

async fn storage_pools(State(state): State<HttpAppState>) -> impl IntoResponse {
    let snapshot = state.broadcaster.current().await;
    Json(PoolsResponse {
        pools: snapshot.storage.pools,
    })
}

async fn storage_devices(State(state): State<HttpAppState>) -> impl IntoResponse {
    let devices: Vec<DeviceEntry> = state
        .profile
        .devices()
        .into_iter()
        .map(|(path, class)| DeviceEntry {
            device: path.to_string(),
            class,
        })
        .collect();
    Json(devices)
}

async fn performance_ws(ws: WebSocketUpgrade, State(state): State<HttpAppState>) -> Response {
    ws.on_upgrade(move |socket| stream_snapshots(socket, state))
}

/// Forwards queued snapshots until either side goes away. Inbound frames
/// other than close are ignored.
async fn stream_snapshots<S: SnapshotSocket>(mut socket: S, state: HttpAppState) {
    let mut subscription = state.broadcaster.subscribe().await;
    let id = subscription.id;
    state
        .metrics
        .set_subscribers(state.broadcaster.subscriber_count().await);
    debug!(subscriber = id, "websocket connected");

    loop {
        tokio::select! {
            queued = subscription.receiver.recv() => match queued {
                Some(payload) => {
                    if !socket.send_frame(Message::Text(payload.to_string())).await {
                        break;
                    }
                }
                None => {
                    // Evicted or shutting down.
                    socket.send_frame(Message::Close(None)).await;
                    break;
                }
            },
            inbound = socket.next_frame() => match inbound {
                Some(Message::Close(_)) | None => break,
                Some(_) => {}
            },
        }
    }

    state.broadcaster.unsubscribe(id).await;
    state
        .metrics
        .set_subscribers(state.broadcaster.subscriber_count().await);
    debug!(subscriber = id, "websocket disconnected");
}
