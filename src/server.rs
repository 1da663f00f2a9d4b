// src/server.rs
//
// Broker host: axum router exposing the signaling WebSocket and a small
// read-only HTTP surface.
//
//   GET /ws                     one duplex signaling channel per socket
//   GET /health                 liveness + counters
//   GET /v1/groups              every active group
//   GET /v1/groups/:group_key   one group
//
// ────────────────────────────────────────────────────────────────────────────

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Request, State};
use axum::http::{HeaderName, HeaderValue, Method};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::ApiError;
use crate::protocol::ClientMessage;
use crate::registry::{GroupInfo, SessionRegistry};
use crate::router::SignalingRouter;

const VERSION: &str = env!("CARGO_PKG_VERSION");

// ─── BrokerState ────────────────────────────────────────────────────────────

pub struct BrokerState {
    pub router: Arc<SignalingRouter>,
}

impl BrokerState {
    pub fn new(outbound_queue: usize) -> Arc<Self> {
        let registry = Arc::new(SessionRegistry::new());
        Arc::new(Self {
            router: Arc::new(SignalingRouter::new(registry, outbound_queue)),
        })
    }
}

// ─── Handlers ───────────────────────────────────────────────────────────────

async fn health_handler(State(state): State<Arc<BrokerState>>) -> impl IntoResponse {
    let router = &state.router;
    Json(serde_json::json!({
        "status": "ok",
        "version": VERSION,
        "groups_active": router.registry().group_count(),
        "connections_active": router.connection_count(),
        "messages_delivered": router.delivered(),
        "messages_dropped": router.dropped(),
    }))
}

async fn list_groups(State(state): State<Arc<BrokerState>>) -> Json<Vec<GroupInfo>> {
    Json(state.router.registry().groups())
}

async fn get_group(
    State(state): State<Arc<BrokerState>>,
    Path(group_key): Path<String>,
) -> Result<Json<GroupInfo>, ApiError> {
    if group_key.trim().is_empty() {
        return Err(ApiError::invalid_group_key());
    }
    state
        .router
        .registry()
        .group(&group_key)
        .map(Json)
        .ok_or_else(|| ApiError::group_not_found(&group_key))
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<BrokerState>>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<BrokerState>) {
    let (connection_id, mut outbound) = state.router.connect();
    let (mut sender, mut receiver) = socket.split();

    // Writer: drains this connection's queue onto the wire.
    let writer_id = connection_id.clone();
    tokio::spawn(async move {
        while let Some(message) = outbound.recv().await {
            let Ok(json) = serde_json::to_string(&message) else {
                continue;
            };
            if sender.send(Message::Text(json)).await.is_err() {
                break;
            }
        }
        let _ = sender.close().await;
        debug!(connection_id = %writer_id, "writer task ended");
    });

    while let Some(frame) = receiver.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Binary(data)) => match String::from_utf8(data) {
                Ok(text) => text,
                Err(_) => {
                    debug!(connection_id = %connection_id, "non-UTF-8 binary frame ignored");
                    continue;
                }
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                debug!(connection_id = %connection_id, "socket error: {e}");
                break;
            }
        };

        match serde_json::from_str::<ClientMessage>(&text) {
            Ok(message) => {
                state.router.handle(&connection_id, message);
            }
            Err(e) => debug!(connection_id = %connection_id, "malformed frame dropped: {e}"),
        }
    }

    // Dropping the queue sender ends the writer task.
    state.router.disconnect(&connection_id);
}

// ─── Version header middleware ──────────────────────────────────────────────

async fn version_header_middleware(request: Request, next: Next) -> impl IntoResponse {
    let mut response = next.run(request).await;
    response.headers_mut().insert(
        HeaderName::from_static("x-peerwatch-version"),
        HeaderValue::from_static(VERSION),
    );
    response
}

// ─── CORS configuration ────────────────────────────────────────────────────

fn build_cors_layer(allowed_origins: &str) -> CorsLayer {
    if allowed_origins == "*" {
        warn!("CORS: permissive mode (allow all origins)");
        return CorsLayer::permissive();
    }

    let origins: Vec<HeaderValue> = allowed_origins
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .filter_map(|s| match s.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("CORS: ignoring invalid origin {s:?}");
                None
            }
        })
        .collect();

    info!("CORS: restricted to {} origin(s)", origins.len());

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET])
        .allow_headers([HeaderName::from_static("content-type")])
}

// ─── Router / serving ───────────────────────────────────────────────────────

pub fn app(state: Arc<BrokerState>, allowed_origins: &str) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/v1/groups", get(list_groups))
        .route("/v1/groups/:group_key", get(get_group))
        .layer(middleware::from_fn(version_header_middleware))
        .layer(build_cors_layer(allowed_origins))
        .with_state(state)
}

/// Serve `app` on an already-bound listener until `shutdown` fires.
pub async fn serve(
    listener: TcpListener,
    app: Router,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

/// Bind the configured address and run the broker.
pub async fn run(config: &Config, shutdown: CancellationToken) -> std::io::Result<()> {
    let state = BrokerState::new(config.outbound_queue);
    let app = app(state, &config.allowed_origins);
    let listener = TcpListener::bind(&config.bind_addr).await?;
    info!("peerwatch broker listening on http://{}", listener.local_addr()?);
    serve(listener, app, shutdown).await
}

// ─── Tests ──────────────────────────────────────────────────────────────────
