use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use tether_core::ids::OwnerId;
use tether_engine::SessionOrchestrator;
use tether_telemetry::SqliteLogSink;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tower_http::cors::CorsLayer;

use crate::client::{self, ClientId, ClientRegistry};
use crate::event_bridge::EventBridge;
use crate::handlers::{self, Caller, HandlerState};
use crate::rpc::{RpcRequest, RpcResponse};

const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

/// Server configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub max_send_queue: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 9191,
            max_send_queue: 256,
        }
    }
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub handler_state: Arc<HandlerState>,
    pub client_registry: Arc<ClientRegistry>,
    pub message_tx: mpsc::Sender<(ClientId, String)>,
}

#[derive(Debug, Deserialize)]
pub struct ConnectQuery {
    #[serde(rename = "ownerId")]
    pub owner_id: Option<String>,
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// Bind the listener and start serving. Returns a handle to shut it down.
/// `logs` backs the `logs.query` method when SQLite logging is on.
pub async fn start(
    config: ServerConfig,
    orchestrator: Arc<dyn SessionOrchestrator>,
    logs: Option<Arc<SqliteLogSink>>,
) -> Result<ServerHandle, std::io::Error> {
    let client_registry = Arc::new(ClientRegistry::new(config.max_send_queue));
    let bridge = Arc::new(EventBridge::new(
        Arc::clone(&client_registry),
        Arc::clone(&orchestrator),
    ));
    let handler_state = Arc::new(HandlerState::new(orchestrator, Arc::clone(&bridge)).with_logs(logs));
    let cancel = CancellationToken::new();

    let cleanup_bridge = Arc::clone(&bridge);
    let cleanup = client::start_cleanup_task(
        Arc::clone(&client_registry),
        CLEANUP_INTERVAL,
        cancel.clone(),
        move |id| {
            cleanup_bridge.detach_client(id);
        },
    );

    let (msg_tx, msg_rx) = mpsc::channel::<(ClientId, String)>(1024);
    let tracker = TaskTracker::new();
    let rpc = tokio::spawn(process_rpc_messages(
        msg_rx,
        Arc::clone(&handler_state),
        Arc::clone(&client_registry),
        tracker.clone(),
        cancel.clone(),
    ));

    let router = build_router(AppState {
        handler_state,
        client_registry,
        message_tx: msg_tx,
    });
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;

    tracing::info!(host = %config.host, port = local_addr.port(), "Tether server started");

    let shutdown = cancel.clone();
    let server = tokio::spawn(async move {
        let result = axum::serve(listener, router)
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await;
        if let Err(e) = result {
            tracing::error!(error = %e, "server stopped with error");
        }
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        cancel,
        tracker,
        server,
        rpc,
        cleanup,
    })
}

/// Handle returned by `start()`; keeps background tasks alive.
pub struct ServerHandle {
    pub port: u16,
    cancel: CancellationToken,
    tracker: TaskTracker,
    server: tokio::task::JoinHandle<()>,
    rpc: tokio::task::JoinHandle<()>,
    cleanup: tokio::task::JoinHandle<()>,
}

impl ServerHandle {
    /// Stop accepting connections and wait for in-flight requests.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        let _ = self.cleanup.await;
        let _ = self.rpc.await;
        self.tracker.close();
        self.tracker.wait().await;
        // Open sockets keep graceful shutdown waiting; bound it.
        let server = self.server;
        if tokio::time::timeout(Duration::from_secs(5), server).await.is_err() {
            tracing::warn!("server did not drain in time");
        }
        tracing::info!("Tether server stopped");
    }
}

/// WebSocket upgrade handler. `ownerId` binds the socket to one owner.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<ConnectQuery>,
    State(state): State<AppState>,
) -> Response {
    let owner_id = match query.owner_id.as_deref().map(str::trim) {
        Some(raw) if !raw.is_empty() => OwnerId::from_raw(raw),
        _ => return (StatusCode::BAD_REQUEST, "ownerId is required").into_response(),
    };
    ws.on_upgrade(move |socket| handle_socket(socket, owner_id, state))
}

async fn handle_socket(socket: WebSocket, owner_id: OwnerId, state: AppState) {
    let (client_id, rx) = state.client_registry.register(owner_id.clone());
    tracing::info!(client_id = %client_id, owner_id = %owner_id, "WebSocket client connected");

    client::handle_ws_connection(
        socket,
        client_id.clone(),
        rx,
        Arc::clone(&state.client_registry),
        state.message_tx,
    )
    .await;

    state.client_registry.unregister(&client_id);
    let dropped = state.handler_state.bridge.detach_client(&client_id);
    tracing::info!(client_id = %client_id, subscriptions = dropped, "WebSocket client disconnected");
}

/// Health check HTTP endpoint.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    (StatusCode::OK, axum::Json(handlers::health_report(&state.handler_state)))
}

/// Route raw frames to handlers. Each request runs on its own task so a
/// slow pairing call does not stall other clients.
async fn process_rpc_messages(
    mut rx: mpsc::Receiver<(ClientId, String)>,
    state: Arc<HandlerState>,
    registry: Arc<ClientRegistry>,
    tracker: TaskTracker,
    cancel: CancellationToken,
) {
    loop {
        let (client_id, raw_message) = tokio::select! {
            _ = cancel.cancelled() => break,
            msg = rx.recv() => match msg {
                Some(msg) => msg,
                None => break,
            },
        };

        let Some(owner_id) = registry.owner_of(&client_id) else {
            continue;
        };
        let request: RpcRequest = match serde_json::from_str(&raw_message) {
            Ok(req) => req,
            Err(_) => {
                send_response(&registry, &client_id, &RpcResponse::parse_error());
                continue;
            }
        };

        let state = Arc::clone(&state);
        let registry = Arc::clone(&registry);
        tracker.spawn(async move {
            let caller = Caller {
                client_id,
                owner_id,
            };
            let params = request.params.unwrap_or(serde_json::json!({}));
            let response =
                handlers::dispatch(&state, &caller, &request.method, &params, request.id).await;
            send_response(&registry, &caller.client_id, &response);
        });
    }
}

fn send_response(registry: &ClientRegistry, client_id: &ClientId, response: &RpcResponse) {
    match serde_json::to_string(response) {
        Ok(json) => {
            registry.send_to(client_id, json);
        }
        Err(e) => tracing::error!(client_id = %client_id, error = %e, "failed to serialize response"),
    }
}
