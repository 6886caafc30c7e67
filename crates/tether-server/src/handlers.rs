//! RPC method handlers.
//!
//! Every request runs on behalf of the owner its WebSocket was opened for.
//! Sessions of other owners are reported as `NOT_FOUND`.

use std::sync::Arc;
use std::time::Instant;

use tether_core::ids::{OwnerId, SessionId, SubscriberId};
use tether_core::session::Session;
use tether_engine::orchestrator::MAX_EVENT_PAGE;
use tether_engine::{OrchestratorError, SessionOrchestrator};
use tether_telemetry::{LogQuery, SqliteLogSink};

use crate::client::ClientId;
use crate::event_bridge::EventBridge;
use crate::rpc::{self, RpcResponse};
use crate::wire;

const DEFAULT_EVENT_PAGE: u32 = 100;
const DEFAULT_LOG_PAGE: u32 = 100;
const MAX_LOG_PAGE: u32 = 500;

/// Shared state available to all RPC handlers.
pub struct HandlerState {
    pub orchestrator: Arc<dyn SessionOrchestrator>,
    pub bridge: Arc<EventBridge>,
    /// Persisted warn+ records; `None` when SQLite logging is off.
    pub logs: Option<Arc<SqliteLogSink>>,
    pub started_at: Instant,
}

impl HandlerState {
    pub fn new(orchestrator: Arc<dyn SessionOrchestrator>, bridge: Arc<EventBridge>) -> Self {
        Self {
            orchestrator,
            bridge,
            logs: None,
            started_at: Instant::now(),
        }
    }

    pub fn with_logs(mut self, logs: Option<Arc<SqliteLogSink>>) -> Self {
        self.logs = logs;
        self
    }
}

/// Who is calling.
#[derive(Clone, Debug)]
pub struct Caller {
    pub client_id: ClientId,
    pub owner_id: OwnerId,
}

type Id = Option<serde_json::Value>;

/// Dispatch an RPC method to the appropriate handler.
///
/// Normalizes camelCase params to snake_case before routing.
pub async fn dispatch(
    state: &Arc<HandlerState>,
    caller: &Caller,
    method: &str,
    params: &serde_json::Value,
    id: Id,
) -> RpcResponse {
    let params = wire::normalize_params(params);
    tracing::debug!(client_id = %caller.client_id, owner_id = %caller.owner_id, method, "rpc");

    match method {
        // Session
        "session.create" => session_create(state, caller, &params, id).await,
        "session.list" => session_list(state, caller, id),
        "session.status" | "session.get" => session_status(state, caller, &params, id),
        "session.pairingCode" => session_pairing_code(state, caller, &params, id).await,
        "session.currentCode" => session_current_code(state, caller, &params, id),
        "session.disconnect" => session_disconnect(state, caller, &params, id).await,
        "session.reconnect" => session_reconnect(state, caller, &params, id).await,
        "session.delete" => session_delete(state, caller, &params, id).await,

        // Events
        "events.list" => events_list(state, caller, &params, id),
        "events.subscribe" => events_subscribe(state, caller, &params, id),
        "events.unsubscribe" => events_unsubscribe(state, caller, &params, id),

        // Logs
        "logs.query" => logs_query(state, caller, &params, id),

        // System
        "system.ping" | "health" => health(state, id),

        _ => RpcResponse::method_not_found(id, method),
    }
}

/// Resolve the `session_id` param to a session the caller owns.
fn owned_session(
    state: &HandlerState,
    caller: &Caller,
    params: &serde_json::Value,
    id: &Id,
) -> Result<Session, RpcResponse> {
    let raw = rpc::require_str(params, "session_id")
        .map_err(|e| RpcResponse::invalid_params(id.clone(), e))?;
    let session_id = SessionId::from_raw(raw);
    let not_found = OrchestratorError::NotFound(session_id.clone());
    match state.orchestrator.get_status(&session_id) {
        Ok(session) if session.owner_id == caller.owner_id => Ok(session),
        Ok(_) => Err(RpcResponse::from_orchestrator(id.clone(), &not_found)),
        Err(e) => Err(RpcResponse::from_orchestrator(id.clone(), &e)),
    }
}

fn respond<T>(
    id: Id,
    result: Result<T, OrchestratorError>,
    to_wire: impl FnOnce(T) -> serde_json::Value,
) -> RpcResponse {
    match result {
        Ok(value) => RpcResponse::success(id, to_wire(value)),
        Err(e) => {
            tracing::debug!(error = %e, kind = e.error_kind(), "rpc call failed");
            RpcResponse::from_orchestrator(id, &e)
        }
    }
}

// ── Session ──

async fn session_create(
    state: &HandlerState,
    caller: &Caller,
    params: &serde_json::Value,
    id: Id,
) -> RpcResponse {
    let name = match rpc::require_str(params, "name") {
        Ok(n) => n,
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    let result = state
        .orchestrator
        .create_session(caller.owner_id.clone(), name)
        .await;
    respond(id, result, |s| wire::session_to_wire(&s))
}

fn session_list(state: &HandlerState, caller: &Caller, id: Id) -> RpcResponse {
    let result = state.orchestrator.list_sessions(&caller.owner_id);
    respond(id, result, |sessions| {
        let sessions: Vec<_> = sessions.iter().map(wire::session_to_wire).collect();
        serde_json::json!({ "sessions": sessions })
    })
}

fn session_status(
    state: &HandlerState,
    caller: &Caller,
    params: &serde_json::Value,
    id: Id,
) -> RpcResponse {
    match owned_session(state, caller, params, &id) {
        Ok(session) => RpcResponse::success(id, wire::session_to_wire(&session)),
        Err(resp) => resp,
    }
}

async fn session_pairing_code(
    state: &HandlerState,
    caller: &Caller,
    params: &serde_json::Value,
    id: Id,
) -> RpcResponse {
    let session = match owned_session(state, caller, params, &id) {
        Ok(s) => s,
        Err(resp) => return resp,
    };
    let result = state.orchestrator.get_pairing_code(&session.id).await;
    respond(id, result, |m| wire::pairing_to_wire(&m))
}

fn session_current_code(
    state: &HandlerState,
    caller: &Caller,
    params: &serde_json::Value,
    id: Id,
) -> RpcResponse {
    let session = match owned_session(state, caller, params, &id) {
        Ok(s) => s,
        Err(resp) => return resp,
    };
    let result = state.orchestrator.current_pairing_code(&session.id);
    respond(id, result, |m| wire::pairing_to_wire(&m))
}

async fn session_disconnect(
    state: &HandlerState,
    caller: &Caller,
    params: &serde_json::Value,
    id: Id,
) -> RpcResponse {
    let session = match owned_session(state, caller, params, &id) {
        Ok(s) => s,
        Err(resp) => return resp,
    };
    let result = state.orchestrator.disconnect(&session.id).await;
    respond(id, result, |s| wire::session_to_wire(&s))
}

async fn session_reconnect(
    state: &HandlerState,
    caller: &Caller,
    params: &serde_json::Value,
    id: Id,
) -> RpcResponse {
    let session = match owned_session(state, caller, params, &id) {
        Ok(s) => s,
        Err(resp) => return resp,
    };
    let result = state.orchestrator.reconnect(&session.id).await;
    respond(id, result, |s| wire::session_to_wire(&s))
}

async fn session_delete(
    state: &HandlerState,
    caller: &Caller,
    params: &serde_json::Value,
    id: Id,
) -> RpcResponse {
    let session = match owned_session(state, caller, params, &id) {
        Ok(s) => s,
        Err(resp) => return resp,
    };
    let result = state.orchestrator.delete_session(&session.id).await;
    respond(id, result, |()| {
        serde_json::json!({ "sessionId": session.id, "deleted": true })
    })
}

// ── Events ──

fn events_list(
    state: &HandlerState,
    caller: &Caller,
    params: &serde_json::Value,
    id: Id,
) -> RpcResponse {
    let session = match owned_session(state, caller, params, &id) {
        Ok(s) => s,
        Err(resp) => return resp,
    };
    let after = rpc::optional_i64(params, "after_sequence");
    let limit = rpc::optional_i64(params, "limit")
        .map(|l| l.clamp(1, i64::from(MAX_EVENT_PAGE)) as u32)
        .unwrap_or(DEFAULT_EVENT_PAGE);

    let result = state.orchestrator.list_events(&session.id, after, limit);
    respond(id, result, |events| {
        let has_more = events.len() as u32 == limit;
        let events: Vec<_> = events.iter().map(|e| e.to_envelope()).collect();
        serde_json::json!({ "events": events, "hasMore": has_more })
    })
}

fn events_subscribe(
    state: &HandlerState,
    caller: &Caller,
    params: &serde_json::Value,
    id: Id,
) -> RpcResponse {
    let filter = rpc::optional_str(params, "session_id").map(SessionId::from_raw);
    match state
        .orchestrator
        .subscribe(caller.owner_id.clone(), filter.clone())
    {
        Ok(subscription) => {
            let sub_id = state.bridge.attach(&caller.client_id, subscription);
            RpcResponse::success(
                id,
                serde_json::json!({ "subscriptionId": sub_id, "sessionId": filter }),
            )
        }
        Err(e) => RpcResponse::from_orchestrator(id, &e),
    }
}

fn events_unsubscribe(
    state: &HandlerState,
    caller: &Caller,
    params: &serde_json::Value,
    id: Id,
) -> RpcResponse {
    let raw = match rpc::require_str(params, "subscription_id") {
        Ok(r) => r,
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    let removed = state
        .bridge
        .detach(&caller.client_id, &SubscriberId::from_raw(raw));
    RpcResponse::success(id, serde_json::json!({ "removed": removed }))
}

// ── Logs ──

/// Persisted warn+ records tagged with the caller's owner id, newest first.
fn logs_query(
    state: &HandlerState,
    caller: &Caller,
    params: &serde_json::Value,
    id: Id,
) -> RpcResponse {
    let Some(sink) = &state.logs else {
        return RpcResponse::not_available(id, "log persistence is disabled");
    };
    let session_id = match rpc::optional_str(params, "session_id") {
        Some(_) => match owned_session(state, caller, params, &id) {
            Ok(session) => Some(session.id.to_string()),
            Err(resp) => return resp,
        },
        None => None,
    };
    let limit = rpc::optional_i64(params, "limit")
        .map(|l| l.clamp(1, i64::from(MAX_LOG_PAGE)) as u32)
        .unwrap_or(DEFAULT_LOG_PAGE);
    let query = LogQuery {
        level: rpc::optional_str(params, "level").map(str::to_uppercase),
        target: rpc::optional_str(params, "target").map(String::from),
        session_id,
        owner_id: Some(caller.owner_id.to_string()),
        since: rpc::optional_str(params, "since").map(String::from),
        limit: Some(limit),
    };

    match sink.query(&query) {
        Ok(records) => RpcResponse::success(id, serde_json::json!({ "logs": records })),
        Err(e) => RpcResponse::internal_error(id, format!("log query failed: {e}")),
    }
}

// ── System ──

fn health(state: &HandlerState, id: Id) -> RpcResponse {
    RpcResponse::success(id, health_report(state))
}

pub fn health_report(state: &HandlerState) -> serde_json::Value {
    let persisted_logs = state.logs.as_ref().and_then(|sink| sink.count().ok());
    serde_json::json!({
        "status": "healthy",
        "uptimeSecs": state.started_at.elapsed().as_secs(),
        "stats": state.orchestrator.stats(),
        "bridgedSubscriptions": state.bridge.active_count(),
        "persistedLogs": persisted_logs,
    })
}
