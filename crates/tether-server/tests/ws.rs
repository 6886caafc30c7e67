use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tether_core::ids::SessionId;
use tether_engine::{Orchestrator, OrchestratorConfig, QrSvgRenderer};
use tether_protocol::MockClientFactory;
use tether_server::{start, ServerConfig, ServerHandle};
use tether_store::SqliteGateway;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

struct TestServer {
    handle: ServerHandle,
    factory: Arc<MockClientFactory>,
    orch: Arc<Orchestrator>,
}

impl TestServer {
    async fn start(config: OrchestratorConfig) -> Self {
        let factory = Arc::new(MockClientFactory::new());
        let orch = Arc::new(
            Orchestrator::new(
                config,
                Arc::new(SqliteGateway::in_memory().unwrap()),
                factory.clone(),
                Arc::new(QrSvgRenderer::with_min_size(64)),
            )
            .unwrap(),
        );
        let handle = start(
            ServerConfig {
                port: 0,
                ..Default::default()
            },
            orch.clone(),
            None,
        )
        .await
        .unwrap();
        Self {
            handle,
            factory,
            orch,
        }
    }

    async fn connect(&self, owner: &str) -> Socket {
        let url = format!("ws://127.0.0.1:{}/ws?ownerId={owner}", self.handle.port);
        let (ws, _) = connect_async(url).await.unwrap();
        Socket {
            ws,
            next_id: 0,
            pushed: Vec::new(),
        }
    }
}

struct Socket {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    next_id: u64,
    pushed: Vec<Value>,
}

impl Socket {
    async fn next_frame(&mut self) -> Value {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(3), self.ws.next())
                .await
                .expect("timed out waiting for a frame")
                .expect("socket closed")
                .unwrap();
            if let Message::Text(text) = msg {
                return serde_json::from_str(text.as_str()).unwrap();
            }
        }
    }

    /// Send a request and wait for its response, keeping pushed events.
    async fn call(&mut self, method: &str, params: Value) -> Value {
        self.next_id += 1;
        let id = self.next_id;
        let frame = json!({ "method": method, "params": params, "id": id });
        self.ws
            .send(Message::Text(frame.to_string().into()))
            .await
            .unwrap();
        loop {
            let frame = self.next_frame().await;
            if frame.get("success").is_some() && frame["id"] == id {
                return frame;
            }
            self.pushed.push(frame);
        }
    }

    /// Wait for a pushed event of `event_type`.
    async fn pushed_event(&mut self, event_type: &str) -> Value {
        if let Some(pos) = self.pushed.iter().position(|e| e["type"] == event_type) {
            return self.pushed.remove(pos);
        }
        loop {
            let frame = self.next_frame().await;
            if frame["type"] == event_type {
                return frame;
            }
            self.pushed.push(frame);
        }
    }
}

#[tokio::test]
async fn create_pair_and_stream_events() {
    let server = TestServer::start(OrchestratorConfig::default()).await;
    let mut ws = server.connect("1").await;

    let resp = ws.call("events.subscribe", json!({})).await;
    assert_eq!(resp["success"], true);
    assert!(resp["result"]["subscriptionId"].is_string());

    let resp = ws.call("session.create", json!({ "name": "phone-A" })).await;
    assert_eq!(resp["success"], true);
    let sid = resp["result"]["sessionId"].as_str().unwrap().to_string();
    assert_eq!(resp["result"]["status"], "pending");

    let created = ws.pushed_event("session_created").await;
    assert_eq!(created["sessionId"], sid.as_str());
    assert_eq!(created["version"], 1);

    let resp = ws.call("session.pairingCode", json!({ "sessionId": sid })).await;
    let code = &resp["result"];
    assert!(code["image"].as_str().unwrap().starts_with("data:image/svg+xml;base64,"));
    let issued = ws.pushed_event("pairing_code_issued").await;
    assert_eq!(issued["data"]["code"], code["code"]);

    server
        .factory
        .client(&SessionId::from_raw(sid.clone()))
        .unwrap()
        .simulate_paired("15551234567@s.whatsapp.net", b"noise-keys")
        .await;

    let connected = ws.pushed_event("connected").await;
    assert_eq!(connected["status"], "connected");
    assert_eq!(connected["data"]["identity"], "15551234567@s.whatsapp.net");

    let resp = ws.call("session.status", json!({ "sessionId": sid })).await;
    assert_eq!(resp["result"]["status"], "connected");

    server.handle.shutdown().await;
    server.orch.shutdown().await;
}

#[tokio::test]
async fn owners_only_see_their_own_sessions() {
    let server = TestServer::start(OrchestratorConfig::default()).await;
    let mut alice = server.connect("alice").await;
    let mut bob = server.connect("bob").await;

    let resp = bob.call("events.subscribe", json!({})).await;
    assert_eq!(resp["success"], true);

    let resp = alice.call("session.create", json!({ "name": "phone-A" })).await;
    let sid = resp["result"]["sessionId"].as_str().unwrap().to_string();

    let resp = bob.call("session.status", json!({ "sessionId": sid })).await;
    assert_eq!(resp["success"], false);
    assert_eq!(resp["error"]["code"], "NOT_FOUND");

    let resp = bob.call("session.delete", json!({ "sessionId": sid })).await;
    assert_eq!(resp["error"]["code"], "NOT_FOUND");

    let resp = bob.call("session.list", json!({})).await;
    assert!(resp["result"]["sessions"].as_array().unwrap().is_empty());
    assert!(bob.pushed.is_empty(), "bob saw alice's events: {:?}", bob.pushed);

    let resp = alice.call("session.list", json!({})).await;
    assert_eq!(resp["result"]["sessions"].as_array().unwrap().len(), 1);

    server.handle.shutdown().await;
}

#[tokio::test]
async fn limit_exceeded_is_reported() {
    let config = OrchestratorConfig {
        max_sessions_per_owner: 1,
        ..Default::default()
    };
    let server = TestServer::start(config).await;
    let mut ws = server.connect("1").await;

    let resp = ws.call("session.create", json!({ "name": "phone-A" })).await;
    assert_eq!(resp["success"], true);
    let resp = ws.call("session.create", json!({ "name": "phone-B" })).await;
    assert_eq!(resp["error"]["code"], "LIMIT_EXCEEDED");
    assert_eq!(resp["error"]["data"]["limit"], 1);

    server.handle.shutdown().await;
}

#[tokio::test]
async fn malformed_frames_get_parse_errors() {
    let server = TestServer::start(OrchestratorConfig::default()).await;
    let mut ws = server.connect("1").await;

    ws.ws
        .send(Message::Text("not json".to_string().into()))
        .await
        .unwrap();
    let frame = ws.next_frame().await;
    assert_eq!(frame["success"], false);
    assert_eq!(frame["error"]["code"], "PARSE_ERROR");

    let resp = ws.call("nope.nothing", json!({})).await;
    assert_eq!(resp["error"]["code"], "METHOD_NOT_FOUND");

    server.handle.shutdown().await;
}

#[tokio::test]
async fn closing_the_socket_drops_its_subscriptions() {
    let server = TestServer::start(OrchestratorConfig::default()).await;
    let mut ws = server.connect("1").await;
    ws.call("events.subscribe", json!({})).await;
    assert_eq!(server.orch.broadcaster().subscriber_count(), 1);

    ws.ws.close(None).await.unwrap();
    drop(ws);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while server.orch.broadcaster().subscriber_count() != 0 {
        assert!(
            tokio::time::Instant::now() < deadline,
            "subscription outlived its socket"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    server.handle.shutdown().await;
}
