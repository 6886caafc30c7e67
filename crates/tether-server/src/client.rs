use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use tether_core::ids::OwnerId;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(90);

/// Unique client identifier.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ClientId(pub String);

impl Default for ClientId {
    fn default() -> Self {
        Self(format!("client_{}", Uuid::now_v7()))
    }
}

impl ClientId {
    pub fn new() -> Self {
        Self::default()
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A connected WebSocket client, bound to one owner for its whole life.
pub struct Client {
    pub id: ClientId,
    pub owner_id: OwnerId,
    tx: mpsc::Sender<String>,
    connected: AtomicBool,
    last_pong: AtomicU64,
}

impl Client {
    fn new(id: ClientId, owner_id: OwnerId, tx: mpsc::Sender<String>) -> Self {
        Self {
            id,
            owner_id,
            tx,
            connected: AtomicBool::new(true),
            last_pong: AtomicU64::new(now_secs()),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub fn record_pong(&self) {
        self.last_pong.store(now_secs(), Ordering::Relaxed);
    }

    pub fn is_alive(&self) -> bool {
        let last = self.last_pong.load(Ordering::Relaxed);
        now_secs().saturating_sub(last) < CLIENT_TIMEOUT.as_secs()
    }
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Registry of all connected WebSocket clients.
pub struct ClientRegistry {
    clients: DashMap<ClientId, Arc<Client>>,
    max_send_queue: usize,
}

impl ClientRegistry {
    pub fn new(max_send_queue: usize) -> Self {
        Self {
            clients: DashMap::new(),
            max_send_queue,
        }
    }

    /// Register a new client for `owner_id` and return its ID + outbound queue.
    pub fn register(&self, owner_id: OwnerId) -> (ClientId, mpsc::Receiver<String>) {
        let id = ClientId::new();
        let (tx, rx) = mpsc::channel(self.max_send_queue);
        self.clients
            .insert(id.clone(), Arc::new(Client::new(id.clone(), owner_id, tx)));
        (id, rx)
    }

    /// Remove a client. Returns it if it was still registered.
    pub fn unregister(&self, id: &ClientId) -> Option<Arc<Client>> {
        let (_, client) = self.clients.remove(id)?;
        client.connected.store(false, Ordering::Relaxed);
        Some(client)
    }

    pub fn get(&self, id: &ClientId) -> Option<Arc<Client>> {
        self.clients.get(id).map(|c| Arc::clone(c.value()))
    }

    pub fn owner_of(&self, id: &ClientId) -> Option<OwnerId> {
        self.clients.get(id).map(|c| c.owner_id.clone())
    }

    /// Queue a message for one client. A full queue drops the message.
    pub fn send_to(&self, client_id: &ClientId, message: String) -> bool {
        let Some(tx) = self.clients.get(client_id).map(|c| c.tx.clone()) else {
            return false;
        };
        match tx.try_send(message) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(msg)) => {
                tracing::warn!(
                    client_id = %client_id,
                    msg_len = msg.len(),
                    "Send queue full, dropping message"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    pub fn count(&self) -> usize {
        self.clients.len()
    }

    pub fn clients_for_owner(&self, owner_id: &OwnerId) -> Vec<ClientId> {
        self.clients
            .iter()
            .filter(|entry| &entry.owner_id == owner_id && entry.is_connected())
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Remove clients that haven't answered pings within the timeout.
    pub fn cleanup_dead_clients(&self) -> Vec<ClientId> {
        let dead: Vec<ClientId> = self
            .clients
            .iter()
            .filter(|entry| !entry.is_alive())
            .map(|entry| entry.key().clone())
            .collect();

        for id in &dead {
            self.unregister(id);
            tracing::info!(client_id = %id, "Cleaned up dead client");
        }
        dead
    }
}

/// Drive one WebSocket: a writer draining the client's queue with periodic
/// pings, and a reader forwarding text frames to `on_message`.
pub async fn handle_ws_connection(
    socket: WebSocket,
    client_id: ClientId,
    mut rx: mpsc::Receiver<String>,
    registry: Arc<ClientRegistry>,
    on_message: mpsc::Sender<(ClientId, String)>,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let writer_cid = client_id.clone();
    let writer = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(HEARTBEAT_INTERVAL);
        ping_interval.tick().await;

        loop {
            tokio::select! {
                msg = rx.recv() => {
                    let Some(text) = msg else { break };
                    if ws_tx.send(WsMessage::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                _ = ping_interval.tick() => {
                    if ws_tx.send(WsMessage::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                    tracing::trace!(client_id = %writer_cid, "Sent ping");
                }
            }
        }
        let _ = ws_tx.close().await;
    });

    let reader_cid = client_id.clone();
    let reader_registry = Arc::clone(&registry);
    let reader = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_rx.next().await {
            match msg {
                WsMessage::Text(text) => {
                    if on_message
                        .send((reader_cid.clone(), text.to_string()))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                WsMessage::Pong(_) => {
                    if let Some(client) = reader_registry.get(&reader_cid) {
                        client.record_pong();
                    }
                }
                WsMessage::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = writer => {},
        _ = reader => {},
    }
}

/// Periodically evict clients that stopped answering pings, handing each
/// evicted id to `on_removed`.
pub fn start_cleanup_task<F>(
    registry: Arc<ClientRegistry>,
    interval: Duration,
    cancel: CancellationToken,
    on_removed: F,
) -> tokio::task::JoinHandle<()>
where
    F: Fn(&ClientId) + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let removed = registry.cleanup_dead_clients();
                    for id in &removed {
                        on_removed(id);
                    }
                    if !removed.is_empty() {
                        tracing::info!(removed = removed.len(), "Dead client cleanup");
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owner(n: u32) -> OwnerId {
        OwnerId::from_raw(n.to_string())
    }

    #[test]
    fn client_id_unique() {
        let a = ClientId::new();
        let b = ClientId::new();
        assert_ne!(a, b);
        assert!(a.0.starts_with("client_"));
    }

    #[test]
    fn register_and_unregister() {
        let registry = ClientRegistry::new(32);
        let (id1, _rx1) = registry.register(owner(1));
        let (id2, _rx2) = registry.register(owner(2));
        assert_eq!(registry.count(), 2);
        assert_eq!(registry.owner_of(&id2), Some(owner(2)));

        let removed = registry.unregister(&id1).unwrap();
        assert!(!removed.is_connected());
        assert!(registry.unregister(&id1).is_none());
        assert_eq!(registry.count(), 1);
        assert!(registry.owner_of(&id1).is_none());
    }

    #[test]
    fn clients_grouped_by_owner() {
        let registry = ClientRegistry::new(32);
        let (a, _ra) = registry.register(owner(1));
        let (b, _rb) = registry.register(owner(1));
        let (_c, _rc) = registry.register(owner(2));

        let mut mine = registry.clients_for_owner(&owner(1));
        mine.sort_by(|x, y| x.0.cmp(&y.0));
        let mut expected = vec![a, b];
        expected.sort_by(|x, y| x.0.cmp(&y.0));
        assert_eq!(mine, expected);
        assert!(registry.clients_for_owner(&owner(3)).is_empty());
    }

    #[tokio::test]
    async fn send_to_specific_client() {
        let registry = ClientRegistry::new(32);
        let (id, mut rx) = registry.register(owner(1));
        assert!(registry.send_to(&id, "test message".into()));
        assert_eq!(rx.recv().await.unwrap(), "test message");
        assert!(!registry.send_to(&ClientId::new(), "nobody".into()));
    }

    #[test]
    fn send_to_full_queue_drops() {
        let registry = ClientRegistry::new(2);
        let (id, _rx) = registry.register(owner(1));
        assert!(registry.send_to(&id, "msg1".into()));
        assert!(registry.send_to(&id, "msg2".into()));
        assert!(!registry.send_to(&id, "msg3".into()));
    }

    #[test]
    fn send_to_closed_queue_fails() {
        let registry = ClientRegistry::new(2);
        let (id, rx) = registry.register(owner(1));
        drop(rx);
        assert!(!registry.send_to(&id, "late".into()));
    }

    #[test]
    fn cleanup_dead_clients_removes_expired() {
        let registry = ClientRegistry::new(32);
        let (id, _rx) = registry.register(owner(1));
        let (_live, _rx2) = registry.register(owner(1));
        registry.get(&id).unwrap().last_pong.store(0, Ordering::Relaxed);

        let removed = registry.cleanup_dead_clients();
        assert_eq!(removed, vec![id]);
        assert_eq!(registry.count(), 1);
    }

    #[tokio::test]
    async fn cleanup_task_stops_on_cancel() {
        let registry = Arc::new(ClientRegistry::new(4));
        let cancel = CancellationToken::new();
        let task = start_cleanup_task(
            registry,
            Duration::from_millis(10),
            cancel.clone(),
            |_| {},
        );
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }
}
