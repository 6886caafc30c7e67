//! Scriptable in-process protocol client.
//!
//! Used by the engine tests and by the binary's `simulated` backend. Every
//! client created by a [`MockClientFactory`] shares one [`MockScript`], so a
//! test can make connects fail or pairing challenges hang for all sessions,
//! then drive individual sessions through [`MockProtocolClient`]'s
//! `simulate_*` helpers.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use rand::RngCore;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use tether_core::errors::ProtocolError;
use tether_core::ids::{ProtocolIdentity, SessionId};
use tether_core::protocol::{
    ClientFactory, ClientParts, ConnectionMetadata, IdentityMaterial, InboundMessage,
    PairingChallenge, ProtocolClient, ProtocolEvent,
};
use tether_core::session::Session;

use crate::adapter::{translate, ExternalEvent};

const DEFAULT_EVENT_BUFFER: usize = 64;

/// Shared, mutable behaviour of every mock client.
#[derive(Debug)]
pub struct MockScript {
    connect_failures: AtomicU32,
    connects_blocked: AtomicBool,
    challenges_hang: AtomicBool,
    challenge_delay: Mutex<Duration>,
    challenge_timeout: Mutex<Duration>,
    auto_pair_after: Mutex<Option<Duration>>,
    create_delay: Mutex<Duration>,
}

impl Default for MockScript {
    fn default() -> Self {
        Self {
            connect_failures: AtomicU32::new(0),
            connects_blocked: AtomicBool::new(false),
            challenges_hang: AtomicBool::new(false),
            challenge_delay: Mutex::new(Duration::ZERO),
            challenge_timeout: Mutex::new(Duration::from_secs(60)),
            auto_pair_after: Mutex::new(None),
            create_delay: Mutex::new(Duration::ZERO),
        }
    }
}

impl MockScript {
    /// Fail the next `n` connect calls across all clients.
    pub fn fail_next_connects(&self, n: u32) {
        self.connect_failures.store(n, Ordering::SeqCst);
    }

    /// Make every connect fail until unblocked.
    pub fn block_connects(&self, blocked: bool) {
        self.connects_blocked.store(blocked, Ordering::SeqCst);
    }

    /// Make pairing challenges wait until cancelled.
    pub fn hang_challenges(&self, hang: bool) {
        self.challenges_hang.store(hang, Ordering::SeqCst);
    }

    pub fn set_challenge_delay(&self, delay: Duration) {
        *self.challenge_delay.lock() = delay;
    }

    /// Validity the library reports for each challenge.
    pub fn set_challenge_timeout(&self, timeout: Duration) {
        *self.challenge_timeout.lock() = timeout;
    }

    /// Complete pairing on its own this long after a challenge is issued.
    pub fn auto_pair_after(&self, delay: Option<Duration>) {
        *self.auto_pair_after.lock() = delay;
    }

    /// Slow down client construction (widens restore races in tests).
    pub fn set_create_delay(&self, delay: Duration) {
        *self.create_delay.lock() = delay;
    }

    fn take_connect_failure(&self) -> bool {
        if self.connects_blocked.load(Ordering::SeqCst) {
            return true;
        }
        self.connect_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

/// One simulated connection.
pub struct MockProtocolClient {
    session_id: SessionId,
    identity: Mutex<Option<ProtocolIdentity>>,
    connected: Arc<AtomicBool>,
    connect_calls: AtomicU32,
    disconnect_calls: AtomicU32,
    challenges: AtomicU32,
    events: mpsc::Sender<ProtocolEvent>,
    script: Arc<MockScript>,
    cancel: CancellationToken,
}

impl MockProtocolClient {
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn connect_calls(&self) -> u32 {
        self.connect_calls.load(Ordering::SeqCst)
    }

    pub fn disconnect_calls(&self) -> u32 {
        self.disconnect_calls.load(Ordering::SeqCst)
    }

    pub fn challenges_issued(&self) -> u32 {
        self.challenges.load(Ordering::SeqCst)
    }

    /// Deliver an internal event as if the library had produced it.
    pub async fn emit(&self, event: ProtocolEvent) {
        if self.events.send(event).await.is_err() {
            debug!(session_id = %self.session_id, "mock event dropped, receiver gone");
        }
    }

    /// Deliver a raw library event through the adapter.
    pub async fn emit_external(&self, event: ExternalEvent) {
        let name = event.name();
        match translate(event) {
            Some(event) => self.emit(event).await,
            None => debug!(session_id = %self.session_id, event = name, "ignored external event"),
        }
    }

    pub async fn simulate_scan(&self) {
        self.emit_external(ExternalEvent::QrScanned).await;
    }

    /// Finish pairing: the link is up and `material` is the new credential set.
    pub async fn simulate_paired(&self, identity: &str, material: &[u8]) {
        *self.identity.lock() = Some(ProtocolIdentity::new(identity));
        self.connected.store(true, Ordering::SeqCst);
        self.emit(ProtocolEvent::PairingSucceeded {
            identity: ProtocolIdentity::new(identity),
            material: IdentityMaterial::new(material.to_vec()),
        })
        .await;
    }

    pub async fn simulate_pairing_failed(&self, reason: &str) {
        self.emit_external(ExternalEvent::PairError {
            jid: None,
            error: reason.to_string(),
        })
        .await;
    }

    /// The transport drops and the library notices.
    pub async fn simulate_link_drop(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.emit_external(ExternalEvent::Disconnected).await;
    }

    /// The transport drops without any event (only a health check finds it).
    pub fn drop_silently(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    pub async fn simulate_logout(&self, reason: &str) {
        self.connected.store(false, Ordering::SeqCst);
        self.emit_external(ExternalEvent::LoggedOut {
            on_connect: false,
            reason: reason.to_string(),
        })
        .await;
    }

    pub async fn simulate_message(&self, id: &str, from: &str) {
        self.emit(ProtocolEvent::MessageReceived {
            message: InboundMessage {
                id: id.to_string(),
                from: from.to_string(),
                timestamp: Utc::now(),
            },
        })
        .await;
    }

    fn spawn_auto_pair(&self, delay: Duration) {
        let events = self.events.clone();
        let connected = self.connected.clone();
        let cancel = self.cancel.clone();
        let session_id = self.session_id.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            let mut credentials = vec![0u8; 32];
            rand::thread_rng().fill_bytes(&mut credentials);
            let jid = format!("sim-{}@s.whatsapp.net", uuid::Uuid::now_v7().simple());
            debug!(session_id = %session_id, jid = %jid, "simulated pairing completed");

            connected.store(true, Ordering::SeqCst);
            let _ = events.send(ProtocolEvent::PairingScanned).await;
            let _ = events
                .send(ProtocolEvent::PairingSucceeded {
                    identity: ProtocolIdentity::new(jid),
                    material: IdentityMaterial::new(credentials),
                })
                .await;
        });
    }
}

#[async_trait]
impl ProtocolClient for MockProtocolClient {
    async fn connect(&self) -> Result<(), ProtocolError> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        if self.script.take_connect_failure() {
            return Err(ProtocolError::ConnectionFailed("scripted failure".into()));
        }
        self.connected.store(true, Ordering::SeqCst);

        let identity = self.identity.lock().clone();
        if let Some(identity) = identity {
            // Non-blocking: connect must not wait on the event consumer.
            let _ = self.events.try_send(ProtocolEvent::Connected {
                identity,
                metadata: ConnectionMetadata::default(),
            });
        }
        Ok(())
    }

    async fn disconnect(&self) {
        self.disconnect_calls.fetch_add(1, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        self.cancel.cancel();
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn request_pairing_challenge(
        &self,
        cancel: &CancellationToken,
    ) -> Result<PairingChallenge, ProtocolError> {
        if self.script.challenges_hang.load(Ordering::SeqCst) {
            cancel.cancelled().await;
            return Err(ProtocolError::Cancelled);
        }

        let delay = *self.script.challenge_delay.lock();
        if !delay.is_zero() {
            tokio::select! {
                _ = cancel.cancelled() => return Err(ProtocolError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }

        let n = self.challenges.fetch_add(1, Ordering::SeqCst) + 1;
        let challenge = PairingChallenge {
            code: format!("2@{}#{n},{}", self.session_id, uuid::Uuid::now_v7().simple()),
            timeout: *self.script.challenge_timeout.lock(),
        };

        let auto_pair = *self.script.auto_pair_after.lock();
        if let Some(delay) = auto_pair {
            self.spawn_auto_pair(delay);
        }
        Ok(challenge)
    }
}

/// Factory handing out [`MockProtocolClient`]s and remembering the latest
/// one per session.
pub struct MockClientFactory {
    script: Arc<MockScript>,
    clients: DashMap<SessionId, Arc<MockProtocolClient>>,
    created: AtomicUsize,
    event_buffer: usize,
}

impl Default for MockClientFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl MockClientFactory {
    pub fn new() -> Self {
        Self {
            script: Arc::new(MockScript::default()),
            clients: DashMap::new(),
            created: AtomicUsize::new(0),
            event_buffer: DEFAULT_EVENT_BUFFER,
        }
    }

    pub fn with_event_buffer(mut self, size: usize) -> Self {
        self.event_buffer = size.max(1);
        self
    }

    pub fn script(&self) -> &MockScript {
        &self.script
    }

    /// Most recently created client for a session.
    pub fn client(&self, session_id: &SessionId) -> Option<Arc<MockProtocolClient>> {
        self.clients.get(session_id).map(|c| c.value().clone())
    }

    /// Total clients created across all sessions.
    pub fn created_count(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ClientFactory for MockClientFactory {
    async fn create(
        &self,
        session: &Session,
        material: Option<IdentityMaterial>,
    ) -> Result<ClientParts, ProtocolError> {
        if session.protocol_identity.is_some() && material.is_none() {
            return Err(ProtocolError::InvalidIdentity(format!(
                "session {} is paired but no credentials were supplied",
                session.id
            )));
        }

        let delay = *self.script.create_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let (tx, rx) = mpsc::channel(self.event_buffer);
        let client = Arc::new(MockProtocolClient {
            session_id: session.id.clone(),
            identity: Mutex::new(session.protocol_identity.clone()),
            connected: Arc::new(AtomicBool::new(false)),
            connect_calls: AtomicU32::new(0),
            disconnect_calls: AtomicU32::new(0),
            challenges: AtomicU32::new(0),
            events: tx,
            script: self.script.clone(),
            cancel: CancellationToken::new(),
        });

        self.clients.insert(session.id.clone(), client.clone());
        self.created.fetch_add(1, Ordering::SeqCst);
        debug!(session_id = %session.id, paired = material.is_some(), "mock client created");

        Ok(ClientParts {
            client,
            events: rx,
        })
    }
}
