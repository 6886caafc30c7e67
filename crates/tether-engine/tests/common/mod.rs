#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use tether_core::ids::{OwnerId, SessionId};
use tether_core::persistence::PersistenceGateway;
use tether_core::session::{Session, SessionStatus};
use tether_engine::{Orchestrator, OrchestratorConfig, QrSvgRenderer, SessionOrchestrator};
use tether_protocol::{Backoff, MockClientFactory, MockProtocolClient};
use tether_store::SqliteGateway;

pub struct Harness {
    pub orch: Arc<Orchestrator>,
    pub store: Arc<SqliteGateway>,
    pub factory: Arc<MockClientFactory>,
}

impl Harness {
    pub fn new(config: OrchestratorConfig) -> Self {
        let store = Arc::new(SqliteGateway::in_memory().unwrap());
        let factory = Arc::new(MockClientFactory::new());
        Self::over(config, store, factory)
    }

    /// A second orchestrator over existing state, as after a restart.
    pub fn over(
        config: OrchestratorConfig,
        store: Arc<SqliteGateway>,
        factory: Arc<MockClientFactory>,
    ) -> Self {
        let orch = Orchestrator::new(
            config,
            store.clone(),
            factory.clone(),
            Arc::new(QrSvgRenderer::with_min_size(64)),
        )
        .unwrap();
        Self {
            orch: Arc::new(orch),
            store,
            factory,
        }
    }

    pub fn client(&self, id: &SessionId) -> Arc<MockProtocolClient> {
        self.factory.client(id).expect("no mock client for session")
    }

    pub fn status(&self, id: &SessionId) -> SessionStatus {
        self.orch.get_status(id).unwrap().status
    }

    pub fn session(&self, id: &SessionId) -> Session {
        self.orch.get_status(id).unwrap()
    }

    pub fn event_types(&self, id: &SessionId) -> Vec<String> {
        self.orch
            .list_events(id, None, 1000)
            .unwrap()
            .iter()
            .map(|e| e.event_type().to_string())
            .collect()
    }

    /// Move the persisted pairing code's expiry into the past.
    pub fn expire_code(&self, id: &SessionId) {
        let mut session = self.store.load_session(id).unwrap().unwrap();
        let material = session.pairing.as_mut().expect("session has no pairing code");
        material.expires_at = chrono::Utc::now() - chrono::Duration::seconds(1);
        self.store.save_session(&session).unwrap();
    }

    /// Create a session and walk it to Connected.
    pub async fn paired_session(&self, owner: &OwnerId, name: &str) -> Session {
        let session = self.orch.create_session(owner.clone(), name).await.unwrap();
        self.orch.get_pairing_code(&session.id).await.unwrap();
        let identity = format!("{}@s.whatsapp.net", name);
        self.client(&session.id)
            .simulate_paired(&identity, b"noise-keys")
            .await;
        let id = session.id.clone();
        eventually("session connected", || self.status(&id) == SessionStatus::Connected).await;
        self.session(&session.id)
    }
}

pub fn owner(n: u32) -> OwnerId {
    OwnerId::from_raw(n.to_string())
}

/// Config with short timeouts and a fast, jitter-free reconnect policy.
pub fn fast_config() -> OrchestratorConfig {
    OrchestratorConfig {
        challenge_timeout: Duration::from_secs(2),
        connect_timeout: Duration::from_secs(1),
        reconnect: Backoff {
            max_attempts: 3,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
            jitter_factor: 0.0,
        },
        ..OrchestratorConfig::default()
    }
}

/// Poll `check` until it holds, panicking after two seconds.
pub async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !check() {
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for: {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
