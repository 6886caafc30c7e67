//! Session orchestrator: the public API of the engine.
//!
//! `SessionOrchestrator` is the interface the server talks to;
//! `Orchestrator` is the production implementation over a
//! [`PersistenceGateway`] and a [`ClientFactory`].

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};

use tether_core::errors::PersistenceError;
use tether_core::events::{Event, EventPayload};
use tether_core::ids::{OwnerId, SessionId, SubscriberId};
use tether_core::persistence::PersistenceGateway;
use tether_core::protocol::ClientFactory;
use tether_core::session::{PairingMaterial, Session, SessionStatus};
use tether_core::state::{self, DisconnectReason, InvalidTransition, Transition};

use crate::broadcast::{EventBroadcaster, Subscription};
use crate::config::OrchestratorConfig;
use crate::context::EngineContext;
use crate::error::OrchestratorError;
use crate::health::{HealthMonitor, SweepReport};
use crate::pairing::PairingCoordinator;
use crate::quota::{LimitExceeded, QuotaGuard};
use crate::registry::SessionRegistry;
use crate::render::PairingRenderer;

pub const MAX_NAME_LEN: usize = 64;
pub const MAX_EVENT_PAGE: u32 = 1000;

#[async_trait]
pub trait SessionOrchestrator: Send + Sync {
    /// Create a Pending session for `owner`, counted against its quota.
    async fn create_session(&self, owner: OwnerId, name: &str) -> Result<Session, OrchestratorError>;

    /// The session's valid pairing code, issuing one if needed.
    async fn get_pairing_code(&self, id: &SessionId) -> Result<PairingMaterial, OrchestratorError>;

    /// The code on display right now; never issues.
    fn current_pairing_code(&self, id: &SessionId) -> Result<PairingMaterial, OrchestratorError>;

    fn get_status(&self, id: &SessionId) -> Result<Session, OrchestratorError>;

    fn list_sessions(&self, owner: &OwnerId) -> Result<Vec<Session>, OrchestratorError>;

    /// Drop the live link. A Connected session becomes Disconnected.
    async fn disconnect(&self, id: &SessionId) -> Result<Session, OrchestratorError>;

    /// Bring a Disconnected session back, or re-attach a Connected one that
    /// has no live handle.
    async fn reconnect(&self, id: &SessionId) -> Result<Session, OrchestratorError>;

    async fn delete_session(&self, id: &SessionId) -> Result<(), OrchestratorError>;

    fn subscribe(
        &self,
        owner: OwnerId,
        session: Option<SessionId>,
    ) -> Result<Subscription, OrchestratorError>;

    fn unsubscribe(&self, id: &SubscriberId) -> bool;

    fn list_events(
        &self,
        id: &SessionId,
        after_sequence: Option<i64>,
        limit: u32,
    ) -> Result<Vec<Event>, OrchestratorError>;

    /// Stop every live handle and subscription of `owner` without changing
    /// any persisted status. Returns the number of handles stopped.
    async fn detach_owner(&self, owner: &OwnerId) -> usize;

    fn stats(&self) -> EngineStats;
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStats {
    pub live_sessions: usize,
    pub subscribers: usize,
    pub events_published: u64,
    pub events_dropped: u64,
}

pub struct Orchestrator {
    ctx: Arc<EngineContext>,
    pairing: PairingCoordinator,
    health: Arc<HealthMonitor>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl Orchestrator {
    /// Build the orchestrator and seed the quota from persisted sessions.
    /// Fails if the store is unreachable.
    pub fn new(
        config: OrchestratorConfig,
        store: Arc<dyn PersistenceGateway>,
        factory: Arc<dyn ClientFactory>,
        renderer: Arc<dyn PairingRenderer>,
    ) -> Result<Self, OrchestratorError> {
        store.ping()?;
        let ctx = Arc::new(EngineContext::new(config, store, factory, renderer));

        let mut hydrated = 0;
        for status in SessionStatus::ALL.into_iter().filter(SessionStatus::holds_slot) {
            for session in ctx.store.list_sessions_by_status(status)? {
                if session.holds_slot() {
                    ctx.quota.hydrate(&session.owner_id, &session.id);
                    hydrated += 1;
                }
            }
        }
        info!(hydrated, limit = ctx.quota.limit(), "orchestrator ready");

        Ok(Self {
            pairing: PairingCoordinator::new(ctx.clone()),
            health: Arc::new(HealthMonitor::new(ctx.clone())),
            monitor: Mutex::new(None),
            ctx,
        })
    }

    /// Start the periodic health sweep. Calling it again is a no-op.
    pub fn start_health_monitor(&self) {
        let mut monitor = self.monitor.lock();
        if monitor.is_none() {
            *monitor = Some(self.health.clone().spawn());
            info!(interval = ?self.ctx.config.health_interval, "health monitor started");
        }
    }

    /// Run one health sweep now.
    pub async fn run_health_sweep(&self) -> SweepReport {
        self.health.sweep().await
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.ctx.config
    }

    pub fn quota(&self) -> &QuotaGuard {
        &self.ctx.quota
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.ctx.registry
    }

    pub fn broadcaster(&self) -> &EventBroadcaster {
        &self.ctx.broadcaster
    }

    pub fn is_shutting_down(&self) -> bool {
        self.ctx.is_shutting_down()
    }

    /// Stop the health monitor, every live handle and every subscription.
    pub async fn shutdown(&self) {
        if self.ctx.is_shutting_down() {
            return;
        }
        self.ctx.shutdown.cancel();

        // Cancel first: a sweep may be queued behind a pairing wait.
        for handle in self.ctx.registry.handles() {
            handle.cancel();
        }
        let monitor = self.monitor.lock().take();
        if let Some(task) = monitor {
            let _ = task.await;
        }

        let handles = self.ctx.registry.handles();
        join_all(handles.iter().map(|h| self.ctx.retire(h.session_id()))).await;
        self.ctx.broadcaster.close_all();
        info!(handles = handles.len(), "orchestrator stopped");
    }

    async fn persist_deletion(&self, id: &SessionId) -> Result<Session, OrchestratorError> {
        let mut session = self.ctx.load_visible(id)?;
        state::mark_deleted(&mut session, Utc::now())?;
        self.ctx.save(&session).await?;
        Ok(session)
    }

    fn ensure_running(&self) -> Result<(), OrchestratorError> {
        if self.ctx.is_shutting_down() {
            Err(OrchestratorError::ShuttingDown)
        } else {
            Ok(())
        }
    }
}

/// Only a live link (or a dropped one still being retried) can be
/// disconnected.
fn ensure_disconnectable(session: &Session) -> Result<(), InvalidTransition> {
    match session.status {
        SessionStatus::Connected | SessionStatus::Disconnected if session.is_active => Ok(()),
        from => Err(InvalidTransition {
            from,
            transition: Transition::LinkLost {
                reason: DisconnectReason::Requested,
            }
            .name(),
            reason: "session is not connected",
        }),
    }
}

fn validate_name(name: &str) -> Result<&str, OrchestratorError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(OrchestratorError::InvalidName("name is empty".into()));
    }
    if name.chars().count() > MAX_NAME_LEN {
        return Err(OrchestratorError::InvalidName(format!(
            "name is longer than {MAX_NAME_LEN} characters"
        )));
    }
    if name.chars().any(char::is_control) {
        return Err(OrchestratorError::InvalidName("name contains control characters".into()));
    }
    Ok(name)
}

#[async_trait]
impl SessionOrchestrator for Orchestrator {
    #[instrument(skip_all, fields(owner_id = %owner))]
    async fn create_session(&self, owner: OwnerId, name: &str) -> Result<Session, OrchestratorError> {
        self.ensure_running()?;
        let name = validate_name(name)?;
        let reservation = self.ctx.quota.reserve(&owner)?;

        let session = Session::new(owner.clone(), name, Utc::now());
        match self.ctx.store.insert_session(&session) {
            Ok(()) => {}
            Err(PersistenceError::Conflict(_)) => {
                return Err(OrchestratorError::DuplicateName {
                    owner_id: owner,
                    name: name.to_string(),
                })
            }
            Err(e) => return Err(e.into()),
        }
        reservation.commit(&session.id);
        info!(session_id = %session.id, name, "session created");

        self.ctx.record(
            &session,
            EventPayload::SessionCreated {
                name: session.name.clone(),
            },
        );
        if let Err(e) = self.ctx.get_or_restore(&session.id).await {
            warn!(session_id = %session.id, error = %e, "client not started, will retry on first use");
        }
        Ok(session)
    }

    async fn get_pairing_code(&self, id: &SessionId) -> Result<PairingMaterial, OrchestratorError> {
        self.ensure_running()?;
        self.pairing.issue(id).await
    }

    fn current_pairing_code(&self, id: &SessionId) -> Result<PairingMaterial, OrchestratorError> {
        self.pairing.current(id)
    }

    fn get_status(&self, id: &SessionId) -> Result<Session, OrchestratorError> {
        self.ctx.load_visible(id)
    }

    fn list_sessions(&self, owner: &OwnerId) -> Result<Vec<Session>, OrchestratorError> {
        Ok(self.ctx.store.list_sessions(owner)?)
    }

    #[instrument(skip_all, fields(session_id = %id))]
    async fn disconnect(&self, id: &SessionId) -> Result<Session, OrchestratorError> {
        // Reject early so a pairing wait holding the lock cannot stall us.
        ensure_disconnectable(&self.ctx.load_visible(id)?)?;
        let _guard = self.ctx.locks.lock(id).await;
        let mut session = self.ctx.load_visible(id)?;
        ensure_disconnectable(&session)?;
        self.ctx.retire(id).await;

        if session.status == SessionStatus::Connected {
            self.ctx
                .commit(
                    &mut session,
                    Transition::LinkLost {
                        reason: DisconnectReason::Requested,
                    },
                )
                .await?;
        }
        Ok(session)
    }

    #[instrument(skip_all, fields(session_id = %id))]
    async fn reconnect(&self, id: &SessionId) -> Result<Session, OrchestratorError> {
        self.ensure_running()?;
        let ctx = &self.ctx;
        let _guard = ctx.locks.lock(id).await;
        let mut session = ctx.load_visible(id)?;

        match session.status {
            SessionStatus::Connected if session.is_active => {
                let handle = ctx.get_or_restore(id).await?;
                if !handle.is_connected() {
                    ctx.connect(&handle)
                        .await
                        .map_err(|e| OrchestratorError::protocol(id, e))?;
                    ctx.record(&session, EventPayload::Restored {});
                }
                Ok(session)
            }
            SessionStatus::Disconnected => {
                state::check(&session, &Transition::ReconnectSucceeded)?;
                if ctx.quota.remaining(&session.owner_id) == 0 {
                    return Err(LimitExceeded {
                        owner_id: session.owner_id.clone(),
                        limit: ctx.quota.limit(),
                    }
                    .into());
                }

                let handle = ctx.get_or_restore(id).await?;
                if !handle.is_connected() {
                    ctx.connect(&handle)
                        .await
                        .map_err(|e| OrchestratorError::protocol(id, e))?;
                }
                let committed = ctx
                    .commit_with(
                        &mut session,
                        Transition::ReconnectSucceeded,
                        EventPayload::Reconnected { attempts: 1 },
                    )
                    .await;
                if let Err(e) = committed {
                    handle.client().disconnect().await;
                    return Err(e);
                }
                Ok(session)
            }
            from => Err(InvalidTransition {
                from,
                transition: Transition::ReconnectSucceeded.name(),
                reason: "session is not disconnected",
            }
            .into()),
        }
    }

    #[instrument(skip_all, fields(session_id = %id))]
    async fn delete_session(&self, id: &SessionId) -> Result<(), OrchestratorError> {
        let ctx = &self.ctx;
        // Unblock an in-flight pairing wait before queueing for the lock.
        if let Some(handle) = ctx.registry.get(id) {
            handle.cancel();
        }
        let guard = ctx.locks.lock(id).await;
        let session = match self.persist_deletion(id).await {
            Ok(session) => session,
            Err(e) => {
                // The handle is already cancelled; drop it so the next access rebuilds one.
                ctx.retire(id).await;
                return Err(e);
            }
        };
        ctx.quota.release(&session.owner_id, id);
        ctx.retire(id).await;
        if let Err(e) = ctx.store.delete_identity_material(id) {
            warn!(error = %e, "failed to drop identity material of deleted session");
        }
        ctx.record(&session, EventPayload::Deleted {});
        info!(owner_id = %session.owner_id, "session deleted");

        drop(guard);
        ctx.locks.forget(id);
        ctx.registry.forget(id);
        Ok(())
    }

    fn subscribe(
        &self,
        owner: OwnerId,
        session: Option<SessionId>,
    ) -> Result<Subscription, OrchestratorError> {
        self.ensure_running()?;
        if let Some(id) = &session {
            let target = self.ctx.load_visible(id)?;
            if target.owner_id != owner {
                return Err(OrchestratorError::NotFound(id.clone()));
            }
        }
        Ok(self.ctx.broadcaster.subscribe(owner, session))
    }

    fn unsubscribe(&self, id: &SubscriberId) -> bool {
        self.ctx.broadcaster.unsubscribe(id)
    }

    fn list_events(
        &self,
        id: &SessionId,
        after_sequence: Option<i64>,
        limit: u32,
    ) -> Result<Vec<Event>, OrchestratorError> {
        self.ctx.load_visible(id)?;
        Ok(self
            .ctx
            .store
            .list_events(id, after_sequence, limit.clamp(1, MAX_EVENT_PAGE))?)
    }

    #[instrument(skip_all, fields(owner_id = %owner))]
    async fn detach_owner(&self, owner: &OwnerId) -> usize {
        let handles = self.ctx.registry.handles_for_owner(owner);
        for handle in &handles {
            handle.cancel();
        }
        join_all(handles.iter().map(|h| self.ctx.retire(h.session_id()))).await;
        let subscribers = self.ctx.broadcaster.unsubscribe_owner(owner);
        info!(handles = handles.len(), subscribers, "owner detached");
        handles.len()
    }

    fn stats(&self) -> EngineStats {
        EngineStats {
            live_sessions: self.ctx.registry.len(),
            subscribers: self.ctx.broadcaster.subscriber_count(),
            events_published: self.ctx.broadcaster.published_total(),
            events_dropped: self.ctx.broadcaster.dropped_total(),
        }
    }
}
