//! State shared by the orchestrator, the per-session workers and the health
//! monitor, plus the one path every status change goes through.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use tether_core::errors::{PersistenceError, ProtocolError};
use tether_core::events::{Event, EventPayload};
use tether_core::ids::SessionId;
use tether_core::persistence::PersistenceGateway;
use tether_core::protocol::ClientFactory;
use tether_core::session::{Session, SessionStatus};
use tether_core::state::{self, SlotChange, Transition};

use crate::broadcast::EventBroadcaster;
use crate::config::OrchestratorConfig;
use crate::error::{OrchestratorError, RestoreError};
use crate::locks::SessionLocks;
use crate::quota::QuotaGuard;
use crate::registry::{SessionHandle, SessionRegistry};
use crate::render::PairingRenderer;
use crate::worker;

const SAVE_ATTEMPTS: u32 = 3;

pub(crate) struct EngineContext {
    pub(crate) config: OrchestratorConfig,
    pub(crate) store: Arc<dyn PersistenceGateway>,
    pub(crate) factory: Arc<dyn ClientFactory>,
    pub(crate) renderer: Arc<dyn PairingRenderer>,
    pub(crate) registry: SessionRegistry,
    pub(crate) quota: QuotaGuard,
    pub(crate) broadcaster: EventBroadcaster,
    pub(crate) locks: SessionLocks,
    pub(crate) shutdown: CancellationToken,
}

impl EngineContext {
    pub(crate) fn new(
        config: OrchestratorConfig,
        store: Arc<dyn PersistenceGateway>,
        factory: Arc<dyn ClientFactory>,
        renderer: Arc<dyn PairingRenderer>,
    ) -> Self {
        Self {
            quota: QuotaGuard::new(config.max_sessions_per_owner),
            broadcaster: EventBroadcaster::new(config.subscriber_queue),
            registry: SessionRegistry::new(),
            locks: SessionLocks::default(),
            shutdown: CancellationToken::new(),
            config,
            store,
            factory,
            renderer,
        }
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Load a session that callers may see (exists and not deleted).
    pub(crate) fn load_visible(&self, id: &SessionId) -> Result<Session, OrchestratorError> {
        match self.store.load_session(id)? {
            Some(session) if !session.is_deleted() => Ok(session),
            _ => Err(OrchestratorError::NotFound(id.clone())),
        }
    }

    /// Persist `session`, retrying briefly while the store is unavailable.
    pub(crate) async fn save(&self, session: &Session) -> Result<(), PersistenceError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.store.save_session(session) {
                Err(PersistenceError::Unavailable(detail)) if attempt < SAVE_ATTEMPTS => {
                    warn!(session_id = %session.id, attempt, error = %detail, "session save failed, retrying");
                    tokio::time::sleep(Duration::from_millis(50 * u64::from(attempt))).await;
                }
                other => return other,
            }
        }
    }

    /// Apply `transition` with its default event payload.
    pub(crate) async fn commit(
        &self,
        session: &mut Session,
        transition: Transition,
    ) -> Result<Event, OrchestratorError> {
        let payload = transition_payload(&transition, session);
        self.commit_with(session, transition, payload).await
    }

    /// Validate, reserve quota if the session re-enters the active set,
    /// persist, then record and publish `payload`. The caller holds the
    /// session lock. On error nothing has changed.
    pub(crate) async fn commit_with(
        &self,
        session: &mut Session,
        transition: Transition,
        payload: EventPayload,
    ) -> Result<Event, OrchestratorError> {
        let step = state::check(session, &transition).inspect_err(|e| {
            warn!(session_id = %session.id, owner_id = %session.owner_id, error = %e, "rejected transition");
        })?;

        let reservation = match step.slot {
            SlotChange::Acquire if !self.quota.holds(&session.owner_id, &session.id) => {
                Some(self.quota.reserve(&session.owner_id)?)
            }
            _ => None,
        };

        let mut next = session.clone();
        state::apply(&mut next, &transition, Utc::now())?;
        self.save(&next).await?;

        if let Some(reservation) = reservation {
            reservation.commit(&next.id);
        }
        if step.slot == SlotChange::Release {
            self.quota.release(&next.owner_id, &next.id);
        }

        info!(
            session_id = %next.id,
            owner_id = %next.owner_id,
            transition = transition.name(),
            from = %step.from,
            to = %step.to,
            "session transition"
        );
        *session = next;
        Ok(self.record(session, payload))
    }

    /// Append an event to the session's log and publish it. A failed append
    /// is logged; the event is still published, unsequenced.
    pub(crate) fn record(&self, session: &Session, payload: EventPayload) -> Event {
        let event = Event::for_session(session, payload, Utc::now());
        let event = match self.store.append_event(event.clone()) {
            Ok(stored) => stored,
            Err(e) => {
                error!(
                    session_id = %session.id,
                    event_type = event.event_type(),
                    error = %e,
                    "failed to persist event"
                );
                event
            }
        };
        self.broadcaster.publish(&event);
        event
    }

    pub(crate) async fn get_or_restore(
        self: &Arc<Self>,
        id: &SessionId,
    ) -> Result<Arc<SessionHandle>, RestoreError> {
        self.registry.get_or_restore(id, || self.restore(id)).await
    }

    /// Build a handle for a persisted session: load it and its identity
    /// material, create a client and start the event worker.
    async fn restore(self: &Arc<Self>, id: &SessionId) -> Result<Arc<SessionHandle>, RestoreError> {
        if self.is_shutting_down() {
            return Err(RestoreError::ShuttingDown);
        }
        let session = self
            .store
            .load_session(id)?
            .filter(|s| !s.is_deleted())
            .ok_or_else(|| RestoreError::NotFound(id.clone()))?;
        if session.is_terminal() {
            return Err(RestoreError::Inactive(id.clone()));
        }

        let material = match (&session.protocol_identity, session.status) {
            (None, SessionStatus::Pending | SessionStatus::PairingReady) => None,
            (None, _) => return Err(RestoreError::MissingIdentity(id.clone())),
            (Some(_), _) => match self.store.load_identity_material(id) {
                Ok(Some(material)) => Some(material),
                Ok(None) => {
                    return Err(RestoreError::KeyMaterial {
                        session_id: id.clone(),
                        detail: "no stored identity material".into(),
                    })
                }
                Err(PersistenceError::Corrupt(detail)) => {
                    return Err(RestoreError::KeyMaterial {
                        session_id: id.clone(),
                        detail,
                    })
                }
                Err(e) => return Err(e.into()),
            },
        };

        let parts = self.factory.create(&session, material).await?;
        let handle = Arc::new(SessionHandle::new(
            session.id.clone(),
            session.owner_id.clone(),
            parts.client,
        ));
        handle.spawn(worker::run(self.clone(), handle.clone(), parts.events));
        info!(session_id = %session.id, status = %session.status, "session handle restored");
        Ok(handle)
    }

    /// One connect call, bounded by the connect timeout and the handle's
    /// cancellation.
    pub(crate) async fn connect(&self, handle: &SessionHandle) -> Result<(), ProtocolError> {
        let timeout = self.config.connect_timeout;
        tokio::select! {
            biased;
            _ = handle.cancel_token().cancelled() => Err(ProtocolError::Cancelled),
            result = tokio::time::timeout(timeout, handle.client().connect()) => {
                result.unwrap_or(Err(ProtocolError::Timeout(timeout)))
            }
        }
    }

    /// Start the reconnect loop for `handle` unless one is already running.
    pub(crate) fn spawn_reconnect(self: &Arc<Self>, handle: &Arc<SessionHandle>) {
        if handle.is_stopped() || !handle.begin_reconnect() {
            return;
        }
        handle.spawn(worker::reconnect(self.clone(), handle.clone()));
    }

    /// Tear down the live handle of `id`, if any. Never call from a task
    /// owned by that handle.
    pub(crate) async fn retire(&self, id: &SessionId) {
        if let Some(handle) = self.registry.evict(id).await {
            handle.shutdown().await;
        }
    }

    /// Tear down `handle` from inside one of its own tasks.
    pub(crate) async fn retire_from_task(&self, handle: &Arc<SessionHandle>) {
        self.registry.remove_if_current(handle);
        handle.stop_from_task().await;
    }
}

/// Event recorded for a transition, computed from the session before the
/// transition applies.
pub(crate) fn transition_payload(transition: &Transition, before: &Session) -> EventPayload {
    match transition {
        Transition::IssuePairingCode { material } | Transition::RefreshPairingCode { material } => {
            EventPayload::PairingCodeIssued {
                code: material.code.clone(),
                image: material.image.clone(),
                expires_at: material.expires_at,
                retry_count: material.retry_count,
            }
        }
        Transition::CodeScanned => EventPayload::PairingScanned {},
        Transition::CodeExpired => EventPayload::PairingExpired {
            retry_count: before.pairing.as_ref().map_or(0, |p| p.retry_count),
        },
        Transition::PairingSucceeded { identity } => EventPayload::Connected {
            identity: identity.clone(),
            push_name: None,
        },
        Transition::PairingFailed { reason } => EventPayload::PairingFailed {
            reason: reason.clone(),
        },
        Transition::LinkLost { reason } => EventPayload::Disconnected {
            reason: reason.clone(),
        },
        Transition::RemoteLogout { reason } => EventPayload::LoggedOut {
            reason: reason.clone(),
        },
        Transition::ReconnectSucceeded => EventPayload::Reconnected { attempts: 0 },
        Transition::ReconnectExhausted { attempts } => EventPayload::ReconnectFailed {
            attempts: *attempts,
        },
    }
}
