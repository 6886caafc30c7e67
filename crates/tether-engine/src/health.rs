//! Periodic reconciliation of persisted intent against live state.
//!
//! Each sweep restores Connected sessions that lost their handle, expires
//! stale pairing codes, and notices links that dropped without telling
//! anyone. A failure on one session is logged and counted; the sweep moves
//! on to the next.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::OwnedMutexGuard;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use tether_core::events::EventPayload;
use tether_core::ids::SessionId;
use tether_core::session::{Session, SessionStatus};
use tether_core::state::{DisconnectReason, Transition};

use crate::context::EngineContext;
use crate::error::OrchestratorError;
use crate::registry::SessionHandle;

/// What one sweep did.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    /// Connected sessions given a fresh handle and link.
    pub restored: usize,
    /// Pairing codes expired.
    pub expired: usize,
    /// Links found down and handed to the reconnect loop.
    pub link_lost: usize,
    /// Sessions failed because they can never be restored.
    pub failed: usize,
    /// Per-session errors that were logged and skipped.
    pub errors: usize,
}

impl SweepReport {
    pub fn is_quiet(&self) -> bool {
        *self == Self::default()
    }
}

enum Recovery {
    Restored,
    LinkLost,
    Failed,
}

pub struct HealthMonitor {
    ctx: Arc<EngineContext>,
}

impl HealthMonitor {
    pub(crate) fn new(ctx: Arc<EngineContext>) -> Self {
        Self { ctx }
    }

    /// Sweep every `health_interval` until the orchestrator shuts down.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.ctx.config.health_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = self.ctx.shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        self.sweep().await;
                    }
                }
            }
            debug!("health monitor stopped");
        })
    }

    #[instrument(skip_all)]
    pub async fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();
        self.restore_orphans(&mut report).await;
        self.expire_codes(&mut report).await;
        self.check_links(&mut report).await;

        if report.is_quiet() {
            debug!("health sweep found nothing to do");
        } else {
            info!(
                restored = report.restored,
                expired = report.expired,
                link_lost = report.link_lost,
                failed = report.failed,
                errors = report.errors,
                "health sweep complete"
            );
        }
        report
    }

    /// Take the session lock unless the orchestrator is shutting down.
    async fn lock(&self, id: &SessionId) -> Result<OwnedMutexGuard<()>, OrchestratorError> {
        self.ctx
            .locks
            .lock_or_cancel(id, &self.ctx.shutdown)
            .await
            .ok_or(OrchestratorError::ShuttingDown)
    }

    fn sessions_in(&self, status: SessionStatus, report: &mut SweepReport) -> Vec<Session> {
        match self.ctx.store.list_sessions_by_status(status) {
            Ok(sessions) => sessions,
            Err(e) => {
                warn!(%status, error = %e, "health sweep could not list sessions");
                report.errors += 1;
                Vec::new()
            }
        }
    }

    async fn restore_orphans(&self, report: &mut SweepReport) {
        for session in self.sessions_in(SessionStatus::Connected, report) {
            if self.ctx.is_shutting_down() {
                return;
            }
            if self.ctx.registry.is_live(&session.id) {
                continue;
            }
            match self.recover(&session.id).await {
                Ok(Recovery::Restored) => report.restored += 1,
                Ok(Recovery::LinkLost) => report.link_lost += 1,
                Ok(Recovery::Failed) => report.failed += 1,
                Err(OrchestratorError::ShuttingDown) => return,
                Err(e) => {
                    warn!(session_id = %session.id, error = %e, "health restore failed");
                    report.errors += 1;
                }
            }
        }
    }

    async fn recover(&self, id: &SessionId) -> Result<Recovery, OrchestratorError> {
        let ctx = &self.ctx;
        let handle = match ctx.get_or_restore(id).await {
            Ok(handle) => handle,
            Err(e) if e.is_permanent() => {
                warn!(session_id = %id, error = %e, "session can never be restored, failing it");
                self.fail_unrestorable(id).await?;
                return Ok(Recovery::Failed);
            }
            Err(e) => return Err(e.into()),
        };

        let connected = ctx.connect(&handle).await;
        let _guard = self.lock(id).await?;
        let mut session = ctx.load_visible(id)?;
        if !session.is_active || session.status != SessionStatus::Connected {
            return Ok(Recovery::Restored);
        }
        match connected {
            Ok(()) => {
                ctx.record(&session, EventPayload::Restored {});
                Ok(Recovery::Restored)
            }
            Err(e) => {
                warn!(session_id = %id, error = %e, "restored session failed to connect");
                self.link_lost(&mut session, &handle).await?;
                Ok(Recovery::LinkLost)
            }
        }
    }

    /// Connected, but the identity material needed to reconnect is gone.
    async fn fail_unrestorable(&self, id: &SessionId) -> Result<(), OrchestratorError> {
        let ctx = &self.ctx;
        let _guard = self.lock(id).await?;
        let mut session = ctx.load_visible(id)?;
        if session.is_active && session.status == SessionStatus::Connected {
            ctx.commit(
                &mut session,
                Transition::LinkLost {
                    reason: DisconnectReason::HealthCheck,
                },
            )
            .await?;
            ctx.commit(&mut session, Transition::ReconnectExhausted { attempts: 0 })
                .await?;
        }
        Ok(())
    }

    async fn expire_codes(&self, report: &mut SweepReport) {
        let now = Utc::now();
        for session in self.sessions_in(SessionStatus::PairingReady, report) {
            if self.ctx.is_shutting_down() {
                return;
            }
            let stale = session.pairing.as_ref().map_or(true, |p| p.is_expired_at(now));
            if !stale {
                continue;
            }
            match self.expire(&session.id).await {
                Ok(true) => report.expired += 1,
                Ok(false) => {}
                Err(OrchestratorError::ShuttingDown) => return,
                Err(e) => {
                    warn!(session_id = %session.id, error = %e, "failed to expire pairing code");
                    report.errors += 1;
                }
            }
        }
    }

    async fn expire(&self, id: &SessionId) -> Result<bool, OrchestratorError> {
        let ctx = &self.ctx;
        let _guard = self.lock(id).await?;
        let mut session = ctx.load_visible(id)?;
        let still_stale = session.is_active
            && session.status == SessionStatus::PairingReady
            && session
                .pairing
                .as_ref()
                .map_or(true, |p| p.is_expired_at(Utc::now()));
        if !still_stale {
            return Ok(false);
        }
        ctx.commit(&mut session, Transition::CodeExpired).await?;
        ctx.retire(id).await;
        Ok(true)
    }

    async fn check_links(&self, report: &mut SweepReport) {
        for handle in self.ctx.registry.handles() {
            if self.ctx.is_shutting_down() {
                return;
            }
            if handle.is_stopped() || handle.is_connected() || handle.is_reconnecting() {
                continue;
            }
            // Pending and pairing sessions have no link to lose, and their
            // lock may be held across a pairing wait.
            match self.ctx.load_visible(handle.session_id()) {
                Ok(session) if session.is_active && session.status == SessionStatus::Connected => {}
                Ok(_) | Err(OrchestratorError::NotFound(_)) => continue,
                Err(e) => {
                    warn!(session_id = %handle.session_id(), error = %e, "link check failed");
                    report.errors += 1;
                    continue;
                }
            }
            match self.check_link(&handle).await {
                Ok(true) => report.link_lost += 1,
                Ok(false) => {}
                Err(OrchestratorError::ShuttingDown) => return,
                Err(e) => {
                    warn!(session_id = %handle.session_id(), error = %e, "link check failed");
                    report.errors += 1;
                }
            }
        }
    }

    async fn check_link(&self, handle: &Arc<SessionHandle>) -> Result<bool, OrchestratorError> {
        let ctx = &self.ctx;
        let id = handle.session_id();
        let _guard = self.lock(id).await?;
        let mut session = ctx.load_visible(id)?;
        if !session.is_active || session.status != SessionStatus::Connected || handle.is_connected() {
            return Ok(false);
        }
        self.link_lost(&mut session, handle).await?;
        Ok(true)
    }

    async fn link_lost(
        &self,
        session: &mut Session,
        handle: &Arc<SessionHandle>,
    ) -> Result<(), OrchestratorError> {
        self.ctx
            .commit(
                session,
                Transition::LinkLost {
                    reason: DisconnectReason::HealthCheck,
                },
            )
            .await?;
        self.ctx.spawn_reconnect(handle);
        Ok(())
    }
}
