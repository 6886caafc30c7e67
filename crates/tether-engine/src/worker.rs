//! Per-session event worker and reconnect loop.
//!
//! Both run as tasks of the session's [`SessionHandle`]: they stop when the
//! handle is cancelled, and take the session lock (cancellably) before
//! touching persisted state.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use tether_core::errors::ProtocolError;
use tether_core::events::EventPayload;
use tether_core::ids::ProtocolIdentity;
use tether_core::protocol::{ConnectionMetadata, ProtocolEvent};
use tether_core::session::{Session, SessionStatus};
use tether_core::state::{self, DisconnectReason, Transition};

use crate::context::EngineContext;
use crate::error::OrchestratorError;
use crate::registry::SessionHandle;

/// Consume the client's events until the handle stops or the client goes
/// away.
pub(crate) async fn run(
    ctx: Arc<EngineContext>,
    handle: Arc<SessionHandle>,
    mut events: mpsc::Receiver<ProtocolEvent>,
) {
    let cancel = handle.cancel_token().clone();
    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        let kind = event.kind();
        debug!(session_id = %handle.session_id(), event = kind, "protocol event");
        if let Err(e) = on_event(&ctx, &handle, event).await {
            warn!(
                session_id = %handle.session_id(),
                event = kind,
                error = %e,
                "failed to apply protocol event"
            );
        }
    }
    debug!(session_id = %handle.session_id(), "session worker exited");
}

async fn on_event(
    ctx: &Arc<EngineContext>,
    handle: &Arc<SessionHandle>,
    event: ProtocolEvent,
) -> Result<(), OrchestratorError> {
    let id = handle.session_id();
    let Some(_guard) = ctx.locks.lock_or_cancel(id, handle.cancel_token()).await else {
        return Ok(());
    };
    let mut session = ctx.load_visible(id)?;
    if !session.is_active {
        debug!(session_id = %id, event = event.kind(), "event for inactive session ignored");
        return Ok(());
    }

    match event {
        ProtocolEvent::PairingScanned => {
            if session.status == SessionStatus::PairingReady {
                ctx.commit(&mut session, Transition::CodeScanned).await?;
            }
        }
        ProtocolEvent::PairingSucceeded { identity, material } => {
            ctx.store.save_identity_material(id, &material)?;
            complete_pairing(ctx, &mut session, identity, None).await?;
        }
        ProtocolEvent::PairingFailed { reason } => {
            fail_pairing(ctx, handle, &mut session, reason).await?;
        }
        ProtocolEvent::Connected { identity, metadata } => {
            ensure_connected(ctx, handle, &mut session, identity, metadata).await?;
        }
        ProtocolEvent::Disconnected => {
            if session.status == SessionStatus::Connected {
                ctx.commit(
                    &mut session,
                    Transition::LinkLost {
                        reason: DisconnectReason::Network,
                    },
                )
                .await?;
                ctx.spawn_reconnect(handle);
            }
        }
        ProtocolEvent::LoggedOut { reason } => match session.status {
            SessionStatus::Connected | SessionStatus::Disconnected => {
                ctx.commit(&mut session, Transition::RemoteLogout { reason }).await?;
                if let Err(e) = ctx.store.delete_identity_material(id) {
                    warn!(session_id = %id, error = %e, "failed to drop identity material after logout");
                }
                ctx.retire_from_task(handle).await;
            }
            SessionStatus::PairingReady | SessionStatus::Pairing => {
                fail_pairing(ctx, handle, &mut session, reason).await?;
            }
            _ => {}
        },
        ProtocolEvent::MessageReceived { message } => {
            state::touch(&mut session, Utc::now());
            ctx.save(&session).await?;
            ctx.record(
                &session,
                EventPayload::MessageReceived {
                    message_id: message.id,
                    from: message.from,
                },
            );
        }
    }
    Ok(())
}

/// Walk a pairing session to Connected. A success that arrives while the
/// code is still displayed implies the scan happened.
async fn complete_pairing(
    ctx: &EngineContext,
    session: &mut Session,
    identity: ProtocolIdentity,
    push_name: Option<String>,
) -> Result<(), OrchestratorError> {
    if session.status == SessionStatus::PairingReady {
        ctx.commit(session, Transition::CodeScanned).await?;
    }
    match session.status {
        SessionStatus::Pairing => {
            let payload = EventPayload::Connected {
                identity: identity.clone(),
                push_name,
            };
            ctx.commit_with(session, Transition::PairingSucceeded { identity }, payload)
                .await?;
        }
        SessionStatus::Connected => {
            debug!(session_id = %session.id, "duplicate pairing success ignored");
        }
        status => {
            warn!(session_id = %session.id, %status, "pairing success in unexpected status");
        }
    }
    Ok(())
}

async fn fail_pairing(
    ctx: &EngineContext,
    handle: &Arc<SessionHandle>,
    session: &mut Session,
    reason: String,
) -> Result<(), OrchestratorError> {
    if session.status == SessionStatus::PairingReady {
        ctx.commit(session, Transition::CodeScanned).await?;
    }
    if session.status == SessionStatus::Pairing {
        ctx.commit(session, Transition::PairingFailed { reason }).await?;
        ctx.retire_from_task(handle).await;
    }
    Ok(())
}

/// The link reports itself up. Whatever status the session is in, converge
/// on Connected.
async fn ensure_connected(
    ctx: &EngineContext,
    handle: &Arc<SessionHandle>,
    session: &mut Session,
    identity: ProtocolIdentity,
    metadata: ConnectionMetadata,
) -> Result<(), OrchestratorError> {
    match session.status {
        SessionStatus::Connected => {
            state::touch(session, Utc::now());
            ctx.save(session).await?;
        }
        SessionStatus::Disconnected => {
            match ctx
                .commit_with(
                    session,
                    Transition::ReconnectSucceeded,
                    EventPayload::Reconnected { attempts: 0 },
                )
                .await
            {
                Ok(_) => {}
                Err(OrchestratorError::LimitExceeded(e)) => {
                    warn!(session_id = %session.id, error = %e, "link came back over quota");
                    give_up(ctx, handle, session, 0).await?;
                }
                Err(e) => return Err(e),
            }
        }
        SessionStatus::PairingReady | SessionStatus::Pairing => {
            complete_pairing(ctx, session, identity, metadata.push_name).await?;
        }
        status => {
            debug!(session_id = %session.id, %status, "connected event ignored");
        }
    }
    Ok(())
}

async fn give_up(
    ctx: &EngineContext,
    handle: &Arc<SessionHandle>,
    session: &mut Session,
    attempts: u32,
) -> Result<(), OrchestratorError> {
    ctx.commit(session, Transition::ReconnectExhausted { attempts }).await?;
    ctx.retire_from_task(handle).await;
    Ok(())
}

enum ReconnectOutcome {
    Connected { attempts: u32 },
    GaveUp { attempts: u32 },
}

/// Re-establish the link of a Disconnected session with backoff, then
/// settle the outcome under the session lock.
pub(crate) async fn reconnect(ctx: Arc<EngineContext>, handle: Arc<SessionHandle>) {
    if let Some(outcome) = attempt_reconnect(&ctx, &handle).await {
        if let Err(e) = settle(&ctx, &handle, outcome).await {
            warn!(session_id = %handle.session_id(), error = %e, "failed to settle reconnect");
        }
    }
    handle.end_reconnect();
}

async fn attempt_reconnect(ctx: &EngineContext, handle: &SessionHandle) -> Option<ReconnectOutcome> {
    let policy = &ctx.config.reconnect;
    let cancel = handle.cancel_token();
    let mut attempts = 0;

    while policy.allows(attempts) {
        let delay = policy.delay(attempts);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return None,
            _ = tokio::time::sleep(delay) => {}
        }
        if handle.is_connected() {
            return Some(ReconnectOutcome::Connected { attempts });
        }

        attempts += 1;
        match ctx.connect(handle).await {
            Ok(()) => {
                info!(session_id = %handle.session_id(), attempts, "link re-established");
                return Some(ReconnectOutcome::Connected { attempts });
            }
            Err(ProtocolError::Cancelled) => return None,
            Err(e) if e.is_fatal() => {
                warn!(session_id = %handle.session_id(), attempts, error = %e, "reconnect hit a fatal error");
                return Some(ReconnectOutcome::GaveUp { attempts });
            }
            Err(e) => {
                warn!(session_id = %handle.session_id(), attempts, error = %e, "reconnect attempt failed");
            }
        }
    }
    Some(ReconnectOutcome::GaveUp { attempts })
}

async fn settle(
    ctx: &EngineContext,
    handle: &Arc<SessionHandle>,
    outcome: ReconnectOutcome,
) -> Result<(), OrchestratorError> {
    let id = handle.session_id();
    let Some(_guard) = ctx.locks.lock_or_cancel(id, handle.cancel_token()).await else {
        return Ok(());
    };
    let mut session = ctx.load_visible(id)?;
    if !session.is_active || session.status != SessionStatus::Disconnected {
        debug!(session_id = %id, status = %session.status, "reconnect outcome superseded");
        return Ok(());
    }

    match outcome {
        ReconnectOutcome::Connected { attempts } => {
            match ctx
                .commit_with(
                    &mut session,
                    Transition::ReconnectSucceeded,
                    EventPayload::Reconnected { attempts },
                )
                .await
            {
                Ok(_) => Ok(()),
                Err(OrchestratorError::LimitExceeded(e)) => {
                    warn!(session_id = %id, error = %e, "reconnected over quota, giving up");
                    give_up(ctx, handle, &mut session, attempts).await
                }
                Err(e) => Err(e),
            }
        }
        ReconnectOutcome::GaveUp { attempts } => {
            warn!(session_id = %id, attempts, "reconnect attempts exhausted");
            give_up(ctx, handle, &mut session, attempts).await
        }
    }
}
