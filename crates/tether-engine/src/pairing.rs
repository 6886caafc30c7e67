//! Pairing-code issuance.
//!
//! A session has at most one code at a time. Asking again while the code is
//! still valid returns the same code; once it has expired a fresh challenge
//! is requested from the client and supersedes it, up to the configured
//! number of codes per session.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, instrument, warn};

use tether_core::ids::SessionId;
use tether_core::session::{PairingMaterial, Session, SessionStatus};
use tether_core::state::Transition;

use crate::context::EngineContext;
use crate::error::OrchestratorError;

pub struct PairingCoordinator {
    ctx: Arc<EngineContext>,
}

impl PairingCoordinator {
    pub(crate) fn new(ctx: Arc<EngineContext>) -> Self {
        Self { ctx }
    }

    /// Return the session's valid pairing code, issuing a new one if needed.
    #[instrument(skip_all, fields(session_id = %session_id))]
    pub async fn issue(&self, session_id: &SessionId) -> Result<PairingMaterial, OrchestratorError> {
        let ctx = &self.ctx;
        let _guard = ctx.locks.lock(session_id).await;
        let mut session = ctx.load_visible(session_id)?;
        let now = Utc::now();

        let issued = match (session.status, &session.pairing) {
            _ if !session.is_active => return Err(not_available(&session)),
            (SessionStatus::PairingReady, Some(current)) if !current.is_expired_at(now) => {
                return Ok(current.clone());
            }
            (SessionStatus::PairingReady, current) => current.as_ref().map_or(0, |p| p.retry_count),
            (SessionStatus::Pending, _) => 0,
            _ => return Err(not_available(&session)),
        };

        if issued >= ctx.config.max_pairing_retries {
            if session.status == SessionStatus::PairingReady {
                ctx.commit(&mut session, Transition::CodeExpired).await?;
                ctx.retire(session_id).await;
            }
            warn!(retries = issued, "pairing retries exhausted");
            return Err(OrchestratorError::RetryExhausted {
                session_id: session_id.clone(),
                retries: issued,
            });
        }

        let handle = ctx.get_or_restore(session_id).await?;
        let cancel = handle.cancel_token().child_token();
        let wait = ctx.config.challenge_timeout;
        let challenge = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(OrchestratorError::Cancelled),
            result = tokio::time::timeout(wait, handle.client().request_pairing_challenge(&cancel)) => {
                match result {
                    Ok(Ok(challenge)) => challenge,
                    Ok(Err(e)) => return Err(OrchestratorError::protocol(session_id, e)),
                    Err(_) => {
                        cancel.cancel();
                        warn!(timeout = ?wait, "no pairing challenge from client");
                        return Err(OrchestratorError::PairingTimeout(wait));
                    }
                }
            }
        };

        let image = ctx
            .renderer
            .render(&challenge.code)
            .map_err(|e| OrchestratorError::Internal(e.to_string()))?;

        let validity = if challenge.timeout.is_zero() {
            ctx.config.pairing_timeout
        } else {
            challenge.timeout.min(ctx.config.pairing_timeout)
        };
        let issued_at = Utc::now();
        let expires_at = issued_at
            + chrono::Duration::from_std(validity).map_err(|e| OrchestratorError::Internal(e.to_string()))?;
        let material = PairingMaterial {
            code: challenge.code,
            image,
            issued_at,
            expires_at,
            retry_count: issued + 1,
        };

        let transition = if session.status == SessionStatus::Pending {
            Transition::IssuePairingCode {
                material: material.clone(),
            }
        } else {
            Transition::RefreshPairingCode {
                material: material.clone(),
            }
        };
        ctx.commit(&mut session, transition).await?;
        info!(retry_count = material.retry_count, %expires_at, "pairing code issued");
        Ok(material)
    }

    /// The code currently on display, without issuing anything.
    pub fn current(&self, session_id: &SessionId) -> Result<PairingMaterial, OrchestratorError> {
        let session = self.ctx.load_visible(session_id)?;
        match (session.status, session.pairing) {
            (SessionStatus::PairingReady, Some(material)) if session.is_active => {
                if material.is_expired_at(Utc::now()) {
                    Err(OrchestratorError::PairingExpired(session_id.clone()))
                } else {
                    Ok(material)
                }
            }
            (SessionStatus::Expired, _) => Err(OrchestratorError::PairingExpired(session_id.clone())),
            (status, _) => Err(OrchestratorError::NotAvailable {
                session_id: session_id.clone(),
                status,
            }),
        }
    }
}

fn not_available(session: &Session) -> OrchestratorError {
    OrchestratorError::NotAvailable {
        session_id: session.id.clone(),
        status: session.status,
    }
}
