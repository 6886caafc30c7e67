use std::time::Duration;

use tether_core::errors::{PersistenceError, ProtocolError};
use tether_core::ids::{OwnerId, SessionId};
use tether_core::session::SessionStatus;
use tether_core::state::InvalidTransition;

use crate::quota::LimitExceeded;

/// Why a live handle could not be rebuilt for a session.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum RestoreError {
    #[error("session {0} not found")]
    NotFound(SessionId),

    #[error("session {0} is no longer active")]
    Inactive(SessionId),

    #[error("session {0} has no protocol identity")]
    MissingIdentity(SessionId),

    #[error("identity material for session {session_id} unusable: {detail}")]
    KeyMaterial { session_id: SessionId, detail: String },

    #[error("protocol client: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("persistence: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("orchestrator is shutting down")]
    ShuttingDown,
}

impl RestoreError {
    /// Failures that no amount of retrying will fix.
    pub fn is_permanent(&self) -> bool {
        match self {
            Self::MissingIdentity(_) | Self::KeyMaterial { .. } => true,
            Self::Protocol(e) => e.is_fatal(),
            _ => false,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    LimitExceeded(#[from] LimitExceeded),

    #[error("owner {owner_id} already has a session named {name:?}")]
    DuplicateName { owner_id: OwnerId, name: String },

    #[error("invalid session name: {0}")]
    InvalidName(String),

    #[error("session {0} not found")]
    NotFound(SessionId),

    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),

    #[error("no pairing challenge within {0:?}")]
    PairingTimeout(Duration),

    #[error("session {session_id} exhausted its {retries} pairing codes")]
    RetryExhausted { session_id: SessionId, retries: u32 },

    #[error("session {session_id} has no pairing code available in status {status}")]
    NotAvailable {
        session_id: SessionId,
        status: SessionStatus,
    },

    #[error("pairing code for session {0} has expired")]
    PairingExpired(SessionId),

    #[error("session not connected: {0}")]
    NotConnected(#[from] RestoreError),

    #[error("protocol error on session {session_id}: {source}")]
    Protocol {
        session_id: SessionId,
        #[source]
        source: ProtocolError,
    },

    #[error("persistence: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("operation cancelled")]
    Cancelled,

    #[error("orchestrator is shutting down")]
    ShuttingDown,

    #[error("{0}")]
    Internal(String),
}

impl OrchestratorError {
    /// Stable error code for API layers.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::LimitExceeded(_) => "LIMIT_EXCEEDED",
            Self::DuplicateName { .. } => "DUPLICATE_NAME",
            Self::InvalidName(_) => "INVALID_NAME",
            Self::NotFound(_) => "NOT_FOUND",
            Self::InvalidTransition(_) => "INVALID_TRANSITION",
            Self::PairingTimeout(_) => "PAIRING_TIMEOUT",
            Self::RetryExhausted { .. } => "RETRY_EXHAUSTED",
            Self::NotAvailable { .. } => "NOT_AVAILABLE",
            Self::PairingExpired(_) => "PAIRING_EXPIRED",
            Self::NotConnected(_) => "NOT_CONNECTED",
            Self::Protocol { .. } => "PROTOCOL_ERROR",
            Self::Persistence(_) => "PERSISTENCE_ERROR",
            Self::Cancelled => "CANCELLED",
            Self::ShuttingDown => "SHUTTING_DOWN",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    pub(crate) fn protocol(session_id: &SessionId, source: ProtocolError) -> Self {
        match source {
            ProtocolError::Cancelled => Self::Cancelled,
            source => Self::Protocol {
                session_id: session_id.clone(),
                source,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kinds_are_stable() {
        let id = SessionId::from_raw("sess_1");
        assert_eq!(OrchestratorError::NotFound(id.clone()).error_kind(), "NOT_FOUND");
        assert_eq!(
            OrchestratorError::NotConnected(RestoreError::MissingIdentity(id.clone())).error_kind(),
            "NOT_CONNECTED"
        );
        assert_eq!(
            OrchestratorError::PairingTimeout(Duration::from_secs(20)).error_kind(),
            "PAIRING_TIMEOUT"
        );
    }

    #[test]
    fn cancelled_protocol_error_collapses() {
        let id = SessionId::from_raw("sess_1");
        assert!(matches!(
            OrchestratorError::protocol(&id, ProtocolError::Cancelled),
            OrchestratorError::Cancelled
        ));
        assert!(matches!(
            OrchestratorError::protocol(&id, ProtocolError::NotConnected),
            OrchestratorError::Protocol { .. }
        ));
    }

    #[test]
    fn permanent_restore_failures() {
        let id = SessionId::from_raw("sess_1");
        assert!(RestoreError::MissingIdentity(id.clone()).is_permanent());
        assert!(RestoreError::KeyMaterial {
            session_id: id.clone(),
            detail: "corrupt".into()
        }
        .is_permanent());
        assert!(!RestoreError::Protocol(ProtocolError::Timeout(Duration::from_secs(1))).is_permanent());
        assert!(!RestoreError::NotFound(id).is_permanent());
    }
}
