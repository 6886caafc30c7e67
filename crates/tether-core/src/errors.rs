use std::time::Duration;

/// Failure reported by a protocol client. Classified so callers can decide
/// whether a reconnect attempt is worth making.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    // Retryable
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    #[error("not connected")]
    NotConnected,
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    // Fatal for this identity
    #[error("rejected by server: {0}")]
    Rejected(String),
    #[error("identity material missing or unusable: {0}")]
    InvalidIdentity(String),

    // Operational
    #[error("cancelled")]
    Cancelled,
    #[error("client closed")]
    Closed,
}

impl ProtocolError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ConnectionFailed(_) | Self::NotConnected | Self::Timeout(_)
        )
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Rejected(_) | Self::InvalidIdentity(_))
    }

    /// Short classification string for logs and events.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::ConnectionFailed(_) => "connection_failed",
            Self::NotConnected => "not_connected",
            Self::Timeout(_) => "timeout",
            Self::Rejected(_) => "rejected",
            Self::InvalidIdentity(_) => "invalid_identity",
            Self::Cancelled => "cancelled",
            Self::Closed => "closed",
        }
    }
}

/// Failure reported by the persistence gateway.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum PersistenceError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(ProtocolError::ConnectionFailed("tcp reset".into()).is_retryable());
        assert!(ProtocolError::NotConnected.is_retryable());
        assert!(ProtocolError::Timeout(Duration::from_secs(5)).is_retryable());
        assert!(!ProtocolError::Rejected("401".into()).is_retryable());
        assert!(!ProtocolError::Cancelled.is_retryable());
    }

    #[test]
    fn fatal_classification() {
        assert!(ProtocolError::Rejected("banned".into()).is_fatal());
        assert!(ProtocolError::InvalidIdentity("no keys".into()).is_fatal());
        assert!(!ProtocolError::Closed.is_fatal());
    }

    #[test]
    fn error_kind_strings() {
        assert_eq!(ProtocolError::Cancelled.error_kind(), "cancelled");
        assert_eq!(
            ProtocolError::ConnectionFailed(String::new()).error_kind(),
            "connection_failed"
        );
    }
}
