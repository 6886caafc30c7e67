//! Boundary to the external messaging protocol library.
//!
//! The library does the network connection, the pairing handshake and the
//! encryption. The orchestrator only sees [`ProtocolClient`] (one per
//! session) and the closed [`ProtocolEvent`] set; adapters translate the
//! library's own event vocabulary into it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretSlice};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::errors::ProtocolError;
use crate::ids::ProtocolIdentity;
use crate::session::Session;

/// Opaque per-identity key material produced by a successful pairing and
/// needed to reconnect without pairing again.
pub struct IdentityMaterial(SecretSlice<u8>);

impl IdentityMaterial {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(SecretSlice::from(bytes))
    }

    pub fn expose(&self) -> &[u8] {
        self.0.expose_secret()
    }

    pub fn len(&self) -> usize {
        self.expose().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Clone for IdentityMaterial {
    fn clone(&self) -> Self {
        Self::new(self.expose().to_vec())
    }
}

impl std::fmt::Debug for IdentityMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "IdentityMaterial([REDACTED; {} bytes])", self.len())
    }
}

/// A pairing challenge handed out by the client: the payload to encode into
/// a scannable code, and how long the library will honour it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PairingChallenge {
    pub code: String,
    pub timeout: Duration,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConnectionMetadata {
    pub push_name: Option<String>,
    pub platform: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InboundMessage {
    pub id: String,
    pub from: String,
    pub timestamp: DateTime<Utc>,
}

/// Internal protocol events. Everything the library emits is translated into
/// one of these before it reaches the state machine.
#[derive(Clone, Debug)]
pub enum ProtocolEvent {
    Connected {
        identity: ProtocolIdentity,
        metadata: ConnectionMetadata,
    },
    Disconnected,
    LoggedOut {
        reason: String,
    },
    PairingScanned,
    PairingSucceeded {
        identity: ProtocolIdentity,
        material: IdentityMaterial,
    },
    PairingFailed {
        reason: String,
    },
    MessageReceived {
        message: InboundMessage,
    },
}

impl ProtocolEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connected { .. } => "connected",
            Self::Disconnected => "disconnected",
            Self::LoggedOut { .. } => "logged_out",
            Self::PairingScanned => "pairing_scanned",
            Self::PairingSucceeded { .. } => "pairing_succeeded",
            Self::PairingFailed { .. } => "pairing_failed",
            Self::MessageReceived { .. } => "message_received",
        }
    }
}

/// One live connection to the messaging network.
#[async_trait]
pub trait ProtocolClient: Send + Sync {
    async fn connect(&self) -> Result<(), ProtocolError>;
    async fn disconnect(&self);
    fn is_connected(&self) -> bool;

    /// Ask the library for a pairing challenge. Suspends until the library
    /// produces one; must return [`ProtocolError::Cancelled`] promptly once
    /// `cancel` fires.
    async fn request_pairing_challenge(
        &self,
        cancel: &CancellationToken,
    ) -> Result<PairingChallenge, ProtocolError>;
}

/// A freshly built client plus the stream of its translated events.
pub struct ClientParts {
    pub client: Arc<dyn ProtocolClient>,
    pub events: mpsc::Receiver<ProtocolEvent>,
}

/// Builds protocol clients. `material` is `None` for a session that still
/// has to pair.
#[async_trait]
pub trait ClientFactory: Send + Sync {
    async fn create(
        &self,
        session: &Session,
        material: Option<IdentityMaterial>,
    ) -> Result<ClientParts, ProtocolError>;
}
