//! Translation from the messaging library's raw events to [`ProtocolEvent`].
//!
//! The library reports far more than the orchestrator cares about
//! (receipts, presence, history sync...). Only the events that move a
//! session through its lifecycle survive translation; the rest are dropped
//! here so the state machine never sees them.

use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use tether_core::ids::ProtocolIdentity;
use tether_core::protocol::{ConnectionMetadata, IdentityMaterial, InboundMessage, ProtocolEvent};

/// Connect-failure codes that mean the stored identity is no longer valid.
const LOGGED_OUT_CODES: [u16; 2] = [401, 403];

/// Raw event shapes as emitted by the messaging library.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ExternalEvent {
    /// New batch of pairing codes; consumed by the challenge request path.
    Qr { codes: Vec<String> },
    QrScanned,
    PairSuccess {
        jid: String,
        #[serde(default)]
        business_name: Option<String>,
        #[serde(default)]
        platform: Option<String>,
        /// Base64 of the freshly negotiated device credentials.
        credentials: String,
    },
    PairError {
        #[serde(default)]
        jid: Option<String>,
        error: String,
    },
    Connected {
        jid: String,
        #[serde(default)]
        push_name: Option<String>,
        #[serde(default)]
        platform: Option<String>,
    },
    Disconnected,
    StreamReplaced,
    StreamError { code: String },
    KeepAliveTimeout { error_count: u32 },
    KeepAliveRestored,
    ConnectFailure { code: u16, #[serde(default)] message: Option<String> },
    TemporaryBan { code: u16, expire_secs: u64 },
    LoggedOut { #[serde(default)] on_connect: bool, reason: String },
    Message {
        id: String,
        from: String,
        timestamp: DateTime<Utc>,
    },
    Receipt { ids: Vec<String> },
    Presence { from: String, unavailable: bool },
    HistorySync,
}

impl ExternalEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Qr { .. } => "qr",
            Self::QrScanned => "qr_scanned",
            Self::PairSuccess { .. } => "pair_success",
            Self::PairError { .. } => "pair_error",
            Self::Connected { .. } => "connected",
            Self::Disconnected => "disconnected",
            Self::StreamReplaced => "stream_replaced",
            Self::StreamError { .. } => "stream_error",
            Self::KeepAliveTimeout { .. } => "keep_alive_timeout",
            Self::KeepAliveRestored => "keep_alive_restored",
            Self::ConnectFailure { .. } => "connect_failure",
            Self::TemporaryBan { .. } => "temporary_ban",
            Self::LoggedOut { .. } => "logged_out",
            Self::Message { .. } => "message",
            Self::Receipt { .. } => "receipt",
            Self::Presence { .. } => "presence",
            Self::HistorySync => "history_sync",
        }
    }
}

/// Map one external event to an internal one, or `None` when the event
/// carries nothing the lifecycle needs.
pub fn translate(event: ExternalEvent) -> Option<ProtocolEvent> {
    match event {
        ExternalEvent::QrScanned => Some(ProtocolEvent::PairingScanned),
        ExternalEvent::PairSuccess {
            jid, credentials, ..
        } => match base64::engine::general_purpose::STANDARD.decode(credentials.as_bytes()) {
            Ok(bytes) if !bytes.is_empty() => Some(ProtocolEvent::PairingSucceeded {
                identity: ProtocolIdentity::new(jid),
                material: IdentityMaterial::new(bytes),
            }),
            _ => {
                warn!(jid = %jid, "pair success without usable credentials");
                Some(ProtocolEvent::PairingFailed {
                    reason: "pairing produced unusable credentials".into(),
                })
            }
        },
        ExternalEvent::PairError { error, .. } => Some(ProtocolEvent::PairingFailed { reason: error }),
        ExternalEvent::Connected {
            jid,
            push_name,
            platform,
        } => Some(ProtocolEvent::Connected {
            identity: ProtocolIdentity::new(jid),
            metadata: ConnectionMetadata { push_name, platform },
        }),
        ExternalEvent::Disconnected
        | ExternalEvent::StreamReplaced
        | ExternalEvent::StreamError { .. }
        | ExternalEvent::TemporaryBan { .. } => Some(ProtocolEvent::Disconnected),
        ExternalEvent::ConnectFailure { code, message } => {
            if LOGGED_OUT_CODES.contains(&code) {
                Some(ProtocolEvent::LoggedOut {
                    reason: message.unwrap_or_else(|| format!("connect failure {code}")),
                })
            } else {
                Some(ProtocolEvent::Disconnected)
            }
        }
        ExternalEvent::LoggedOut { reason, .. } => Some(ProtocolEvent::LoggedOut { reason }),
        ExternalEvent::Message { id, from, timestamp } => Some(ProtocolEvent::MessageReceived {
            message: InboundMessage { id, from, timestamp },
        }),
        ExternalEvent::Qr { .. }
        | ExternalEvent::KeepAliveTimeout { .. }
        | ExternalEvent::KeepAliveRestored
        | ExternalEvent::Receipt { .. }
        | ExternalEvent::Presence { .. }
        | ExternalEvent::HistorySync => None,
    }
}
