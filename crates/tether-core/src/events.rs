use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{EventId, OwnerId, ProtocolIdentity, SessionId};
use crate::session::{Session, SessionStatus};
use crate::state::DisconnectReason;

/// Version of the [`EventEnvelope`] wire shape.
pub const ENVELOPE_VERSION: u32 = 1;

/// Typed payload of every event the orchestrator records and broadcasts.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum EventPayload {
    SessionCreated {
        name: String,
    },
    PairingCodeIssued {
        code: String,
        image: String,
        expires_at: DateTime<Utc>,
        retry_count: u32,
    },
    PairingScanned {},
    PairingExpired {
        retry_count: u32,
    },
    PairingFailed {
        reason: String,
    },
    Connected {
        identity: ProtocolIdentity,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        push_name: Option<String>,
    },
    Restored {},
    Disconnected {
        reason: DisconnectReason,
    },
    LoggedOut {
        reason: String,
    },
    Reconnected {
        attempts: u32,
    },
    ReconnectFailed {
        attempts: u32,
    },
    MessageReceived {
        message_id: String,
        from: String,
    },
    Deleted {},
}

impl EventPayload {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::SessionCreated { .. } => "session_created",
            Self::PairingCodeIssued { .. } => "pairing_code_issued",
            Self::PairingScanned { .. } => "pairing_scanned",
            Self::PairingExpired { .. } => "pairing_expired",
            Self::PairingFailed { .. } => "pairing_failed",
            Self::Connected { .. } => "connected",
            Self::Restored { .. } => "restored",
            Self::Disconnected { .. } => "disconnected",
            Self::LoggedOut { .. } => "logged_out",
            Self::Reconnected { .. } => "reconnected",
            Self::ReconnectFailed { .. } => "reconnect_failed",
            Self::MessageReceived { .. } => "message_received",
            Self::Deleted { .. } => "deleted",
        }
    }

    /// The per-kind data object, without the type tag.
    pub fn data(&self) -> serde_json::Value {
        match serde_json::to_value(self) {
            Ok(serde_json::Value::Object(mut map)) => map
                .remove("data")
                .unwrap_or_else(|| serde_json::Value::Object(Default::default())),
            _ => serde_json::Value::Null,
        }
    }

    /// Rebuild a payload from its stored type and data columns.
    pub fn from_parts(event_type: &str, data: serde_json::Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(serde_json::json!({ "type": event_type, "data": data }))
    }
}

/// Append-only record of something that happened to a session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub session_id: SessionId,
    pub owner_id: OwnerId,
    /// Per-session position, assigned when the event is appended.
    pub sequence: i64,
    /// Session status right after the event.
    pub status: SessionStatus,
    pub payload: EventPayload,
    pub created_at: DateTime<Utc>,
}

impl Event {
    pub fn for_session(session: &Session, payload: EventPayload, now: DateTime<Utc>) -> Self {
        Self {
            id: EventId::new(),
            session_id: session.id.clone(),
            owner_id: session.owner_id.clone(),
            sequence: 0,
            status: session.status,
            payload,
            created_at: now,
        }
    }

    pub fn event_type(&self) -> &'static str {
        self.payload.event_type()
    }

    pub fn to_envelope(&self) -> EventEnvelope {
        EventEnvelope {
            version: ENVELOPE_VERSION,
            event_type: self.event_type().to_string(),
            session_id: self.session_id.clone(),
            owner_id: self.owner_id.clone(),
            status: self.status,
            sequence: self.sequence,
            data: self.payload.data(),
            timestamp: self.created_at,
        }
    }
}

/// Shape delivered to subscribers, independent of the internal enums.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    pub version: u32,
    #[serde(rename = "type")]
    pub event_type: String,
    pub session_id: SessionId,
    pub owner_id: OwnerId,
    pub status: SessionStatus,
    pub sequence: i64,
    pub data: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}
