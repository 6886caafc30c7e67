use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{OwnerId, ProtocolIdentity, SessionId};

/// Connection status of a session. See [`crate::state`] for the legal walks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Pending,
    PairingReady,
    Pairing,
    Connected,
    Disconnected,
    Failed,
    Expired,
}

impl SessionStatus {
    pub const ALL: [SessionStatus; 7] = [
        Self::Pending,
        Self::PairingReady,
        Self::Pairing,
        Self::Connected,
        Self::Disconnected,
        Self::Failed,
        Self::Expired,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::PairingReady => "pairing_ready",
            Self::Pairing => "pairing",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Failed => "failed",
            Self::Expired => "expired",
        }
    }

    /// Statuses that count against the owner's device quota.
    pub fn holds_slot(&self) -> bool {
        matches!(
            self,
            Self::Pending | Self::PairingReady | Self::Pairing | Self::Connected
        )
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown session status: {s}"))
    }
}

/// The current pairing code of a session awaiting pairing. A session holds
/// at most one; issuing a new code replaces the previous one.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairingMaterial {
    pub code: String,
    /// Displayable rendering of the code (an `image/svg+xml` data URL).
    pub image: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub retry_count: u32,
}

impl PairingMaterial {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Time left before expiry, zero once expired.
    pub fn remaining(&self, now: DateTime<Utc>) -> std::time::Duration {
        (self.expires_at - now).to_std().unwrap_or_default()
    }
}

/// One linked messaging identity slot owned by a tenant.
///
/// Mutated only through [`crate::state::apply`]; everything else reads it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub owner_id: OwnerId,
    pub name: String,
    pub status: SessionStatus,
    pub protocol_identity: Option<ProtocolIdentity>,
    pub pairing: Option<PairingMaterial>,
    pub connected_at: Option<DateTime<Utc>>,
    pub disconnected_at: Option<DateTime<Utc>>,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub is_active: bool,
    /// Set by an explicit delete; deleted sessions are invisible to callers.
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new(owner_id: OwnerId, name: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: SessionId::new(),
            owner_id,
            name: name.into(),
            status: SessionStatus::Pending,
            protocol_identity: None,
            pairing: None,
            connected_at: None,
            disconnected_at: None,
            last_seen_at: None,
            is_active: true,
            deleted_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether this session currently occupies one of its owner's slots.
    pub fn holds_slot(&self) -> bool {
        self.is_active && self.status.holds_slot()
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Terminal sessions never leave their status again; a new session must
    /// be created to retry.
    pub fn is_terminal(&self) -> bool {
        !self.is_active || matches!(self.status, SessionStatus::Failed | SessionStatus::Expired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn status_string_roundtrip() {
        for status in SessionStatus::ALL {
            let parsed: SessionStatus = status.to_string().parse().unwrap();
            assert_eq!(parsed, status);
        }
        assert!("bogus".parse::<SessionStatus>().is_err());
    }

    #[test]
    fn status_serde_matches_display() {
        let json = serde_json::to_string(&SessionStatus::PairingReady).unwrap();
        assert_eq!(json, "\"pairing_ready\"");
    }

    #[test]
    fn slot_holding_statuses() {
        assert!(SessionStatus::Pending.holds_slot());
        assert!(SessionStatus::PairingReady.holds_slot());
        assert!(SessionStatus::Pairing.holds_slot());
        assert!(SessionStatus::Connected.holds_slot());
        assert!(!SessionStatus::Disconnected.holds_slot());
        assert!(!SessionStatus::Failed.holds_slot());
        assert!(!SessionStatus::Expired.holds_slot());
    }

    #[test]
    fn new_session_is_pending_and_active() {
        let now = Utc::now();
        let session = Session::new(OwnerId::from_raw("1"), "phone-A", now);
        assert_eq!(session.status, SessionStatus::Pending);
        assert!(session.is_active);
        assert!(session.holds_slot());
        assert!(!session.is_terminal());
        assert!(session.protocol_identity.is_none());
    }

    #[test]
    fn inactive_session_is_terminal_and_holds_nothing() {
        let mut session = Session::new(OwnerId::from_raw("1"), "phone-A", Utc::now());
        session.is_active = false;
        assert!(session.is_terminal());
        assert!(!session.holds_slot());
    }

    #[test]
    fn pairing_material_expiry() {
        let now = Utc::now();
        let material = PairingMaterial {
            code: "2@abc".into(),
            image: String::new(),
            issued_at: now,
            expires_at: now + Duration::seconds(30),
            retry_count: 1,
        };
        assert!(!material.is_expired_at(now));
        assert!(material.is_expired_at(now + Duration::seconds(30)));
        assert_eq!(material.remaining(now).as_secs(), 30);
        assert_eq!(material.remaining(now + Duration::seconds(31)).as_secs(), 0);
    }
}
