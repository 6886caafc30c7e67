//! Connection state machine.
//!
//! ```text
//! Pending        --issue-pairing-code-->    PairingReady
//! PairingReady   --refresh-pairing-code-->  PairingReady
//! PairingReady   --code-scanned-->          Pairing
//! PairingReady   --code-expired-->          Expired
//! Pairing        --pairing-succeeded-->     Connected
//! Pairing        --pairing-failed-->        Failed
//! Connected      --link-lost-->             Disconnected
//! Connected      --remote-logout-->         Disconnected (inactive)
//! Disconnected   --remote-logout-->         Disconnected (inactive)
//! Disconnected   --reconnect-succeeded-->   Connected
//! Disconnected   --reconnect-exhausted-->   Failed
//! (any)          --explicit-delete-->       (inactive, deleted)
//! ```
//!
//! [`check`] validates without side effects so callers can reserve a quota
//! slot before a session re-enters the active set; [`apply`] validates and
//! mutates. Inactive sessions accept nothing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::ProtocolIdentity;
use crate::session::{PairingMaterial, Session, SessionStatus};

/// Why a connected link went away.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectReason {
    /// The transport dropped or the remote closed the stream.
    Network,
    /// The health sweep found the client not connected.
    HealthCheck,
    /// The owner asked for the disconnect.
    Requested,
    /// Another client took over the same identity.
    Replaced,
}

impl DisconnectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::HealthCheck => "health_check",
            Self::Requested => "requested",
            Self::Replaced => "replaced",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Transition {
    IssuePairingCode { material: PairingMaterial },
    RefreshPairingCode { material: PairingMaterial },
    CodeScanned,
    CodeExpired,
    PairingSucceeded { identity: ProtocolIdentity },
    PairingFailed { reason: String },
    LinkLost { reason: DisconnectReason },
    RemoteLogout { reason: String },
    ReconnectSucceeded,
    ReconnectExhausted { attempts: u32 },
}

impl Transition {
    pub fn name(&self) -> &'static str {
        match self {
            Self::IssuePairingCode { .. } => "issue-pairing-code",
            Self::RefreshPairingCode { .. } => "refresh-pairing-code",
            Self::CodeScanned => "code-scanned",
            Self::CodeExpired => "code-expired",
            Self::PairingSucceeded { .. } => "pairing-succeeded",
            Self::PairingFailed { .. } => "pairing-failed",
            Self::LinkLost { .. } => "link-lost",
            Self::RemoteLogout { .. } => "remote-logout",
            Self::ReconnectSucceeded => "reconnect-succeeded",
            Self::ReconnectExhausted { .. } => "reconnect-exhausted",
        }
    }
}

impl std::fmt::Display for Transition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Effect of a transition on the owner's quota.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotChange {
    Unchanged,
    /// The session re-enters the active set; a slot must be reserved first.
    Acquire,
    /// The session leaves the active set; its slot is returned.
    Release,
}

/// A validated step through the graph.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Step {
    pub from: SessionStatus,
    pub to: SessionStatus,
    pub slot: SlotChange,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("invalid transition {transition} from {from}: {reason}")]
pub struct InvalidTransition {
    pub from: SessionStatus,
    pub transition: &'static str,
    pub reason: &'static str,
}

/// Target status of `transition` out of `from`, or `None` if the edge does
/// not exist.
pub fn target(from: SessionStatus, transition: &Transition) -> Option<SessionStatus> {
    use SessionStatus::*;
    match (from, transition) {
        (Pending, Transition::IssuePairingCode { .. }) => Some(PairingReady),
        (PairingReady, Transition::RefreshPairingCode { .. }) => Some(PairingReady),
        (PairingReady, Transition::CodeScanned) => Some(Pairing),
        (PairingReady, Transition::CodeExpired) => Some(Expired),
        (Pairing, Transition::PairingSucceeded { .. }) => Some(Connected),
        (Pairing, Transition::PairingFailed { .. }) => Some(Failed),
        (Connected, Transition::LinkLost { .. }) => Some(Disconnected),
        (Connected | Disconnected, Transition::RemoteLogout { .. }) => Some(Disconnected),
        (Disconnected, Transition::ReconnectSucceeded) => Some(Connected),
        (Disconnected, Transition::ReconnectExhausted { .. }) => Some(Failed),
        _ => None,
    }
}

/// Validate `transition` against the session without touching it.
pub fn check(session: &Session, transition: &Transition) -> Result<Step, InvalidTransition> {
    let from = session.status;
    let invalid = |reason| InvalidTransition {
        from,
        transition: transition.name(),
        reason,
    };

    if !session.is_active {
        return Err(invalid("session is inactive"));
    }
    let to = target(from, transition).ok_or_else(|| invalid("not in transition graph"))?;

    if let Transition::PairingSucceeded { identity } = transition {
        if session
            .protocol_identity
            .as_ref()
            .is_some_and(|existing| existing != identity)
        {
            return Err(invalid("protocol identity already assigned"));
        }
    }

    let stays_active = !matches!(transition, Transition::RemoteLogout { .. });
    let before = session.holds_slot();
    let after = stays_active && to.holds_slot();
    let slot = match (before, after) {
        (false, true) => SlotChange::Acquire,
        (true, false) => SlotChange::Release,
        _ => SlotChange::Unchanged,
    };

    Ok(Step { from, to, slot })
}

/// Validate and apply `transition`, updating status, timestamps, pairing
/// material and the identity.
pub fn apply(
    session: &mut Session,
    transition: &Transition,
    now: DateTime<Utc>,
) -> Result<Step, InvalidTransition> {
    let step = check(session, transition)?;

    match transition {
        Transition::IssuePairingCode { material } | Transition::RefreshPairingCode { material } => {
            session.pairing = Some(material.clone());
        }
        Transition::PairingSucceeded { identity } => {
            session.protocol_identity = Some(identity.clone());
            session.connected_at = Some(now);
            session.last_seen_at = Some(now);
        }
        Transition::ReconnectSucceeded => {
            session.connected_at = Some(now);
            session.last_seen_at = Some(now);
        }
        Transition::LinkLost { .. } => {
            session.disconnected_at = Some(now);
        }
        Transition::RemoteLogout { .. } => {
            if step.from == SessionStatus::Connected {
                session.disconnected_at = Some(now);
            }
            session.is_active = false;
        }
        Transition::CodeScanned
        | Transition::CodeExpired
        | Transition::PairingFailed { .. }
        | Transition::ReconnectExhausted { .. } => {}
    }

    if !matches!(step.to, SessionStatus::Pending | SessionStatus::PairingReady) {
        session.pairing = None;
    }
    session.status = step.to;
    session.updated_at = now;
    Ok(step)
}

/// Soft-delete the session. Valid from any status, once.
pub fn mark_deleted(session: &mut Session, now: DateTime<Utc>) -> Result<SlotChange, InvalidTransition> {
    if session.is_deleted() {
        return Err(InvalidTransition {
            from: session.status,
            transition: "explicit-delete",
            reason: "session already deleted",
        });
    }
    let slot = if session.holds_slot() {
        SlotChange::Release
    } else {
        SlotChange::Unchanged
    };
    session.is_active = false;
    session.pairing = None;
    session.deleted_at = Some(now);
    session.updated_at = now;
    Ok(slot)
}

/// Record activity on a session without changing its status.
pub fn touch(session: &mut Session, now: DateTime<Utc>) {
    session.last_seen_at = Some(now);
    session.updated_at = now;
}
