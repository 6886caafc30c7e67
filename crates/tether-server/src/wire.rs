//! Client-facing JSON shapes.
//!
//! Handlers work on snake_case params and internal types; this module
//! converts in both directions so the wire stays camelCase.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tether_core::session::{PairingMaterial, Session, SessionStatus};

/// Client param keys that arrive in camelCase.
const CAMEL_TO_SNAKE: &[(&str, &str)] = &[
    ("sessionId", "session_id"),
    ("afterSequence", "after_sequence"),
    ("subscriptionId", "subscription_id"),
];

/// Normalize camelCase params to snake_case.
/// If the snake_case key already exists, the existing value takes precedence.
pub fn normalize_params(params: &serde_json::Value) -> serde_json::Value {
    let Some(obj) = params.as_object() else {
        return params.clone();
    };
    let mut result = obj.clone();
    for &(camel, snake) in CAMEL_TO_SNAKE {
        if result.contains_key(snake) {
            result.remove(camel);
        } else if let Some(val) = result.remove(camel) {
            result.insert(snake.to_string(), val);
        }
    }
    serde_json::Value::Object(result)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionView {
    pub session_id: String,
    pub name: String,
    pub status: SessionStatus,
    pub is_active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol_identity: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connected_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disconnected_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_seen_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Session> for SessionView {
    fn from(s: &Session) -> Self {
        Self {
            session_id: s.id.to_string(),
            name: s.name.clone(),
            status: s.status,
            is_active: s.is_active,
            protocol_identity: s.protocol_identity.as_ref().map(|p| p.to_string()),
            connected_at: s.connected_at,
            disconnected_at: s.disconnected_at,
            last_seen_at: s.last_seen_at,
            created_at: s.created_at,
            updated_at: s.updated_at,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PairingView {
    pub code: String,
    pub image: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub expires_in_secs: u64,
    pub retry_count: u32,
}

impl PairingView {
    pub fn at(material: &PairingMaterial, now: DateTime<Utc>) -> Self {
        Self {
            code: material.code.clone(),
            image: material.image.clone(),
            issued_at: material.issued_at,
            expires_at: material.expires_at,
            expires_in_secs: material.remaining(now).as_secs(),
            retry_count: material.retry_count,
        }
    }
}

pub fn session_to_wire(session: &Session) -> serde_json::Value {
    serde_json::to_value(SessionView::from(session)).unwrap_or_default()
}

pub fn pairing_to_wire(material: &PairingMaterial) -> serde_json::Value {
    serde_json::to_value(PairingView::at(material, Utc::now())).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tether_core::ids::{OwnerId, ProtocolIdentity};

    #[test]
    fn camel_keys_are_renamed() {
        let params = serde_json::json!({"sessionId": "sess_1", "afterSequence": 3, "limit": 10});
        let out = normalize_params(&params);
        assert_eq!(out["session_id"], "sess_1");
        assert_eq!(out["after_sequence"], 3);
        assert_eq!(out["limit"], 10);
        assert!(out.get("sessionId").is_none());
    }

    #[test]
    fn snake_key_wins_over_camel() {
        let params = serde_json::json!({"sessionId": "camel", "session_id": "snake"});
        let out = normalize_params(&params);
        assert_eq!(out["session_id"], "snake");
        assert!(out.get("sessionId").is_none());
    }

    #[test]
    fn non_object_params_pass_through() {
        let params = serde_json::json!([1, 2]);
        assert_eq!(normalize_params(&params), params);
    }

    #[test]
    fn session_view_is_camel_case() {
        let mut session = Session::new(OwnerId::from_raw("7"), "phone-A", Utc::now());
        session.protocol_identity = Some(ProtocolIdentity::new("123@s.whatsapp.net"));
        let json = session_to_wire(&session);
        assert_eq!(json["sessionId"], session.id.as_str());
        assert_eq!(json["status"], "pending");
        assert_eq!(json["isActive"], true);
        assert_eq!(json["protocolIdentity"], "123@s.whatsapp.net");
        assert!(json.get("connectedAt").is_none());
        assert!(json.get("owner_id").is_none());
    }

    #[test]
    fn pairing_view_counts_down() {
        let now = Utc::now();
        let material = PairingMaterial {
            code: "2@abc".into(),
            image: "data:image/svg+xml;base64,AAAA".into(),
            issued_at: now,
            expires_at: now + Duration::seconds(30),
            retry_count: 2,
        };
        let view = PairingView::at(&material, now + Duration::seconds(10));
        assert_eq!(view.expires_in_secs, 20);
        let json = serde_json::to_value(view).unwrap();
        assert_eq!(json["retryCount"], 2);
        assert_eq!(json["code"], "2@abc");
    }
}
