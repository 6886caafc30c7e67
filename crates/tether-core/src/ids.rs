use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

macro_rules! branded_id {
    ($name:ident, $prefix:expr) => {
        #[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new() -> Self {
                Self(format!("{}_{}", $prefix, Uuid::now_v7()))
            }

            pub fn from_raw(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = std::convert::Infallible;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(s.to_owned()))
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

branded_id!(SessionId, "sess");
branded_id!(EventId, "evt");
branded_id!(SubscriberId, "sub");

// Owners are assigned by the embedding application and are normally built
// with `OwnerId::from_raw`; `new()` exists for tests.
branded_id!(OwnerId, "owner");

/// Stable identifier of the paired remote identity (e.g. a phone JID).
/// Assigned by the protocol library once pairing succeeds.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProtocolIdentity(String);

impl ProtocolIdentity {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProtocolIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_id_has_prefix() {
        let id = SessionId::new();
        assert!(id.as_str().starts_with("sess_"), "got: {id}");
    }

    #[test]
    fn event_and_subscriber_prefixes() {
        assert!(EventId::new().as_str().starts_with("evt_"));
        assert!(SubscriberId::new().as_str().starts_with("sub_"));
    }

    #[test]
    fn owner_id_from_raw_preserves_value() {
        let owner = OwnerId::from_raw("1");
        assert_eq!(owner.as_str(), "1");
        assert_eq!(owner.to_string(), "1");
    }

    #[test]
    fn ids_are_unique_and_monotonic() {
        let ids: Vec<SessionId> = (0..50).map(|_| SessionId::new()).collect();
        for w in ids.windows(2) {
            assert!(w[0] < w[1], "not monotonic: {} >= {}", w[0], w[1]);
        }
    }

    #[test]
    fn serde_is_transparent() {
        let id = SessionId::from_raw("sess_abc");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"sess_abc\"");
        let identity = ProtocolIdentity::new("15551234567@s.whatsapp.net");
        let json = serde_json::to_string(&identity).unwrap();
        let parsed: ProtocolIdentity = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, identity);
    }
}
