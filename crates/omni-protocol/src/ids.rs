//! Typed ID types for the runtime.
//!
//! Session, subscriber and connection ids are opaque String wrappers
//! (serde-transparent). Event ids are plain integers because they are
//! assigned densely by the event stream at append time.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! typed_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create from any string value.
            pub fn from_string(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            /// Create a new ID using UUID v4 (random).
            pub fn new_uuid() -> Self {
                Self(uuid::Uuid::new_v4().simple().to_string())
            }

            /// View as string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new_uuid()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

typed_id!(
    /// Identifier of a session: one sandbox bound to one event stream.
    SessionId
);
typed_id!(
    /// Identifier under which a listener is registered on an event stream.
    SubscriberId
);
typed_id!(
    /// Identifier of one live client connection (a conversation).
    ConnectionId
);

impl SubscriberId {
    /// The runtime consuming actions from the stream.
    pub fn runtime() -> Self {
        Self("runtime".to_owned())
    }

    /// The transport layer forwarding events to clients.
    pub fn server() -> Self {
        Self("server".to_owned())
    }

    /// A top-level driver such as a CLI.
    pub fn main() -> Self {
        Self("main".to_owned())
    }

    pub fn test() -> Self {
        Self("test".to_owned())
    }
}

/// Dense, monotonically increasing position of an event within its stream.
pub type EventId = u64;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_id_new_is_unique() {
        let a = SessionId::new_uuid();
        let b = SessionId::new_uuid();
        assert_ne!(a, b);
        assert!(!a.as_str().contains('-'));
    }

    #[test]
    fn session_id_from_string() {
        let id = SessionId::from_string("test-session");
        assert_eq!(id.as_str(), "test-session");
        assert_eq!(id.to_string(), "test-session");
    }

    #[test]
    fn well_known_subscribers() {
        assert_eq!(SubscriberId::runtime().as_str(), "runtime");
        assert_ne!(SubscriberId::server(), SubscriberId::main());
    }

    #[test]
    fn typed_id_serde_roundtrip() {
        let id = ConnectionId::from_string("conn-1");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"conn-1\"");
        let back: ConnectionId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, back);
    }
}
