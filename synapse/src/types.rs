//! Shared Identifier Types
//!
//! Newtype string identifiers used across the coordination fabric. All ids are
//! uuid-v4 strings by default but accept arbitrary strings for interop with
//! external registries.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! string_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(String);

        impl $name {
            /// Create a new unique id
            pub fn new() -> Self {
                Self(Uuid::new_v4().to_string())
            }

            /// Create from string (for deserialization/testing)
            pub fn from_string(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            /// Borrow the underlying string
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
    };
}

string_id! {
    /// Unique identifier for an agent
    AgentId
}

string_id! {
    /// Unique identifier for a coordination session
    SessionId
}

string_id! {
    /// Unique identifier for a message within a session
    MessageId
}

string_id! {
    /// Unique identifier for a consensus round
    RoundId
}

string_id! {
    /// Unique identifier for an emergent insight
    InsightId
}

string_id! {
    /// Unique identifier for a record in the audit store
    RecordId
}

impl AgentId {
    /// System agent id used for fabric-generated messages
    pub fn system() -> Self {
        Self("system".to_string())
    }
}
