//! Typed string ids for the core domain entities.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn from_string(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

string_id!(
    /// Identifier of a conversation row.
    ConversationId
);
string_id!(
    /// Identifier of a message row. Client-generated temporary ids carry a
    /// `tmp-` prefix until the server assigns the real id.
    MessageId
);
string_id!(
    /// Identifier of a user.
    UserId
);

/// Prefix distinguishing client-generated temporary ids from server ids.
const TEMP_ID_PREFIX: &str = "tmp-";

impl MessageId {
    /// Generates a fresh temporary id for an optimistic message.
    pub fn temporary() -> Self {
        Self(format!("{TEMP_ID_PREFIX}{}", uuid::Uuid::new_v4()))
    }

    /// Whether this id was generated locally and is awaiting server
    /// confirmation.
    pub fn is_temporary(&self) -> bool {
        self.0.starts_with(TEMP_ID_PREFIX)
    }
}
