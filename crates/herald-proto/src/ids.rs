//! Room, user and device identifiers.
//!
//! Opaque string newtypes. The homeserver owns their grammar; Herald only
//! compares, orders and echoes them back.

use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wrap a raw identifier.
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Borrow the raw identifier.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

string_id!(
    /// Room identifier, e.g. `!abc:example.org`.
    RoomId
);

string_id!(
    /// Fully qualified user identifier, e.g. `@alice:example.org`.
    UserId
);

string_id!(
    /// Device identifier, unique per user.
    DeviceId
);

impl RoomId {
    /// Normalize a room reference given without or with a sigil.
    ///
    /// `abc:x`, `#abc:x` and `!abc:x` all become `!abc:x`.
    pub fn normalize(raw: &str) -> Self {
        Self(format!("!{}", raw.trim_start_matches(['#', '!'])))
    }
}
