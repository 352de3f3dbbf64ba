//! Identifier types for the character runtime.
//!
//! Runtime-generated identities are UUID newtypes so an `InstanceId` can never
//! be passed where a `SceneId` is expected. Character types are authored by
//! hand and keep a human-readable string id instead.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Defines a UUID-backed identifier with the common conversions.
macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Create a new random ID.
            #[inline]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Wrap an existing UUID.
            #[inline]
            pub const fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Get the underlying UUID.
            #[inline]
            pub const fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), &self.0.to_string()[..8])
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(Uuid::parse_str(s)?))
            }
        }
    };
}

define_id!(
    /// Unique identifier for a character agent instance.
    InstanceId
);

define_id!(
    /// Unique identifier for a scene.
    SceneId
);

define_id!(
    /// Unique identifier for a dispatched query.
    QueryId
);

define_id!(
    /// Unique identifier for a story session.
    SessionId
);

/// Identifier of a registered character agent type, e.g. `"mbti"`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TypeId(String);

impl TypeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TypeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TypeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Who issued a query.
///
/// Characters can ask each other questions, so a caller is either the story
/// runtime itself, a named agent outside the character set (narrator,
/// architect), or another character instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum CallerId {
    /// The runtime acting on its own behalf.
    Story,
    /// An agent that is not a character, such as the narrator.
    Agent(String),
    /// A character instance.
    Character(InstanceId),
}

impl CallerId {
    /// Shorthand for a named non-character agent.
    pub fn agent(name: impl Into<String>) -> Self {
        CallerId::Agent(name.into())
    }

    /// The instance id when the caller is a character.
    pub fn as_character(&self) -> Option<InstanceId> {
        match self {
            CallerId::Character(id) => Some(*id),
            _ => None,
        }
    }
}

impl fmt::Display for CallerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallerId::Story => write!(f, "story"),
            CallerId::Agent(name) => write!(f, "agent:{name}"),
            CallerId::Character(id) => write!(f, "character:{id}"),
        }
    }
}
