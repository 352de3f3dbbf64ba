//! Character agent types and instances.
//!
//! A [`CharacterAgentType`] is an immutable descriptor: trait schema,
//! instruction template, backend and behavior. A [`CharacterAgentInstance`] is
//! one concrete character built from a type, with its own property values,
//! instructions, lifecycle status and memory.

pub mod agent_type;
pub mod builtin;
pub mod instance;
pub mod profile;
pub mod registry;

pub use agent_type::{CharacterAgentType, Provenance, TypeDescriptor, DEFAULT_TEMPLATE};
pub use instance::CharacterAgentInstance;
pub use profile::CharacterProfile;
pub use registry::{InstanceRegistry, TypeRegistry};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle status of an instance.
///
/// Active instances take part in scenes and receive queries. Dormant ones are
/// parked but keep their memory. Retired is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleStatus {
    Active,
    Dormant,
    Retired,
}

impl LifecycleStatus {
    /// Whether moving from `self` to `next` is allowed.
    pub fn can_transition_to(self, next: LifecycleStatus) -> bool {
        use LifecycleStatus::*;
        matches!(
            (self, next),
            (Active, Dormant) | (Dormant, Active) | (Active, Retired) | (Dormant, Retired)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleStatus::Active => "active",
            LifecycleStatus::Dormant => "dormant",
            LifecycleStatus::Retired => "retired",
        }
    }
}

impl fmt::Display for LifecycleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
