//! # Ensemble
//!
//! A runtime for story characters realized as autonomous, stateful agents.
//!
//! ## Core Concepts
//!
//! - **Character type**: an immutable descriptor with a trait schema, an
//!   instruction template, a generative backend and a behavior implementing
//!   the four-operation capability contract (speak, think, choose, answer)
//! - **Instance**: one character built from a type, with its own properties,
//!   instructions, lifecycle status and append-only memory
//! - **Dispatcher**: serializes queries per instance, retries the backend and
//!   commits memory atomically
//! - **Scene**: a bounded episode with a fixed set of participants
//! - **Story session**: the context object owning all of the above
//!
//! ## Example
//!
//! ```rust,ignore
//! use ensemble_core::prelude::*;
//!
//! let session = StorySession::new(RuntimeConfig::default());
//! session.register_builtin_types(backend)?;
//! let sally = session.instantiate(
//!     &"mbti".into(),
//!     CharacterProfile::new("Sally").with_role("protagonist"),
//!     mbti_schema().fill_defaults(PropertyMap::new()),
//!     "Runs the bakery on Mill Street.",
//! )?;
//! let scene = session.open_scene("Morning at the bakery", &[sally])?;
//! let response = session
//!     .advance_turn(scene, sally, CapabilityRequest::speak("Greet the first customer."))
//!     .await?;
//! ```

pub mod backend;
pub mod capability;
pub mod character;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod id;
pub mod logging;
pub mod memory;
pub mod persist;
pub mod scene;
pub mod schema;
pub mod session;
pub mod testing;

pub use config::{RetryPolicy, RuntimeConfig};
pub use error::{BackendError, Result, RuntimeError, SchemaError, SnapshotError};
pub use session::StorySession;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::backend::{GenerationContext, GenerativeBackend, InstanceSnapshot, Participant};
    pub use crate::capability::{
        BackendBehavior, CapabilityRequest, CapabilitySet, CharacterBehavior, Generation, Operation,
    };
    pub use crate::character::builtin::{default_schema, mbti_schema};
    pub use crate::character::{
        CharacterAgentInstance, CharacterAgentType, CharacterProfile, LifecycleStatus, Provenance,
        TypeDescriptor,
    };
    pub use crate::config::{RetryPolicy, RuntimeConfig};
    pub use crate::dispatch::{Dispatcher, Query, Response, ResponseStatus};
    pub use crate::error::*;
    pub use crate::id::*;
    pub use crate::memory::{
        MemoryEntry, MemoryFilter, MemoryKind, MemoryPayload, SceneFilter, ScopeFilter, Visibility,
    };
    pub use crate::persist::SessionSnapshot;
    pub use crate::scene::{Scene, SceneStatus, TurnOutcome, TurnPolicy};
    pub use crate::schema::{PropertyMap, PropertySpec, PropertyValue, TraitSchema};
    pub use crate::session::StorySession;
}
