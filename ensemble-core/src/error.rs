//! Error types for the character runtime.
//!
//! Validation failures are reported synchronously and never retried. Backend
//! failures are retried by the dispatcher and only surface once the retry
//! policy is exhausted.

use crate::capability::Operation;
use crate::character::LifecycleStatus;
use crate::id::{InstanceId, QueryId, SceneId, TypeId};
use std::time::Duration;

/// Main error type for runtime operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RuntimeError {
    /// Property values or a trait schema failed validation
    #[error("Schema violation for type '{type_id}': {source}")]
    SchemaViolation {
        type_id: TypeId,
        #[source]
        source: SchemaError,
    },

    /// A type with the same id is already registered, or a snapshot disagrees
    /// with the registered type
    #[error("Type conflict for '{type_id}': {reason}")]
    TypeConflict { type_id: TypeId, reason: String },

    /// The type does not implement the full capability contract
    #[error("Type '{type_id}' does not implement the capability contract, missing {missing:?}")]
    ContractViolation {
        type_id: TypeId,
        missing: Vec<Operation>,
    },

    /// Type lookup miss
    #[error("Unknown character type: {0}")]
    UnknownType(TypeId),

    /// Instance lookup miss
    #[error("Unknown character instance: {0}")]
    UnknownInstance(InstanceId),

    /// Scene lookup miss
    #[error("Unknown scene: {0}")]
    UnknownScene(SceneId),

    /// Memory entry lookup miss
    #[error("Instance {instance} has no memory entry #{sequence}")]
    UnknownMemoryEntry { instance: InstanceId, sequence: u64 },

    /// Instance is not active
    #[error("Instance {instance} is unavailable ({status})")]
    InstanceUnavailable {
        instance: InstanceId,
        status: LifecycleStatus,
    },

    /// Illegal lifecycle, scene, or memory state change
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    /// Instance is already in an open scene or already executing in this call chain
    #[error("Instance {instance} is busy: {reason}")]
    InstanceBusy { instance: InstanceId, reason: String },

    /// Instance is not part of the scene it was asked to act in
    #[error("Instance {instance} is not a participant of scene {scene}")]
    NotParticipant { scene: SceneId, instance: InstanceId },

    /// Request payload is malformed
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Generative backend kept failing after all retries
    #[error("Backend failed for instance {instance} after {attempts} attempt(s): {source}")]
    BackendFailure {
        instance: InstanceId,
        attempts: u32,
        #[source]
        source: BackendError,
    },

    /// The query was cancelled before it committed
    #[error("Query {query} was cancelled")]
    Cancelled { query: QueryId },

    /// Snapshot export/import error
    #[error("Snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),
}

impl RuntimeError {
    /// Whether this error comes from request validation rather than the backend.
    pub fn is_validation(&self) -> bool {
        !matches!(
            self,
            RuntimeError::BackendFailure { .. } | RuntimeError::Cancelled { .. }
        )
    }
}

/// Schema-specific errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SchemaError {
    /// Schema declares no properties
    #[error("schema declares no properties")]
    Empty,

    /// Two properties share a name
    #[error("property '{0}' is declared more than once")]
    DuplicateProperty(String),

    /// A property domain is malformed (inverted range, empty choice set, ...)
    #[error("property '{property}' has an invalid domain: {reason}")]
    InvalidDomain { property: String, reason: String },

    /// Third-party types must meet additional requirements
    #[error("third-party policy: {0}")]
    Policy(String),

    /// Required property not supplied
    #[error("missing property '{0}'")]
    MissingProperty(String),

    /// Property not declared by the schema
    #[error("unexpected property '{0}'")]
    UnexpectedProperty(String),

    /// Value has the wrong kind for the property
    #[error("property '{property}' expects {expected}, got {found}")]
    WrongKind {
        property: String,
        expected: String,
        found: String,
    },

    /// Value lies outside the declared domain
    #[error("property '{property}' value {value} is outside {domain}")]
    OutOfRange {
        property: String,
        value: String,
        domain: String,
    },
}

/// Errors reported by a generative backend
#[derive(Debug, Clone, thiserror::Error)]
pub enum BackendError {
    /// Network/connection error
    #[error("Network error: {0}")]
    Network(String),

    /// Error status from the provider API
    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    /// The invocation exceeded its deadline
    #[error("Backend timed out after {0:?}")]
    Timeout(Duration),

    /// Output could not be interpreted (e.g. no option selected)
    #[error("Malformed backend output: {0}")]
    Malformed(String),

    /// Backend declined to produce content
    #[error("Backend refused: {0}")]
    Refused(String),

    /// Backend is misconfigured
    #[error("Backend configuration error: {0}")]
    Configuration(String),
}

impl BackendError {
    /// Whether another attempt could succeed. A misconfigured backend fails
    /// the same way every time.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, BackendError::Configuration(_))
    }
}

/// Errors from snapshot export/import
#[derive(Debug, Clone, thiserror::Error)]
pub enum SnapshotError {
    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },

    #[error("Session already holds {0} instance(s); import requires an empty session")]
    SessionNotEmpty(usize),

    #[error("Snapshot is inconsistent: {0}")]
    Inconsistent(String),
}

impl From<serde_json::Error> for SnapshotError {
    fn from(err: serde_json::Error) -> Self {
        SnapshotError::Serialization(err.to_string())
    }
}

/// Result type alias for runtime operations
pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Result type for backend invocations
pub type BackendResult<T> = std::result::Result<T, BackendError>;
