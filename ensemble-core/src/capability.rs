//! The capability contract shared by every character type.
//!
//! Every type implements exactly four operations: speak, think, choose and
//! answer. The dispatcher invokes them uniformly through [`CharacterBehavior`],
//! so built-in, user-defined and third-party types are interchangeable.

use crate::backend::{GenerationContext, GenerativeBackend, InstanceSnapshot};
use crate::error::{BackendError, BackendResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// One operation of the capability contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    /// Produce dialogue in the current scene
    Speak,
    /// Produce a private thought
    Think,
    /// Pick one of an enumerated set of options
    Choose,
    /// Answer a question from another agent
    Answer,
}

impl Operation {
    /// The complete contract.
    pub const ALL: [Operation; 4] = [
        Operation::Speak,
        Operation::Think,
        Operation::Choose,
        Operation::Answer,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Speak => "speak",
            Operation::Think => "think",
            Operation::Choose => "choose",
            Operation::Answer => "answer",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Set of operations a type claims to implement.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CapabilitySet(BTreeSet<Operation>);

impl CapabilitySet {
    /// All four operations.
    pub fn full() -> Self {
        Self(Operation::ALL.into_iter().collect())
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with(mut self, operation: Operation) -> Self {
        self.0.insert(operation);
        self
    }

    pub fn without(mut self, operation: Operation) -> Self {
        self.0.remove(&operation);
        self
    }

    pub fn contains(&self, operation: Operation) -> bool {
        self.0.contains(&operation)
    }

    /// Contract operations absent from this set.
    pub fn missing(&self) -> Vec<Operation> {
        Operation::ALL
            .into_iter()
            .filter(|op| !self.0.contains(op))
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        self.missing().is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = Operation> + '_ {
        self.0.iter().copied()
    }
}

/// Payload of a capability invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum CapabilityRequest {
    /// Say something; `prompt` describes what the line should address
    Speak { prompt: String },
    /// Reflect privately on a situation
    Think { situation: String },
    /// Decide between options
    Choose {
        options: Vec<String>,
        #[serde(default)]
        context: String,
    },
    /// Answer a question posed by the caller
    Answer { question: String },
}

impl CapabilityRequest {
    pub fn speak(prompt: impl Into<String>) -> Self {
        CapabilityRequest::Speak {
            prompt: prompt.into(),
        }
    }

    pub fn think(situation: impl Into<String>) -> Self {
        CapabilityRequest::Think {
            situation: situation.into(),
        }
    }

    pub fn choose<S: Into<String>>(
        options: impl IntoIterator<Item = S>,
        context: impl Into<String>,
    ) -> Self {
        CapabilityRequest::Choose {
            options: options.into_iter().map(Into::into).collect(),
            context: context.into(),
        }
    }

    pub fn answer(question: impl Into<String>) -> Self {
        CapabilityRequest::Answer {
            question: question.into(),
        }
    }

    pub fn operation(&self) -> Operation {
        match self {
            CapabilityRequest::Speak { .. } => Operation::Speak,
            CapabilityRequest::Think { .. } => Operation::Think,
            CapabilityRequest::Choose { .. } => Operation::Choose,
            CapabilityRequest::Answer { .. } => Operation::Answer,
        }
    }

    /// Check the payload before anything is dispatched.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            CapabilityRequest::Choose { options, .. } => {
                if options.is_empty() {
                    return Err("choose requires at least one option".to_string());
                }
                if options.iter().any(|o| o.trim().is_empty()) {
                    return Err("choose options must not be blank".to_string());
                }
            }
            CapabilityRequest::Answer { question } => {
                if question.trim().is_empty() {
                    return Err("answer requires a question".to_string());
                }
            }
            CapabilityRequest::Speak { .. } | CapabilityRequest::Think { .. } => {}
        }
        Ok(())
    }
}

/// Content produced by a behavior for one invocation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Generation {
    /// Text of the line, thought, decision rationale or answer
    pub content: String,
    /// Index into the option set, for `choose`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected: Option<usize>,
    /// Optional mood tag reported by the backend
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub emotional_state: Option<String>,
}

impl Generation {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn with_selected(mut self, index: usize) -> Self {
        self.selected = Some(index);
        self
    }

    pub fn with_emotional_state(mut self, state: impl Into<String>) -> Self {
        self.emotional_state = Some(state.into());
        self
    }
}

/// Polymorphic implementation of the capability contract.
///
/// A behavior decides how each operation uses the type's backend. Rust makes
/// all four methods mandatory; [`CharacterBehavior::capabilities`] is the
/// declared claim that registration checks against the contract.
#[async_trait]
pub trait CharacterBehavior: Send + Sync {
    /// Operations this behavior claims to implement.
    fn capabilities(&self) -> CapabilitySet {
        CapabilitySet::full()
    }

    async fn speak(
        &self,
        snapshot: &InstanceSnapshot,
        context: &GenerationContext,
        backend: &dyn GenerativeBackend,
    ) -> BackendResult<Generation>;

    async fn think(
        &self,
        snapshot: &InstanceSnapshot,
        context: &GenerationContext,
        backend: &dyn GenerativeBackend,
    ) -> BackendResult<Generation>;

    async fn choose(
        &self,
        snapshot: &InstanceSnapshot,
        context: &GenerationContext,
        backend: &dyn GenerativeBackend,
    ) -> BackendResult<Generation>;

    async fn answer(
        &self,
        snapshot: &InstanceSnapshot,
        context: &GenerationContext,
        backend: &dyn GenerativeBackend,
    ) -> BackendResult<Generation>;
}

/// Route a context to the matching behavior method.
pub async fn invoke(
    behavior: &dyn CharacterBehavior,
    snapshot: &InstanceSnapshot,
    context: &GenerationContext,
    backend: &dyn GenerativeBackend,
) -> BackendResult<Generation> {
    match context.operation() {
        Operation::Speak => behavior.speak(snapshot, context, backend).await,
        Operation::Think => behavior.think(snapshot, context, backend).await,
        Operation::Choose => behavior.choose(snapshot, context, backend).await,
        Operation::Answer => behavior.answer(snapshot, context, backend).await,
    }
}

/// Behavior that hands every operation to the backend unchanged, resolving
/// the selected option for `choose`.
#[derive(Debug, Clone, Copy, Default)]
pub struct BackendBehavior;

#[async_trait]
impl CharacterBehavior for BackendBehavior {
    async fn speak(
        &self,
        snapshot: &InstanceSnapshot,
        context: &GenerationContext,
        backend: &dyn GenerativeBackend,
    ) -> BackendResult<Generation> {
        backend.generate(snapshot, context).await
    }

    async fn think(
        &self,
        snapshot: &InstanceSnapshot,
        context: &GenerationContext,
        backend: &dyn GenerativeBackend,
    ) -> BackendResult<Generation> {
        backend.generate(snapshot, context).await
    }

    async fn choose(
        &self,
        snapshot: &InstanceSnapshot,
        context: &GenerationContext,
        backend: &dyn GenerativeBackend,
    ) -> BackendResult<Generation> {
        let options = match &context.request {
            CapabilityRequest::Choose { options, .. } => options,
            other => {
                return Err(BackendError::Malformed(format!(
                    "choose invoked with a {} request",
                    other.operation()
                )))
            }
        };
        let mut generation = backend.generate(snapshot, context).await?;
        let index = resolve_selection(&generation, options)?;
        generation.selected = Some(index);
        Ok(generation)
    }

    async fn answer(
        &self,
        snapshot: &InstanceSnapshot,
        context: &GenerationContext,
        backend: &dyn GenerativeBackend,
    ) -> BackendResult<Generation> {
        backend.generate(snapshot, context).await
    }
}

/// Work out which option a generation picked.
///
/// An explicit index wins. Otherwise the content may start with a 1-based
/// option number, or name exactly one option.
pub fn resolve_selection(generation: &Generation, options: &[String]) -> BackendResult<usize> {
    if let Some(index) = generation.selected {
        if index < options.len() {
            return Ok(index);
        }
        return Err(BackendError::Malformed(format!(
            "selected option {index} but only {} offered",
            options.len()
        )));
    }

    let content = generation.content.trim();
    let leading: String = content.chars().take_while(|c| c.is_ascii_digit()).collect();
    if let Ok(number) = leading.parse::<usize>() {
        if (1..=options.len()).contains(&number) {
            return Ok(number - 1);
        }
    }

    let lower = content.to_lowercase();
    let named: Vec<usize> = options
        .iter()
        .enumerate()
        .filter(|(_, option)| lower.contains(&option.to_lowercase()))
        .map(|(i, _)| i)
        .collect();
    match named.as_slice() {
        [single] => Ok(*single),
        [] => Err(BackendError::Malformed(
            "decision does not name any offered option".to_string(),
        )),
        _ => Err(BackendError::Malformed(
            "decision names more than one option".to_string(),
        )),
    }
}
