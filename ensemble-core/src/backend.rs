//! Generative backend contract.
//!
//! The runtime never produces text itself. Each character type carries a
//! [`GenerativeBackend`] that turns a read-only [`InstanceSnapshot`] plus a
//! [`GenerationContext`] into a [`Generation`].

use crate::capability::{CapabilityRequest, Generation, Operation};
use crate::character::CharacterProfile;
use crate::error::BackendResult;
use crate::id::{CallerId, InstanceId, QueryId, SceneId, TypeId};
use crate::memory::MemoryEntry;
use crate::schema::{PropertyMap, TraitSchema};
use async_trait::async_trait;
use std::fmt::Write as _;
use std::sync::Arc;

/// Pluggable text generator.
#[async_trait]
pub trait GenerativeBackend: Send + Sync {
    /// Provider name, used in logs.
    fn name(&self) -> &str;

    /// Produce content for one capability invocation.
    async fn generate(
        &self,
        snapshot: &InstanceSnapshot,
        context: &GenerationContext,
    ) -> BackendResult<Generation>;
}

/// Read-only view of an instance handed to the backend.
#[derive(Debug, Clone)]
pub struct InstanceSnapshot {
    pub instance_id: InstanceId,
    pub profile: CharacterProfile,
    pub type_id: TypeId,
    pub type_description: String,
    pub schema: TraitSchema,
    pub properties: PropertyMap,
    /// Type template rendered with the instance's own instructions
    pub instructions: String,
    /// Bounded window of live memories, oldest first
    pub memory: Vec<Arc<MemoryEntry>>,
}

impl InstanceSnapshot {
    pub fn name(&self) -> &str {
        &self.profile.name
    }

    /// Describe the character: profile first, then one line per trait.
    pub fn persona_summary(&self) -> String {
        let mut out = format!("{} is a {} character.", self.name(), self.type_id);
        if !self.type_description.is_empty() {
            let _ = write!(out, " {}", self.type_description);
        }
        let profile = self.profile.render();
        if !profile.is_empty() {
            let _ = write!(out, "\n{profile}");
        }
        for spec in self.schema.properties() {
            let Some(value) = self.properties.get(&spec.name) else {
                continue;
            };
            let _ = write!(out, "\n- {}: {}", spec.name, value);
            if let Some(description) = &spec.description {
                let _ = write!(out, " ({description})");
            }
        }
        out
    }

    /// Memory window rendered one entry per line.
    pub fn memory_digest(&self) -> String {
        self.memory
            .iter()
            .map(|entry| format!("[{}] {}", entry.sequence, entry.summary()))
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// System prompt combining instructions, persona and memory.
    pub fn system_prompt(&self) -> String {
        let mut prompt = self.instructions.clone();
        let _ = write!(prompt, "\n\n{}", self.persona_summary());
        if !self.memory.is_empty() {
            let _ = write!(prompt, "\n\nWhat you remember:\n{}", self.memory_digest());
        }
        prompt
    }
}

/// Another character present in the scene.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Participant {
    pub id: InstanceId,
    pub name: String,
}

/// Everything a behavior knows about the invocation it is serving.
#[derive(Debug, Clone)]
pub struct GenerationContext {
    pub query_id: QueryId,
    /// The instance being invoked
    pub target: InstanceId,
    pub caller: CallerId,
    pub request: CapabilityRequest,
    pub scene: Option<SceneId>,
    /// Other participants of the scene, excluding the target
    pub participants: Vec<Participant>,
    /// Instances already executing further up this query's call chain,
    /// including the target
    pub call_chain: Vec<InstanceId>,
    /// 1-based attempt number
    pub attempt: u32,
}

impl GenerationContext {
    pub fn operation(&self) -> Operation {
        self.request.operation()
    }

    /// The request phrased as a user turn.
    pub fn render_request(&self) -> String {
        let mut out = String::new();
        if !self.participants.is_empty() {
            let names: Vec<&str> = self.participants.iter().map(|p| p.name.as_str()).collect();
            let _ = writeln!(out, "Also present: {}.", names.join(", "));
        }
        match &self.request {
            CapabilityRequest::Speak { prompt } => {
                let _ = write!(out, "Say your next line in the scene. {prompt}");
            }
            CapabilityRequest::Think { situation } => {
                let _ = write!(
                    out,
                    "Think privately about the situation. Nobody will hear this. {situation}"
                );
            }
            CapabilityRequest::Choose { options, context } => {
                if !context.is_empty() {
                    let _ = writeln!(out, "{context}");
                }
                let _ = writeln!(out, "Choose exactly one option:");
                for (i, option) in options.iter().enumerate() {
                    let _ = writeln!(out, "{}. {option}", i + 1);
                }
                let _ = write!(out, "Reply with the option number first, then your reasoning.");
            }
            CapabilityRequest::Answer { question } => {
                let _ = write!(out, "{} asks you: \"{question}\" Answer in character.", self.caller);
            }
        }
        out.trim().to_string()
    }
}
