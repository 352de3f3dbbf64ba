//! Testing utilities.
//!
//! - `ScriptedBackend` for deterministic tests without API calls
//! - `TestHarness` for building a session with a ready-made character type
//! - Assertion helpers for memory and scene state

use crate::backend::{GenerationContext, GenerativeBackend, InstanceSnapshot};
use crate::capability::{Generation, Operation};
use crate::config::RuntimeConfig;
use crate::character::TypeDescriptor;
use crate::error::{BackendError, BackendResult};
use crate::id::{CallerId, InstanceId, SceneId, TypeId};
use crate::memory::{MemoryFilter, MemoryKind};
use crate::schema::{PropertyMap, PropertySpec, PropertyValue, TraitSchema};
use crate::session::StorySession;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

/// One scripted backend outcome.
#[derive(Debug, Clone)]
pub enum ScriptedStep {
    Reply(Generation),
    Fail(BackendError),
    /// Never respond
    Hang,
}

/// What the backend was asked to do.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub instance: InstanceId,
    pub name: String,
    pub operation: Operation,
    pub caller: CallerId,
    pub scene: Option<SceneId>,
    pub attempt: u32,
    /// Size of the memory window the backend received
    pub memory_len: usize,
    pub call_chain: Vec<InstanceId>,
    pub system_prompt: String,
    pub prompt: String,
}

/// A backend that replays a script.
///
/// Steps are consumed in order across all instances. With the script empty
/// it answers `"<name> <operation> #<n>"`, picking the first option for
/// `choose`.
pub struct ScriptedBackend {
    name: String,
    steps: Mutex<VecDeque<ScriptedStep>>,
    delay: Option<Duration>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl Default for ScriptedBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::named("scripted")
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Mutex::new(VecDeque::new()),
            delay: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Sleep before every response.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn push(&self, step: ScriptedStep) {
        self.steps.lock().push_back(step);
    }

    /// Queue a plain text reply.
    pub fn reply(&self, text: impl Into<String>) {
        self.push(ScriptedStep::Reply(Generation::text(text)));
    }

    pub fn reply_with(&self, generation: Generation) {
        self.push(ScriptedStep::Reply(generation));
    }

    pub fn fail(&self, error: BackendError) {
        self.push(ScriptedStep::Fail(error));
    }

    pub fn hang(&self) {
        self.push(ScriptedStep::Hang);
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn last_call(&self) -> Option<RecordedCall> {
        self.calls.lock().last().cloned()
    }

    pub fn remaining_steps(&self) -> usize {
        self.steps.lock().len()
    }
}

#[async_trait]
impl GenerativeBackend for ScriptedBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn generate(
        &self,
        snapshot: &InstanceSnapshot,
        context: &GenerationContext,
    ) -> BackendResult<Generation> {
        let call_number = {
            let mut calls = self.calls.lock();
            calls.push(RecordedCall {
                instance: snapshot.instance_id,
                name: snapshot.name().to_string(),
                operation: context.operation(),
                caller: context.caller.clone(),
                scene: context.scene,
                attempt: context.attempt,
                memory_len: snapshot.memory.len(),
                call_chain: context.call_chain.clone(),
                system_prompt: snapshot.system_prompt(),
                prompt: context.render_request(),
            });
            calls.len()
        };
        let step = self.steps.lock().pop_front();

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        match step {
            Some(ScriptedStep::Reply(generation)) => Ok(generation),
            Some(ScriptedStep::Fail(error)) => Err(error),
            Some(ScriptedStep::Hang) => std::future::pending().await,
            None => {
                let operation = context.operation();
                let generation =
                    Generation::text(format!("{} {} #{call_number}", snapshot.name(), operation));
                Ok(match operation {
                    Operation::Choose => generation.with_selected(0),
                    _ => generation,
                })
            }
        }
    }
}

/// Type id registered by [`TestHarness`].
pub const ARCHETYPE: &str = "archetype";

/// A session with one `archetype` type (`extroversion`, real in [0, 1])
/// backed by a shared [`ScriptedBackend`].
pub struct TestHarness {
    pub session: StorySession,
    pub backend: Arc<ScriptedBackend>,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_config(RuntimeConfig::default())
    }

    pub fn with_config(config: RuntimeConfig) -> Self {
        Self::with_backend(config, ScriptedBackend::new())
    }

    pub fn with_backend(config: RuntimeConfig, backend: ScriptedBackend) -> Self {
        let backend = Arc::new(backend);
        let session = StorySession::new(config);
        let schema = archetype_schema();
        session
            .register_type(TypeDescriptor::new(ARCHETYPE, schema, backend.clone()))
            .expect("archetype registers on a fresh session");
        Self { session, backend }
    }

    pub fn type_id(&self) -> TypeId {
        TypeId::new(ARCHETYPE)
    }

    /// Instantiate an archetype character.
    pub fn spawn(&self, name: &str, extroversion: f64) -> crate::error::Result<InstanceId> {
        self.session
            .instantiate(&self.type_id(), name, extroversion_props(extroversion), "")
    }

    pub fn memory_kinds(&self, id: InstanceId) -> Vec<MemoryKind> {
        self.session
            .read_memory(id, MemoryFilter::all())
            .map(|read| read.iter().map(|e| e.kind).collect())
            .unwrap_or_default()
    }

    pub fn memory_len(&self, id: InstanceId) -> usize {
        self.session
            .instance(id)
            .map(|i| i.memory().len())
            .unwrap_or(0)
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

/// Schema with a single `extroversion` real in [0, 1].
pub fn archetype_schema() -> TraitSchema {
    TraitSchema::new().with_property(
        PropertySpec::real("extroversion", 0.0, 1.0).with_description("How outgoing"),
    )
}

pub fn extroversion_props(value: f64) -> PropertyMap {
    PropertyMap::from([("extroversion".to_string(), PropertyValue::Real(value))])
}

/// Assert that an instance's memory holds exactly `expected` entries.
pub fn assert_memory_len(harness: &TestHarness, id: InstanceId, expected: usize) {
    let actual = harness.memory_len(id);
    assert_eq!(
        actual, expected,
        "Expected {expected} memory entries for {id}, found {actual}"
    );
}

/// Assert that sequence numbers run 0..n without gaps.
pub fn assert_contiguous_memory(harness: &TestHarness, id: InstanceId) {
    let read = harness
        .session
        .read_memory(id, MemoryFilter::all())
        .unwrap_or_else(|e| panic!("Cannot read memory of {id}: {e}"));
    for (position, entry) in read.iter().enumerate() {
        assert_eq!(
            entry.sequence, position as u64,
            "Memory of {id} has a gap at position {position}"
        );
    }
}
