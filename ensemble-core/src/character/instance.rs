//! Character agent instances.

use super::{CharacterAgentType, CharacterProfile, LifecycleStatus};
use crate::backend::InstanceSnapshot;
use crate::error::{Result, RuntimeError};
use crate::id::{InstanceId, QueryId, SceneId};
use crate::memory::{MemoryFilter, MemoryStore};
use crate::schema::PropertyMap;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Debug)]
struct InstanceState {
    status: LifecycleStatus,
    instructions: String,
    scene: Option<SceneId>,
    /// Query currently holding the execution slot
    running: Option<QueryId>,
}

/// One concrete character.
///
/// Identity, profile, type and property values are fixed at creation. Status,
/// instructions and scene membership change through the session. Memory is
/// append-only and only written while the execution slot is held.
#[derive(Debug)]
pub struct CharacterAgentInstance {
    id: InstanceId,
    profile: CharacterProfile,
    agent_type: Arc<CharacterAgentType>,
    properties: PropertyMap,
    created_at: DateTime<Utc>,
    state: RwLock<InstanceState>,
    memory: Arc<MemoryStore>,
    slot: Arc<Mutex<()>>,
}

impl CharacterAgentInstance {
    /// Create an active instance after checking `properties` against the
    /// type's schema. Values are never coerced.
    pub(crate) fn new(
        agent_type: Arc<CharacterAgentType>,
        profile: impl Into<CharacterProfile>,
        properties: PropertyMap,
        instructions: impl Into<String>,
    ) -> Result<Self> {
        let profile = profile.into();
        if profile.name.trim().is_empty() {
            return Err(RuntimeError::InvalidRequest(
                "instance name must not be empty".to_string(),
            ));
        }
        agent_type
            .schema()
            .check_values(&properties)
            .map_err(|source| RuntimeError::SchemaViolation {
                type_id: agent_type.id().clone(),
                source,
            })?;

        let id = InstanceId::new();
        Ok(Self {
            id,
            profile,
            agent_type,
            properties,
            created_at: Utc::now(),
            state: RwLock::new(InstanceState {
                status: LifecycleStatus::Active,
                instructions: instructions.into(),
                scene: None,
                running: None,
            }),
            memory: Arc::new(MemoryStore::new(id)),
            slot: Arc::new(Mutex::new(())),
        })
    }

    /// Rebuild an instance from persisted parts. Properties are re-checked
    /// against the currently registered type.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn restore(
        id: InstanceId,
        agent_type: Arc<CharacterAgentType>,
        profile: CharacterProfile,
        properties: PropertyMap,
        instructions: String,
        status: LifecycleStatus,
        created_at: DateTime<Utc>,
        memory: MemoryStore,
    ) -> Result<Self> {
        let mut instance = Self::new(agent_type, profile, properties, instructions)?;
        instance.id = id;
        instance.created_at = created_at;
        instance.state.get_mut().status = status;
        instance.memory = Arc::new(memory);
        Ok(instance)
    }

    pub fn id(&self) -> InstanceId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.profile.name
    }

    pub fn profile(&self) -> &CharacterProfile {
        &self.profile
    }

    pub fn agent_type(&self) -> &Arc<CharacterAgentType> {
        &self.agent_type
    }

    pub fn properties(&self) -> &PropertyMap {
        &self.properties
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn status(&self) -> LifecycleStatus {
        self.state.read().status
    }

    pub fn is_active(&self) -> bool {
        self.status() == LifecycleStatus::Active
    }

    /// Fail with `InstanceUnavailable` unless the instance is active.
    pub fn ensure_active(&self) -> Result<()> {
        match self.status() {
            LifecycleStatus::Active => Ok(()),
            status => Err(RuntimeError::InstanceUnavailable {
                instance: self.id,
                status,
            }),
        }
    }

    /// The instance's own instruction text.
    pub fn instructions(&self) -> String {
        self.state.read().instructions.clone()
    }

    /// Instructions rendered through the type template.
    pub fn effective_instructions(&self) -> String {
        let instructions = self.instructions();
        self.agent_type
            .render_instructions(&self.profile.name, &instructions)
    }

    /// Open scene this instance is currently part of.
    pub fn current_scene(&self) -> Option<SceneId> {
        self.state.read().scene
    }

    pub fn memory(&self) -> &Arc<MemoryStore> {
        &self.memory
    }

    pub(crate) fn set_status(&self, next: LifecycleStatus) -> Result<LifecycleStatus> {
        let mut state = self.state.write();
        let previous = state.status;
        if !previous.can_transition_to(next) {
            return Err(RuntimeError::InvalidTransition(format!(
                "instance {} cannot go from {previous} to {next}",
                self.id
            )));
        }
        state.status = next;
        Ok(previous)
    }

    pub(crate) fn set_instructions(&self, text: impl Into<String>) -> Result<()> {
        let mut state = self.state.write();
        if state.status == LifecycleStatus::Retired {
            return Err(RuntimeError::InstanceUnavailable {
                instance: self.id,
                status: state.status,
            });
        }
        state.instructions = text.into();
        Ok(())
    }

    /// Check that the instance can join `scene`.
    pub(crate) fn check_can_join(&self) -> Result<()> {
        let state = self.state.read();
        if state.status != LifecycleStatus::Active {
            return Err(RuntimeError::InstanceUnavailable {
                instance: self.id,
                status: state.status,
            });
        }
        if let Some(scene) = state.scene {
            return Err(RuntimeError::InstanceBusy {
                instance: self.id,
                reason: format!("already in open scene {scene}"),
            });
        }
        Ok(())
    }

    /// Record membership in `scene`. Callers check eligibility first, under
    /// the scene table lock.
    pub(crate) fn join_scene(&self, scene: SceneId) {
        self.state.write().scene = Some(scene);
    }

    pub(crate) fn leave_scene(&self, scene: SceneId) {
        let mut state = self.state.write();
        if state.scene == Some(scene) {
            state.scene = None;
        }
    }

    /// Wait for exclusive use of this instance. Waiters are served in
    /// arrival order; the guard releases the slot on drop.
    pub(crate) async fn acquire_slot(&self) -> OwnedMutexGuard<()> {
        self.slot.clone().lock_owned().await
    }

    /// Mark `query` as the one executing on this instance until the returned
    /// guard drops. Only called while the execution slot is held.
    pub(crate) fn begin_query(&self, query: QueryId) -> RunningQuery<'_> {
        self.state.write().running = Some(query);
        RunningQuery {
            instance: self,
            query,
        }
    }

    pub(crate) fn is_running(&self, query: QueryId) -> bool {
        self.state.read().running == Some(query)
    }

    /// Read-only view for the backend, with a memory window drawn through
    /// `filter`.
    pub fn snapshot(&self, filter: &MemoryFilter, window: usize) -> InstanceSnapshot {
        InstanceSnapshot {
            instance_id: self.id,
            profile: self.profile.clone(),
            type_id: self.agent_type.id().clone(),
            type_description: self.agent_type.description().to_string(),
            schema: self.agent_type.schema().clone(),
            properties: self.properties.clone(),
            instructions: self.effective_instructions(),
            memory: self.memory.window(filter, window),
        }
    }
}

/// Clears the running query on drop, including when the dispatch future is
/// dropped or cancelled.
pub(crate) struct RunningQuery<'a> {
    instance: &'a CharacterAgentInstance,
    query: QueryId,
}

impl Drop for RunningQuery<'_> {
    fn drop(&mut self) {
        let mut state = self.instance.state.write();
        if state.running == Some(self.query) {
            state.running = None;
        }
    }
}
