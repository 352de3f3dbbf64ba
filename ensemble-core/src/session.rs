//! Story session: the context object owning every registry.
//!
//! A session is constructed explicitly and passed around; nothing here is
//! global. Authoring collaborators drive it through this API.

use crate::backend::GenerativeBackend;
use crate::capability::CapabilityRequest;
use crate::character::{
    builtin, CharacterAgentInstance, CharacterAgentType, CharacterProfile, InstanceRegistry,
    LifecycleStatus, TypeDescriptor, TypeRegistry,
};
use crate::config::RuntimeConfig;
use crate::dispatch::{Dispatcher, Query, Response};
use crate::error::{Result, RuntimeError};
use crate::id::{CallerId, InstanceId, SceneId, SessionId, TypeId};
use crate::memory::{MemoryFilter, MemoryRead, NewMemory};
use crate::scene::{Scene, SceneBook, TurnPolicy, TurnRecord, TurnTicket};
use crate::schema::PropertyMap;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::sync::Arc;
use tracing::{info, instrument};

/// Result of one participant's turn within a round.
pub type RoundResult = Vec<(InstanceId, Result<Response>)>;

/// The story runtime.
#[derive(Debug)]
pub struct StorySession {
    pub(crate) id: SessionId,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) config: RuntimeConfig,
    pub(crate) types: TypeRegistry,
    pub(crate) instances: Arc<InstanceRegistry>,
    pub(crate) scenes: SceneBook,
    pub(crate) dispatcher: Dispatcher,
}

impl Default for StorySession {
    fn default() -> Self {
        Self::new(RuntimeConfig::default())
    }
}

impl StorySession {
    pub fn new(config: RuntimeConfig) -> Self {
        let instances = Arc::new(InstanceRegistry::new());
        let dispatcher = Dispatcher::new(instances.clone(), config.clone());
        Self {
            id: SessionId::new(),
            created_at: Utc::now(),
            config,
            types: TypeRegistry::new(),
            instances,
            scenes: SceneBook::new(),
            dispatcher,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    /// When this session object was created. Not carried over by import.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Handle for issuing queries, e.g. from inside a backend.
    pub fn dispatcher(&self) -> Dispatcher {
        self.dispatcher.clone()
    }

    // ========================================================================
    // Types
    // ========================================================================

    pub fn register_type(&self, descriptor: TypeDescriptor) -> Result<TypeId> {
        self.types.register(descriptor)
    }

    /// Register the `default` and `mbti` types backed by `backend`.
    pub fn register_builtin_types(
        &self,
        backend: Arc<dyn GenerativeBackend>,
    ) -> Result<Vec<TypeId>> {
        builtin::all(backend)
            .into_iter()
            .map(|descriptor| self.types.register(descriptor))
            .collect()
    }

    pub fn agent_type(&self, id: &TypeId) -> Result<Arc<CharacterAgentType>> {
        self.types.get(id)
    }

    pub fn types(&self) -> Vec<Arc<CharacterAgentType>> {
        self.types.list()
    }

    // ========================================================================
    // Instances
    // ========================================================================

    /// Create an active instance of a registered type.
    ///
    /// `profile` is a full [`CharacterProfile`] or just a name.
    pub fn instantiate(
        &self,
        type_id: &TypeId,
        profile: impl Into<CharacterProfile>,
        properties: PropertyMap,
        instructions: impl Into<String>,
    ) -> Result<InstanceId> {
        let agent_type = self.types.get(type_id)?;
        let instance = CharacterAgentInstance::new(agent_type, profile, properties, instructions)?;
        let instance = self.instances.insert(instance);
        info!(instance = %instance.id(), name = instance.name(), type_id = %type_id, "Instantiated character");
        Ok(instance.id())
    }

    pub fn instance(&self, id: InstanceId) -> Result<Arc<CharacterAgentInstance>> {
        self.instances.get(id)
    }

    /// Oldest instance with this name.
    pub fn find_instance(&self, name: &str) -> Option<Arc<CharacterAgentInstance>> {
        self.instances.find_by_name(name)
    }

    pub fn find_instances(&self, name: &str) -> Vec<Arc<CharacterAgentInstance>> {
        self.instances.find_all_by_name(name)
    }

    pub fn instances(&self) -> Vec<Arc<CharacterAgentInstance>> {
        self.instances.list()
    }

    pub fn set_status(&self, id: InstanceId, status: LifecycleStatus) -> Result<()> {
        let instance = self.instances.get(id)?;
        let previous = instance.set_status(status)?;
        info!(instance = %id, from = %previous, to = %status, "Lifecycle transition");
        Ok(())
    }

    pub fn set_instructions(&self, id: InstanceId, text: impl Into<String>) -> Result<()> {
        self.instances.get(id)?.set_instructions(text)
    }

    // ========================================================================
    // Memory
    // ========================================================================

    /// Lazy read over an instance's memory. Works in every lifecycle state.
    pub fn read_memory(&self, id: InstanceId, filter: MemoryFilter) -> Result<MemoryRead> {
        Ok(self.instances.get(id)?.memory().read(filter))
    }

    /// Place authored knowledge into an instance's memory, outside any scene.
    pub async fn inject_knowledge(&self, id: InstanceId, text: impl Into<String>) -> Result<u64> {
        self.append_memory(id, NewMemory::injected_knowledge(text)).await
    }

    /// Record a fact the instance learned, optionally tied to a scene.
    pub async fn record_fact(
        &self,
        id: InstanceId,
        scene: Option<SceneId>,
        text: impl Into<String>,
    ) -> Result<u64> {
        if let Some(scene) = scene {
            self.scenes.get(scene)?;
        }
        self.append_memory(id, NewMemory::fact(text).in_scene(scene))
            .await
    }

    /// Supersede an earlier entry. History is kept.
    pub async fn redact(
        &self,
        id: InstanceId,
        sequence: u64,
        reason: Option<String>,
    ) -> Result<u64> {
        let instance = self.writable(id)?;
        let _slot = instance.acquire_slot().await;
        let marker = instance.memory().redact(sequence, reason)?;
        info!(instance = %id, target = sequence, marker = marker.sequence, "Memory redacted");
        Ok(marker.sequence)
    }

    async fn append_memory(&self, id: InstanceId, draft: NewMemory) -> Result<u64> {
        let instance = self.writable(id)?;
        let _slot = instance.acquire_slot().await;
        Ok(instance.memory().append(draft)?.sequence)
    }

    fn writable(&self, id: InstanceId) -> Result<Arc<CharacterAgentInstance>> {
        let instance = self.instances.get(id)?;
        if instance.status() == LifecycleStatus::Retired {
            return Err(RuntimeError::InstanceUnavailable {
                instance: id,
                status: LifecycleStatus::Retired,
            });
        }
        Ok(instance)
    }

    // ========================================================================
    // Scenes
    // ========================================================================

    /// Open a scene with the configured default turn policy.
    pub fn open_scene(
        &self,
        title: impl Into<String>,
        participants: &[InstanceId],
    ) -> Result<SceneId> {
        self.open_scene_with_policy(title, participants, self.config.turn_policy)
    }

    pub fn open_scene_with_policy(
        &self,
        title: impl Into<String>,
        participants: &[InstanceId],
        policy: TurnPolicy,
    ) -> Result<SceneId> {
        let instances = participants
            .iter()
            .map(|id| self.instances.get(*id))
            .collect::<Result<Vec<_>>>()?;
        self.scenes.open(title.into(), instances, policy)
    }

    pub fn close_scene(&self, id: SceneId) -> Result<()> {
        self.scenes.close(id, |p| self.instances.get(p).ok())
    }

    pub fn scene(&self, id: SceneId) -> Result<Scene> {
        self.scenes.get(id)
    }

    pub fn scenes(&self) -> Vec<Scene> {
        self.scenes.list()
    }

    /// Have `instance` act in `scene`. The turn is logged whatever happens
    /// once the scene and participant checks pass.
    #[instrument(skip(self, request), fields(operation = %request.operation()))]
    pub async fn advance_turn(
        &self,
        scene: SceneId,
        instance: InstanceId,
        request: CapabilityRequest,
    ) -> Result<Response> {
        let ticket = self.scenes.ticket(scene, instance)?;
        let _turn = match ticket.policy {
            TurnPolicy::Sequential => Some(ticket.turn_lock.clone().lock_owned().await),
            TurnPolicy::Free => None,
        };
        self.play_turn(scene, instance, request).await
    }

    /// Give every active participant a turn with the same request.
    ///
    /// Under [`TurnPolicy::Free`] the turns run concurrently. Under
    /// [`TurnPolicy::Sequential`] they run in participant order while the
    /// scene's turn lock is held, so no other turn interleaves.
    pub async fn run_round(&self, scene: SceneId, request: CapabilityRequest) -> Result<RoundResult> {
        let snapshot = self.scenes.get(scene)?;
        if !snapshot.is_open() {
            return Err(RuntimeError::InvalidTransition(format!(
                "scene {scene} is closed"
            )));
        }
        let actors: Vec<InstanceId> = snapshot
            .participants
            .iter()
            .copied()
            .filter(|id| self.instances.get(*id).map(|i| i.is_active()).unwrap_or(false))
            .collect();

        match snapshot.turn_policy {
            TurnPolicy::Free => {
                let turns = actors
                    .iter()
                    .map(|id| self.play_turn(scene, *id, request.clone()));
                Ok(actors.iter().copied().zip(join_all(turns).await).collect())
            }
            TurnPolicy::Sequential => {
                let TurnTicket { turn_lock, .. } = match actors.first() {
                    Some(first) => self.scenes.ticket(scene, *first)?,
                    None => return Ok(Vec::new()),
                };
                let _turn = turn_lock.lock_owned().await;
                let mut results = Vec::with_capacity(actors.len());
                for id in actors {
                    let result = self.play_turn(scene, id, request.clone()).await;
                    results.push((id, result));
                }
                Ok(results)
            }
        }
    }

    async fn play_turn(
        &self,
        scene: SceneId,
        instance: InstanceId,
        request: CapabilityRequest,
    ) -> Result<Response> {
        // Re-checked here: the scene may have closed while waiting for a turn.
        let ticket = self.scenes.ticket(scene, instance)?;
        let query = Query::new(CallerId::Story, instance, request).in_scene(scene, ticket.others);
        let (query_id, operation) = (query.id, query.operation());
        let result = self.dispatcher.dispatch(query).await;
        self.scenes
            .record_turn(scene, TurnRecord::new(instance, query_id, operation, &result));
        result
    }

    /// Ask `target` a question on behalf of `caller`.
    ///
    /// With a scene, the target must be one of its participants and the
    /// exchange is recorded in that scene.
    pub async fn ask(
        &self,
        caller: CallerId,
        target: InstanceId,
        question: impl Into<String>,
        scene: Option<SceneId>,
    ) -> Result<Response> {
        let mut query = Query::new(caller, target, CapabilityRequest::answer(question));
        if let Some(scene) = scene {
            let ticket = self.scenes.ticket(scene, target)?;
            query = query.in_scene(scene, ticket.others);
        }
        self.dispatcher.dispatch(query).await
    }

    /// Dispatch an arbitrary query.
    pub async fn dispatch(&self, query: Query) -> Result<Response> {
        self.dispatcher.dispatch(query).await
    }
}
