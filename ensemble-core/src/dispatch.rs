//! Query dispatch.
//!
//! The dispatcher routes a capability request to one instance, holding that
//! instance's execution slot for the whole invocation. Backend calls run
//! under a deadline and are retried with capped exponential backoff. Memory
//! is appended synchronously after the backend returns, so a query that is
//! cancelled, dropped or exhausted leaves no trace.

use crate::backend::{GenerationContext, Participant};
use crate::capability::{self, resolve_selection, CapabilityRequest, Generation, Operation};
use crate::character::{CharacterAgentInstance, InstanceRegistry};
use crate::config::RuntimeConfig;
use crate::error::{BackendError, BackendResult, Result, RuntimeError};
use crate::id::{CallerId, InstanceId, QueryId, SceneId};
use crate::memory::{MemoryEntry, MemoryFilter, NewMemory};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OwnedMutexGuard;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Context a query runs in.
#[derive(Debug, Clone, Default)]
pub struct QueryContext {
    pub scene: Option<SceneId>,
    /// Other instances present in the scene
    pub participants: Vec<InstanceId>,
    /// Instances executing further up the chain that issued this query
    pub(crate) call_chain: Vec<InstanceId>,
    /// Query the calling character is running while it issues this one
    pub(crate) parent: Option<QueryId>,
    /// Per-attempt deadline, overriding the configured one
    pub timeout: Option<Duration>,
    pub cancel: Option<CancellationToken>,
}

/// A capability request addressed to one instance.
#[derive(Debug, Clone)]
pub struct Query {
    pub id: QueryId,
    pub caller: CallerId,
    pub target: InstanceId,
    pub request: CapabilityRequest,
    pub context: QueryContext,
}

impl Query {
    pub fn new(caller: CallerId, target: InstanceId, request: CapabilityRequest) -> Self {
        Self {
            id: QueryId::new(),
            caller,
            target,
            request,
            context: QueryContext::default(),
        }
    }

    /// A query issued by a character while it is itself being invoked.
    ///
    /// The new query inherits the scene and the call chain, so the caller's
    /// slot (already held) is not requested again.
    pub fn nested(parent: &GenerationContext, target: InstanceId, request: CapabilityRequest) -> Self {
        let participants = parent
            .participants
            .iter()
            .map(|p| p.id)
            .chain(std::iter::once(parent.target))
            .filter(|id| *id != target)
            .collect();
        Self {
            id: QueryId::new(),
            caller: CallerId::Character(parent.target),
            target,
            request,
            context: QueryContext {
                scene: parent.scene,
                participants,
                call_chain: parent.call_chain.clone(),
                parent: Some(parent.query_id),
                timeout: None,
                cancel: None,
            },
        }
    }

    pub fn in_scene(mut self, scene: SceneId, participants: Vec<InstanceId>) -> Self {
        self.context.scene = Some(scene);
        self.context.participants = participants;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.context.timeout = Some(timeout);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.context.cancel = Some(token);
        self
    }

    pub fn operation(&self) -> Operation {
        self.request.operation()
    }

    /// Instances this query was issued from, outermost first.
    pub fn call_chain(&self) -> &[InstanceId] {
        &self.context.call_chain
    }
}

/// Outcome of a dispatched query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseStatus {
    Ok,
    Failed,
    Cancelled,
}

/// Reply correlated with a [`Query`].
#[derive(Debug, Clone)]
pub struct Response {
    pub query_id: QueryId,
    pub target: InstanceId,
    pub operation: Operation,
    pub status: ResponseStatus,
    pub content: Option<String>,
    /// Index of the chosen option, for `choose`
    pub selected: Option<usize>,
    pub emotional_state: Option<String>,
    /// Entries appended to the target's memory
    pub entries: Vec<Arc<MemoryEntry>>,
    /// Entries appended to the calling character's memory
    pub caller_entries: Vec<Arc<MemoryEntry>>,
    /// Backend attempts made
    pub attempts: u32,
    pub error: Option<RuntimeError>,
}

impl Response {
    fn empty(query: &Query, status: ResponseStatus, attempts: u32) -> Self {
        Self {
            query_id: query.id,
            target: query.target,
            operation: query.operation(),
            status,
            content: None,
            selected: None,
            emotional_state: None,
            entries: Vec::new(),
            caller_entries: Vec::new(),
            attempts,
            error: None,
        }
    }

    fn cancelled(query: &Query, attempts: u32) -> Self {
        Self::empty(query, ResponseStatus::Cancelled, attempts)
    }

    fn failed(query: &Query, error: RuntimeError, attempts: u32) -> Self {
        Self {
            error: Some(error),
            ..Self::empty(query, ResponseStatus::Failed, attempts)
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == ResponseStatus::Ok
    }

    /// Turn a failed or cancelled response into an error.
    pub fn into_result(mut self) -> Result<Response> {
        if self.status == ResponseStatus::Cancelled {
            return Err(RuntimeError::Cancelled {
                query: self.query_id,
            });
        }
        match self.error.take() {
            Some(err) => Err(err),
            None => Ok(self),
        }
    }
}

/// A backend result checked against the request, with the memory it will
/// produce.
struct Prepared {
    generation: Generation,
    selected: Option<usize>,
    draft: NewMemory,
}

fn prepare(query: &Query, generation: Generation) -> BackendResult<Prepared> {
    let blank = generation.content.trim().is_empty();
    let (draft, selected) = match &query.request {
        CapabilityRequest::Choose { options, .. } => {
            let index = resolve_selection(&generation, options)?;
            let draft = NewMemory::decision(options.clone(), index, generation.content.clone());
            (draft, Some(index))
        }
        _ if blank => {
            return Err(BackendError::Malformed(
                "backend returned empty content".to_string(),
            ))
        }
        CapabilityRequest::Speak { .. } => (NewMemory::dialogue(generation.content.clone()), None),
        CapabilityRequest::Think { .. } => (NewMemory::thought(generation.content.clone()), None),
        CapabilityRequest::Answer { question } => (
            NewMemory::answer(query.caller.clone(), question.clone(), generation.content.clone()),
            None,
        ),
    };
    Ok(Prepared {
        generation,
        selected,
        draft: draft.in_scene(query.context.scene).from_query(query.id),
    })
}

async fn acquire_slots(
    mut instances: Vec<Arc<CharacterAgentInstance>>,
) -> Vec<OwnedMutexGuard<()>> {
    // Ascending id order so two multi-slot queries never wait on each other
    // in opposite directions.
    instances.sort_by_key(|i| i.id());
    instances.dedup_by_key(|i| i.id());
    let mut guards = Vec::with_capacity(instances.len());
    for instance in &instances {
        guards.push(instance.acquire_slot().await);
    }
    guards
}

#[derive(Debug)]
struct DispatcherInner {
    instances: Arc<InstanceRegistry>,
    config: RuntimeConfig,
}

/// Routes queries to instances. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

impl Dispatcher {
    pub fn new(instances: Arc<InstanceRegistry>, config: RuntimeConfig) -> Self {
        Self {
            inner: Arc::new(DispatcherInner { instances, config }),
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    /// Run a query to completion.
    ///
    /// Validation problems come back as `Err`. Once the query is accepted the
    /// result is always `Ok`, with the response status telling success,
    /// backend failure and cancellation apart.
    #[instrument(
        name = "dispatch",
        skip_all,
        fields(query = %query.id, target = %query.target, operation = %query.operation(), caller = %query.caller)
    )]
    pub async fn dispatch(&self, query: Query) -> Result<Response> {
        query
            .request
            .validate()
            .map_err(RuntimeError::InvalidRequest)?;

        let target = self.inner.instances.get(query.target)?;
        target.ensure_active()?;

        if query.caller.as_character() == Some(query.target) {
            return Err(RuntimeError::InstanceBusy {
                instance: query.target,
                reason: "an instance cannot query itself".to_string(),
            });
        }

        let caller = match query.caller.as_character() {
            Some(id) => {
                let caller = self.inner.instances.get(id)?;
                caller.ensure_active()?;
                Some(caller)
            }
            None => None,
        };

        let nested = self.check_call_chain(&query, caller.as_ref())?;
        if query.context.call_chain.contains(&query.target) {
            return Err(RuntimeError::InstanceBusy {
                instance: query.target,
                reason: "already executing in this call chain".to_string(),
            });
        }

        // A nested caller already holds its own slot.
        let mut slots = vec![target.clone()];
        if let (Operation::Answer, Some(caller), false) = (query.operation(), &caller, nested) {
            slots.push(caller.clone());
        }

        let cancel = query
            .context
            .cancel
            .clone()
            .unwrap_or_else(CancellationToken::new);

        let _guards = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!("Query cancelled before it was admitted");
                return Ok(Response::cancelled(&query, 0));
            }
            guards = acquire_slots(slots) => guards,
        };

        // Status may have changed while waiting for the slot.
        target.ensure_active()?;
        if let Some(caller) = &caller {
            caller.ensure_active()?;
        }
        let _running = target.begin_query(query.id);

        self.execute(&query, &target, caller.as_ref(), &cancel).await
    }

    /// Whether `query` was issued from inside a running invocation.
    ///
    /// A non-empty call chain is only honoured when the caller is its last
    /// link and is executing the parent query right now. Anything else could
    /// skip the caller's slot, so it is rejected.
    fn check_call_chain(
        &self,
        query: &Query,
        caller: Option<&Arc<CharacterAgentInstance>>,
    ) -> Result<bool> {
        let chain = &query.context.call_chain;
        if chain.is_empty() {
            return Ok(false);
        }
        let running = match (query.context.parent, caller) {
            (Some(parent), Some(caller)) => {
                chain.last() == Some(&caller.id()) && caller.is_running(parent)
            }
            _ => false,
        };
        if !running {
            warn!("Call chain does not belong to a running query");
            return Err(RuntimeError::InvalidRequest(
                "nested query issued outside its parent invocation".to_string(),
            ));
        }
        Ok(true)
    }

    async fn execute(
        &self,
        query: &Query,
        target: &Arc<CharacterAgentInstance>,
        caller: Option<&Arc<CharacterAgentInstance>>,
        cancel: &CancellationToken,
    ) -> Result<Response> {
        let config = &self.inner.config;
        let filter = MemoryFilter::for_operation(query.operation(), query.context.scene);
        let snapshot = target.snapshot(&filter, config.memory_window);
        let participants = self.participants(query);
        let mut call_chain = query.context.call_chain.clone();
        call_chain.push(target.id());

        let timeout = query.context.timeout.unwrap_or_else(|| config.retry.timeout());
        let max_attempts = config.retry.attempts();
        let agent_type = target.agent_type().clone();

        let mut attempt = 0;
        let failure = loop {
            attempt += 1;
            let context = GenerationContext {
                query_id: query.id,
                target: target.id(),
                caller: query.caller.clone(),
                request: query.request.clone(),
                scene: query.context.scene,
                participants: participants.clone(),
                call_chain: call_chain.clone(),
                attempt,
            };
            debug!(attempt, backend = agent_type.backend().name(), "Invoking backend");

            let call = capability::invoke(
                agent_type.behavior().as_ref(),
                &snapshot,
                &context,
                agent_type.backend().as_ref(),
            );
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!(attempt, "Query cancelled during backend call");
                    return Ok(Response::cancelled(query, attempt));
                }
                outcome = tokio::time::timeout(timeout, call) => {
                    outcome.unwrap_or(Err(BackendError::Timeout(timeout)))
                }
            };

            match outcome.and_then(|generation| prepare(query, generation)) {
                Ok(prepared) => return self.commit(query, target, caller, prepared, attempt),
                Err(err) if attempt < max_attempts && err.is_retryable() => {
                    let delay = config.retry.backoff(attempt);
                    warn!(
                        attempt,
                        error = %err,
                        delay_ms = delay.as_millis() as u64,
                        "Backend attempt failed, retrying"
                    );
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {
                            info!(attempt, "Query cancelled during backoff");
                            return Ok(Response::cancelled(query, attempt));
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(err) => break err,
            }
        };

        error!(attempts = attempt, error = %failure, "Backend failed, giving up");
        Ok(Response::failed(
            query,
            RuntimeError::BackendFailure {
                instance: target.id(),
                attempts: attempt,
                source: failure,
            },
            attempt,
        ))
    }

    /// Append the produced memory. Runs without awaiting, so nothing can
    /// interrupt it between the backend returning and the entries landing.
    fn commit(
        &self,
        query: &Query,
        target: &CharacterAgentInstance,
        caller: Option<&Arc<CharacterAgentInstance>>,
        prepared: Prepared,
        attempts: u32,
    ) -> Result<Response> {
        let Prepared {
            generation,
            selected,
            draft,
        } = prepared;

        let caller_draft = match (&query.request, caller) {
            (CapabilityRequest::Answer { question }, Some(_)) => Some(
                NewMemory::question(
                    CallerId::Character(target.id()),
                    question.clone(),
                    generation.content.clone(),
                )
                .in_scene(query.context.scene)
                .from_query(query.id),
            ),
            _ => None,
        };

        let entries = target.memory().append_all(vec![draft])?;
        let caller_entries = match (caller, caller_draft) {
            (Some(caller), Some(draft)) => caller.memory().append_all(vec![draft])?,
            _ => Vec::new(),
        };

        info!(
            attempts,
            entries = entries.len() + caller_entries.len(),
            "Query committed"
        );

        Ok(Response {
            content: Some(generation.content),
            selected,
            emotional_state: generation.emotional_state,
            entries,
            caller_entries,
            ..Response::empty(query, ResponseStatus::Ok, attempts)
        })
    }

    fn participants(&self, query: &Query) -> Vec<Participant> {
        query
            .context
            .participants
            .iter()
            .filter(|id| **id != query.target)
            .filter_map(|id| self.inner.instances.get(*id).ok())
            .map(|instance| Participant {
                id: instance.id(),
                name: instance.name().to_string(),
            })
            .collect()
    }
}
