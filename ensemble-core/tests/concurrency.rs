//! Concurrency tests: per-instance serialization, nested queries between
//! characters, scene exclusivity and turn policies.

use async_trait::async_trait;
use ensemble_core::backend::{GenerationContext, GenerativeBackend, InstanceSnapshot};
use ensemble_core::capability::Generation;
use ensemble_core::error::BackendResult;
use ensemble_core::prelude::*;
use ensemble_core::testing::{
    archetype_schema, assert_contiguous_memory, assert_memory_len, extroversion_props,
    ScriptedBackend, TestHarness,
};
use futures::future::join_all;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Backend whose characters question each other while being invoked.
///
/// When an instance listed in `relays` is invoked, it first asks its relay
/// target a question through the dispatcher and then replies with what it
/// heard.
#[derive(Default)]
struct RelayBackend {
    dispatcher: OnceCell<Dispatcher>,
    relays: Mutex<HashMap<InstanceId, InstanceId>>,
    /// Outcome of each nested query, in completion order
    nested: Mutex<Vec<(InstanceId, std::result::Result<String, RuntimeError>)>>,
}

impl RelayBackend {
    fn relay(&self, from: InstanceId, to: InstanceId) {
        self.relays.lock().insert(from, to);
    }
}

#[async_trait]
impl GenerativeBackend for RelayBackend {
    fn name(&self) -> &str {
        "relay"
    }

    async fn generate(
        &self,
        snapshot: &InstanceSnapshot,
        context: &GenerationContext,
    ) -> BackendResult<Generation> {
        let relay_to = self.relays.lock().get(&snapshot.instance_id).copied();
        let Some(to) = relay_to else {
            return Ok(Generation::text(format!("{} has nothing to add", snapshot.name())));
        };
        let Some(dispatcher) = self.dispatcher.get() else {
            return Err(BackendError::Configuration("dispatcher not wired".to_string()));
        };

        let query = Query::nested(context, to, CapabilityRequest::answer("What do you know?"));
        let outcome = dispatcher
            .dispatch(query)
            .await
            .and_then(Response::into_result)
            .map(|response| response.content.unwrap_or_default());
        let heard = match &outcome {
            Ok(text) => text.clone(),
            Err(_) => "no answer".to_string(),
        };
        self.nested.lock().push((snapshot.instance_id, outcome));
        Ok(Generation::text(format!("{} heard: {heard}", snapshot.name())))
    }
}

fn relay_session() -> (StorySession, Arc<RelayBackend>) {
    let backend = Arc::new(RelayBackend::default());
    let session = StorySession::default();
    session
        .register_type(TypeDescriptor::new("relay", archetype_schema(), backend.clone()))
        .unwrap();
    let _ = backend.dispatcher.set(session.dispatcher());
    (session, backend)
}

fn spawn(session: &StorySession, name: &str) -> InstanceId {
    session
        .instantiate(&"relay".into(), name, extroversion_props(0.5), "")
        .unwrap()
}

#[tokio::test]
async fn test_many_concurrent_queries_produce_contiguous_memory() {
    let harness = TestHarness::with_backend(
        RuntimeConfig::default(),
        ScriptedBackend::new().with_delay(Duration::from_millis(1)),
    );
    let sally = harness.spawn("Sally", 0.8).unwrap();

    let queries = (0..20).map(|i| {
        let request = if i % 2 == 0 {
            CapabilityRequest::speak(format!("Line {i}"))
        } else {
            CapabilityRequest::think(format!("Thought {i}"))
        };
        harness
            .session
            .dispatch(Query::new(CallerId::Story, sally, request))
    });
    let responses = join_all(queries).await;

    assert!(responses.iter().all(|r| r.as_ref().unwrap().is_ok()));
    assert_memory_len(&harness, sally, 20);
    assert_contiguous_memory(&harness, sally);

    // Each invocation saw every memory committed before it.
    let windows: Vec<usize> = harness.backend.calls().iter().map(|c| c.memory_len).collect();
    assert_eq!(windows, (0..20).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_nested_answer_while_invoked() {
    let (session, backend) = relay_session();
    let sally = spawn(&session, "Sally");
    let roger = spawn(&session, "Roger");
    backend.relay(sally, roger);

    let response = session
        .dispatch(Query::new(
            CallerId::Story,
            sally,
            CapabilityRequest::think("Who can I rely on?"),
        ))
        .await
        .unwrap();
    assert_eq!(
        response.content.as_deref(),
        Some("Sally heard: Roger has nothing to add")
    );

    let nested = backend.nested.lock();
    assert_eq!(nested.len(), 1);
    assert!(nested[0].1.is_ok());

    let roger_memory = session.read_memory(roger, MemoryFilter::all()).unwrap().to_vec();
    assert_eq!(roger_memory.len(), 1);
    assert_eq!(roger_memory[0].kind, MemoryKind::Answer);

    // Sally's question lands before her own thought.
    let sally_kinds: Vec<MemoryKind> = session
        .read_memory(sally, MemoryFilter::all())
        .unwrap()
        .iter()
        .map(|e| e.kind)
        .collect();
    assert_eq!(sally_kinds, vec![MemoryKind::Question, MemoryKind::Thought]);
}

#[tokio::test]
async fn test_reentry_into_call_chain_is_rejected() {
    let (session, backend) = relay_session();
    let sally = spawn(&session, "Sally");
    let roger = spawn(&session, "Roger");
    backend.relay(sally, roger);
    backend.relay(roger, sally);

    let response = tokio::time::timeout(
        Duration::from_secs(5),
        session.dispatch(Query::new(
            CallerId::Story,
            sally,
            CapabilityRequest::speak("Start a rumor."),
        )),
    )
    .await
    .expect("re-entry must not deadlock")
    .unwrap();
    assert!(response.is_ok());

    let nested = backend.nested.lock();
    assert_eq!(nested.len(), 2);
    // Roger tried to ask Sally back while she was waiting on him.
    assert_eq!(nested[0].0, roger);
    assert!(matches!(
        nested[0].1,
        Err(RuntimeError::InstanceBusy { instance, .. }) if instance == sally
    ));
    assert_eq!(nested[1].0, sally);
    assert_eq!(
        nested[1].1.as_deref().ok(),
        Some("Roger heard: no answer")
    );
}

#[tokio::test]
async fn test_claimed_call_chain_cannot_skip_the_callers_slot() {
    let harness = TestHarness::new();
    let sally = harness.spawn("Sally", 0.8).unwrap();
    let roger = harness.spawn("Roger", 0.3).unwrap();
    harness.backend.hang();

    // Sally is tied up in a slow invocation of her own.
    let busy = harness.session.dispatch(
        Query::new(CallerId::Story, sally, CapabilityRequest::speak("Hold the floor."))
            .with_timeout(Duration::from_millis(200)),
    );
    let claimed = async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        // A context Sally's backend never received.
        let made_up = GenerationContext {
            query_id: QueryId::new(),
            target: sally,
            caller: CallerId::Story,
            request: CapabilityRequest::speak(""),
            scene: None,
            participants: Vec::new(),
            call_chain: vec![sally],
            attempt: 1,
        };
        harness
            .session
            .dispatch(Query::nested(
                &made_up,
                roger,
                CapabilityRequest::answer("What is the password?"),
            ))
            .await
    };
    let (busy, claimed) = tokio::join!(busy, claimed);

    assert!(matches!(claimed, Err(RuntimeError::InvalidRequest(_))));
    assert!(busy.unwrap().is_ok());
    assert_memory_len(&harness, roger, 0);
    // Only Sally's own line, no question slipped in beside it.
    let kinds: Vec<MemoryKind> = harness
        .session
        .read_memory(sally, MemoryFilter::all())
        .unwrap()
        .iter()
        .map(|e| e.kind)
        .collect();
    assert_eq!(kinds, vec![MemoryKind::Dialogue]);
}

#[tokio::test]
async fn test_character_cannot_question_itself() {
    let harness = TestHarness::new();
    let sally = harness.spawn("Sally", 0.8).unwrap();

    let err = harness
        .session
        .ask(CallerId::Character(sally), sally, "Am I sure?", None)
        .await
        .unwrap_err();
    assert!(matches!(err, RuntimeError::InstanceBusy { .. }));
    assert_memory_len(&harness, sally, 0);
}

#[tokio::test]
async fn test_scene_membership_is_exclusive_under_contention() {
    let harness = TestHarness::new();
    let sally = harness.spawn("Sally", 0.8).unwrap();
    let others: Vec<InstanceId> = (0..8)
        .map(|i| harness.spawn(&format!("Extra {i}"), 0.1).unwrap())
        .collect();

    let session = &harness.session;
    let results: Vec<Result<SceneId>> = std::thread::scope(|scope| {
        let handles: Vec<_> = others
            .iter()
            .map(|other| {
                let participants = [sally, *other];
                scope.spawn(move || session.open_scene("Contested", &participants))
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().expect("thread panicked"))
            .collect()
    });

    let opened: Vec<SceneId> = results.iter().filter_map(|r| r.as_ref().ok().copied()).collect();
    assert_eq!(opened.len(), 1);
    assert!(results
        .iter()
        .filter_map(|r| r.as_ref().err())
        .all(|e| matches!(e, RuntimeError::InstanceBusy { instance, .. } if *instance == sally)));

    // Losers were not left half-claimed.
    let scene = harness.session.scene(opened[0]).unwrap();
    let free: Vec<InstanceId> = others
        .iter()
        .copied()
        .filter(|id| !scene.has_participant(*id))
        .collect();
    assert_eq!(free.len(), others.len() - 1);
    for id in free {
        assert_eq!(harness.session.instance(id).unwrap().current_scene(), None);
    }

    harness.session.close_scene(opened[0]).unwrap();
    harness.session.open_scene("Rematch", &[sally]).unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_free_round_runs_participants_concurrently() {
    let delay = Duration::from_millis(50);
    let harness = TestHarness::with_backend(
        RuntimeConfig::default(),
        ScriptedBackend::new().with_delay(delay),
    );
    let sally = harness.spawn("Sally", 0.8).unwrap();
    let taj = harness.spawn("Taj", 0.2).unwrap();
    let scene = harness
        .session
        .open_scene_with_policy("Market", &[sally, taj], TurnPolicy::Free)
        .unwrap();

    let started = tokio::time::Instant::now();
    let results = harness
        .session
        .run_round(scene, CapabilityRequest::speak("Call out your wares."))
        .await
        .unwrap();
    assert!(started.elapsed() < delay * 2);

    assert_eq!(
        results.iter().map(|(id, _)| *id).collect::<Vec<_>>(),
        vec![sally, taj]
    );
    assert!(results.iter().all(|(_, r)| r.as_ref().unwrap().is_ok()));
    assert_eq!(harness.session.scene(scene).unwrap().turns.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_sequential_round_holds_the_floor() {
    let delay = Duration::from_millis(50);
    let harness = TestHarness::with_backend(
        RuntimeConfig::default(),
        ScriptedBackend::new().with_delay(delay),
    );
    let sally = harness.spawn("Sally", 0.8).unwrap();
    let taj = harness.spawn("Taj", 0.2).unwrap();
    let scene = harness
        .session
        .open_scene_with_policy("Council", &[sally, taj], TurnPolicy::Sequential)
        .unwrap();

    let started = tokio::time::Instant::now();
    let round = harness
        .session
        .run_round(scene, CapabilityRequest::think("Weigh the proposal."));
    let interjection = async {
        tokio::task::yield_now().await;
        harness
            .session
            .advance_turn(scene, taj, CapabilityRequest::speak("Objection!"))
            .await
    };
    let (round, interjection) = tokio::join!(round, interjection);
    assert!(started.elapsed() >= delay * 3);
    assert_eq!(round.unwrap().len(), 2);
    assert!(interjection.unwrap().is_ok());

    // The interjection waited for the whole round.
    let operations: Vec<(InstanceId, Operation)> = harness
        .backend
        .calls()
        .iter()
        .map(|c| (c.instance, c.operation))
        .collect();
    assert_eq!(
        operations,
        vec![
            (sally, Operation::Think),
            (taj, Operation::Think),
            (taj, Operation::Speak),
        ]
    );
}

#[tokio::test]
async fn test_dropped_query_leaves_no_memory() {
    let harness = TestHarness::new();
    let sally = harness.spawn("Sally", 0.8).unwrap();
    harness.backend.hang();

    let query = harness.session.dispatch(Query::new(
        CallerId::Story,
        sally,
        CapabilityRequest::speak("Say something."),
    ));
    assert!(tokio::time::timeout(Duration::from_millis(20), query)
        .await
        .is_err());
    assert_memory_len(&harness, sally, 0);

    // The slot was released with the dropped future.
    let response = harness
        .session
        .dispatch(Query::new(
            CallerId::Story,
            sally,
            CapabilityRequest::speak("Try again."),
        ))
        .await
        .unwrap();
    assert!(response.is_ok());
    assert_memory_len(&harness, sally, 1);
}

#[tokio::test]
async fn test_cancellation_token_while_waiting_for_slot() {
    let harness = TestHarness::new();
    let sally = harness.spawn("Sally", 0.8).unwrap();
    harness.backend.hang();

    let token = tokio_util::sync::CancellationToken::new();
    let blocker = harness.session.dispatch(
        Query::new(CallerId::Story, sally, CapabilityRequest::speak("Hold the floor."))
            .with_timeout(Duration::from_millis(100)),
    );
    let waiter = harness.session.dispatch(
        Query::new(CallerId::Story, sally, CapabilityRequest::speak("Wait."))
            .with_cancellation(token.clone()),
    );
    let cancel = async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel();
    };
    let (blocked, waited, ()) = tokio::join!(blocker, waiter, cancel);

    let waited = waited.unwrap();
    assert_eq!(waited.status, ResponseStatus::Cancelled);
    assert_eq!(waited.attempts, 0);
    // The blocker timed out once, then got a default reply on retry.
    let blocked = blocked.unwrap();
    assert!(blocked.is_ok());
    assert_eq!(blocked.attempts, 2);
    assert_memory_len(&harness, sally, 1);
}
