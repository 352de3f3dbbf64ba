//! End-to-end story scenarios against a scripted backend.

use ensemble_core::memory::{MemoryFilter, MemoryKind, MemoryPayload};
use ensemble_core::prelude::*;
use ensemble_core::testing::{assert_memory_len, extroversion_props, ScriptedBackend, TestHarness};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_archetype_accepts_sally_rejects_taj() {
    let session = StorySession::default();
    let backend = Arc::new(ScriptedBackend::new());
    let schema = TraitSchema::new().with_property(PropertySpec::real("extroversion", 0.0, 1.0));
    let archetype = session
        .register_type(TypeDescriptor::new("Archetype", schema, backend))
        .unwrap();

    let sally = session.instantiate(&archetype, "Sally", extroversion_props(0.8), "");
    assert!(sally.is_ok());

    let taj = session.instantiate(&archetype, "Taj", extroversion_props(1.5), "");
    match taj {
        Err(RuntimeError::SchemaViolation { source, .. }) => {
            assert!(matches!(source, SchemaError::OutOfRange { .. }));
        }
        other => panic!("expected SchemaViolation, got {other:?}"),
    }
    assert_eq!(session.instances().len(), 1);
}

#[tokio::test]
async fn test_concurrent_speak_is_serialized_in_submission_order() {
    let harness = TestHarness::with_backend(
        RuntimeConfig::default(),
        ScriptedBackend::new().with_delay(Duration::from_millis(20)),
    );
    let sally = harness.spawn("Sally", 0.8).unwrap();
    let taj = harness.spawn("Taj", 0.3).unwrap();
    let scene = harness.session.open_scene("Village square", &[sally, taj]).unwrap();

    harness.backend.reply("Good morning, Taj!");
    harness.backend.reply("Lovely day for it.");

    let first = harness
        .session
        .advance_turn(scene, sally, CapabilityRequest::speak("Greet Taj."));
    let second = harness
        .session
        .advance_turn(scene, sally, CapabilityRequest::speak("Remark on the weather."));
    let (first, second) = tokio::join!(first, second);
    let (first, second) = (first.unwrap(), second.unwrap());

    assert!(first.is_ok() && second.is_ok());
    assert_eq!(first.entries[0].sequence, 0);
    assert_eq!(second.entries[0].sequence, 1);

    // The second call only started once the first one's memory was in.
    let calls = harness.backend.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].memory_len, 0);
    assert_eq!(calls[1].memory_len, 1);

    let lines: Vec<String> = harness
        .session
        .read_memory(sally, MemoryFilter::all())
        .unwrap()
        .iter()
        .map(|e| match &e.payload {
            MemoryPayload::Text { text } => text.clone(),
            other => panic!("unexpected payload {other:?}"),
        })
        .collect();
    assert_eq!(lines, vec!["Good morning, Taj!", "Lovely day for it."]);
    assert_memory_len(&harness, sally, 2);
}

#[tokio::test]
async fn test_narrator_asks_roger() {
    let harness = TestHarness::new();
    let roger = harness.spawn("Roger", 0.4).unwrap();
    harness
        .backend
        .reply("Lizzy? I'd trust her with the shop keys, not with my secrets.");

    let response = harness
        .session
        .ask(CallerId::agent("narrator"), roger, "Do you trust Lizzy?", None)
        .await
        .unwrap();

    assert_eq!(response.status, ResponseStatus::Ok);
    assert_eq!(
        response.content.as_deref(),
        Some("Lizzy? I'd trust her with the shop keys, not with my secrets.")
    );
    assert!(response.caller_entries.is_empty());

    let memory = harness
        .session
        .read_memory(roger, MemoryFilter::all())
        .unwrap()
        .to_vec();
    assert_eq!(memory.len(), 1);
    assert_eq!(memory[0].kind, MemoryKind::Answer);
    match &memory[0].payload {
        MemoryPayload::Exchange {
            counterpart,
            question,
            reply,
        } => {
            assert_eq!(counterpart, &CallerId::agent("narrator"));
            assert_eq!(question, "Do you trust Lizzy?");
            assert!(reply.starts_with("Lizzy?"));
        }
        other => panic!("unexpected payload {other:?}"),
    }
}

#[tokio::test]
async fn test_retired_taj_keeps_memory_but_cannot_act() {
    let harness = TestHarness::new();
    let sally = harness.spawn("Sally", 0.8).unwrap();
    let taj = harness.spawn("Taj", 0.2).unwrap();
    let scene = harness.session.open_scene("Tavern", &[sally, taj]).unwrap();

    harness
        .session
        .advance_turn(scene, taj, CapabilityRequest::speak("Order a drink."))
        .await
        .unwrap();
    harness
        .session
        .advance_turn(scene, taj, CapabilityRequest::think("About Sally."))
        .await
        .unwrap();

    harness.session.set_status(taj, LifecycleStatus::Retired).unwrap();

    let err = harness
        .session
        .advance_turn(scene, taj, CapabilityRequest::speak("Anything."))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        RuntimeError::InstanceUnavailable {
            status: LifecycleStatus::Retired,
            ..
        }
    ));

    let read = harness.session.read_memory(taj, MemoryFilter::all()).unwrap();
    let kinds: Vec<MemoryKind> = read.iter().map(|e| e.kind).collect();
    assert_eq!(kinds, vec![MemoryKind::Dialogue, MemoryKind::Thought]);
    // Restartable.
    assert_eq!(read.iter().count(), 2);

    let turns = harness.session.scene(scene).unwrap().turns;
    assert_eq!(turns.len(), 3);
    assert_eq!(turns[2].outcome, TurnOutcome::Rejected);
}

#[tokio::test]
async fn test_character_questions_character_in_scene() {
    let harness = TestHarness::new();
    let lizzy = harness.spawn("Lizzy", 0.9).unwrap();
    let roger = harness.spawn("Roger", 0.4).unwrap();
    let scene = harness.session.open_scene("Back room", &[lizzy, roger]).unwrap();
    harness.backend.reply("More than anyone in this town.");

    let response = harness
        .session
        .ask(CallerId::Character(lizzy), roger, "Do you trust me?", Some(scene))
        .await
        .unwrap();
    assert!(response.is_ok());

    assert_eq!(harness.memory_kinds(roger), vec![MemoryKind::Answer]);
    assert_eq!(harness.memory_kinds(lizzy), vec![MemoryKind::Question]);
    assert_eq!(response.entries[0].scene, Some(scene));
    assert_eq!(response.caller_entries[0].scene, Some(scene));

    let call = harness.backend.last_call().unwrap();
    assert_eq!(call.caller, CallerId::Character(lizzy));
    assert!(call.prompt.contains("Also present: Lizzy."));
}

#[tokio::test]
async fn test_speak_window_is_scene_scoped() {
    let harness = TestHarness::new();
    let sally = harness.spawn("Sally", 0.8).unwrap();
    let taj = harness.spawn("Taj", 0.2).unwrap();

    harness
        .session
        .inject_knowledge(sally, "The mill burned down last winter.")
        .await
        .unwrap();

    let market = harness.session.open_scene("Market", &[sally, taj]).unwrap();
    harness
        .session
        .advance_turn(market, sally, CapabilityRequest::speak("Haggle."))
        .await
        .unwrap();
    harness.session.close_scene(market).unwrap();

    let bakery = harness.session.open_scene("Bakery", &[sally]).unwrap();
    harness
        .session
        .advance_turn(bakery, sally, CapabilityRequest::speak("Open up."))
        .await
        .unwrap();
    // Speaking in the bakery sees the injected knowledge but not the market.
    assert_eq!(harness.backend.last_call().unwrap().memory_len, 1);

    harness
        .session
        .advance_turn(bakery, sally, CapabilityRequest::think("The day so far."))
        .await
        .unwrap();
    // Thinking draws on everything.
    assert_eq!(harness.backend.last_call().unwrap().memory_len, 3);
}
