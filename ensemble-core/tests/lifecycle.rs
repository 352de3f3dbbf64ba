//! Type registration and instance lifecycle through the session API.

use ensemble_core::character::builtin::{DEFAULT_TYPE_ID, MBTI_TYPE_ID};
use ensemble_core::prelude::*;
use ensemble_core::testing::{ScriptedBackend, TestHarness};
use std::sync::Arc;

fn backend() -> Arc<ScriptedBackend> {
    Arc::new(ScriptedBackend::new())
}

#[test]
fn test_builtin_types_register_and_instantiate() {
    let session = StorySession::default();
    let ids = session.register_builtin_types(backend()).unwrap();
    assert_eq!(ids, vec![TypeId::new(DEFAULT_TYPE_ID), TypeId::new(MBTI_TYPE_ID)]);

    let mbti = session.agent_type(&MBTI_TYPE_ID.into()).unwrap();
    assert_eq!(mbti.provenance(), Provenance::BuiltIn);

    let props = mbti_schema().fill_defaults(PropertyMap::new());
    let sally = session
        .instantiate(&MBTI_TYPE_ID.into(), "Sally", props, "Runs the bakery on Mill Street.")
        .unwrap();
    let instance = session.instance(sally).unwrap();
    assert_eq!(instance.properties()["extroversion"], PropertyValue::Real(50.0));
    assert!(instance
        .effective_instructions()
        .contains("Runs the bakery on Mill Street."));

    // Registering the same id twice is a conflict.
    assert!(matches!(
        session.register_builtin_types(backend()),
        Err(RuntimeError::TypeConflict { .. })
    ));
}

#[test]
fn test_third_party_types_get_stricter_checks() {
    let session = StorySession::default();
    let loose = TraitSchema::new().with_property(PropertySpec::real("Grit", 0.0, 1.0));

    // Fine for a user-defined type.
    session
        .register_type(TypeDescriptor::new("homebrew", loose.clone(), backend()))
        .unwrap();

    let err = session
        .register_type(
            TypeDescriptor::new("marketplace", loose, backend())
                .with_provenance(Provenance::ThirdParty),
        )
        .unwrap_err();
    assert!(matches!(
        err,
        RuntimeError::SchemaViolation {
            source: SchemaError::Policy(_),
            ..
        }
    ));
    assert!(session.agent_type(&"marketplace".into()).is_err());

    let tidy = TraitSchema::new().with_property(
        PropertySpec::real("grit", 0.0, 1.0).with_description("Refuses to give up"),
    );
    session
        .register_type(
            TypeDescriptor::new("marketplace", tidy, backend())
                .with_provenance(Provenance::ThirdParty),
        )
        .unwrap();
}

#[test]
fn test_incomplete_contract_is_rejected() {
    let session = StorySession::default();
    let schema = TraitSchema::new().with_property(PropertySpec::boolean("brave"));
    let err = session
        .register_type(
            TypeDescriptor::new("mute", schema, backend())
                .with_capabilities(CapabilitySet::full().without(Operation::Answer)),
        )
        .unwrap_err();
    match err {
        RuntimeError::ContractViolation { missing, .. } => {
            assert_eq!(missing, vec![Operation::Answer]);
        }
        other => panic!("expected ContractViolation, got {other:?}"),
    }
    assert!(session.types().is_empty());
}

#[test]
fn test_instantiate_unknown_type_and_bad_properties() {
    let harness = TestHarness::new();
    assert!(matches!(
        harness
            .session
            .instantiate(&"nobody".into(), "Ghost", PropertyMap::new(), ""),
        Err(RuntimeError::UnknownType(_))
    ));
    assert!(matches!(
        harness
            .session
            .instantiate(&harness.type_id(), "Blank", PropertyMap::new(), ""),
        Err(RuntimeError::SchemaViolation {
            source: SchemaError::MissingProperty(_),
            ..
        })
    ));
    assert!(harness.session.instances().is_empty());
}

#[tokio::test]
async fn test_dormant_instance_cannot_join_or_act() {
    let harness = TestHarness::new();
    let sally = harness.spawn("Sally", 0.8).unwrap();
    let taj = harness.spawn("Taj", 0.2).unwrap();
    harness
        .session
        .set_status(taj, LifecycleStatus::Dormant)
        .unwrap();

    assert!(matches!(
        harness.session.open_scene("Picnic", &[sally, taj]),
        Err(RuntimeError::InstanceUnavailable {
            status: LifecycleStatus::Dormant,
            ..
        })
    ));
    // Sally was not claimed by the failed open.
    harness.session.open_scene("Solo", &[sally]).unwrap();

    let err = harness
        .session
        .ask(CallerId::Story, taj, "Are you awake?", None)
        .await
        .unwrap_err();
    assert!(err.is_validation());

    // Dormant instances still take authored knowledge.
    harness
        .session
        .inject_knowledge(taj, "The picnic was cancelled.")
        .await
        .unwrap();

    harness.session.set_status(taj, LifecycleStatus::Active).unwrap();
    let response = harness
        .session
        .ask(CallerId::Story, taj, "Are you awake?", None)
        .await
        .unwrap();
    assert!(response.is_ok());
}

#[tokio::test]
async fn test_retirement_is_terminal() {
    let harness = TestHarness::new();
    let taj = harness.spawn("Taj", 0.2).unwrap();
    harness.session.set_status(taj, LifecycleStatus::Retired).unwrap();

    assert!(matches!(
        harness.session.set_status(taj, LifecycleStatus::Active),
        Err(RuntimeError::InvalidTransition(_))
    ));
    assert!(matches!(
        harness.session.set_instructions(taj, "Come back."),
        Err(RuntimeError::InstanceUnavailable { .. })
    ));
    assert!(matches!(
        harness.session.inject_knowledge(taj, "Too late.").await,
        Err(RuntimeError::InstanceUnavailable { .. })
    ));
    assert!(harness
        .session
        .read_memory(taj, MemoryFilter::all())
        .is_ok());
}

#[tokio::test]
async fn test_instructions_change_takes_effect_on_next_query() {
    let harness = TestHarness::new();
    let roger = harness.spawn("Roger", 0.4).unwrap();

    harness
        .session
        .set_instructions(roger, "Keeps the ledger for the guild.")
        .unwrap();
    harness
        .session
        .ask(CallerId::Story, roger, "What do you do?", None)
        .await
        .unwrap();

    let call = harness.backend.last_call().unwrap();
    assert!(call.system_prompt.contains("Keeps the ledger for the guild."));
    assert_eq!(
        harness.session.find_instance("Roger").map(|i| i.id()),
        Some(roger)
    );
}
