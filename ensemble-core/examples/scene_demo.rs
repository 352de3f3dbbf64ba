//! A short scene played with a scripted backend.
//!
//! Run with `ENSEMBLE_LOG=debug` to see dispatch spans.

use ensemble_core::character::builtin::MBTI_TYPE_ID;
use ensemble_core::logging::{init_logging, LoggingConfig};
use ensemble_core::prelude::*;
use ensemble_core::testing::ScriptedBackend;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<()> {
    if let Err(e) = init_logging(&LoggingConfig::default().with_level("info")) {
        eprintln!("Logging disabled: {e}");
    }

    let backend = Arc::new(ScriptedBackend::named("demo"));
    backend.reply("Morning, Taj! The rye is still warm.");
    backend.reply("Morning. Just the one loaf, thanks.");
    backend.reply("He never buys more than one. Something's off with him lately.");
    backend.reply_with(Generation::text("I'll slip him a pastry, on the house.").with_selected(1));
    backend.reply("Honestly? I trust Lizzy more than my own brother.");

    let session = StorySession::default();
    session.register_builtin_types(backend.clone())?;
    let mbti: TypeId = MBTI_TYPE_ID.into();
    let defaults = mbti_schema().fill_defaults(PropertyMap::new());

    let mut sally_props = defaults.clone();
    sally_props.insert("extroversion".to_string(), PropertyValue::Real(80.0));
    let sally_profile = CharacterProfile::new("Sally")
        .with_role("protagonist")
        .with_relationships("Old friends with Lizzy. Worried about Taj.");
    let sally = session.instantiate(&mbti, sally_profile, sally_props, "Runs the bakery on Mill Street.")?;
    let taj = session.instantiate(&mbti, "Taj", defaults.clone(), "A quiet carpenter.")?;
    let roger = session.instantiate(&mbti, "Roger", defaults, "Keeps the guild ledger.")?;

    let scene = session.open_scene("Morning at the bakery", &[sally, taj])?;
    for (who, request) in [
        (sally, CapabilityRequest::speak("Greet Taj as he walks in.")),
        (taj, CapabilityRequest::speak("Order your usual.")),
        (sally, CapabilityRequest::think("Taj seems distracted.")),
        (
            sally,
            CapabilityRequest::choose(
                ["Say nothing", "Offer a free pastry", "Ask what's wrong"],
                "Taj is counting coins slowly.",
            ),
        ),
    ] {
        let response = session.advance_turn(scene, who, request).await?;
        let name = session.instance(who)?.name().to_string();
        println!("{name} ({}): {}", response.operation, response.content.unwrap_or_default());
    }
    session.close_scene(scene)?;

    let answer = session
        .ask(CallerId::agent("narrator"), roger, "Do you trust Lizzy?", None)
        .await?
        .into_result()?;
    println!("Roger (answer): {}", answer.content.unwrap_or_default());

    println!("\nSally remembers:");
    for entry in session.read_memory(sally, MemoryFilter::current())?.iter() {
        println!("  [{}] {}", entry.sequence, entry.summary());
    }

    let snapshot = session.export_state();
    println!(
        "\nSnapshot: {} instances, {} memories, {} bytes",
        snapshot.metadata.instance_count,
        snapshot.metadata.memory_entry_count,
        snapshot.to_json()?.len()
    );
    Ok(())
}
