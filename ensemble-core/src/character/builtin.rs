//! Built-in character types.
//!
//! Two stock personality models: a five-trait `default` model and an `mbti`
//! model with four dimensions. Both are schemas and templates only; how the
//! numbers shape the output is up to the backend.

use super::{Provenance, TypeDescriptor};
use crate::backend::GenerativeBackend;
use crate::schema::{PropertySpec, TraitSchema};
use once_cell::sync::Lazy;
use std::sync::Arc;

pub const DEFAULT_TYPE_ID: &str = "default";
pub const MBTI_TYPE_ID: &str = "mbti";

const DEFAULT_TRAITS: [(&str, &str); 5] = [
    (
        "assertiveness",
        "How assertive and direct the character is (0=passive, 100=dominant)",
    ),
    (
        "warmth",
        "How warm and friendly the character is (0=cold, 100=very warm)",
    ),
    (
        "formality",
        "How formal the character's speech and manner are (0=casual, 100=very formal)",
    ),
    (
        "verbosity",
        "How talkative the character is (0=terse, 100=verbose)",
    ),
    (
        "emotionality",
        "How openly emotional the character is (0=stoic, 100=very expressive)",
    ),
];

const MBTI_DIMENSIONS: [(&str, &str); 4] = [
    ("extroversion", "E/I dimension: 0=Introverted, 100=Extroverted"),
    ("intuition", "N/S dimension: 0=Sensing, 100=Intuitive"),
    ("thinking", "T/F dimension: 0=Feeling, 100=Thinking"),
    ("judging", "J/P dimension: 0=Perceiving, 100=Judging"),
];

fn percent_schema(traits: &[(&str, &str)]) -> TraitSchema {
    TraitSchema::from_properties(
        traits
            .iter()
            .map(|(name, description)| {
                PropertySpec::real(*name, 0.0, 100.0)
                    .with_description(*description)
                    .with_default(50.0)
            })
            .collect(),
    )
}

static DEFAULT_SCHEMA: Lazy<TraitSchema> = Lazy::new(|| percent_schema(&DEFAULT_TRAITS));
static MBTI_SCHEMA: Lazy<TraitSchema> = Lazy::new(|| percent_schema(&MBTI_DIMENSIONS));

/// Schema of the `default` type.
pub fn default_schema() -> TraitSchema {
    DEFAULT_SCHEMA.clone()
}

/// Schema of the `mbti` type.
pub fn mbti_schema() -> TraitSchema {
    MBTI_SCHEMA.clone()
}

/// Five-trait personality type.
pub fn default_type(backend: Arc<dyn GenerativeBackend>) -> TypeDescriptor {
    TypeDescriptor::new(DEFAULT_TYPE_ID, default_schema(), backend)
        .with_provenance(Provenance::BuiltIn)
        .with_description("Personality described by five traits, each scored 0 to 100.")
        .with_template(
            "You are {{name}}, a character in an interactive story.\n\
             Let your traits below shape how you speak and decide, without naming them.\n\n\
             {{instructions}}",
        )
}

/// Myers-Briggs style type.
pub fn mbti_type(backend: Arc<dyn GenerativeBackend>) -> TypeDescriptor {
    TypeDescriptor::new(MBTI_TYPE_ID, mbti_schema(), backend)
        .with_provenance(Provenance::BuiltIn)
        .with_description("Personality described by four MBTI dimensions, each scored 0 to 100.")
        .with_template(
            "You are {{name}}, a character in an interactive story.\n\
             Your temperament follows the MBTI dimensions below; express it through behavior.\n\n\
             {{instructions}}",
        )
}

/// Every built-in type, sharing one backend.
pub fn all(backend: Arc<dyn GenerativeBackend>) -> Vec<TypeDescriptor> {
    vec![default_type(backend.clone()), mbti_type(backend)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::PropertyMap;
    use crate::testing::ScriptedBackend;

    #[test]
    fn test_builtin_schemas_are_strictly_valid() {
        default_schema().validate_strict().unwrap();
        mbti_schema().validate_strict().unwrap();
        assert_eq!(default_schema().len(), 5);
        assert_eq!(
            mbti_schema().keys().collect::<Vec<_>>(),
            vec!["extroversion", "intuition", "thinking", "judging"]
        );
    }

    #[test]
    fn test_defaults_fill_schema() {
        let schema = mbti_schema();
        let filled = schema.fill_defaults(PropertyMap::new());
        schema.check_values(&filled).unwrap();
    }

    #[test]
    fn test_builtin_types_build() {
        for descriptor in all(Arc::new(ScriptedBackend::new())) {
            let agent_type = descriptor.build().unwrap();
            assert_eq!(agent_type.provenance(), Provenance::BuiltIn);
        }
    }
}
