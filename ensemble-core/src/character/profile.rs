//! Narrative profile of a character.

use serde::{Deserialize, Serialize};
use std::fmt::Write as _;

/// Who a character is in the story, independent of its trait values.
///
/// Only the name is required. Empty fields are left out of prompts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharacterProfile {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Protagonist, antagonist, supporting, ...
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub motivations: String,
    /// Ties to other characters
    #[serde(default)]
    pub relationships: String,
    #[serde(default)]
    pub backstory: String,
}

impl CharacterProfile {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = role.into();
        self
    }

    pub fn with_motivations(mut self, motivations: impl Into<String>) -> Self {
        self.motivations = motivations.into();
        self
    }

    pub fn with_relationships(mut self, relationships: impl Into<String>) -> Self {
        self.relationships = relationships.into();
        self
    }

    pub fn with_backstory(mut self, backstory: impl Into<String>) -> Self {
        self.backstory = backstory.into();
        self
    }

    /// Labelled lines for the non-empty narrative fields.
    pub fn render(&self) -> String {
        let fields = [
            ("Role", &self.role),
            ("Description", &self.description),
            ("Motivations", &self.motivations),
            ("Relationships", &self.relationships),
            ("Backstory", &self.backstory),
        ];
        let mut out = String::new();
        for (label, value) in fields {
            let value = value.trim();
            if value.is_empty() {
                continue;
            }
            if !out.is_empty() {
                out.push('\n');
            }
            let _ = write!(out, "{label}: {value}");
        }
        out
    }
}

impl From<&str> for CharacterProfile {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for CharacterProfile {
    fn from(name: String) -> Self {
        Self::new(name)
    }
}
