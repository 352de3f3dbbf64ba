//! Character agent type descriptors.

use crate::backend::GenerativeBackend;
use crate::capability::{BackendBehavior, CapabilitySet, CharacterBehavior};
use crate::error::{Result, RuntimeError, SchemaError};
use crate::id::TypeId;
use crate::schema::TraitSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Instruction template used when a descriptor does not supply one.
pub const DEFAULT_TEMPLATE: &str =
    "You are {{name}}, a character in an interactive story. Stay in character.\n\n{{instructions}}";

/// Where a type came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    /// Shipped with the runtime
    BuiltIn,
    /// Written by the story author
    UserDefined,
    /// Loaded from an outside package; validated more strictly
    ThirdParty,
}

/// Unvalidated type definition handed to [`TypeRegistry::register`].
///
/// [`TypeRegistry::register`]: crate::character::TypeRegistry::register
pub struct TypeDescriptor {
    pub(crate) id: TypeId,
    pub(crate) description: String,
    pub(crate) provenance: Provenance,
    pub(crate) schema: TraitSchema,
    pub(crate) instruction_template: String,
    pub(crate) capabilities: Option<CapabilitySet>,
    pub(crate) backend: Arc<dyn GenerativeBackend>,
    pub(crate) behavior: Arc<dyn CharacterBehavior>,
}

impl TypeDescriptor {
    /// A user-defined type that hands every operation straight to `backend`.
    pub fn new(
        id: impl Into<TypeId>,
        schema: TraitSchema,
        backend: Arc<dyn GenerativeBackend>,
    ) -> Self {
        Self {
            id: id.into(),
            description: String::new(),
            provenance: Provenance::UserDefined,
            schema,
            instruction_template: DEFAULT_TEMPLATE.to_string(),
            capabilities: None,
            backend,
            behavior: Arc::new(BackendBehavior),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_provenance(mut self, provenance: Provenance) -> Self {
        self.provenance = provenance;
        self
    }

    pub fn with_template(mut self, template: impl Into<String>) -> Self {
        self.instruction_template = template.into();
        self
    }

    pub fn with_behavior(mut self, behavior: Arc<dyn CharacterBehavior>) -> Self {
        self.behavior = behavior;
        self
    }

    /// Declare the capability claim explicitly instead of taking it from the
    /// behavior.
    pub fn with_capabilities(mut self, capabilities: CapabilitySet) -> Self {
        self.capabilities = Some(capabilities);
        self
    }

    pub fn id(&self) -> &TypeId {
        &self.id
    }

    /// Validate the descriptor and freeze it into a registered type.
    pub(crate) fn build(self) -> Result<CharacterAgentType> {
        let violation = |source: SchemaError| RuntimeError::SchemaViolation {
            type_id: self.id.clone(),
            source,
        };

        self.schema.validate().map_err(violation)?;

        let capabilities = self
            .capabilities
            .clone()
            .unwrap_or_else(|| self.behavior.capabilities());
        let missing = capabilities.missing();
        if !missing.is_empty() {
            return Err(RuntimeError::ContractViolation {
                type_id: self.id.clone(),
                missing,
            });
        }

        if self.provenance == Provenance::ThirdParty {
            self.schema.validate_strict().map_err(violation)?;
            if self.instruction_template.trim().is_empty() {
                return Err(violation(SchemaError::Policy(
                    "instruction template must not be empty".to_string(),
                )));
            }
        }

        Ok(CharacterAgentType {
            id: self.id,
            description: self.description,
            provenance: self.provenance,
            schema: self.schema,
            instruction_template: self.instruction_template,
            capabilities,
            backend: self.backend,
            behavior: self.behavior,
        })
    }
}

impl fmt::Debug for TypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeDescriptor")
            .field("id", &self.id)
            .field("provenance", &self.provenance)
            .field("schema", &self.schema)
            .field("backend", &self.backend.name())
            .finish_non_exhaustive()
    }
}

/// A registered, immutable character type shared by all its instances.
pub struct CharacterAgentType {
    id: TypeId,
    description: String,
    provenance: Provenance,
    schema: TraitSchema,
    instruction_template: String,
    capabilities: CapabilitySet,
    backend: Arc<dyn GenerativeBackend>,
    behavior: Arc<dyn CharacterBehavior>,
}

impl CharacterAgentType {
    pub fn id(&self) -> &TypeId {
        &self.id
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn provenance(&self) -> Provenance {
        self.provenance
    }

    pub fn schema(&self) -> &TraitSchema {
        &self.schema
    }

    pub fn instruction_template(&self) -> &str {
        &self.instruction_template
    }

    pub fn capabilities(&self) -> &CapabilitySet {
        &self.capabilities
    }

    pub fn backend(&self) -> &Arc<dyn GenerativeBackend> {
        &self.backend
    }

    pub fn behavior(&self) -> &Arc<dyn CharacterBehavior> {
        &self.behavior
    }

    /// Render the template for one instance.
    ///
    /// `{{name}}` and `{{instructions}}` are substituted. A template without
    /// an `{{instructions}}` placeholder gets the instance instructions
    /// appended after a blank line.
    pub fn render_instructions(&self, name: &str, instructions: &str) -> String {
        let rendered = self.instruction_template.replace("{{name}}", name);
        if rendered.contains("{{instructions}}") {
            rendered
                .replace("{{instructions}}", instructions)
                .trim_end()
                .to_string()
        } else if instructions.is_empty() {
            rendered
        } else {
            format!("{}\n\n{instructions}", rendered.trim_end())
        }
    }
}

impl fmt::Debug for CharacterAgentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CharacterAgentType")
            .field("id", &self.id)
            .field("provenance", &self.provenance)
            .field("schema", &self.schema)
            .field("capabilities", &self.capabilities)
            .field("backend", &self.backend.name())
            .finish_non_exhaustive()
    }
}
