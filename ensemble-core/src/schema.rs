//! Trait schemas: the named, typed properties a character type exposes.
//!
//! A schema is pure data. Types declare one at registration, and every
//! instance must supply exactly one in-domain value per declared property.

use crate::error::SchemaError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;

/// Upper bound on properties for third-party types.
pub const MAX_THIRD_PARTY_PROPERTIES: usize = 32;

/// Property values of an instance, keyed by property name.
pub type PropertyMap = BTreeMap<String, PropertyValue>;

/// Valid domain of a property.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PropertyDomain {
    /// Real number in the closed range `[min, max]`
    Real { min: f64, max: f64 },
    /// Integer in the closed range `[min, max]`
    Integer { min: i64, max: i64 },
    /// True or false
    Boolean,
    /// Free text, optionally length-limited (in characters)
    Text { max_len: Option<usize> },
    /// One of a fixed set of options
    Choice { options: Vec<String> },
}

impl PropertyDomain {
    fn kind_name(&self) -> &'static str {
        match self {
            PropertyDomain::Real { .. } => "real",
            PropertyDomain::Integer { .. } => "integer",
            PropertyDomain::Boolean => "boolean",
            PropertyDomain::Text { .. } => "text",
            PropertyDomain::Choice { .. } => "choice",
        }
    }

    fn check_well_formed(&self, property: &str) -> Result<(), SchemaError> {
        let invalid = |reason: &str| SchemaError::InvalidDomain {
            property: property.to_string(),
            reason: reason.to_string(),
        };
        match self {
            PropertyDomain::Real { min, max } => {
                if min.is_nan() || max.is_nan() {
                    return Err(invalid("bounds must be numbers"));
                }
                if min > max {
                    return Err(invalid("minimum exceeds maximum"));
                }
            }
            PropertyDomain::Integer { min, max } => {
                if min > max {
                    return Err(invalid("minimum exceeds maximum"));
                }
            }
            PropertyDomain::Boolean => {}
            PropertyDomain::Text { max_len } => {
                if *max_len == Some(0) {
                    return Err(invalid("maximum length must be positive"));
                }
            }
            PropertyDomain::Choice { options } => {
                if options.is_empty() {
                    return Err(invalid("choice set is empty"));
                }
                let mut seen = HashSet::new();
                for option in options {
                    if !seen.insert(option.as_str()) {
                        return Err(invalid(&format!("option '{option}' is repeated")));
                    }
                }
            }
        }
        Ok(())
    }

    /// Check a value against this domain.
    fn check_value(&self, property: &str, value: &PropertyValue) -> Result<(), SchemaError> {
        let wrong_kind = || SchemaError::WrongKind {
            property: property.to_string(),
            expected: self.kind_name().to_string(),
            found: value.kind_name().to_string(),
        };
        let out_of_range = || SchemaError::OutOfRange {
            property: property.to_string(),
            value: value.to_string(),
            domain: self.to_string(),
        };

        match (self, value) {
            (PropertyDomain::Real { min, max }, PropertyValue::Real(v)) => {
                if !v.is_finite() || v < min || v > max {
                    return Err(out_of_range());
                }
            }
            // Whole numbers are valid reals; JSON does not distinguish 1 from 1.0.
            (PropertyDomain::Real { min, max }, PropertyValue::Integer(v)) => {
                let v = *v as f64;
                if v < *min || v > *max {
                    return Err(out_of_range());
                }
            }
            (PropertyDomain::Integer { min, max }, PropertyValue::Integer(v)) => {
                if v < min || v > max {
                    return Err(out_of_range());
                }
            }
            (PropertyDomain::Boolean, PropertyValue::Bool(_)) => {}
            (PropertyDomain::Text { max_len }, PropertyValue::Text(text)) => {
                if let Some(max) = max_len {
                    if text.chars().count() > *max {
                        return Err(out_of_range());
                    }
                }
            }
            (PropertyDomain::Choice { options }, PropertyValue::Text(text)) => {
                if !options.iter().any(|o| o == text) {
                    return Err(out_of_range());
                }
            }
            _ => return Err(wrong_kind()),
        }
        Ok(())
    }
}

impl fmt::Display for PropertyDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyDomain::Real { min, max } => write!(f, "real in [{min}, {max}]"),
            PropertyDomain::Integer { min, max } => write!(f, "integer in [{min}, {max}]"),
            PropertyDomain::Boolean => write!(f, "boolean"),
            PropertyDomain::Text { max_len: Some(max) } => write!(f, "text of at most {max} chars"),
            PropertyDomain::Text { max_len: None } => write!(f, "text"),
            PropertyDomain::Choice { options } => write!(f, "one of {}", options.join("|")),
        }
    }
}

/// A concrete property value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Bool(bool),
    Integer(i64),
    Real(f64),
    Text(String),
}

impl PropertyValue {
    fn kind_name(&self) -> &'static str {
        match self {
            PropertyValue::Bool(_) => "boolean",
            PropertyValue::Integer(_) => "integer",
            PropertyValue::Real(_) => "real",
            PropertyValue::Text(_) => "text",
        }
    }

    /// Numeric view of the value, if it is a number.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            PropertyValue::Integer(v) => Some(*v as f64),
            PropertyValue::Real(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropertyValue::Text(text) => Some(text),
            _ => None,
        }
    }
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyValue::Bool(v) => write!(f, "{v}"),
            PropertyValue::Integer(v) => write!(f, "{v}"),
            PropertyValue::Real(v) => write!(f, "{v}"),
            PropertyValue::Text(v) => write!(f, "\"{v}\""),
        }
    }
}

impl From<f64> for PropertyValue {
    fn from(v: f64) -> Self {
        PropertyValue::Real(v)
    }
}

impl From<i64> for PropertyValue {
    fn from(v: i64) -> Self {
        PropertyValue::Integer(v)
    }
}

impl From<bool> for PropertyValue {
    fn from(v: bool) -> Self {
        PropertyValue::Bool(v)
    }
}

impl From<&str> for PropertyValue {
    fn from(v: &str) -> Self {
        PropertyValue::Text(v.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(v: String) -> Self {
        PropertyValue::Text(v)
    }
}

/// Declaration of a single property.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertySpec {
    /// Property name, unique within the schema
    pub name: String,
    /// Valid values
    pub domain: PropertyDomain,
    /// What the property means, shown to generative backends
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Value used by [`TraitSchema::fill_defaults`]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<PropertyValue>,
}

impl PropertySpec {
    pub fn new(name: impl Into<String>, domain: PropertyDomain) -> Self {
        Self {
            name: name.into(),
            domain,
            description: None,
            default: None,
        }
    }

    /// A real-valued property in `[min, max]`.
    pub fn real(name: impl Into<String>, min: f64, max: f64) -> Self {
        Self::new(name, PropertyDomain::Real { min, max })
    }

    /// An integer property in `[min, max]`.
    pub fn integer(name: impl Into<String>, min: i64, max: i64) -> Self {
        Self::new(name, PropertyDomain::Integer { min, max })
    }

    pub fn boolean(name: impl Into<String>) -> Self {
        Self::new(name, PropertyDomain::Boolean)
    }

    pub fn text(name: impl Into<String>, max_len: Option<usize>) -> Self {
        Self::new(name, PropertyDomain::Text { max_len })
    }

    pub fn choice<S: Into<String>>(name: impl Into<String>, options: impl IntoIterator<Item = S>) -> Self {
        Self::new(
            name,
            PropertyDomain::Choice {
                options: options.into_iter().map(Into::into).collect(),
            },
        )
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_default(mut self, default: impl Into<PropertyValue>) -> Self {
        self.default = Some(default.into());
        self
    }
}

/// Ordered set of property declarations for a character type.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TraitSchema {
    properties: Vec<PropertySpec>,
}

impl TraitSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_properties(properties: Vec<PropertySpec>) -> Self {
        Self { properties }
    }

    /// Append a property declaration.
    pub fn with_property(mut self, spec: PropertySpec) -> Self {
        self.properties.push(spec);
        self
    }

    pub fn properties(&self) -> &[PropertySpec] {
        &self.properties
    }

    pub fn get(&self, name: &str) -> Option<&PropertySpec> {
        self.properties.iter().find(|p| p.name == name)
    }

    /// Property names in declaration order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.properties.iter().map(|p| p.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.properties.len()
    }

    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }

    /// Check the schema itself: non-empty, no name collisions, well-formed
    /// domains, and defaults inside their domains.
    pub fn validate(&self) -> Result<(), SchemaError> {
        if self.properties.is_empty() {
            return Err(SchemaError::Empty);
        }

        let mut seen = HashSet::new();
        for spec in &self.properties {
            if spec.name.trim().is_empty() {
                return Err(SchemaError::InvalidDomain {
                    property: spec.name.clone(),
                    reason: "property name is blank".to_string(),
                });
            }
            if !seen.insert(spec.name.as_str()) {
                return Err(SchemaError::DuplicateProperty(spec.name.clone()));
            }
            spec.domain.check_well_formed(&spec.name)?;
            if let Some(default) = &spec.default {
                spec.domain.check_value(&spec.name, default)?;
            }
        }
        Ok(())
    }

    /// Stricter validation applied to third-party types before activation.
    pub fn validate_strict(&self) -> Result<(), SchemaError> {
        self.validate()?;

        if self.properties.len() > MAX_THIRD_PARTY_PROPERTIES {
            return Err(SchemaError::Policy(format!(
                "{} properties declared, at most {MAX_THIRD_PARTY_PROPERTIES} allowed",
                self.properties.len()
            )));
        }

        for spec in &self.properties {
            if !is_snake_case(&spec.name) {
                return Err(SchemaError::Policy(format!(
                    "property '{}' must be lowercase snake_case",
                    spec.name
                )));
            }
            if spec.description.as_deref().map_or(true, |d| d.trim().is_empty()) {
                return Err(SchemaError::Policy(format!(
                    "property '{}' has no description",
                    spec.name
                )));
            }
            match &spec.domain {
                PropertyDomain::Real { min, max } if !min.is_finite() || !max.is_finite() => {
                    return Err(SchemaError::Policy(format!(
                        "property '{}' must have finite bounds",
                        spec.name
                    )));
                }
                PropertyDomain::Text { max_len: None } => {
                    return Err(SchemaError::Policy(format!(
                        "text property '{}' must declare a maximum length",
                        spec.name
                    )));
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Check that `values` matches the schema exactly.
    pub fn check_values(&self, values: &PropertyMap) -> Result<(), SchemaError> {
        for spec in &self.properties {
            let value = values
                .get(&spec.name)
                .ok_or_else(|| SchemaError::MissingProperty(spec.name.clone()))?;
            spec.domain.check_value(&spec.name, value)?;
        }
        if let Some(extra) = values.keys().find(|k| self.get(k).is_none()) {
            return Err(SchemaError::UnexpectedProperty(extra.clone()));
        }
        Ok(())
    }

    /// Return `values` with declared defaults added for absent properties.
    ///
    /// Instantiation never applies defaults on its own; authoring code calls
    /// this explicitly when it wants them.
    pub fn fill_defaults(&self, mut values: PropertyMap) -> PropertyMap {
        for spec in &self.properties {
            if let Some(default) = &spec.default {
                values
                    .entry(spec.name.clone())
                    .or_insert_with(|| default.clone());
            }
        }
        values
    }
}

fn is_snake_case(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_lowercase())
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}
