//! Typed configuration schemas for stage collaborators.

use crate::errors::InvalidInputError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;

/// Resolved configuration handed to a collaborator.
pub type ResolvedConfig = Map<String, Value>;

/// Value type of a configuration option.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OptionKind {
    /// Free-form string.
    String,
    /// Signed or unsigned integer.
    Integer,
    /// Any JSON number.
    Float,
    /// `true` / `false`.
    Boolean,
    /// One of a fixed set of strings.
    Enum {
        /// Allowed values.
        values: Vec<String>,
    },
}

impl OptionKind {
    fn accepts(&self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Float => value.is_number(),
            Self::Boolean => value.is_boolean(),
            Self::Enum { values } => value
                .as_str()
                .is_some_and(|v| values.iter().any(|allowed| allowed == v)),
        }
    }

    fn describe(&self) -> String {
        match self {
            Self::String => "a string".to_string(),
            Self::Integer => "an integer".to_string(),
            Self::Float => "a number".to_string(),
            Self::Boolean => "a boolean".to_string(),
            Self::Enum { values } => format!("one of [{}]", values.join(", ")),
        }
    }
}

/// A named configuration option.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptionSpec {
    /// Option name.
    pub name: String,
    /// Value type.
    #[serde(flatten)]
    pub kind: OptionKind,
    /// Whether a value must be supplied (no default).
    #[serde(default)]
    pub required: bool,
    /// Value used when none is supplied.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    /// Optional description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl OptionSpec {
    /// Creates an optional option of the given kind.
    #[must_use]
    pub fn new(name: impl Into<String>, kind: OptionKind) -> Self {
        Self {
            name: name.into(),
            kind,
            required: false,
            default: None,
            description: None,
        }
    }

    /// A required string option.
    #[must_use]
    pub fn required_string(name: impl Into<String>) -> Self {
        Self::new(name, OptionKind::String).required()
    }

    /// An enum option.
    #[must_use]
    pub fn enumeration<I, S>(name: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(
            name,
            OptionKind::Enum {
                values: values.into_iter().map(Into::into).collect(),
            },
        )
    }

    /// Marks the option as required.
    #[must_use]
    pub const fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Sets the default value.
    #[must_use]
    pub fn with_default(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    /// Sets the description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// The set of options a stage recognizes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigSchema {
    /// Recognized options, in declaration order.
    #[serde(default)]
    pub options: Vec<OptionSpec>,
}

impl ConfigSchema {
    /// Creates an empty schema.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an option.
    #[must_use]
    pub fn option(mut self, option: OptionSpec) -> Self {
        self.options.push(option);
        self
    }

    /// Looks up an option by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&OptionSpec> {
        self.options.iter().find(|o| o.name == name)
    }

    /// Checks the schema itself: unique names, usable enums, well-typed defaults.
    ///
    /// # Errors
    ///
    /// Returns an error describing the first inconsistency.
    pub fn validate(&self, stage_id: &str) -> Result<(), InvalidInputError> {
        let mut seen = HashSet::new();
        for option in &self.options {
            if option.name.trim().is_empty() {
                return Err(InvalidInputError::new(stage_id, "configuration option with empty name"));
            }
            if !seen.insert(option.name.as_str()) {
                return Err(InvalidInputError::new(
                    stage_id,
                    format!("configuration option '{}' declared twice", option.name),
                ));
            }
            if let OptionKind::Enum { values } = &option.kind {
                if values.is_empty() {
                    return Err(InvalidInputError::new(
                        stage_id,
                        format!("enum option '{}' has no allowed values", option.name),
                    ));
                }
            }
            if option.required && option.default.is_some() {
                return Err(InvalidInputError::new(
                    stage_id,
                    format!("option '{}' is required and cannot have a default", option.name),
                ));
            }
            if let Some(default) = &option.default {
                if !option.kind.accepts(default) {
                    return Err(InvalidInputError::new(
                        stage_id,
                        format!(
                            "default for '{}' must be {}, got {default}",
                            option.name,
                            option.kind.describe()
                        ),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Validates supplied values and fills in defaults.
    ///
    /// Unknown keys, wrongly typed values and missing required options are
    /// rejected. Optional options without a default and without a value are
    /// left out of the result.
    ///
    /// # Errors
    ///
    /// Returns an [`InvalidInputError`] naming the offending option.
    pub fn resolve(
        &self,
        stage_id: &str,
        values: &Map<String, Value>,
    ) -> Result<ResolvedConfig, InvalidInputError> {
        if let Some(unknown) = values.keys().find(|k| self.get(k).is_none()) {
            let known: Vec<&str> = self.options.iter().map(|o| o.name.as_str()).collect();
            return Err(InvalidInputError::new(
                stage_id,
                format!(
                    "unrecognized configuration option '{unknown}' (known: [{}])",
                    known.join(", ")
                ),
            ));
        }

        let mut resolved = Map::new();
        for option in &self.options {
            match values.get(&option.name) {
                Some(value) if option.kind.accepts(value) => {
                    resolved.insert(option.name.clone(), value.clone());
                }
                Some(value) => {
                    return Err(InvalidInputError::new(
                        stage_id,
                        format!(
                            "option '{}' must be {}, got {value}",
                            option.name,
                            option.kind.describe()
                        ),
                    ));
                }
                None if option.required => {
                    return Err(InvalidInputError::new(
                        stage_id,
                        format!("required option '{}' is missing", option.name),
                    ));
                }
                None => {
                    if let Some(default) = &option.default {
                        resolved.insert(option.name.clone(), default.clone());
                    }
                }
            }
        }
        Ok(resolved)
    }
}
