//! Stage definitions and collaborator references.

use super::ConfigSchema;
use crate::core::ArtifactType;
use crate::engine::RetryConfig;
use crate::errors::InvalidInputError;
use crate::invoke::CommandTemplate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A subprocess collaborator.
///
/// `program` and `args` are templates; see [`crate::invoke::CommandTemplate`]
/// for the placeholders they may contain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    /// Program to execute.
    pub program: String,
    /// Argument templates.
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment variables (values are templates too).
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Kill the process after this many seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Exit codes that signal a transient failure worth retrying.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub transient_exit_codes: Vec<i32>,
}

impl CommandSpec {
    /// Creates a command spec.
    #[must_use]
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            env: BTreeMap::new(),
            timeout_secs: None,
            transient_exit_codes: Vec::new(),
        }
    }

    /// Sets the timeout.
    #[must_use]
    pub const fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    /// Adds an environment variable.
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Sets the exit codes treated as transient.
    #[must_use]
    pub fn with_transient_exit_codes(mut self, codes: impl IntoIterator<Item = i32>) -> Self {
        self.transient_exit_codes = codes.into_iter().collect();
        self
    }
}

fn default_endpoint_timeout() -> u64 {
    300
}

/// A model-serving HTTP endpoint collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointSpec {
    /// URL receiving the JSON invocation request.
    pub url: String,
    /// Request timeout in seconds.
    #[serde(default = "default_endpoint_timeout")]
    pub timeout_secs: u64,
    /// Additional headers.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl EndpointSpec {
    /// Creates an endpoint spec with the default timeout.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            timeout_secs: default_endpoint_timeout(),
            headers: BTreeMap::new(),
        }
    }
}

/// Reference to the external tool or model that performs a stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Collaborator {
    /// Run a local program.
    Command(CommandSpec),
    /// Call a model-serving endpoint.
    Endpoint(EndpointSpec),
}

impl Collaborator {
    /// Short label for logs.
    #[must_use]
    pub fn label(&self) -> &str {
        match self {
            Self::Command(spec) => &spec.program,
            Self::Endpoint(spec) => &spec.url,
        }
    }
}

/// Declares one pipeline stage: what it consumes, what it produces, and who
/// does the work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageDefinition {
    /// Unique stage id.
    pub id: String,
    /// Optional description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Required input types, in the order passed to the collaborator.
    pub inputs: Vec<ArtifactType>,
    /// The single produced type.
    pub output: ArtifactType,
    /// External tool or model.
    pub collaborator: Collaborator,
    /// Recognized configuration options.
    #[serde(default)]
    pub config: ConfigSchema,
    /// Retry policy for transient failures.
    #[serde(default)]
    pub retry: RetryConfig,
    /// Shared resource the stage competes for (e.g. `gpu`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_class: Option<String>,
}

impl StageDefinition {
    /// Creates a stage definition with an empty schema and default retry policy.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        inputs: impl IntoIterator<Item = ArtifactType>,
        output: ArtifactType,
        collaborator: Collaborator,
    ) -> Self {
        Self {
            id: id.into(),
            description: None,
            inputs: inputs.into_iter().collect(),
            output,
            collaborator,
            config: ConfigSchema::default(),
            retry: RetryConfig::default(),
            resource_class: None,
        }
    }

    /// Sets the configuration schema.
    #[must_use]
    pub fn with_config(mut self, config: ConfigSchema) -> Self {
        self.config = config;
        self
    }

    /// Sets the retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the resource class.
    #[must_use]
    pub fn with_resource_class(mut self, class: impl Into<String>) -> Self {
        self.resource_class = Some(class.into());
        self
    }

    /// Sets the description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Validates the definition in isolation.
    ///
    /// # Errors
    ///
    /// Returns an error if the id is empty, the stage consumes its own
    /// output, an input type is repeated, the retry policy allows no attempt,
    /// the configuration schema is inconsistent, or a command template uses
    /// a placeholder the contract cannot fill.
    pub fn validate(&self) -> Result<(), InvalidInputError> {
        if self.id.trim().is_empty() {
            return Err(InvalidInputError::new("<unnamed>", "stage id cannot be empty"));
        }
        if self.inputs.contains(&self.output) {
            return Err(InvalidInputError::new(
                &self.id,
                format!("stage cannot consume its own output type '{}'", self.output),
            ));
        }
        for (i, input) in self.inputs.iter().enumerate() {
            if self.inputs[..i].contains(input) {
                return Err(InvalidInputError::new(
                    &self.id,
                    format!("input type '{input}' is listed twice"),
                ));
            }
        }
        if self.retry.max_attempts == 0 {
            return Err(InvalidInputError::new(&self.id, "retry.max_attempts must be at least 1"));
        }
        self.config.validate(&self.id)?;
        if let Collaborator::Command(spec) = &self.collaborator {
            CommandTemplate::new(spec).validate(self)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::OptionSpec;

    fn command() -> Collaborator {
        Collaborator::Command(CommandSpec::new("predict-ccs", ["{input}", "{output}"]))
    }

    #[test]
    fn test_stage_definition_builder() {
        let def = StageDefinition::new(
            "ccs",
            [ArtifactType::RescoredPsms],
            ArtifactType::CcsPredictions,
            command(),
        )
        .with_resource_class("gpu")
        .with_description("CCS prediction");

        assert_eq!(def.id, "ccs");
        assert_eq!(def.inputs, vec![ArtifactType::RescoredPsms]);
        assert_eq!(def.resource_class.as_deref(), Some("gpu"));
        assert_eq!(def.retry.max_attempts, 3);
        assert!(def.validate().is_ok());
    }

    #[test]
    fn test_self_consuming_stage_rejected() {
        let def = StageDefinition::new(
            "loop",
            [ArtifactType::OrfCalls],
            ArtifactType::OrfCalls,
            command(),
        );
        assert!(def.validate().is_err());
    }

    #[test]
    fn test_repeated_input_rejected() {
        let def = StageDefinition::new(
            "rank",
            [ArtifactType::RescoredPsms, ArtifactType::RescoredPsms],
            ArtifactType::RankedList,
            command(),
        );
        assert!(def.validate().unwrap_err().reason.contains("listed twice"));
    }

    #[test]
    fn test_invalid_schema_propagates() {
        let def = StageDefinition::new(
            "binding",
            [ArtifactType::RescoredPsms],
            ArtifactType::BindingAffinities,
            command(),
        )
        .with_config(
            ConfigSchema::new().option(OptionSpec::required_string("haplotype").with_default("x")),
        );
        assert!(def.validate().is_err());
    }

    #[test]
    fn test_template_checked_against_contract() {
        let def = StageDefinition::new(
            "ccs",
            [ArtifactType::RescoredPsms],
            ArtifactType::CcsPredictions,
            Collaborator::Command(CommandSpec::new("predict", ["{input.1}"])),
        );
        assert!(def.validate().unwrap_err().reason.contains("input 1"));
    }

    #[test]
    fn test_collaborator_serde_shape() {
        let json = serde_json::json!({
            "kind": "command",
            "program": "timsconvert",
            "args": ["--input", "{input}", "--outdir", "{work_dir}"],
            "timeout_secs": 3600
        });
        let collaborator: Collaborator = serde_json::from_value(json).unwrap();
        match collaborator {
            Collaborator::Command(spec) => {
                assert_eq!(spec.program, "timsconvert");
                assert_eq!(spec.timeout_secs, Some(3600));
                assert!(spec.transient_exit_codes.is_empty());
            }
            Collaborator::Endpoint(_) => panic!("expected command"),
        }

        let endpoint: Collaborator =
            serde_json::from_value(serde_json::json!({"kind": "endpoint", "url": "http://koina:8501/ccs"}))
                .unwrap();
        assert_eq!(endpoint.label(), "http://koina:8501/ccs");
    }
}
