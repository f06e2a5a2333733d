//! Command template expansion.
//!
//! Recognized placeholders:
//!
//! | placeholder    | expands to                                         |
//! |----------------|----------------------------------------------------|
//! | `{input}`      | path of the first input                            |
//! | `{input.N}`    | path of input `N` (0-based, declaration order)     |
//! | `{inputs}`     | every input path; one argument each when alone     |
//! | `{output}`     | the staging output path                            |
//! | `{work_dir}`   | the scratch directory                              |
//! | `{sample}`     | the sample id                                      |
//! | `{stage}`      | the stage id                                       |
//! | `{config.KEY}` | resolved option `KEY` (strings unquoted)           |
//! | `{manifest}`   | search manifest written into the work directory    |

use super::search_manifest::{manifest_path, DATA_TYPE_OPTION};
use super::{InvocationError, InvocationRequest};
use crate::contracts::{CommandSpec, StageDefinition};
use crate::errors::{Diagnostic, InvalidInputError};
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::LazyLock;

#[allow(clippy::expect_used)]
static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{([a-z_]+)(?:\.([A-Za-z0-9_\-]+))?\}").expect("placeholder pattern is valid")
});

#[derive(Debug, Clone, PartialEq, Eq)]
enum Placeholder {
    Input(usize),
    Inputs,
    Output,
    WorkDir,
    Sample,
    Stage,
    Config(String),
    Manifest,
}

impl Placeholder {
    fn parse(name: &str, qualifier: Option<&str>) -> Result<Self, String> {
        match (name, qualifier) {
            ("input", None) => Ok(Self::Input(0)),
            ("input", Some(index)) => index
                .parse()
                .map(Self::Input)
                .map_err(|_| format!("'{{input.{index}}}' needs a numeric index")),
            ("inputs", None) => Ok(Self::Inputs),
            ("output", None) => Ok(Self::Output),
            ("work_dir", None) => Ok(Self::WorkDir),
            ("sample", None) => Ok(Self::Sample),
            ("stage", None) => Ok(Self::Stage),
            ("manifest", None) => Ok(Self::Manifest),
            ("config", Some(key)) => Ok(Self::Config(key.to_string())),
            (name, Some(q)) => Err(format!("unknown placeholder '{{{name}.{q}}}'")),
            (name, None) => Err(format!("unknown placeholder '{{{name}}}'")),
        }
    }
}

/// A fully expanded command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedCommand {
    /// Program to run.
    pub program: String,
    /// Arguments.
    pub args: Vec<String>,
    /// Extra environment variables.
    pub env: BTreeMap<String, String>,
}

/// Expands a [`CommandSpec`] for one invocation.
#[derive(Debug, Clone, Copy)]
pub struct CommandTemplate<'a> {
    spec: &'a CommandSpec,
}

impl<'a> CommandTemplate<'a> {
    /// Wraps a command spec.
    #[must_use]
    pub const fn new(spec: &'a CommandSpec) -> Self {
        Self { spec }
    }

    fn templates(&self) -> impl Iterator<Item = &'a str> {
        std::iter::once(self.spec.program.as_str())
            .chain(self.spec.args.iter().map(String::as_str))
            .chain(self.spec.env.values().map(String::as_str))
    }

    /// Whether the command reads a search manifest, which must then be
    /// written before the collaborator starts.
    #[must_use]
    pub fn uses_manifest(&self) -> bool {
        self.templates().any(|template| {
            PLACEHOLDER
                .captures_iter(template)
                .any(|caps| caps.get(1).is_some_and(|m| m.as_str() == "manifest") && caps.get(2).is_none())
        })
    }

    /// Checks every placeholder against the stage contract.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown placeholders, input indexes past the
    /// declared inputs, and config keys the schema does not recognize.
    pub fn validate(&self, stage: &StageDefinition) -> Result<(), InvalidInputError> {
        for template in self.templates() {
            for caps in PLACEHOLDER.captures_iter(template) {
                let name = caps.get(1).map_or("", |m| m.as_str());
                let qualifier = caps.get(2).map(|m| m.as_str());
                let placeholder = Placeholder::parse(name, qualifier)
                    .map_err(|reason| InvalidInputError::new(&stage.id, reason))?;
                match placeholder {
                    Placeholder::Input(index) if index >= stage.inputs.len() => {
                        return Err(InvalidInputError::new(
                            &stage.id,
                            format!(
                                "template uses input {index} but the stage declares {} input(s)",
                                stage.inputs.len()
                            ),
                        ));
                    }
                    Placeholder::Config(key) if stage.config.get(&key).is_none() => {
                        return Err(InvalidInputError::new(
                            &stage.id,
                            format!("template references unknown option '{key}'"),
                        ));
                    }
                    Placeholder::Manifest
                        if stage.inputs.is_empty() || stage.config.get(DATA_TYPE_OPTION).is_none() =>
                    {
                        return Err(InvalidInputError::new(
                            &stage.id,
                            format!("'{{manifest}}' needs an input and a '{DATA_TYPE_OPTION}' option"),
                        ));
                    }
                    _ => {}
                }
            }
        }
        Ok(())
    }

    /// Expands the program, arguments and environment for `request`.
    ///
    /// # Errors
    ///
    /// Returns a permanent [`InvocationError`] if a placeholder cannot be
    /// expanded.
    pub fn render(&self, request: &InvocationRequest) -> Result<RenderedCommand, InvocationError> {
        let fail = |reason: String| {
            InvocationError::permanent(Diagnostic::new(format!("cannot expand command template: {reason}")))
        };

        let program = expand(&self.spec.program, request).map_err(fail)?;
        let mut args = Vec::with_capacity(self.spec.args.len());
        for arg in &self.spec.args {
            if arg.trim() == "{inputs}" {
                args.extend(request.inputs.iter().map(|i| i.path.to_string_lossy().into_owned()));
            } else {
                args.push(expand(arg, request).map_err(fail)?);
            }
        }
        let mut env = BTreeMap::new();
        for (key, value) in &self.spec.env {
            env.insert(key.clone(), expand(value, request).map_err(fail)?);
        }

        Ok(RenderedCommand { program, args, env })
    }
}

fn expand(template: &str, request: &InvocationRequest) -> Result<String, String> {
    let mut out = String::with_capacity(template.len());
    let mut last = 0;
    for caps in PLACEHOLDER.captures_iter(template) {
        let Some(whole) = caps.get(0) else { continue };
        out.push_str(&template[last..whole.start()]);
        let name = caps.get(1).map_or("", |m| m.as_str());
        let placeholder = Placeholder::parse(name, caps.get(2).map(|m| m.as_str()))?;
        out.push_str(&value_of(&placeholder, request)?);
        last = whole.end();
    }
    out.push_str(&template[last..]);
    Ok(out)
}

fn value_of(placeholder: &Placeholder, request: &InvocationRequest) -> Result<String, String> {
    let path = |p: &std::path::Path| p.to_string_lossy().into_owned();
    Ok(match placeholder {
        Placeholder::Input(index) => request
            .inputs
            .get(*index)
            .map(|i| path(&i.path))
            .ok_or_else(|| format!("no input at index {index}"))?,
        Placeholder::Inputs => request
            .inputs
            .iter()
            .map(|i| path(&i.path))
            .collect::<Vec<_>>()
            .join(" "),
        Placeholder::Output => path(&request.output_path),
        Placeholder::WorkDir => path(&request.work_dir),
        Placeholder::Sample => request.sample.to_string(),
        Placeholder::Stage => request.stage.id.clone(),
        Placeholder::Manifest => path(&manifest_path(request)),
        Placeholder::Config(key) => match request.config.get(key) {
            Some(serde_json::Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => String::new(),
        },
    })
}
