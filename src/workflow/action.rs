//! Action types and parsing
//!
//! This module handles parsing the `uses` field of a step and resolving it to
//! either a built-in action or a reusable composite action registered in
//! `runner.yaml`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Built-in actions that run without a user-supplied definition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BuiltinAction {
    /// `shell/exec` - run `command` through the step shell
    ShellExec,
    /// `wait/ms` - sleep for `duration` milliseconds
    WaitMs,
    /// `fail/now` - always fails (for testing)
    FailNow,
}

impl BuiltinAction {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "shell/exec" => Some(Self::ShellExec),
            "wait/ms" => Some(Self::WaitMs),
            "fail/now" => Some(Self::FailNow),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::ShellExec => "shell/exec",
            Self::WaitMs => "wait/ms",
            Self::FailNow => "fail/now",
        }
    }

    /// Inputs that must be bound with `with:`
    pub fn required_inputs(&self) -> &'static [&'static str] {
        match self {
            Self::ShellExec => &["command"],
            Self::WaitMs => &["duration"],
            Self::FailNow => &[],
        }
    }

    /// Every input the action understands
    pub fn accepted_inputs(&self) -> &'static [&'static str] {
        match self {
            Self::ShellExec => &["command"],
            Self::WaitMs => &["duration"],
            Self::FailNow => &["message", "exit_code"],
        }
    }
}

/// A parsed `uses` reference: `name[@version]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedAction {
    pub name: String,
    pub version: Option<String>,
}

impl ParsedAction {
    /// Parse a `uses` string like `shell/exec` or `docker/build@v2`
    pub fn parse(uses: &str) -> Result<Self, String> {
        let uses = uses.trim();
        let (name, version) = match uses.split_once('@') {
            Some((name, version)) => (name, Some(version)),
            None => (uses, None),
        };

        if name.is_empty() || name.chars().any(char::is_whitespace) {
            return Err(format!("Invalid action reference: '{}'", uses));
        }
        if let Some(v) = version {
            if v.is_empty() || v.chars().any(char::is_whitespace) {
                return Err(format!("Invalid action version in: '{}'", uses));
            }
        }

        Ok(Self {
            name: name.to_string(),
            version: version.map(String::from),
        })
    }
}

/// Declared input of a composite action
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActionInput {
    #[serde(default)]
    pub description: Option<String>,

    #[serde(default)]
    pub required: bool,

    #[serde(default)]
    pub default: Option<String>,
}

/// A reusable composite action: a `run` template with typed inputs
///
/// ```yaml
/// actions:
///   docker/build-push:
///     inputs:
///       image: { required: true }
///     run: docker build -t ${{ inputs.image }} . && docker push ${{ inputs.image }}
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionDefinition {
    #[serde(default)]
    pub description: Option<String>,

    #[serde(default)]
    pub inputs: BTreeMap<String, ActionInput>,

    pub run: String,

    #[serde(default)]
    pub shell: Option<String>,
}

/// What a `uses` reference resolved to
#[derive(Debug, Clone, Copy)]
pub enum ResolvedAction<'a> {
    Builtin(BuiltinAction),
    Composite(&'a ActionDefinition),
}

/// Lookup table for `uses` references
#[derive(Debug, Clone, Default)]
pub struct ActionRegistry {
    composites: BTreeMap<String, ActionDefinition>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a composite action under a name
    pub fn register(&mut self, name: impl Into<String>, definition: ActionDefinition) {
        self.composites.insert(name.into(), definition);
    }

    /// Build a registry from `runner.yaml` action definitions
    pub fn from_definitions(definitions: &BTreeMap<String, ActionDefinition>) -> Self {
        Self {
            composites: definitions.clone(),
        }
    }

    /// Resolve an action. Registered composites may shadow built-ins.
    pub fn resolve(&self, action: &ParsedAction) -> Option<ResolvedAction<'_>> {
        if let Some(definition) = self.composites.get(&action.name) {
            return Some(ResolvedAction::Composite(definition));
        }
        BuiltinAction::from_name(&action.name).map(ResolvedAction::Builtin)
    }

    /// Names of registered composite actions
    pub fn composite_names(&self) -> Vec<&str> {
        self.composites.keys().map(|s| s.as_str()).collect()
    }
}
