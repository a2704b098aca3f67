//! Workflow, Job, and Step definitions
//!
//! This module contains the pipeline document types that mirror GitHub Actions
//! concepts. They are plain deserialized data; references between jobs and
//! `${{ }}` bindings are validated by [`crate::engine::JobGraph::build`].

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;

use super::trigger::Triggers;

// ============================================================================
// Workflow
// ============================================================================

/// A complete pipeline definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    /// Pipeline name (required)
    pub name: String,

    /// Events that start this pipeline. Empty means any event.
    #[serde(default)]
    pub on: Triggers,

    /// Environment variables available to all jobs
    #[serde(default, deserialize_with = "deserialize_env")]
    pub env: BTreeMap<String, String>,

    /// Jobs to execute, keyed by job id
    pub jobs: BTreeMap<String, Job>,
}

impl Workflow {
    /// Parse a workflow from a YAML document
    pub fn from_yaml(yaml: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(yaml)
    }
}

// ============================================================================
// Job
// ============================================================================

/// A job contains an ordered list of steps
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Human-readable name
    pub name: Option<String>,

    /// Jobs this job depends on
    #[serde(default, deserialize_with = "deserialize_needs")]
    pub needs: Vec<String>,

    /// Runtime environment label (e.g. `ubuntu-latest`)
    #[serde(default, alias = "runs-on")]
    pub runs_on: Option<String>,

    /// Permission scope declared for this job (e.g. `contents: read`)
    #[serde(default)]
    pub permissions: BTreeMap<String, String>,

    /// Secret names this job is allowed to read
    #[serde(default)]
    pub secrets: Vec<String>,

    /// Job-level environment variables
    #[serde(default, deserialize_with = "deserialize_env")]
    pub env: BTreeMap<String, String>,

    /// Condition to run this job
    #[serde(rename = "if")]
    pub condition: Option<String>,

    /// Optional jobs do not gate the overall pipeline result
    #[serde(default)]
    pub optional: bool,

    /// Default timeout for each step in milliseconds
    pub timeout: Option<u64>,

    /// Job outputs, usually bound to step outputs
    #[serde(default)]
    pub outputs: BTreeMap<String, String>,

    /// Steps to execute
    pub steps: Vec<Step>,
}

impl Job {
    /// Display name, falling back to the job id
    pub fn display_name<'a>(&'a self, id: &'a str) -> &'a str {
        self.name.as_deref().unwrap_or(id)
    }
}

// ============================================================================
// Step
// ============================================================================

/// A single step in a job
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Step {
    /// ID for referencing outputs
    pub id: Option<String>,

    /// Step name (for logging)
    pub name: Option<String>,

    /// Shell command to run
    pub run: Option<String>,

    /// Reusable action to use (e.g. `shell/exec`, `docker/build@v1`)
    pub uses: Option<String>,

    /// Action inputs
    #[serde(default)]
    pub with: BTreeMap<String, serde_yaml::Value>,

    /// Step-level environment variables
    #[serde(default, deserialize_with = "deserialize_env")]
    pub env: BTreeMap<String, String>,

    /// Shell used for `run` (defaults to the runner shell)
    pub shell: Option<String>,

    /// Working directory for the step process
    #[serde(default, alias = "working-directory")]
    pub working_directory: Option<String>,

    /// Timeout for this step in milliseconds
    pub timeout: Option<u64>,
}

impl Step {
    /// Name used in logs and results
    pub fn display_name(&self, index: usize) -> String {
        if let Some(name) = &self.name {
            return name.clone();
        }
        if let Some(uses) = &self.uses {
            return uses.clone();
        }
        if let Some(id) = &self.id {
            return id.clone();
        }
        format!("Step {}", index + 1)
    }
}

/// Convert a YAML scalar to its string form
pub fn scalar_to_string(value: &serde_yaml::Value) -> String {
    match value {
        serde_yaml::Value::String(s) => s.clone(),
        serde_yaml::Value::Number(n) => n.to_string(),
        serde_yaml::Value::Bool(b) => b.to_string(),
        serde_yaml::Value::Null => String::new(),
        serde_yaml::Value::Tagged(tagged) => scalar_to_string(&tagged.value),
        other => serde_yaml::to_string(other)
            .map(|s| s.trim_end().to_string())
            .unwrap_or_default(),
    }
}

/// `needs: build` and `needs: [build, lint]` are both accepted
fn deserialize_needs<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NeedsHelper {
        One(String),
        Many(Vec<String>),
    }

    match NeedsHelper::deserialize(deserializer)? {
        NeedsHelper::One(job) => Ok(vec![job]),
        NeedsHelper::Many(jobs) => Ok(jobs),
    }
}

/// Env maps accept any scalar value (`NODE_VERSION: 18`)
fn deserialize_env<'de, D>(deserializer: D) -> Result<BTreeMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = BTreeMap::<String, serde_yaml::Value>::deserialize(deserializer)?;
    Ok(raw
        .into_iter()
        .map(|(key, value)| (key, scalar_to_string(&value)))
        .collect())
}
