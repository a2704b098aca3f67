//! Engine error types
//!
//! Build-time errors ([`GraphError`]) abort a run before any job starts.
//! Run-time errors ([`StepError`]) fail only the job that owns the step.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::engine::reporter::ReportError;
use crate::workflow::expressions::ExpressionError;
use crate::workflow::{ConfigError, LoadError};

/// Errors raised while validating a pipeline into a job graph
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GraphError {
    #[error("Cyclic dependency detected at job '{job}': {}", cycle.join(" -> "))]
    CyclicDependency { job: String, cycle: Vec<String> },

    #[error("Job '{job}' needs unknown job '{dependency}'")]
    UnknownJobReference { job: String, dependency: String },

    #[error("Job '{job}' has no steps")]
    EmptyJob { job: String },

    #[error("Duplicate step id '{step}' in job '{job}'")]
    DuplicateStepId { job: String, step: String },

    #[error("Job '{job}', step '{step}': {message}")]
    InvalidStep {
        job: String,
        step: String,
        message: String,
    },

    #[error("Job '{job}', step '{step}' uses unknown action '{action}'")]
    UnknownAction {
        job: String,
        step: String,
        action: String,
    },

    #[error("Invalid expression in {location}: {source}")]
    Expression {
        location: String,
        #[source]
        source: ExpressionError,
    },

    #[error("Unresolved reference '{reference}' in {location}: {reason}")]
    UnresolvedReference {
        location: String,
        reference: String,
        reason: String,
    },

    #[error("Invalid branch pattern '{pattern}': {message}")]
    InvalidTrigger { pattern: String, message: String },
}

impl GraphError {
    /// The job the error is about, if any
    pub fn job(&self) -> Option<&str> {
        match self {
            GraphError::CyclicDependency { job, .. }
            | GraphError::UnknownJobReference { job, .. }
            | GraphError::EmptyJob { job }
            | GraphError::DuplicateStepId { job, .. }
            | GraphError::InvalidStep { job, .. }
            | GraphError::UnknownAction { job, .. } => Some(job),
            _ => None,
        }
    }
}

/// Errors that fail a step (and with it, its job)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepError {
    #[error("StepTimeout: step exceeded {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("StepExecutionError: exit code {exit_code}: {message}")]
    Execution { exit_code: i32, message: String },

    #[error("SecretNotFound: secret '{name}' is not in the secret store")]
    SecretNotFound { name: String },

    #[error("ScopeViolation: job '{job}' is not allowed to read secret '{name}'")]
    ScopeViolation { job: String, name: String },

    #[error("Cancelled")]
    Cancelled,

    #[error("Failed to start '{program}': {message}")]
    Spawn { program: String, message: String },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },
}

impl StepError {
    pub fn invalid_input(message: impl Into<String>) -> Self {
        StepError::InvalidInput {
            message: message.into(),
        }
    }

    pub fn timeout(timeout: Duration) -> Self {
        StepError::Timeout {
            timeout_ms: timeout.as_millis() as u64,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, StepError::Cancelled)
    }

    /// Apply a text transform to every free-form message in the error
    pub fn map_messages(self, f: impl Fn(&str) -> String) -> Self {
        match self {
            StepError::Execution { exit_code, message } => StepError::Execution {
                exit_code,
                message: f(&message),
            },
            StepError::Spawn { program, message } => StepError::Spawn {
                program,
                message: f(&message),
            },
            StepError::InvalidInput { message } => StepError::InvalidInput {
                message: f(&message),
            },
            other => other,
        }
    }
}

/// Errors that can occur while running a pipeline
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("Parse error: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Load error: {0}")]
    Load(#[from] LoadError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Invalid pipeline: {0}")]
    Graph(#[from] GraphError),

    #[error("Pipeline '{workflow}' is not triggered by '{event}' on '{git_ref}'")]
    NotTriggered {
        workflow: String,
        event: String,
        git_ref: String,
    },

    #[error("Secret store error: {0}")]
    Secrets(String),

    #[error("Report error: {0}")]
    Report(#[from] ReportError),
}
