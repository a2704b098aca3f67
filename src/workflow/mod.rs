//! Pipeline types and definitions
//!
//! This module contains all types for defining and parsing pipelines:
//! - `job` - Workflow, Job, and Step
//! - `trigger` - `on:` event and branch filters
//! - `action` - `uses` parsing, built-in and composite actions
//! - `context` - TriggerEvent and the immutable RunContext
//! - `expressions` - Typed `${{ }}` templates and `if:` conditions
//! - `loader` - Load pipelines from files and directories
//! - `runner_config` - `runner.yaml`

pub mod action;
pub mod context;
pub mod expressions;
pub mod job;
pub mod loader;
pub mod runner_config;
pub mod trigger;

pub use action::{
    ActionDefinition, ActionInput, ActionRegistry, BuiltinAction, ParsedAction, ResolvedAction,
};
pub use context::{RunContext, TriggerEvent, CONTEXT_ENV_VARS};
pub use expressions::{
    Condition, ContextRef, ExpressionError, GithubField, Operand, Template, ValueSource,
};
pub use job::{scalar_to_string, Job, Step, Workflow};
pub use loader::{LoadError, WorkflowLoader};
pub use runner_config::{ConfigError, RunnerConfig, SecretSourceConfig};
pub use trigger::{BranchFilter, Triggers};
