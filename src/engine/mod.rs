//! Pipeline execution engine
//!
//! This module contains:
//! - `job_graph` - Validated DAG of jobs with typed bindings
//! - `scheduler` - Bounded-parallel job dispatch
//! - `job_runner` - Sequential step execution for one job
//! - `step_executor` - Process and built-in action execution
//! - `secrets` - Secret stores, scoped resolution and redaction
//! - `reporter` - Run result aggregation and records
//! - `executor` - The main pipeline executor
//! - `cancel` - Run cancellation
//! - `error` - Engine error types
//! - `result` - Step, job, and run result types

pub mod cancel;
pub mod error;
pub mod executor;
pub mod job_graph;
pub mod job_runner;
pub mod reporter;
pub mod result;
pub mod scheduler;
pub mod secrets;
pub mod step_executor;

pub use cancel::{cancel_pair, CancelHandle, CancelSignal};
pub use error::{ExecutorError, GraphError, StepError};
pub use executor::Executor;
pub use job_graph::{EnvBinding, JobGraph, JobNode, StepAction, StepPlan};
pub use job_runner::{parse_set_output, JobRunner, Outputs, StepDefaults};
pub use reporter::{ReportError, RunReporter};
pub use result::{JobResult, JobStatus, RunResult, RunStatus, SkipReason, StepResult, StepStatus};
pub use scheduler::{ScheduleOutcome, Scheduler};
pub use secrets::{
    ChainedSecretStore, EnvSecretStore, MemorySecretStore, Redactor, Secret, SecretFileError,
    SecretProvider, SecretStore, SecretValue, REDACTED,
};
pub use step_executor::{
    InvocationAction, ShellStepExecutor, StepExecutor, StepInvocation, StepOutput,
};
