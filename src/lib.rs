//! # Pipeline Actions
//!
//! A GitHub Actions-style CI/CD runner core: declarative YAML pipelines are
//! validated into a DAG of jobs, scheduled with bounded parallelism, and run
//! step by step as host processes or built-in actions.
//!
//! ## Features
//!
//! - **Declarative YAML pipelines** - `on`, `jobs`, `needs`, `steps`, `uses`
//! - **Validated bindings** - every `${{ }}` reference is checked before a run starts
//! - **Parallel execution** - independent jobs run concurrently up to a limit
//! - **Scoped secrets** - jobs read only the secrets they declare; values are redacted
//! - **Run records** - one JSON result per run
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use pipeline_actions::{Executor, TriggerEvent};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let pipeline = r#"
//! name: ci
//! on:
//!   push:
//!     branches: [main]
//! jobs:
//!   build:
//!     steps:
//!       - name: Compile
//!         run: echo "building ${{ github.sha }}"
//!   test:
//!     needs: build
//!     steps:
//!       - run: echo testing
//! "#;
//!
//!     let event = TriggerEvent::new("push")
//!         .with_ref("refs/heads/main")
//!         .with_sha("4f2a9c1");
//!
//!     let result = Executor::new().run_yaml(pipeline, event).await?;
//!     println!("Run {} finished: {}", result.run_id, result.status);
//!     Ok(())
//! }
//! ```

pub mod engine;
pub mod workflow;

// Re-export main types
pub use engine::{
    CancelHandle, Executor, ExecutorError, GraphError, JobGraph, JobResult, JobStatus,
    MemorySecretStore, RunResult, RunStatus, SecretStore, StepError, StepResult,
};
pub use workflow::{
    ActionDefinition, Job, LoadError, RunContext, RunnerConfig, Step, TriggerEvent, Workflow,
    WorkflowLoader,
};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::engine::{
        CancelHandle, Executor, ExecutorError, JobGraph, JobResult, JobStatus, MemorySecretStore,
        RunResult, RunStatus, SecretStore, ShellStepExecutor, StepExecutor,
    };
    pub use crate::workflow::{
        Job, LoadError, RunnerConfig, Step, TriggerEvent, Workflow, WorkflowLoader,
    };
}
