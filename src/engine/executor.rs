//! Pipeline executor - runs one pipeline for one trigger event
//!
//! This is the main entry point that:
//! 1. Evaluates the pipeline's triggers against the event (once)
//! 2. Builds and validates the job graph
//! 3. Schedules jobs with bounded parallelism
//! 4. Aggregates and records the run result

use std::sync::Arc;
use tracing::{info, instrument};

use crate::engine::cancel::{cancel_pair, CancelHandle, CancelSignal};
use crate::engine::error::{ExecutorError, GraphError};
use crate::engine::job_graph::JobGraph;
use crate::engine::job_runner::{JobRunner, StepDefaults};
use crate::engine::reporter::RunReporter;
use crate::engine::result::RunResult;
use crate::engine::scheduler::Scheduler;
use crate::engine::secrets::{
    ChainedSecretStore, EnvSecretStore, MemorySecretStore, SecretProvider, SecretStore,
};
use crate::engine::step_executor::{ShellStepExecutor, StepExecutor};
use crate::workflow::{
    ActionDefinition, ActionRegistry, RunContext, RunnerConfig, SecretSourceConfig, TriggerEvent,
    Workflow,
};

pub struct Executor {
    config: RunnerConfig,
    actions: ActionRegistry,
    secrets: Arc<dyn SecretStore>,
    step_executor: Arc<dyn StepExecutor>,
    cancel: CancelHandle,
    // Keeps the channel open so later signals still observe cancellation
    _signal: CancelSignal,
}

impl Default for Executor {
    fn default() -> Self {
        Self::new()
    }
}

impl Executor {
    /// Executor with default settings, no secrets and the host shell
    pub fn new() -> Self {
        let (cancel, signal) = cancel_pair();
        Self {
            config: RunnerConfig::default(),
            actions: ActionRegistry::new(),
            secrets: Arc::new(MemorySecretStore::new()),
            step_executor: Arc::new(ShellStepExecutor::new()),
            cancel,
            _signal: signal,
        }
    }

    /// Executor configured from `runner.yaml` settings, including its secret sources
    pub fn from_config(config: RunnerConfig) -> Result<Self, ExecutorError> {
        config.validate()?;
        let secrets = secret_store(&config.secrets)?;
        let actions = ActionRegistry::from_definitions(&config.actions);

        Ok(Self {
            config,
            actions,
            secrets,
            ..Self::new()
        })
    }

    pub fn with_secret_store(mut self, store: Arc<dyn SecretStore>) -> Self {
        self.secrets = store;
        self
    }

    pub fn with_step_executor(mut self, executor: Arc<dyn StepExecutor>) -> Self {
        self.step_executor = executor;
        self
    }

    pub fn with_action(mut self, name: impl Into<String>, definition: ActionDefinition) -> Self {
        self.actions.register(name, definition);
        self
    }

    pub fn parallel(mut self, max: usize) -> Self {
        self.config.parallel = max.max(1);
        self
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Handle for cancelling runs started by this executor.
    ///
    /// Cancellation is sticky: once cancelled, later runs start cancelled too.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Validate a pipeline into its job graph without running anything
    pub fn plan(&self, workflow: &Workflow) -> Result<JobGraph, ExecutorError> {
        Ok(JobGraph::build(workflow, &self.actions)?)
    }

    /// Parse and run a pipeline from YAML
    pub async fn run_yaml(
        &self,
        yaml: &str,
        event: TriggerEvent,
    ) -> Result<RunResult, ExecutorError> {
        let workflow = Workflow::from_yaml(yaml)?;
        self.run(&workflow, event).await
    }

    /// Run a pipeline for one trigger event
    #[instrument(skip_all, fields(workflow = %workflow.name, event = %event.event_name))]
    pub async fn run(
        &self,
        workflow: &Workflow,
        event: TriggerEvent,
    ) -> Result<RunResult, ExecutorError> {
        workflow
            .on
            .validate()
            .map_err(|(pattern, e)| GraphError::InvalidTrigger {
                pattern,
                message: e.to_string(),
            })?;

        if !workflow.on.matches(&event) {
            info!(git_ref = %event.git_ref, "Event does not match pipeline triggers");
            return Err(ExecutorError::NotTriggered {
                workflow: workflow.name.clone(),
                event: event.event_name,
                git_ref: event.git_ref,
            });
        }

        let graph = Arc::new(self.plan(workflow)?);
        let context = Arc::new(RunContext::new(&workflow.name, event));

        info!(
            run_id = %context.run_id,
            jobs = graph.len(),
            levels = graph.execution_levels().len(),
            parallel = self.config.parallel,
            "Starting run"
        );

        let runner = Arc::new(JobRunner::new(
            graph.clone(),
            context.clone(),
            SecretProvider::new(self.secrets.clone()),
            self.step_executor.clone(),
            self.step_defaults(),
        ));
        let outcome = Scheduler::new(runner, self.config.parallel)
            .run(self.cancel.signal())
            .await;

        let reporter = RunReporter::new(self.config.record_dir.clone());
        Ok(reporter.finalize(&graph, &context, outcome)?)
    }

    fn step_defaults(&self) -> StepDefaults {
        StepDefaults {
            shell: self.config.shell.clone(),
            timeout: self.config.step_timeout(),
            working_directory: self.config.working_directory.clone(),
        }
    }
}

fn secret_store(source: &SecretSourceConfig) -> Result<Arc<dyn SecretStore>, ExecutorError> {
    let mut chain = ChainedSecretStore::new();
    if let Some(file) = &source.file {
        let store =
            MemorySecretStore::load_file(file).map_err(|e| ExecutorError::Secrets(e.to_string()))?;
        chain.push(Arc::new(store));
    }
    if let Some(prefix) = &source.env_prefix {
        chain.push(Arc::new(EnvSecretStore::new(prefix.clone())));
    }
    Ok(Arc::new(chain))
}
