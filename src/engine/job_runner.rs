//! Runs the steps of a single job
//!
//! A [`JobRunner`] renders each step's bindings against the run context,
//! the job's secrets and earlier step outputs, hands the invocation to a
//! [`StepExecutor`], and redacts everything it gets back. It never changes
//! job status itself; it returns a [`JobResult`] for the scheduler to record.

use chrono::Utc;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, instrument};

use crate::engine::cancel::CancelSignal;
use crate::engine::error::StepError;
use crate::engine::job_graph::{EnvBinding, JobGraph, JobNode, StepAction, StepPlan};
use crate::engine::result::{JobResult, JobStatus, SkipReason, StepResult, StepStatus};
use crate::engine::secrets::{Redactor, SecretProvider};
use crate::engine::step_executor::{InvocationAction, StepExecutor, StepInvocation};
use crate::workflow::{ContextRef, RunContext, ValueSource};

/// Outputs keyed by name
pub type Outputs = BTreeMap<String, String>;

/// Settings applied when a step does not override them
#[derive(Debug, Clone)]
pub struct StepDefaults {
    pub shell: String,
    pub timeout: Duration,
    pub working_directory: Option<PathBuf>,
}

impl Default for StepDefaults {
    fn default() -> Self {
        Self {
            shell: "sh".to_string(),
            timeout: Duration::from_secs(30 * 60),
            working_directory: None,
        }
    }
}

pub struct JobRunner {
    graph: Arc<JobGraph>,
    context: Arc<RunContext>,
    secrets: SecretProvider,
    executor: Arc<dyn StepExecutor>,
    defaults: StepDefaults,
}

impl JobRunner {
    pub fn new(
        graph: Arc<JobGraph>,
        context: Arc<RunContext>,
        secrets: SecretProvider,
        executor: Arc<dyn StepExecutor>,
        defaults: StepDefaults,
    ) -> Self {
        Self {
            graph,
            context,
            secrets,
            executor,
            defaults,
        }
    }

    pub fn graph(&self) -> &JobGraph {
        &self.graph
    }

    /// Run one job. `upstream` holds the outputs of the jobs it needs.
    #[instrument(skip(self, upstream, cancel), fields(run_id = %self.context.run_id))]
    pub async fn run(
        &self,
        job_id: &str,
        upstream: BTreeMap<String, Outputs>,
        cancel: CancelSignal,
    ) -> JobResult {
        let Some(node) = self.graph.get_job(job_id) else {
            let mut result = JobResult::unstarted(job_id, false, JobStatus::Failed);
            result.error = Some(format!("unknown job '{}'", job_id));
            return result;
        };

        let started = Instant::now();
        let mut result = JobResult::unstarted(&node.id, node.optional, JobStatus::Running);
        result.started_at = Some(Utc::now());

        let mut redactor = Redactor::new();
        let no_steps = BTreeMap::new();

        let base_env = {
            let mut base = self.context.env_vars();
            let mut scope = self.scope(node, &mut redactor, &base, &no_steps, &upstream);
            // Workflow env reading a secret this job does not declare stays unbound
            let inherited: Vec<EnvBinding> = self
                .graph
                .env()
                .iter()
                .filter(|binding| binding.visible_to(&node.secrets))
                .cloned()
                .collect();
            let rendered = render_env(&inherited, &mut scope)
                .and_then(|mut vars| {
                    vars.extend(render_env(&node.env, &mut scope)?);
                    Ok(vars)
                });
            match rendered {
                Ok(vars) => {
                    base.extend(vars);
                    base
                }
                Err(e) => {
                    let e = redactor.redact_error(e);
                    error!(job = %node.id, error = %e, "Failed to bind job env");
                    return finish(result, JobStatus::Failed, Some(e.to_string()), started);
                }
            }
        };

        if let Some(condition) = &node.condition {
            let mut scope = self.scope(node, &mut redactor, &base_env, &no_steps, &upstream);
            match condition.evaluate(&mut scope) {
                Ok(true) => {}
                Ok(false) => {
                    info!(job = %node.id, condition = %condition, "Condition not met, skipping job");
                    result.skip_reason = Some(SkipReason::NotApplicable {
                        detail: format!("condition '{}' was false", condition),
                    });
                    return finish(result, JobStatus::Skipped, None, started);
                }
                Err(e) => {
                    let e = redactor.redact_error(e);
                    return finish(result, JobStatus::Failed, Some(e.to_string()), started);
                }
            }
        }

        info!(
            job = %node.id,
            name = %node.name,
            runs_on = node.runs_on.as_deref().unwrap_or("local"),
            steps = node.steps.len(),
            "Starting job"
        );
        if !node.permissions.is_empty() {
            debug!(job = %node.id, permissions = ?node.permissions, "Job permissions");
        }

        let mut step_outputs: BTreeMap<String, Outputs> = BTreeMap::new();
        let mut outcome = JobStatus::Succeeded;

        for plan in &node.steps {
            if outcome != JobStatus::Succeeded {
                result
                    .steps
                    .push(StepResult::not_run(plan.name.clone(), plan.id.clone()));
                continue;
            }

            let step = self
                .run_step(
                    node,
                    plan,
                    &base_env,
                    &step_outputs,
                    &upstream,
                    &mut redactor,
                    cancel.clone(),
                )
                .await;

            match step.status {
                StepStatus::Succeeded => {
                    if let Some(id) = &plan.id {
                        step_outputs.insert(id.clone(), step.outputs.clone());
                    }
                }
                StepStatus::Cancelled => outcome = JobStatus::Cancelled,
                _ => outcome = JobStatus::Failed,
            }
            result.steps.push(step);
        }

        if outcome == JobStatus::Succeeded {
            let mut scope = self.scope(node, &mut redactor, &base_env, &step_outputs, &upstream);
            let mut outputs = Outputs::new();
            for (name, template) in &node.outputs {
                match template.render(&mut scope) {
                    Ok(value) => {
                        outputs.insert(name.clone(), value);
                    }
                    Err(e) => {
                        let message = format!("output '{}': {}", name, redactor.redact_error(e));
                        return finish(result, JobStatus::Failed, Some(message), started);
                    }
                }
            }
            result.outputs = outputs
                .into_iter()
                .map(|(k, v)| (k, redactor.redact(&v)))
                .collect();
        }

        match outcome {
            JobStatus::Succeeded => info!(job = %node.id, "Job succeeded"),
            JobStatus::Cancelled => info!(job = %node.id, "Job cancelled"),
            _ => error!(job = %node.id, "Job failed"),
        }
        finish(result, outcome, None, started)
    }

    fn scope<'a>(
        &'a self,
        node: &'a JobNode,
        redactor: &'a mut Redactor,
        env: &'a Outputs,
        steps: &'a BTreeMap<String, Outputs>,
        needs: &'a BTreeMap<String, Outputs>,
    ) -> JobScope<'a> {
        JobScope {
            node,
            context: &self.context,
            secrets: &self.secrets,
            redactor,
            env,
            steps,
            needs,
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_step(
        &self,
        node: &JobNode,
        plan: &StepPlan,
        base_env: &Outputs,
        step_outputs: &BTreeMap<String, Outputs>,
        upstream: &BTreeMap<String, Outputs>,
        redactor: &mut Redactor,
        cancel: CancelSignal,
    ) -> StepResult {
        let started = Instant::now();
        let mut result = StepResult::not_run(plan.name.clone(), plan.id.clone());

        let invocation =
            match self.prepare(node, plan, base_env, step_outputs, upstream, redactor) {
                Ok(invocation) => invocation,
                Err(e) => {
                    let e = redactor.redact_error(e);
                    error!(job = %node.id, step = %plan.name, error = %e, "Failed to bind step");
                    result.status = StepStatus::Failed;
                    result.error = Some(e);
                    result.duration_ms = started.elapsed().as_millis() as u64;
                    return result;
                }
            };

        info!(job = %node.id, step = %plan.name, "Running step");
        let output = self.executor.execute(&invocation, cancel).await;

        result.exit_code = output.exit_code;
        result.outputs = parse_set_output(&output.stdout)
            .into_iter()
            .map(|(k, v)| (k, redactor.redact(&v)))
            .collect();
        result.stdout = redactor.redact(&output.stdout);
        result.stderr = redactor.redact(&output.stderr);
        result.error = output.error.map(|e| redactor.redact_error(e));
        result.status = match &result.error {
            None => StepStatus::Succeeded,
            Some(e) if e.is_cancelled() => StepStatus::Cancelled,
            Some(_) => StepStatus::Failed,
        };
        result.duration_ms = output.duration.as_millis() as u64;

        match &result.error {
            None => debug!(job = %node.id, step = %plan.name, "Step succeeded"),
            Some(e) => error!(job = %node.id, step = %plan.name, error = %e, "Step failed"),
        }
        result
    }

    fn prepare(
        &self,
        node: &JobNode,
        plan: &StepPlan,
        base_env: &Outputs,
        step_outputs: &BTreeMap<String, Outputs>,
        upstream: &BTreeMap<String, Outputs>,
        redactor: &mut Redactor,
    ) -> Result<StepInvocation, StepError> {
        let mut env = base_env.clone();
        {
            let mut scope = self.scope(node, redactor, base_env, step_outputs, upstream);
            env.extend(render_env(&plan.env, &mut scope)?);
        }

        let mut scope = self.scope(node, redactor, &env, step_outputs, upstream);
        let action = match &plan.action {
            StepAction::Script { script, shell } => InvocationAction::Script {
                script: script.render(&mut scope)?,
                shell: shell.clone().unwrap_or_else(|| self.defaults.shell.clone()),
            },
            StepAction::Builtin { action, inputs } => {
                let mut rendered = BTreeMap::new();
                for (name, template) in inputs {
                    rendered.insert(name.clone(), template.render(&mut scope)?);
                }
                InvocationAction::Builtin {
                    action: *action,
                    inputs: rendered,
                }
            }
        };

        let working_directory = match (&plan.working_directory, &self.defaults.working_directory)
        {
            (Some(dir), Some(base)) => Some(base.join(dir)),
            (Some(dir), None) => Some(PathBuf::from(dir)),
            (None, base) => base.clone(),
        };

        Ok(StepInvocation {
            job: node.id.clone(),
            step: plan.name.clone(),
            action,
            env,
            working_directory,
            timeout: plan
                .timeout
                .or(node.timeout)
                .unwrap_or(self.defaults.timeout),
        })
    }
}

fn finish(
    mut result: JobResult,
    status: JobStatus,
    error: Option<String>,
    started: Instant,
) -> JobResult {
    result.status = status;
    if error.is_some() {
        result.error = error;
    }
    result.duration_ms = started.elapsed().as_millis() as u64;
    result
}

fn render_env(bindings: &[EnvBinding], scope: &mut JobScope<'_>) -> Result<Outputs, StepError> {
    bindings
        .iter()
        .map(|binding| Ok((binding.name.clone(), binding.value.render(&mut *scope)?)))
        .collect()
}

/// Values visible to one job while it runs
struct JobScope<'a> {
    node: &'a JobNode,
    context: &'a RunContext,
    secrets: &'a SecretProvider,
    redactor: &'a mut Redactor,
    env: &'a Outputs,
    steps: &'a BTreeMap<String, Outputs>,
    needs: &'a BTreeMap<String, Outputs>,
}

impl ValueSource for JobScope<'_> {
    type Error = StepError;

    fn value_of(&mut self, reference: &ContextRef) -> Result<String, StepError> {
        match reference {
            ContextRef::Github(field) => Ok(self.context.github(*field)),
            ContextRef::Env(name) => Ok(self.env.get(name).cloned().unwrap_or_default()),
            ContextRef::Secret(name) => {
                let value = self.secrets.resolve(&self.node.id, &self.node.secrets, name)?;
                self.redactor.add(&value);
                Ok(value.expose().to_string())
            }
            ContextRef::StepOutput { step, output } => Ok(self
                .steps
                .get(step)
                .and_then(|outputs| outputs.get(output))
                .cloned()
                .unwrap_or_default()),
            ContextRef::NeedsOutput { job, output } => Ok(self
                .needs
                .get(job)
                .and_then(|outputs| outputs.get(output))
                .cloned()
                .unwrap_or_default()),
            ContextRef::Input(name) => Err(StepError::invalid_input(format!(
                "input '{}' is not bound",
                name
            ))),
        }
    }
}

/// Collect `::set-output name=<key>::<value>` lines
pub fn parse_set_output(stdout: &str) -> Outputs {
    stdout
        .lines()
        .filter_map(|line| line.trim().strip_prefix("::set-output name="))
        .filter_map(|rest| rest.split_once("::"))
        .filter(|(name, _)| !name.is_empty())
        .map(|(name, value)| (name.to_string(), value.to_string()))
        .collect()
}
