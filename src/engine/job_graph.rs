//! Job graph builder
//!
//! Builds a validated directed acyclic graph from the jobs of one pipeline
//! and computes execution levels for parallel execution. Every `${{ }}`
//! binding is parsed and checked here, so a graph that builds never meets an
//! unknown reference at run time.

use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use crate::engine::error::GraphError;
use crate::workflow::{
    scalar_to_string, ActionDefinition, ActionRegistry, BuiltinAction, Condition, ContextRef, Job,
    ParsedAction, ResolvedAction, Step, Template, Triggers, Workflow, CONTEXT_ENV_VARS,
};

/// One environment variable bound to a template
#[derive(Debug, Clone)]
pub struct EnvBinding {
    pub name: String,
    pub value: Template,
}

impl EnvBinding {
    /// Whether a job declaring `secrets` may bind this variable
    pub fn visible_to(&self, secrets: &[String]) -> bool {
        self.value.refs().all(|reference| match reference {
            ContextRef::Secret(name) => secrets.contains(name),
            _ => true,
        })
    }
}

/// What a step does once its templates are rendered
#[derive(Debug, Clone)]
pub enum StepAction {
    /// A script for the step shell (`run`, `shell/exec`, composite actions)
    Script {
        script: Template,
        shell: Option<String>,
    },
    /// A built-in action executed in-process
    Builtin {
        action: BuiltinAction,
        inputs: BTreeMap<String, Template>,
    },
}

#[derive(Debug, Clone)]
pub struct StepPlan {
    pub index: usize,
    pub id: Option<String>,
    pub name: String,
    pub uses: Option<String>,
    pub action: StepAction,
    pub env: Vec<EnvBinding>,
    pub working_directory: Option<String>,
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct JobNode {
    pub id: String,
    pub name: String,
    pub needs: Vec<String>,
    pub runs_on: Option<String>,
    pub permissions: BTreeMap<String, String>,
    pub secrets: Vec<String>,
    pub env: Vec<EnvBinding>,
    pub condition: Option<Condition>,
    pub optional: bool,
    pub timeout: Option<Duration>,
    pub outputs: BTreeMap<String, Template>,
    pub steps: Vec<StepPlan>,
}

#[derive(Debug, Clone)]
pub struct JobGraph {
    workflow: String,
    triggers: Triggers,
    env: Vec<EnvBinding>,
    nodes: BTreeMap<String, JobNode>,
    dependents: BTreeMap<String, Vec<String>>,
    execution_levels: Vec<Vec<String>>,
    digest: String,
}

impl JobGraph {
    pub fn build(workflow: &Workflow, actions: &ActionRegistry) -> Result<Self, GraphError> {
        workflow
            .on
            .validate()
            .map_err(|(pattern, e)| GraphError::InvalidTrigger {
                pattern,
                message: e.to_string(),
            })?;

        for (id, job) in &workflow.jobs {
            for dep in &job.needs {
                if !workflow.jobs.contains_key(dep) {
                    return Err(GraphError::UnknownJobReference {
                        job: id.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        let execution_levels = Self::compute_execution_levels(&workflow.jobs)?;

        let workflow_rules = RefRules {
            env: None,
            steps: None,
            needs: &[],
            secrets: true,
            jobs: &workflow.jobs,
        };
        let env = bind_env(&workflow.env, &workflow_rules, "workflow")?;

        let mut nodes = BTreeMap::new();
        let mut dependents: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (id, job) in &workflow.jobs {
            let node = build_job(id, job, workflow, &env, actions)?;
            for dep in &node.needs {
                dependents.entry(dep.clone()).or_default().push(id.clone());
            }
            nodes.insert(id.clone(), node);
        }

        Ok(Self {
            workflow: workflow.name.clone(),
            triggers: workflow.on.clone(),
            env,
            nodes,
            dependents,
            execution_levels,
            digest: definition_digest(workflow),
        })
    }

    fn compute_execution_levels(
        jobs: &BTreeMap<String, Job>,
    ) -> Result<Vec<Vec<String>>, GraphError> {
        let mut in_degree: BTreeMap<&str, usize> = BTreeMap::new();
        let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();

        for (id, job) in jobs {
            in_degree.entry(id.as_str()).or_insert(0);
            for dep in unique_needs(&job.needs) {
                *in_degree.entry(id.as_str()).or_insert(0) += 1;
                dependents.entry(dep.as_str()).or_default().push(id.as_str());
            }
        }

        let mut levels: Vec<Vec<String>> = Vec::new();
        let mut current_level: Vec<String> = in_degree
            .iter()
            .filter(|(_, &deg)| deg == 0)
            .map(|(&id, _)| id.to_string())
            .collect();

        current_level.sort();

        while !current_level.is_empty() {
            levels.push(current_level.clone());

            let mut next_level = Vec::new();
            for id in &current_level {
                for &dependent in dependents.get(id.as_str()).into_iter().flatten() {
                    if let Some(degree) = in_degree.get_mut(dependent) {
                        *degree -= 1;
                        if *degree == 0 {
                            next_level.push(dependent.to_string());
                        }
                    }
                }
            }
            next_level.sort();
            current_level = next_level;
        }

        let processed: BTreeSet<&str> = levels.iter().flatten().map(String::as_str).collect();
        if processed.len() != jobs.len() {
            return Err(find_cycle(jobs, &processed));
        }

        Ok(levels)
    }

    pub fn workflow_name(&self) -> &str {
        &self.workflow
    }

    pub fn triggers(&self) -> &Triggers {
        &self.triggers
    }

    /// Workflow-level env bindings
    pub fn env(&self) -> &[EnvBinding] {
        &self.env
    }

    pub fn execution_levels(&self) -> &Vec<Vec<String>> {
        &self.execution_levels
    }

    pub fn get_job(&self, id: &str) -> Option<&JobNode> {
        self.nodes.get(id)
    }

    pub fn jobs(&self) -> impl Iterator<Item = &JobNode> {
        self.nodes.values()
    }

    pub fn job_ids(&self) -> Vec<&str> {
        self.nodes.keys().map(|s| s.as_str()).collect()
    }

    /// Jobs that list `id` in their `needs`
    pub fn dependents(&self, id: &str) -> &[String] {
        self.dependents.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Hex sha256 of the pipeline definition
    pub fn digest(&self) -> &str {
        &self.digest
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// `needs` in declaration order with repeats dropped
fn unique_needs(needs: &[String]) -> Vec<&String> {
    let mut seen = BTreeSet::new();
    needs.iter().filter(|dep| seen.insert(dep.as_str())).collect()
}

// Every unprocessed job still waits on an unprocessed dependency, so
// following `needs` from any of them must come back around.
fn find_cycle(jobs: &BTreeMap<String, Job>, processed: &BTreeSet<&str>) -> GraphError {
    let Some(start) = jobs.keys().find(|id| !processed.contains(id.as_str())) else {
        return GraphError::CyclicDependency {
            job: String::new(),
            cycle: Vec::new(),
        };
    };

    let mut path: Vec<&str> = Vec::new();
    let mut current = start.as_str();
    loop {
        if let Some(pos) = path.iter().position(|&id| id == current) {
            let mut cycle: Vec<String> = path[pos..].iter().map(|s| s.to_string()).collect();
            cycle.push(current.to_string());
            return GraphError::CyclicDependency {
                job: current.to_string(),
                cycle,
            };
        }
        path.push(current);

        let next = jobs.get(current).and_then(|job| {
            job.needs
                .iter()
                .filter(|dep| !processed.contains(dep.as_str()))
                .min()
        });
        match next {
            Some(dep) => current = dep.as_str(),
            None => break,
        }
    }

    GraphError::CyclicDependency {
        job: start.clone(),
        cycle: path.into_iter().map(String::from).collect(),
    }
}

fn definition_digest(workflow: &Workflow) -> String {
    let canonical = serde_yaml::to_string(workflow).unwrap_or_default();
    hex::encode(Sha256::digest(canonical.as_bytes()))
}

/// Which references a template may use where it appears
struct RefRules<'a> {
    /// Declared env names; `None` forbids `env.*`
    env: Option<&'a BTreeSet<String>>,
    /// Ids of earlier steps; `None` forbids `steps.*`
    steps: Option<&'a BTreeSet<String>>,
    needs: &'a [String],
    secrets: bool,
    jobs: &'a BTreeMap<String, Job>,
}

impl RefRules<'_> {
    fn check<'r>(
        &self,
        location: &str,
        refs: impl IntoIterator<Item = &'r ContextRef>,
    ) -> Result<(), GraphError> {
        for reference in refs {
            if let Some(reason) = self.reject(reference) {
                return Err(GraphError::UnresolvedReference {
                    location: location.to_string(),
                    reference: reference.to_string(),
                    reason,
                });
            }
        }
        Ok(())
    }

    fn reject(&self, reference: &ContextRef) -> Option<String> {
        match reference {
            ContextRef::Github(_) => None,
            ContextRef::Env(name) => match self.env {
                None => Some("env values cannot reference env".to_string()),
                Some(declared) if !declared.contains(name) => Some(format!(
                    "'{}' is not declared in workflow, job or step env",
                    name
                )),
                Some(_) => None,
            },
            ContextRef::Secret(_) if !self.secrets => {
                Some("secrets cannot be read here".to_string())
            }
            ContextRef::Secret(_) => None,
            ContextRef::StepOutput { step, .. } => match self.steps {
                None => Some("step outputs are not available here".to_string()),
                Some(earlier) if !earlier.contains(step) => {
                    Some(format!("'{}' is not an earlier step of this job", step))
                }
                Some(_) => None,
            },
            ContextRef::NeedsOutput { job, output } => {
                if !self.needs.contains(job) {
                    return Some(format!("'{}' is not listed in needs", job));
                }
                let declared = self
                    .jobs
                    .get(job)
                    .is_some_and(|j| j.outputs.contains_key(output));
                (!declared).then(|| format!("job '{}' has no output '{}'", job, output))
            }
            ContextRef::Input(_) => {
                Some("inputs are only available inside action definitions".to_string())
            }
        }
    }
}

fn parse_template(location: &str, text: &str) -> Result<Template, GraphError> {
    Template::parse(text).map_err(|source| GraphError::Expression {
        location: location.to_string(),
        source,
    })
}

fn bind_env(
    env: &BTreeMap<String, String>,
    rules: &RefRules<'_>,
    owner: &str,
) -> Result<Vec<EnvBinding>, GraphError> {
    env.iter()
        .map(|(name, value)| {
            let location = format!("{} env.{}", owner, name);
            let template = parse_template(&location, value)?;
            rules.check(&location, template.refs())?;
            Ok(EnvBinding {
                name: name.clone(),
                value: template,
            })
        })
        .collect()
}

fn build_job(
    id: &str,
    job: &Job,
    workflow: &Workflow,
    workflow_env: &[EnvBinding],
    actions: &ActionRegistry,
) -> Result<JobNode, GraphError> {
    if job.steps.is_empty() {
        return Err(GraphError::EmptyJob {
            job: id.to_string(),
        });
    }

    let owner = format!("job '{}'", id);
    let env_rules = RefRules {
        env: None,
        steps: None,
        needs: &job.needs,
        secrets: true,
        jobs: &workflow.jobs,
    };
    let env = bind_env(&job.env, &env_rules, &owner)?;

    let job_env_names: BTreeSet<String> = CONTEXT_ENV_VARS
        .iter()
        .map(|s| s.to_string())
        .chain(
            workflow_env
                .iter()
                .filter(|binding| binding.visible_to(&job.secrets))
                .map(|binding| binding.name.clone()),
        )
        .chain(job.env.keys().cloned())
        .collect();

    let condition = match &job.condition {
        Some(text) => {
            let location = format!("{} if", owner);
            let condition = Condition::parse(text).map_err(|source| GraphError::Expression {
                location: location.clone(),
                source,
            })?;
            let rules = RefRules {
                env: Some(&job_env_names),
                steps: None,
                needs: &job.needs,
                secrets: false,
                jobs: &workflow.jobs,
            };
            rules.check(&location, condition.refs())?;
            Some(condition)
        }
        None => None,
    };

    let timeout = positive_timeout(job.timeout).ok_or_else(|| GraphError::InvalidStep {
        job: id.to_string(),
        step: "*".to_string(),
        message: "job timeout must be greater than 0".to_string(),
    })?;

    let mut earlier: BTreeSet<String> = BTreeSet::new();
    let mut steps = Vec::with_capacity(job.steps.len());
    for (index, step) in job.steps.iter().enumerate() {
        if let Some(step_id) = &step.id {
            if earlier.contains(step_id) {
                return Err(GraphError::DuplicateStepId {
                    job: id.to_string(),
                    step: step_id.clone(),
                });
            }
        }

        let ctx = StepContext {
            job_id: id,
            job,
            index,
            name: step.display_name(index),
            job_env_names: &job_env_names,
            earlier: &earlier,
            jobs: &workflow.jobs,
        };
        steps.push(ctx.build(step, actions)?);

        if let Some(step_id) = &step.id {
            earlier.insert(step_id.clone());
        }
    }

    let output_rules = RefRules {
        env: Some(&job_env_names),
        steps: Some(&earlier),
        needs: &job.needs,
        secrets: false,
        jobs: &workflow.jobs,
    };
    let mut outputs = BTreeMap::new();
    for (name, value) in &job.outputs {
        let location = format!("{} outputs.{}", owner, name);
        let template = parse_template(&location, value)?;
        output_rules.check(&location, template.refs())?;
        outputs.insert(name.clone(), template);
    }

    Ok(JobNode {
        id: id.to_string(),
        name: job.display_name(id).to_string(),
        needs: unique_needs(&job.needs).into_iter().cloned().collect(),
        runs_on: job.runs_on.clone(),
        permissions: job.permissions.clone(),
        secrets: job.secrets.clone(),
        env,
        condition,
        optional: job.optional,
        timeout,
        outputs,
        steps,
    })
}

/// `Some(None)` when unset, `None` when set to zero
fn positive_timeout(ms: Option<u64>) -> Option<Option<Duration>> {
    match ms {
        None => Some(None),
        Some(0) => None,
        Some(ms) => Some(Some(Duration::from_millis(ms))),
    }
}

struct StepContext<'a> {
    job_id: &'a str,
    job: &'a Job,
    index: usize,
    name: String,
    job_env_names: &'a BTreeSet<String>,
    earlier: &'a BTreeSet<String>,
    jobs: &'a BTreeMap<String, Job>,
}

impl StepContext<'_> {
    fn invalid(&self, message: impl Into<String>) -> GraphError {
        GraphError::InvalidStep {
            job: self.job_id.to_string(),
            step: self.name.clone(),
            message: message.into(),
        }
    }

    fn owner(&self) -> String {
        format!("job '{}' step '{}'", self.job_id, self.name)
    }

    fn location(&self, what: &str) -> String {
        format!("{} {}", self.owner(), what)
    }

    fn build(&self, step: &Step, actions: &ActionRegistry) -> Result<StepPlan, GraphError> {
        let env_rules = RefRules {
            env: None,
            steps: Some(self.earlier),
            needs: &self.job.needs,
            secrets: true,
            jobs: self.jobs,
        };
        let env = bind_env(&step.env, &env_rules, &self.owner())?;

        let step_env_names: BTreeSet<String> = self
            .job_env_names
            .iter()
            .cloned()
            .chain(step.env.keys().cloned())
            .collect();
        let rules = RefRules {
            env: Some(&step_env_names),
            steps: Some(self.earlier),
            needs: &self.job.needs,
            secrets: true,
            jobs: self.jobs,
        };

        let action = match (&step.run, &step.uses) {
            (Some(run), None) => {
                if !step.with.is_empty() {
                    return Err(self.invalid("'with' is only valid together with 'uses'"));
                }
                let location = self.location("run");
                let script = parse_template(&location, run)?;
                rules.check(&location, script.refs())?;
                StepAction::Script {
                    script,
                    shell: step.shell.clone(),
                }
            }
            (None, Some(uses)) => self.build_action(step, uses, actions, &rules)?,
            _ => return Err(self.invalid("a step needs exactly one of 'run' or 'uses'")),
        };

        let timeout = positive_timeout(step.timeout)
            .ok_or_else(|| self.invalid("timeout must be greater than 0"))?;

        Ok(StepPlan {
            index: self.index,
            id: step.id.clone(),
            name: self.name.clone(),
            uses: step.uses.clone(),
            action,
            env,
            working_directory: step.working_directory.clone(),
            timeout,
        })
    }

    fn build_action(
        &self,
        step: &Step,
        uses: &str,
        actions: &ActionRegistry,
        rules: &RefRules<'_>,
    ) -> Result<StepAction, GraphError> {
        let parsed = ParsedAction::parse(uses).map_err(|message| self.invalid(message))?;
        let resolved = actions
            .resolve(&parsed)
            .ok_or_else(|| GraphError::UnknownAction {
                job: self.job_id.to_string(),
                step: self.name.clone(),
                action: uses.to_string(),
            })?;

        match resolved {
            ResolvedAction::Builtin(action) => self.build_builtin(step, action, rules),
            ResolvedAction::Composite(definition) => {
                self.build_composite(step, &parsed.name, definition, rules)
            }
        }
    }

    fn bind_with(&self, step: &Step) -> Result<BTreeMap<String, Template>, GraphError> {
        step.with
            .iter()
            .map(|(key, value)| {
                let location = self.location(&format!("with.{}", key));
                Ok((key.clone(), parse_template(&location, &scalar_to_string(value))?))
            })
            .collect()
    }

    fn build_builtin(
        &self,
        step: &Step,
        action: BuiltinAction,
        rules: &RefRules<'_>,
    ) -> Result<StepAction, GraphError> {
        let mut inputs = self.bind_with(step)?;

        for key in inputs.keys() {
            if !action.accepted_inputs().contains(&key.as_str()) {
                return Err(self.invalid(format!(
                    "'{}' does not accept input '{}'",
                    action.name(),
                    key
                )));
            }
        }
        for required in action.required_inputs() {
            if !inputs.contains_key(*required) {
                return Err(self.invalid(format!(
                    "'{}' requires input '{}'",
                    action.name(),
                    required
                )));
            }
        }
        for (key, template) in &inputs {
            rules.check(&self.location(&format!("with.{}", key)), template.refs())?;
        }

        match action {
            BuiltinAction::ShellExec => {
                let script = inputs
                    .remove("command")
                    .ok_or_else(|| self.invalid("'shell/exec' requires input 'command'"))?;
                Ok(StepAction::Script {
                    script,
                    shell: step.shell.clone(),
                })
            }
            BuiltinAction::WaitMs => {
                if let Some(literal) = inputs.get("duration").and_then(literal_text) {
                    literal.trim().parse::<u64>().map_err(|_| {
                        self.invalid(format!("invalid duration '{}'", literal))
                    })?;
                }
                Ok(StepAction::Builtin { action, inputs })
            }
            BuiltinAction::FailNow => {
                if let Some(literal) = inputs.get("exit_code").and_then(literal_text) {
                    match literal.trim().parse::<i32>() {
                        Ok(0) => return Err(self.invalid("'fail/now' exit_code must be non-zero")),
                        Ok(_) => {}
                        Err(_) => {
                            return Err(self.invalid(format!("invalid exit_code '{}'", literal)))
                        }
                    }
                }
                Ok(StepAction::Builtin { action, inputs })
            }
        }
    }

    fn build_composite(
        &self,
        step: &Step,
        action_name: &str,
        definition: &ActionDefinition,
        rules: &RefRules<'_>,
    ) -> Result<StepAction, GraphError> {
        let mut given = self.bind_with(step)?;

        for key in given.keys() {
            if !definition.inputs.contains_key(key) {
                return Err(self.invalid(format!(
                    "'{}' has no input '{}'",
                    action_name, key
                )));
            }
        }

        let mut bound = BTreeMap::new();
        for (name, input) in &definition.inputs {
            let template = match (given.remove(name), &input.default) {
                (Some(template), _) => template,
                (None, Some(default)) => {
                    let location = format!("action '{}' default for '{}'", action_name, name);
                    parse_template(&location, default)?
                }
                (None, None) if input.required => {
                    return Err(self.invalid(format!(
                        "'{}' requires input '{}'",
                        action_name, name
                    )))
                }
                (None, None) => Template::literal(""),
            };
            bound.insert(name.clone(), template);
        }

        let location = format!("action '{}' run", action_name);
        let script = parse_template(&location, &definition.run)?
            .substitute_inputs(&bound)
            .map_err(|missing| {
                self.invalid(format!(
                    "action '{}' references undeclared input '{}'",
                    action_name, missing
                ))
            })?;
        rules.check(&self.location(&format!("uses {}", action_name)), script.refs())?;

        Ok(StepAction::Script {
            script,
            shell: step.shell.clone().or_else(|| definition.shell.clone()),
        })
    }
}

fn literal_text(template: &Template) -> Option<String> {
    template
        .refs()
        .next()
        .is_none()
        .then(|| template.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(yaml: &str) -> Result<JobGraph, GraphError> {
        let workflow = Workflow::from_yaml(yaml).unwrap();
        JobGraph::build(&workflow, &ActionRegistry::new())
    }

    #[test]
    fn test_parallel_levels() {
        let graph = build(
            r#"
name: levels
jobs:
  setup:
    steps: [{ run: "true" }]
  api:
    needs: setup
    steps: [{ run: "true" }]
  e2e:
    needs: setup
    steps: [{ run: "true" }]
  cleanup:
    needs: [api, e2e]
    steps: [{ run: "true" }]
"#,
        )
        .unwrap();

        assert_eq!(graph.len(), 4);
        assert_eq!(graph.execution_levels()[0], vec!["setup"]);
        assert_eq!(graph.execution_levels()[1], vec!["api", "e2e"]);
        assert_eq!(graph.execution_levels()[2], vec!["cleanup"]);
        assert_eq!(graph.dependents("setup"), &["api", "e2e"]);
        assert_eq!(graph.digest().len(), 64);
    }

    #[test]
    fn test_cycle_names_offending_job() {
        let err = build(
            r#"
name: cycle
jobs:
  a:
    needs: c
    steps: [{ run: "true" }]
  b:
    needs: a
    steps: [{ run: "true" }]
  c:
    needs: b
    steps: [{ run: "true" }]
"#,
        )
        .unwrap_err();

        match err {
            GraphError::CyclicDependency { job, cycle } => {
                assert_eq!(cycle.first(), cycle.last());
                assert_eq!(cycle.len(), 4);
                assert!(cycle.contains(&job));
            }
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn test_self_dependency_is_cycle() {
        let err = build(
            r#"
name: self
jobs:
  a:
    needs: a
    steps: [{ run: "true" }]
"#,
        )
        .unwrap_err();
        assert_eq!(
            err,
            GraphError::CyclicDependency {
                job: "a".to_string(),
                cycle: vec!["a".to_string(), "a".to_string()]
            }
        );
    }

    #[test]
    fn test_shell_exec_becomes_script() {
        let graph = build(
            r#"
name: exec
jobs:
  a:
    steps:
      - uses: shell/exec
        with:
          command: echo ${{ github.sha }}
"#,
        )
        .unwrap();

        let step = &graph.get_job("a").unwrap().steps[0];
        match &step.action {
            StepAction::Script { script, .. } => {
                assert_eq!(script.to_string(), "echo ${{ github.sha }}")
            }
            other => panic!("expected script, got {other:?}"),
        }
    }

    #[test]
    fn test_positive_timeout() {
        assert_eq!(positive_timeout(None), Some(None));
        assert_eq!(positive_timeout(Some(0)), None);
        assert_eq!(
            positive_timeout(Some(5)),
            Some(Some(Duration::from_millis(5)))
        );
    }
}
