mod common;

use common::*;
use pipeline_actions::engine::GraphError;
use pipeline_actions::prelude::*;
use pipeline_actions::workflow::{ActionDefinition, ActionInput};
use std::collections::BTreeMap;

fn plan(yaml: &str) -> Result<JobGraph, ExecutorError> {
    let workflow = Workflow::from_yaml(yaml).unwrap();
    Executor::new().plan(&workflow)
}

#[test]
fn test_diamond_levels() {
    let graph = plan(
        r#"
name: diamond
jobs:
  checkout:
    steps: [{ run: "true" }]
  lint:
    needs: checkout
    steps: [{ run: "true" }]
  unit:
    needs: [checkout]
    steps: [{ run: "true" }]
  package:
    needs: [lint, unit]
    steps: [{ run: "true" }]
"#,
    )
    .unwrap();

    assert_eq!(
        graph.execution_levels(),
        &vec![
            vec!["checkout".to_string()],
            vec!["lint".to_string(), "unit".to_string()],
            vec!["package".to_string()],
        ]
    );
    assert_eq!(graph.dependents("checkout"), &["lint", "unit"]);
    assert!(graph.dependents("package").is_empty());
}

#[test]
fn test_cycle_names_a_job() {
    let err = plan(cyclic_workflow()).unwrap_err();
    match err {
        ExecutorError::Graph(GraphError::CyclicDependency { job, cycle }) => {
            assert!(["a", "b", "c"].contains(&job.as_str()));
            assert_eq!(cycle.first(), cycle.last());
            assert_eq!(cycle.len(), 4);
        }
        other => panic!("expected cycle, got {:?}", other),
    }
}

#[test]
fn test_self_dependency_is_a_cycle() {
    let err = plan(
        r#"
name: self
jobs:
  loop:
    needs: [loop]
    steps: [{ run: "true" }]
"#,
    )
    .unwrap_err();
    assert!(matches!(
        err,
        ExecutorError::Graph(GraphError::CyclicDependency { ref job, .. }) if job == "loop"
    ));
}

#[test]
fn test_repeated_needs_counted_once() {
    let graph = plan(
        r#"
name: repeated
jobs:
  build:
    steps: [{ run: "true" }]
  test:
    needs: [build, build]
    steps: [{ run: "true" }]
"#,
    )
    .unwrap();

    assert_eq!(graph.dependents("build"), &["test"]);
    assert_eq!(graph.get_job("test").unwrap().needs, vec!["build"]);
    assert_eq!(graph.execution_levels().len(), 2);
}

#[test]
fn test_fail_now_zero_exit_code_rejected() {
    let err = plan(
        r#"
name: not-a-failure
jobs:
  check:
    steps:
      - uses: fail/now
        with:
          exit_code: 0
"#,
    )
    .unwrap_err();
    assert!(matches!(
        err,
        ExecutorError::Graph(GraphError::InvalidStep { .. })
    ));
    assert!(err.to_string().contains("non-zero"));
}

#[test]
fn test_unknown_dependency() {
    let err = plan(
        r#"
name: dangling
jobs:
  deploy:
    needs: [build]
    steps: [{ run: "true" }]
"#,
    )
    .unwrap_err();
    assert!(matches!(
        err,
        ExecutorError::Graph(GraphError::UnknownJobReference { .. })
    ));
    assert!(err.to_string().contains("build"));
}

#[test]
fn test_undeclared_needs_output_rejected() {
    let err = plan(
        r#"
name: outputs
jobs:
  build:
    steps: [{ run: "true" }]
  deploy:
    needs: [build]
    steps:
      - run: echo ${{ needs.build.outputs.image }}
"#,
    )
    .unwrap_err();
    assert!(matches!(
        err,
        ExecutorError::Graph(GraphError::UnresolvedReference { .. })
    ));
}

#[test]
fn test_later_step_output_rejected() {
    let err = plan(
        r#"
name: order
jobs:
  build:
    steps:
      - run: echo ${{ steps.tag.outputs.value }}
      - id: tag
        run: echo "::set-output name=value::1"
"#,
    )
    .unwrap_err();
    assert!(err.to_string().contains("steps.tag.outputs.value"));
}

#[test]
fn test_secret_in_condition_rejected() {
    let err = plan(
        r#"
name: leak
jobs:
  deploy:
    secrets: [TOKEN]
    if: ${{ secrets.TOKEN }}
    steps: [{ run: "true" }]
"#,
    )
    .unwrap_err();
    assert!(matches!(
        err,
        ExecutorError::Graph(GraphError::UnresolvedReference { .. })
    ));
}

#[test]
fn test_digest_is_stable() {
    let yaml = simple_workflow("digest");
    let first = plan(&yaml).unwrap();
    let second = plan(&yaml).unwrap();
    assert_eq!(first.digest(), second.digest());

    let other = plan(&simple_workflow("digest-2")).unwrap();
    assert_ne!(first.digest(), other.digest());
}

fn greet_action() -> ActionDefinition {
    let mut inputs = BTreeMap::new();
    inputs.insert(
        "who".to_string(),
        ActionInput {
            required: true,
            ..Default::default()
        },
    );
    inputs.insert(
        "greeting".to_string(),
        ActionInput {
            default: Some("hello".to_string()),
            ..Default::default()
        },
    );
    ActionDefinition {
        description: None,
        inputs,
        run: "echo ${{ inputs.greeting }} ${{ inputs.who }}".to_string(),
        shell: None,
    }
}

#[tokio::test]
async fn test_composite_action_runs() {
    let yaml = r#"
name: composite
jobs:
  hello:
    steps:
      - uses: greet@v1
        with:
          who: ${{ github.actor }}
"#;
    let result = Executor::new()
        .with_action("greet", greet_action())
        .run_yaml(yaml, TriggerEvent::new("push").with_actor("octo"))
        .await
        .unwrap();

    assert!(result.success());
    assert_eq!(result.jobs["hello"].steps[0].stdout.trim(), "hello octo");
}

#[test]
fn test_composite_missing_required_input() {
    let workflow = Workflow::from_yaml(
        r#"
name: composite
jobs:
  hello:
    steps:
      - uses: greet
"#,
    )
    .unwrap();
    let err = Executor::new()
        .with_action("greet", greet_action())
        .plan(&workflow)
        .unwrap_err();
    assert!(err.to_string().contains("who"));
}

#[test]
fn test_unknown_action() {
    let err = plan(
        r#"
name: unknown
jobs:
  a:
    steps:
      - uses: docker/build@v2
"#,
    )
    .unwrap_err();
    assert!(matches!(
        err,
        ExecutorError::Graph(GraphError::UnknownAction { .. })
    ));
}
