mod common;

use common::*;
use pipeline_actions::engine::{GraphError, SkipReason, StepError, StepStatus};
use pipeline_actions::prelude::*;
use std::time::{Duration, Instant};

fn push() -> TriggerEvent {
    TriggerEvent::new("push").with_ref("refs/heads/main")
}

#[tokio::test]
async fn test_cyclic_pipeline_runs_no_jobs() {
    let recorder = RecordingExecutor::new();
    let executor = Executor::new().with_step_executor(recorder.clone());

    let err = executor
        .run_yaml(cyclic_workflow(), push())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        ExecutorError::Graph(GraphError::CyclicDependency { .. })
    ));
    assert!(recorder.calls().is_empty());
}

#[tokio::test]
async fn test_failure_skips_downstream_jobs() {
    let recorder = RecordingExecutor::new();
    let executor = Executor::new().with_step_executor(recorder.clone());

    let result = executor
        .run_yaml(&chain_workflow(true), push())
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::Failure);
    assert_eq!(result.job_status("build"), Some(JobStatus::Failed));
    assert_eq!(result.job_status("test"), Some(JobStatus::Skipped));
    assert_eq!(result.job_status("deploy"), Some(JobStatus::Skipped));

    assert_eq!(
        result.jobs["test"].skip_reason,
        Some(SkipReason::UpstreamFailed {
            dependency: "build".to_string()
        })
    );
    assert_eq!(
        result.jobs["deploy"].skip_reason,
        Some(SkipReason::UpstreamFailed {
            dependency: "test".to_string()
        })
    );

    // No step of a skipped job ever reaches the executor
    assert_eq!(recorder.jobs_run(), vec!["build"]);
    assert!(result.jobs["deploy"].steps.is_empty());
}

#[tokio::test]
async fn test_dependencies_run_in_order() {
    let recorder = RecordingExecutor::new();
    let executor = Executor::new().with_step_executor(recorder.clone());

    let result = executor
        .run_yaml(&chain_workflow(false), push())
        .await
        .unwrap();

    assert!(result.success());
    let build = recorder.call_for("build").unwrap();
    let test = recorder.call_for("test").unwrap();
    let deploy = recorder.call_for("deploy").unwrap();
    assert!(build.finished <= test.started);
    assert!(test.finished <= deploy.started);
    assert_eq!(
        result.execution_levels,
        vec![vec!["build"], vec!["test"], vec!["deploy"]]
    );
}

#[tokio::test]
async fn test_independent_jobs_run_concurrently() {
    let yaml = r#"
name: parallel
jobs:
  left:
    steps:
      - uses: wait/ms
        with: { duration: 300 }
  right:
    steps:
      - uses: wait/ms
        with: { duration: 300 }
"#;
    let started = Instant::now();
    let result = Executor::new()
        .parallel(2)
        .run_yaml(yaml, push())
        .await
        .unwrap();
    let elapsed = started.elapsed();

    assert!(result.success());
    assert!(
        elapsed < Duration::from_millis(550),
        "expected overlap, took {:?}",
        elapsed
    );
}

#[tokio::test]
async fn test_parallel_limit_serializes() {
    let yaml = r#"
name: serial
jobs:
  left:
    steps:
      - uses: wait/ms
        with: { duration: 150 }
  right:
    steps:
      - uses: wait/ms
        with: { duration: 150 }
"#;
    let recorder = RecordingExecutor::new();
    let result = Executor::new()
        .parallel(1)
        .with_step_executor(recorder.clone())
        .run_yaml(yaml, push())
        .await
        .unwrap();

    assert!(result.success());
    let calls = recorder.calls();
    assert_eq!(calls.len(), 2);
    let (first, second) = if calls[0].started <= calls[1].started {
        (&calls[0], &calls[1])
    } else {
        (&calls[1], &calls[0])
    };
    assert!(first.finished <= second.started);
}

#[tokio::test]
async fn test_step_timeout_leaves_siblings_alone() {
    let yaml = r#"
name: timeouts
jobs:
  slow:
    steps:
      - uses: wait/ms
        timeout: 100
        with: { duration: 5000 }
      - run: echo never
  sibling:
    steps:
      - uses: wait/ms
        with: { duration: 200 }
      - run: echo fine
"#;
    let started = Instant::now();
    let result = Executor::new().run_yaml(yaml, push()).await.unwrap();

    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(result.status, RunStatus::Failure);
    assert_eq!(result.job_status("slow"), Some(JobStatus::Failed));
    assert_eq!(result.job_status("sibling"), Some(JobStatus::Succeeded));

    let slow = &result.jobs["slow"];
    assert!(matches!(
        slow.steps[0].error,
        Some(StepError::Timeout { timeout_ms: 100 })
    ));
    assert_eq!(slow.steps[1].status, StepStatus::NotRun);
}

#[tokio::test]
async fn test_job_timeout_applies_to_steps() {
    let yaml = r#"
name: job-timeout
jobs:
  slow:
    timeout: 100
    steps:
      - run: sleep 5
"#;
    let result = Executor::new().run_yaml(yaml, push()).await.unwrap();
    let step = &result.jobs["slow"].steps[0];
    assert!(matches!(step.error, Some(StepError::Timeout { .. })));
}

#[tokio::test]
async fn test_cancellation_stops_run() {
    let yaml = r#"
name: cancel
jobs:
  long:
    steps:
      - uses: wait/ms
        with: { duration: 5000 }
  after:
    needs: [long]
    steps:
      - run: echo after
"#;
    let executor = Executor::new();
    let handle = executor.cancel_handle();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.cancel();
    });

    let started = Instant::now();
    let result = executor.run_yaml(yaml, push()).await.unwrap();

    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(result.status, RunStatus::Cancelled);
    assert_eq!(result.job_status("long"), Some(JobStatus::Cancelled));
    assert_eq!(result.job_status("after"), Some(JobStatus::Cancelled));
    assert_eq!(result.jobs["long"].steps[0].status, StepStatus::Cancelled);
}

#[tokio::test]
async fn test_optional_job_does_not_gate() {
    let yaml = r#"
name: optional
jobs:
  build:
    steps:
      - run: echo ok
  lint:
    optional: true
    steps:
      - uses: fail/now
"#;
    let result = Executor::new().run_yaml(yaml, push()).await.unwrap();
    assert_eq!(result.status, RunStatus::Success);
    assert_eq!(result.job_status("lint"), Some(JobStatus::Failed));
}

#[tokio::test]
async fn test_optional_failure_still_skips_dependents() {
    let yaml = r#"
name: optional-chain
jobs:
  flaky:
    optional: true
    steps:
      - uses: fail/now
  report:
    needs: [flaky]
    steps:
      - run: echo report
"#;
    let result = Executor::new().run_yaml(yaml, push()).await.unwrap();
    assert_eq!(result.job_status("report"), Some(JobStatus::Skipped));
    assert_eq!(result.status, RunStatus::Failure);
}

#[tokio::test]
async fn test_needs_outputs_flow_downstream() {
    let yaml = r#"
name: outputs
jobs:
  build:
    outputs:
      image: ${{ steps.meta.outputs.image }}
    steps:
      - id: meta
        run: echo "::set-output name=image::app:${{ github.sha }}"
  deploy:
    needs: [build]
    steps:
      - run: echo "deploying $IMAGE"
        env:
          IMAGE: ${{ needs.build.outputs.image }}
"#;
    let result = Executor::new()
        .run_yaml(yaml, push().with_sha("abc123"))
        .await
        .unwrap();

    assert!(result.success());
    assert_eq!(result.jobs["build"].outputs["image"], "app:abc123");
    assert_eq!(
        result.jobs["deploy"].steps[0].stdout.trim(),
        "deploying app:abc123"
    );
}

#[tokio::test]
async fn test_condition_false_skips_without_failing() {
    let yaml = r#"
name: conditional
jobs:
  build:
    steps:
      - run: echo build
  release:
    needs: [build]
    if: github.event_name == 'release'
    steps:
      - run: echo release
  announce:
    needs: [release]
    steps:
      - run: echo announce
"#;
    let recorder = RecordingExecutor::new();
    let result = Executor::new()
        .with_step_executor(recorder.clone())
        .run_yaml(yaml, push())
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::Success);
    assert_eq!(result.job_status("release"), Some(JobStatus::Skipped));
    assert_eq!(result.job_status("announce"), Some(JobStatus::Skipped));
    assert!(matches!(
        result.jobs["announce"].skip_reason,
        Some(SkipReason::NotApplicable { .. })
    ));
    assert_eq!(recorder.jobs_run(), vec!["build"]);
}

#[tokio::test]
async fn test_context_env_injected() {
    let yaml = r#"
name: ctx
env:
  STAGE: ci
jobs:
  show:
    env:
      TARGET: ${{ github.ref_name }}
    steps:
      - run: echo "$GITHUB_EVENT_NAME $STAGE $TARGET $CI"
"#;
    let recorder = RecordingExecutor::new();
    let result = Executor::new()
        .with_step_executor(recorder.clone())
        .run_yaml(yaml, push())
        .await
        .unwrap();

    assert_eq!(result.jobs["show"].steps[0].stdout.trim(), "push ci main true");
    let call = recorder.call_for("show").unwrap();
    assert_eq!(call.env["GITHUB_RUN_ID"], result.run_id);
}
