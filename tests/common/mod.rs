#![allow(dead_code)]

use async_trait::async_trait;
use pipeline_actions::engine::{
    CancelSignal, ShellStepExecutor, StepExecutor, StepInvocation, StepOutput,
};
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tempfile::TempDir;

pub fn create_test_dir() -> TempDir {
    tempfile::tempdir().expect("Failed to create temp directory")
}

pub fn write_workflow(dir: &Path, filename: &str, content: &str) {
    fs::write(dir.join(filename), content).expect("Failed to write pipeline file");
}

pub fn write_runner_config(dir: &Path, content: &str) {
    fs::write(dir.join("runner.yaml"), content).expect("Failed to write runner.yaml");
}

pub fn simple_workflow(name: &str) -> String {
    format!(
        r#"
name: {}
jobs:
  test:
    steps:
      - uses: wait/ms
        with:
          duration: "1"
"#,
        name
    )
}

pub fn failing_workflow(name: &str) -> String {
    format!(
        r#"
name: {}
jobs:
  test:
    steps:
      - uses: fail/now
        with:
          message: "Intentional test failure"
"#,
        name
    )
}

/// `build -> test -> deploy`, where `build` fails when `fail_build` is set
pub fn chain_workflow(fail_build: bool) -> String {
    let build_step = if fail_build {
        "      - uses: fail/now\n        with:\n          message: build broke\n"
    } else {
        "      - run: echo built\n"
    };
    format!(
        r#"
name: chain
jobs:
  build:
    steps:
{}
  test:
    needs: [build]
    steps:
      - run: echo tested
  deploy:
    needs: [test]
    steps:
      - run: echo deployed
"#,
        build_step
    )
}

pub fn cyclic_workflow() -> &'static str {
    r#"
name: cyclic
jobs:
  a:
    needs: [c]
    steps: [{ run: "true" }]
  b:
    needs: [a]
    steps: [{ run: "true" }]
  c:
    needs: [b]
    steps: [{ run: "true" }]
"#
}

/// One executed step as seen by [`RecordingExecutor`]
#[derive(Debug, Clone)]
pub struct Recorded {
    pub job: String,
    pub step: String,
    pub env: std::collections::BTreeMap<String, String>,
    pub started: Instant,
    pub finished: Instant,
}

/// Runs steps on the host shell and records every invocation it receives
#[derive(Default)]
pub struct RecordingExecutor {
    inner: ShellStepExecutor,
    calls: Mutex<Vec<Recorded>>,
}

impl RecordingExecutor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> Vec<Recorded> {
        self.calls.lock().unwrap().clone()
    }

    pub fn jobs_run(&self) -> Vec<String> {
        self.calls().into_iter().map(|c| c.job).collect()
    }

    pub fn ran(&self, job: &str) -> bool {
        self.calls().iter().any(|c| c.job == job)
    }

    pub fn call_for(&self, job: &str) -> Option<Recorded> {
        self.calls().into_iter().find(|c| c.job == job)
    }
}

#[async_trait]
impl StepExecutor for RecordingExecutor {
    async fn execute(&self, invocation: &StepInvocation, cancel: CancelSignal) -> StepOutput {
        let started = Instant::now();
        let output = self.inner.execute(invocation, cancel).await;
        self.calls.lock().unwrap().push(Recorded {
            job: invocation.job.clone(),
            step: invocation.step.clone(),
            env: invocation.env.clone(),
            started,
            finished: Instant::now(),
        });
        output
    }
}
