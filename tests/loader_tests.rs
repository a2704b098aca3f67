mod common;

use common::*;
use pipeline_actions::prelude::*;
use pipeline_actions::workflow::{scalar_to_string, LoadError};
use std::fs;

#[test]
fn test_empty_pipeline_directory() {
    let dir = create_test_dir();
    assert!(WorkflowLoader::load_directory(dir.path()).unwrap().is_empty());
}

#[test]
fn test_pipelines_load_in_file_name_order() {
    let dir = create_test_dir();
    write_workflow(dir.path(), "30-deploy.yaml", &simple_workflow("deploy"));
    fs::write(dir.path().join("10-lint.yml"), simple_workflow("lint")).unwrap();
    write_workflow(dir.path(), "20-test.yaml", &simple_workflow("test"));

    let names: Vec<_> = WorkflowLoader::load_directory(dir.path())
        .unwrap()
        .into_iter()
        .map(|w| w.name)
        .collect();
    assert_eq!(names, vec!["lint", "test", "deploy"]);
}

#[test]
fn test_directory_skips_runner_config_and_other_files() {
    let dir = create_test_dir();
    write_workflow(dir.path(), "ci.yaml", &simple_workflow("ci"));
    write_runner_config(dir.path(), "parallel: 4");
    fs::write(dir.path().join("runner.yml"), "parallel: 2").unwrap();
    fs::write(dir.path().join("README.md"), "# pipelines").unwrap();
    fs::write(dir.path().join("event.json"), "{}").unwrap();

    let nested = dir.path().join("archived");
    fs::create_dir(&nested).unwrap();
    fs::write(nested.join("old.yaml"), simple_workflow("old")).unwrap();

    let workflows = WorkflowLoader::load_directory(dir.path()).unwrap();
    assert_eq!(workflows.len(), 1);
    assert_eq!(workflows[0].name, "ci");
}

#[test]
fn test_one_broken_pipeline_fails_the_directory() {
    let dir = create_test_dir();
    write_workflow(dir.path(), "ci.yaml", &simple_workflow("ci"));
    fs::write(dir.path().join("release.yaml"), "jobs: [unclosed").unwrap();

    match WorkflowLoader::load_directory(dir.path()) {
        Err(LoadError::Yaml { file, .. }) => assert!(file.ends_with("release.yaml")),
        other => panic!("expected yaml error, got {:?}", other.map(|w| w.len())),
    }
}

#[test]
fn test_load_file_errors() {
    assert!(matches!(
        WorkflowLoader::load_file(std::path::Path::new("/nonexistent/ci.yaml")),
        Err(LoadError::Io(_))
    ));

    let dir = create_test_dir();
    let unnamed = dir.path().join("unnamed.yaml");
    fs::write(&unnamed, "jobs:\n  build:\n    steps:\n      - run: make\n").unwrap();
    assert!(matches!(
        WorkflowLoader::load_file(&unnamed),
        Err(LoadError::Yaml { .. })
    ));
}

#[test]
fn test_load_pipeline_with_all_fields() {
    let dir = create_test_dir();
    let path = dir.path().join("release.yaml");
    fs::write(
        &path,
        r#"
name: release
on:
  push:
    branches: [main, "release/**"]
  pull_request:
env:
  STAGE: ci
  NODE_VERSION: 20
jobs:
  build:
    name: Build
    runs-on: ubuntu-latest
    permissions:
      contents: read
    secrets: [NPM_TOKEN]
    env:
      JOB_VAR: value
    timeout: 60000
    outputs:
      version: ${{ steps.ver.outputs.version }}
    steps:
      - id: ver
        name: Compute version
        run: echo "::set-output name=version::1.0.0"
        working-directory: app
  deploy:
    needs: build
    if: github.ref == 'refs/heads/main'
    optional: true
    steps:
      - uses: wait/ms
        with:
          duration: 1
"#,
    )
    .unwrap();

    let w = WorkflowLoader::load_file(&path).unwrap();
    assert_eq!(w.name, "release");
    assert_eq!(w.on.event_names(), vec!["pull_request", "push"]);
    assert_eq!(w.env["STAGE"], "ci");
    assert_eq!(w.env["NODE_VERSION"], "20");

    let build = &w.jobs["build"];
    assert_eq!(build.display_name("build"), "Build");
    assert_eq!(build.runs_on.as_deref(), Some("ubuntu-latest"));
    assert_eq!(build.permissions["contents"], "read");
    assert_eq!(build.secrets, vec!["NPM_TOKEN"]);
    assert_eq!(build.timeout, Some(60000));
    assert_eq!(build.steps[0].id.as_deref(), Some("ver"));
    assert_eq!(build.steps[0].working_directory.as_deref(), Some("app"));

    let deploy = &w.jobs["deploy"];
    assert_eq!(deploy.needs, vec!["build"]);
    assert!(deploy.optional);
    assert!(deploy.condition.is_some());
    assert_eq!(scalar_to_string(&deploy.steps[0].with["duration"]), "1");
}

#[test]
fn test_unicode_pipeline_names() {
    let dir = create_test_dir();
    let path = dir.path().join("unicode.yaml");
    fs::write(
        &path,
        r#"
name: "デプロイ"
jobs:
  build:
    steps:
      - name: "构建"
        run: "true"
"#,
    )
    .unwrap();

    let w = WorkflowLoader::load_file(&path).unwrap();
    assert_eq!(w.name, "デプロイ");
    assert_eq!(w.jobs["build"].steps[0].name.as_deref(), Some("构建"));
}
