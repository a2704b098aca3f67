//! Run context
//!
//! The triggering event is captured once, when the run starts, and is never
//! mutated afterwards. Jobs running concurrently share it through an `Arc`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::expressions::GithubField;

/// Variables every step process receives from the run context
pub const CONTEXT_ENV_VARS: &[&str] = &[
    "CI",
    "GITHUB_ACTIONS",
    "GITHUB_RUN_ID",
    "GITHUB_WORKFLOW",
    "GITHUB_EVENT_NAME",
    "GITHUB_REF",
    "GITHUB_REF_NAME",
    "GITHUB_SHA",
    "GITHUB_ACTOR",
    "GITHUB_REPOSITORY",
];

/// The external event that started a run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TriggerEvent {
    /// Event type (`push`, `pull_request`, `workflow_dispatch`, ...)
    pub event_name: String,

    /// Fully qualified git ref (`refs/heads/main`)
    #[serde(default, rename = "ref")]
    pub git_ref: String,

    /// Commit SHA
    #[serde(default)]
    pub sha: String,

    /// Identity that triggered the event
    #[serde(default)]
    pub actor: String,

    /// Repository slug (`owner/name`)
    #[serde(default)]
    pub repository: Option<String>,
}

impl TriggerEvent {
    pub fn new(event_name: impl Into<String>) -> Self {
        Self {
            event_name: event_name.into(),
            ..Default::default()
        }
    }

    pub fn with_ref(mut self, git_ref: impl Into<String>) -> Self {
        self.git_ref = git_ref.into();
        self
    }

    pub fn with_sha(mut self, sha: impl Into<String>) -> Self {
        self.sha = sha.into();
        self
    }

    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = actor.into();
        self
    }

    pub fn with_repository(mut self, repository: impl Into<String>) -> Self {
        self.repository = Some(repository.into());
        self
    }

    /// Short ref name (`main` for `refs/heads/main`, `v1` for `refs/tags/v1`)
    pub fn ref_name(&self) -> &str {
        self.git_ref
            .strip_prefix("refs/heads/")
            .or_else(|| self.git_ref.strip_prefix("refs/tags/"))
            .unwrap_or(&self.git_ref)
    }

    /// Branch name, or `None` if the ref is not a branch
    pub fn branch(&self) -> Option<&str> {
        if let Some(branch) = self.git_ref.strip_prefix("refs/heads/") {
            return Some(branch);
        }
        if self.git_ref.starts_with("refs/") || self.git_ref.is_empty() {
            return None;
        }
        Some(&self.git_ref)
    }
}

/// Immutable per-run context shared by every job
#[derive(Debug, Clone)]
pub struct RunContext {
    /// Run ID
    pub run_id: String,

    /// Pipeline name
    pub workflow: String,

    /// Triggering event payload
    pub event: TriggerEvent,

    /// When the run started
    pub started_at: DateTime<Utc>,
}

impl RunContext {
    /// Create a context with a generated run ID
    pub fn new(workflow: impl Into<String>, event: TriggerEvent) -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            workflow: workflow.into(),
            event,
            started_at: Utc::now(),
        }
    }

    /// Value of a `github.*` field
    pub fn github(&self, field: GithubField) -> String {
        match field {
            GithubField::Sha => self.event.sha.clone(),
            GithubField::Ref => self.event.git_ref.clone(),
            GithubField::RefName => self.event.ref_name().to_string(),
            GithubField::Actor => self.event.actor.clone(),
            GithubField::EventName => self.event.event_name.clone(),
            GithubField::RunId => self.run_id.clone(),
            GithubField::Repository => self.event.repository.clone().unwrap_or_default(),
            GithubField::Workflow => self.workflow.clone(),
        }
    }

    /// Standard variables injected into every step process
    pub fn env_vars(&self) -> BTreeMap<String, String> {
        let mut vars = BTreeMap::new();
        vars.insert("CI".to_string(), "true".to_string());
        vars.insert("GITHUB_ACTIONS".to_string(), "true".to_string());
        vars.insert("GITHUB_RUN_ID".to_string(), self.run_id.clone());
        vars.insert("GITHUB_WORKFLOW".to_string(), self.workflow.clone());
        vars.insert("GITHUB_EVENT_NAME".to_string(), self.event.event_name.clone());
        vars.insert("GITHUB_REF".to_string(), self.event.git_ref.clone());
        vars.insert("GITHUB_REF_NAME".to_string(), self.event.ref_name().to_string());
        vars.insert("GITHUB_SHA".to_string(), self.event.sha.clone());
        vars.insert("GITHUB_ACTOR".to_string(), self.event.actor.clone());
        if let Some(repository) = &self.event.repository {
            vars.insert("GITHUB_REPOSITORY".to_string(), repository.clone());
        }
        vars
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event() -> TriggerEvent {
        TriggerEvent::new("push")
            .with_ref("refs/heads/main")
            .with_sha("abc123")
            .with_actor("octocat")
            .with_repository("acme/web")
    }

    #[test]
    fn test_new_context() {
        let ctx = RunContext::new("ci", event());
        assert!(!ctx.run_id.is_empty());
        assert_eq!(ctx.workflow, "ci");
    }

    #[test]
    fn test_ref_name() {
        assert_eq!(event().ref_name(), "main");
        assert_eq!(TriggerEvent::new("push").with_ref("refs/tags/v1.2").ref_name(), "v1.2");
        assert_eq!(TriggerEvent::new("push").with_ref("refs/tags/v1.2").branch(), None);
        assert_eq!(event().branch(), Some("main"));
    }

    #[test]
    fn test_github_fields() {
        let ctx = RunContext::new("ci", event());
        assert_eq!(ctx.github(GithubField::Sha), "abc123");
        assert_eq!(ctx.github(GithubField::Actor), "octocat");
        assert_eq!(ctx.github(GithubField::Ref), "refs/heads/main");
        assert_eq!(ctx.github(GithubField::RefName), "main");
        assert_eq!(ctx.github(GithubField::Repository), "acme/web");
        assert_eq!(ctx.github(GithubField::RunId), ctx.run_id);
    }

    #[test]
    fn test_env_vars() {
        let ctx = RunContext::new("ci", event());
        let vars = ctx.env_vars();
        assert_eq!(vars["CI"], "true");
        assert_eq!(vars["GITHUB_SHA"], "abc123");
        assert_eq!(vars["GITHUB_REF_NAME"], "main");
        assert_eq!(vars["GITHUB_REPOSITORY"], "acme/web");
        assert!(vars.keys().all(|k| CONTEXT_ENV_VARS.contains(&k.as_str())));
    }

    #[test]
    fn test_event_payload_json() {
        let json = r#"{"event_name":"push","ref":"refs/heads/dev","sha":"f00","actor":"ci-bot"}"#;
        let event: TriggerEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.git_ref, "refs/heads/dev");
        assert_eq!(event.repository, None);
    }
}
