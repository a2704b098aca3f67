//! Execution result types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::engine::error::StepError;
use crate::workflow::TriggerEvent;

/// Lifecycle state of a job. Only the scheduler moves a job between states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Pending | JobStatus::Running)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Skipped => "skipped",
            JobStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Why a job was skipped
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SkipReason {
    /// The job's own `if:` was false, or an upstream job was skipped for that reason
    NotApplicable { detail: String },
    /// A dependency failed, was cancelled, or was itself skipped because of a failure
    UpstreamFailed { dependency: String },
}

impl SkipReason {
    pub fn is_upstream_failure(&self) -> bool {
        matches!(self, SkipReason::UpstreamFailed { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Succeeded,
    Failed,
    Cancelled,
    /// An earlier step in the job failed
    NotRun,
}

/// Result of a step execution. Captured text is already redacted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub name: String,
    pub id: Option<String>,
    pub status: StepStatus,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub outputs: BTreeMap<String, String>,
    pub error: Option<StepError>,
    pub duration_ms: u64,
}

impl StepResult {
    pub fn not_run(name: impl Into<String>, id: Option<String>) -> Self {
        Self {
            name: name.into(),
            id,
            status: StepStatus::NotRun,
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            outputs: BTreeMap::new(),
            error: None,
            duration_ms: 0,
        }
    }

    pub fn success(&self) -> bool {
        self.status == StepStatus::Succeeded
    }
}

/// Result of a job execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResult {
    pub job: String,
    pub status: JobStatus,
    pub optional: bool,
    pub steps: Vec<StepResult>,
    pub outputs: BTreeMap<String, String>,
    pub skip_reason: Option<SkipReason>,
    /// Failures that belong to the job rather than a step (condition, outputs, panics)
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub duration_ms: u64,
}

impl JobResult {
    /// A job that never started
    pub fn unstarted(job: impl Into<String>, optional: bool, status: JobStatus) -> Self {
        Self {
            job: job.into(),
            status,
            optional,
            steps: Vec::new(),
            outputs: BTreeMap::new(),
            skip_reason: None,
            error: None,
            started_at: None,
            duration_ms: 0,
        }
    }

    pub fn skipped(job: impl Into<String>, optional: bool, reason: SkipReason) -> Self {
        let mut result = Self::unstarted(job, optional, JobStatus::Skipped);
        result.skip_reason = Some(reason);
        result
    }

    pub fn success(&self) -> bool {
        self.status == JobStatus::Succeeded
    }

    /// The error of the first failing step, or the job-level error
    pub fn first_error(&self) -> Option<String> {
        self.steps
            .iter()
            .find_map(|step| {
                step.error
                    .as_ref()
                    .map(|e| format!("step '{}': {}", step.name, e))
            })
            .or_else(|| self.error.clone())
    }

    /// Whether this job counts against the overall run result
    pub fn blocks_run(&self) -> bool {
        if self.optional {
            return false;
        }
        match self.status {
            JobStatus::Succeeded => false,
            JobStatus::Skipped => self
                .skip_reason
                .as_ref()
                .map_or(true, SkipReason::is_upstream_failure),
            _ => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    Failure,
    Cancelled,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunStatus::Success => "success",
            RunStatus::Failure => "failure",
            RunStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Result of a pipeline run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    pub run_id: String,
    pub workflow: String,
    pub event: TriggerEvent,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// sha256 of the pipeline definition
    pub definition_digest: String,
    pub execution_levels: Vec<Vec<String>>,
    pub jobs: BTreeMap<String, JobResult>,
}

impl RunResult {
    pub fn success(&self) -> bool {
        self.status == RunStatus::Success
    }

    pub fn job(&self, id: &str) -> Option<&JobResult> {
        self.jobs.get(id)
    }

    pub fn job_status(&self, id: &str) -> Option<JobStatus> {
        self.jobs.get(id).map(|j| j.status)
    }

    pub fn duration_ms(&self) -> u64 {
        (self.finished_at - self.started_at).num_milliseconds().max(0) as u64
    }
}
