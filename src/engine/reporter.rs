//! Run reporting
//!
//! Aggregates the scheduler's per-job results into one [`RunResult`],
//! writes it as a JSON record and emits a single structured log event.

use chrono::Utc;
use std::path::{Path, PathBuf};
use tracing::{error, info};

use crate::engine::job_graph::JobGraph;
use crate::engine::result::{RunResult, RunStatus};
use crate::engine::scheduler::ScheduleOutcome;
use crate::workflow::RunContext;

#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    #[error("IO error writing {path}: {error}")]
    Io {
        path: String,
        error: std::io::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Default)]
pub struct RunReporter {
    record_dir: Option<PathBuf>,
}

impl RunReporter {
    pub fn new(record_dir: Option<PathBuf>) -> Self {
        Self { record_dir }
    }

    pub fn record_dir(&self) -> Option<&Path> {
        self.record_dir.as_deref()
    }

    /// Build the final result. Every non-optional job must succeed for the
    /// run to pass; jobs skipped by their own condition do not fail it.
    pub fn aggregate(
        &self,
        graph: &JobGraph,
        context: &RunContext,
        outcome: ScheduleOutcome,
    ) -> RunResult {
        let status = if outcome.cancelled {
            RunStatus::Cancelled
        } else if outcome.results.values().any(|job| job.blocks_run()) {
            RunStatus::Failure
        } else {
            RunStatus::Success
        };

        RunResult {
            run_id: context.run_id.clone(),
            workflow: context.workflow.clone(),
            event: context.event.clone(),
            status,
            started_at: context.started_at,
            finished_at: Utc::now(),
            definition_digest: graph.digest().to_string(),
            execution_levels: graph.execution_levels().clone(),
            jobs: outcome.results,
        }
    }

    /// Write the durable record (if configured) and log the summary
    pub fn emit(&self, result: &RunResult) -> Result<Option<PathBuf>, ReportError> {
        let record = match &self.record_dir {
            Some(dir) => Some(write_record(dir, result)?),
            None => None,
        };

        let failures: Vec<String> = result
            .jobs
            .values()
            .filter(|job| job.blocks_run())
            .map(|job| match job.first_error() {
                Some(err) => format!("{}: {}", job.job, err),
                None => job.job.clone(),
            })
            .collect();

        if result.success() {
            info!(
                run_id = %result.run_id,
                workflow = %result.workflow,
                status = %result.status,
                jobs = result.jobs.len(),
                duration_ms = result.duration_ms(),
                digest = %result.definition_digest,
                record = ?record,
                "Run finished"
            );
        } else {
            error!(
                run_id = %result.run_id,
                workflow = %result.workflow,
                status = %result.status,
                jobs = result.jobs.len(),
                failures = ?failures,
                duration_ms = result.duration_ms(),
                digest = %result.definition_digest,
                record = ?record,
                "Run finished"
            );
        }

        Ok(record)
    }

    pub fn finalize(
        &self,
        graph: &JobGraph,
        context: &RunContext,
        outcome: ScheduleOutcome,
    ) -> Result<RunResult, ReportError> {
        let result = self.aggregate(graph, context, outcome);
        self.emit(&result)?;
        Ok(result)
    }
}

fn write_record(dir: &Path, result: &RunResult) -> Result<PathBuf, ReportError> {
    std::fs::create_dir_all(dir).map_err(|error| ReportError::Io {
        path: dir.display().to_string(),
        error,
    })?;

    let path = dir.join(format!("{}.json", result.run_id));
    let json = serde_json::to_string_pretty(result)?;
    std::fs::write(&path, json).map_err(|error| ReportError::Io {
        path: path.display().to_string(),
        error,
    })?;
    Ok(path)
}
