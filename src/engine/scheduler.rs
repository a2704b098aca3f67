//! Job scheduler
//!
//! Dispatches jobs in dependency order with bounded parallelism. Jobs start
//! as soon as all their dependencies have succeeded (eager scheduling). The
//! scheduler loop is the only place job status changes; workers hand their
//! [`JobResult`] back through the join set.

use futures::FutureExt;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, instrument, warn};

use crate::engine::cancel::CancelSignal;
use crate::engine::job_graph::JobGraph;
use crate::engine::job_runner::{JobRunner, Outputs};
use crate::engine::result::{JobResult, JobStatus, SkipReason};

/// Terminal state of every job once scheduling ends
#[derive(Debug, Clone)]
pub struct ScheduleOutcome {
    pub statuses: BTreeMap<String, JobStatus>,
    pub results: BTreeMap<String, JobResult>,
    pub cancelled: bool,
}

pub struct Scheduler {
    runner: Arc<JobRunner>,
    max_concurrent: usize,
}

impl Scheduler {
    pub fn new(runner: Arc<JobRunner>, max_concurrent: usize) -> Self {
        Self {
            runner,
            max_concurrent: max_concurrent.max(1),
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    #[instrument(skip_all, fields(workflow = %self.runner.graph().workflow_name()))]
    pub async fn run(&self, mut cancel: CancelSignal) -> ScheduleOutcome {
        let graph = self.runner.graph();
        let semaphore = Arc::new(Semaphore::new(self.max_concurrent));
        let order: Vec<String> = graph.execution_levels().iter().flatten().cloned().collect();

        let mut statuses: BTreeMap<String, JobStatus> = order
            .iter()
            .map(|id| (id.clone(), JobStatus::Pending))
            .collect();
        let mut results: BTreeMap<String, JobResult> = BTreeMap::new();
        let mut running: JoinSet<(String, JobResult)> = JoinSet::new();
        let mut cancelled = false;

        loop {
            if !cancelled && cancel.is_cancelled() {
                cancelled = true;
                cancel_pending(graph, &mut statuses, &mut results);
            }

            if !cancelled {
                resolve_skips(graph, &order, &mut statuses, &mut results);

                for id in &order {
                    if statuses.get(id) != Some(&JobStatus::Pending) || !ready(graph, id, &statuses)
                    {
                        continue;
                    }
                    let Ok(permit) = semaphore.clone().try_acquire_owned() else {
                        break;
                    };

                    let upstream = upstream_outputs(graph, id, &results);
                    let runner = self.runner.clone();
                    let signal = cancel.clone();
                    let job_id = id.clone();

                    info!(job = %id, "Dispatching job");
                    statuses.insert(id.clone(), JobStatus::Running);
                    running.spawn(async move {
                        let _permit = permit;
                        let outcome = AssertUnwindSafe(runner.run(&job_id, upstream, signal))
                            .catch_unwind()
                            .await;
                        let result = outcome.unwrap_or_else(|panic| {
                            let optional = runner
                                .graph()
                                .get_job(&job_id)
                                .is_some_and(|job| job.optional);
                            let mut result =
                                JobResult::unstarted(&job_id, optional, JobStatus::Failed);
                            result.error = Some(format!("job panicked: {}", panic_message(&*panic)));
                            result
                        });
                        (job_id, result)
                    });
                }
            }

            if running.is_empty() {
                break;
            }

            tokio::select! {
                joined = running.join_next() => match joined {
                    Some(Ok((id, result))) => {
                        info!(job = %id, status = %result.status, "Job finished");
                        statuses.insert(id.clone(), result.status);
                        results.insert(id, result);
                    }
                    Some(Err(e)) => error!(error = %e, "Job task failed to complete"),
                    None => {}
                },
                _ = cancel.cancelled(), if !cancelled => {
                    warn!("Cancellation requested, stopping dispatch");
                    cancelled = true;
                    cancel_pending(graph, &mut statuses, &mut results);
                }
            }
        }

        // Anything not terminal here lost its task
        for (id, status) in statuses.iter_mut() {
            if status.is_terminal() {
                continue;
            }
            let optional = graph.get_job(id).is_some_and(|job| job.optional);
            let final_status = if cancelled {
                JobStatus::Cancelled
            } else {
                JobStatus::Failed
            };
            let mut result = JobResult::unstarted(id, optional, final_status);
            if final_status == JobStatus::Failed {
                result.error = Some("job task ended without a result".to_string());
            }
            *status = final_status;
            results.insert(id.clone(), result);
        }

        ScheduleOutcome {
            statuses,
            results,
            cancelled,
        }
    }
}

fn ready(graph: &JobGraph, id: &str, statuses: &BTreeMap<String, JobStatus>) -> bool {
    graph.get_job(id).is_some_and(|job| {
        job.needs
            .iter()
            .all(|dep| statuses.get(dep) == Some(&JobStatus::Succeeded))
    })
}

/// Mark pending jobs whose dependencies can no longer all succeed.
///
/// `order` is topological, so one pass propagates skips transitively.
fn resolve_skips(
    graph: &JobGraph,
    order: &[String],
    statuses: &mut BTreeMap<String, JobStatus>,
    results: &mut BTreeMap<String, JobResult>,
) {
    for id in order {
        if statuses.get(id) != Some(&JobStatus::Pending) {
            continue;
        }
        let Some(job) = graph.get_job(id) else {
            continue;
        };

        let mut reason = None;
        for dep in &job.needs {
            let dep_reason = match statuses.get(dep) {
                Some(JobStatus::Failed) | Some(JobStatus::Cancelled) => {
                    Some(SkipReason::UpstreamFailed {
                        dependency: dep.clone(),
                    })
                }
                Some(JobStatus::Skipped) => {
                    let upstream_failed = results
                        .get(dep)
                        .and_then(|r| r.skip_reason.as_ref())
                        .map_or(true, SkipReason::is_upstream_failure);
                    Some(if upstream_failed {
                        SkipReason::UpstreamFailed {
                            dependency: dep.clone(),
                        }
                    } else {
                        SkipReason::NotApplicable {
                            detail: format!("dependency '{}' was skipped", dep),
                        }
                    })
                }
                _ => None,
            };

            match dep_reason {
                Some(r @ SkipReason::UpstreamFailed { .. }) => {
                    reason = Some(r);
                    break;
                }
                Some(r) if reason.is_none() => reason = Some(r),
                _ => {}
            }
        }

        if let Some(reason) = reason {
            info!(job = %id, reason = ?reason, "Skipping job");
            statuses.insert(id.clone(), JobStatus::Skipped);
            results.insert(id.clone(), JobResult::skipped(id, job.optional, reason));
        }
    }
}

fn cancel_pending(
    graph: &JobGraph,
    statuses: &mut BTreeMap<String, JobStatus>,
    results: &mut BTreeMap<String, JobResult>,
) {
    for (id, status) in statuses.iter_mut() {
        if *status == JobStatus::Pending {
            *status = JobStatus::Cancelled;
            let optional = graph.get_job(id).is_some_and(|job| job.optional);
            results.insert(
                id.clone(),
                JobResult::unstarted(id, optional, JobStatus::Cancelled),
            );
        }
    }
}

fn upstream_outputs(
    graph: &JobGraph,
    id: &str,
    results: &BTreeMap<String, JobResult>,
) -> BTreeMap<String, Outputs> {
    graph
        .get_job(id)
        .map(|job| {
            job.needs
                .iter()
                .filter_map(|dep| results.get(dep).map(|r| (dep.clone(), r.outputs.clone())))
                .collect()
        })
        .unwrap_or_default()
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
