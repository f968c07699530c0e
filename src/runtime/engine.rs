use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{error, info};

use crate::dsl::JobDef;
use crate::flow::evaluator::FlowEvaluator;
use crate::flow::{ifelse, looping, replicate};
use crate::runtime::action::FlowAction;
use crate::runtime::changes::ChangeSet;
use crate::runtime::error::{EngineError, Result};
use crate::runtime::job::{Job, JobId, JobStatus};
use crate::runtime::ports::{CronPredictor, EventKind, NotificationSink, Policy, ResourceManager};
use crate::runtime::task::{TaskId, TaskStatus};
use crate::runtime::view::JobView;
use crate::sched::cycle::{self, CycleReport};

/// One job's registry and live view, guarded together by a single lock so
/// a resolver call is one transaction.
pub struct JobEntry {
    pub job: Job,
    pub view: JobView,
}

pub type JobTable = DashMap<JobId, Arc<Mutex<JobEntry>>>;

/// External collaborators consumed by the engine.
pub struct Collaborators {
    pub policy: Arc<dyn Policy>,
    pub resources: Arc<dyn ResourceManager>,
    pub evaluator: Arc<dyn FlowEvaluator>,
    pub cron: Arc<dyn CronPredictor>,
    pub sink: Arc<dyn NotificationSink>,
}

/// Outcome reported when a started task terminates. Result variables are
/// merged into the job variables before the flow script is evaluated.
#[derive(Debug, Clone, Default)]
pub struct TaskOutcome {
    pub success: bool,
    pub duration_ms: i64,
    pub vars: HashMap<String, Value>,
}

impl TaskOutcome {
    pub fn success() -> Self {
        Self {
            success: true,
            ..Default::default()
        }
    }

    pub fn failure() -> Self {
        Self::default()
    }

    pub fn with_var(mut self, key: impl Into<String>, value: Value) -> Self {
        self.vars.insert(key.into(), value);
        self
    }
}

/// Dashboard snapshot of a job's counters.
#[derive(Debug, Clone)]
pub struct JobInfo {
    pub id: JobId,
    pub name: String,
    pub status: JobStatus,
    pub pending_tasks: usize,
    pub running_tasks: usize,
    pub finished_tasks: usize,
    pub total_tasks: usize,
    pub failure_reason: Option<String>,
}

/// Dashboard snapshot of one task.
#[derive(Debug, Clone)]
pub struct TaskSnapshot {
    pub id: TaskId,
    pub name: String,
    pub status: TaskStatus,
    pub iteration: u32,
    pub replication: u32,
    pub dependencies: Vec<TaskId>,
    pub provenance: Option<String>,
    pub scheduled_time: Option<DateTime<Utc>>,
}

/// The scheduler's runtime core: owns the per-job task graphs, resolves
/// flow actions on task termination, and drives the resource-matching
/// scheduling cycle.
///
/// Structural access to one job is serialized by its entry lock; jobs are
/// independent and mutate concurrently.
pub struct Engine {
    jobs: JobTable,
    policy: Arc<dyn Policy>,
    resources: Arc<dyn ResourceManager>,
    evaluator: Arc<dyn FlowEvaluator>,
    cron: Arc<dyn CronPredictor>,
    sink: Arc<dyn NotificationSink>,
}

impl Engine {
    pub fn new(collaborators: Collaborators) -> Self {
        Self {
            jobs: DashMap::new(),
            policy: collaborators.policy,
            resources: collaborators.resources,
            evaluator: collaborators.evaluator,
            cron: collaborators.cron,
            sink: collaborators.sink,
        }
    }

    /// Builds and registers a job from its definition.
    pub async fn submit(&self, def: JobDef) -> Result<JobId> {
        let (job, view) = crate::dsl::build(def)?;
        let id = job.id;
        info!(job = %id, name = %job.name, tasks = job.total_tasks(), "job submitted");
        self.jobs
            .insert(id, Arc::new(Mutex::new(JobEntry { job, view })));
        self.sink
            .publish(id, EventKind::JobSubmitted, &ChangeSet::new())
            .await;
        Ok(id)
    }

    fn entry(&self, id: JobId) -> Result<Arc<Mutex<JobEntry>>> {
        self.jobs
            .get(&id)
            .map(|e| e.value().clone())
            .ok_or(EngineError::JobNotFound(id))
    }

    /// Launcher confirmation that a bound task is executing.
    pub async fn on_task_started(&self, job_id: JobId, task_id: TaskId) -> Result<()> {
        let entry = self.entry(job_id)?;
        let mut guard = entry.lock().await;
        guard.job.mark_running(task_id)
    }

    /// Entry point for task termination: updates counters, evaluates the
    /// flow script and applies the resulting structural action as one
    /// transaction under the job lock.
    ///
    /// A resolver failure is fatal for this job only: the job is failed
    /// with a diagnostic reason and the error is returned.
    pub async fn on_task_terminated(
        &self,
        job_id: JobId,
        task_id: TaskId,
        outcome: TaskOutcome,
    ) -> Result<()> {
        let entry = self.entry(job_id)?;
        let result = {
            let mut guard = entry.lock().await;
            self.terminate_in(&mut guard, job_id, task_id, outcome).await
        };
        match result {
            Ok(released) => {
                // the worker's nodes go back to the pool, outside the lock
                if !released.is_empty() {
                    self.resources.release_nodes(released).await;
                }
                Ok(())
            }
            Err(e) => {
                if is_flow_fatal(&e) {
                    error!(job = %job_id, task = task_id, error = %e, "flow resolution failed");
                    self.fail_job(job_id, e.to_string()).await?;
                }
                Err(e)
            }
        }
    }

    async fn terminate_in(
        &self,
        entry: &mut JobEntry,
        job_id: JobId,
        task_id: TaskId,
        outcome: TaskOutcome,
    ) -> Result<Vec<crate::runtime::task::NodeId>> {
        let JobEntry { job, view } = entry;
        let now = Utc::now();
        job.mark_finished(task_id, outcome.success, outcome.duration_ms, now)?;
        let released = std::mem::take(&mut job.task_mut(task_id)?.bound_nodes);
        for (key, value) in outcome.vars {
            job.variables.insert(key, value);
        }

        let mut changes = ChangeSet::new();
        changes.task_updated(task_id);

        // a failed task carries no flow action and releases no dependents;
        // the orchestrator decides what to do with the stalled job
        if !outcome.success {
            return Ok(released);
        }

        let action = self.evaluator.evaluate(job.task(task_id)?, &job.variables)?;
        match &action {
            FlowAction::Continue => {
                view.terminate(job, task_id);
            }
            FlowAction::If {
                target,
                target_else,
                continuation,
            } => {
                ifelse::apply(
                    job,
                    view,
                    task_id,
                    target,
                    target_else,
                    continuation.as_deref(),
                    &mut changes,
                )?;
                self.sink
                    .publish(job_id, EventKind::TaskSkipped, &changes)
                    .await;
                // only now may the initiator's successors be scheduled
                view.terminate(job, task_id);
            }
            FlowAction::Replicate { count } => {
                replicate::apply(job, view, task_id, *count, &mut changes)?;
                let event = if *count < 1 {
                    EventKind::TaskSkipped
                } else {
                    EventKind::TaskReplicated
                };
                self.sink.publish(job_id, event, &changes).await;
                view.terminate(job, task_id);
            }
            FlowAction::Loop { target, cron } => {
                looping::apply(
                    job,
                    view,
                    task_id,
                    target,
                    cron.as_deref(),
                    &*self.cron,
                    &mut changes,
                )?;
                self.sink
                    .publish(job_id, EventKind::TaskReplicated, &changes)
                    .await;
            }
        }

        if job.is_complete() && !job.status.is_terminal() {
            job.status = JobStatus::Finished;
            job.finished_at = Some(now);
            info!(job = %job_id, "job finished");
            self.sink
                .publish(job_id, EventKind::JobFinished, &ChangeSet::new())
                .await;
        }
        Ok(released)
    }

    /// One scheduling cycle: candidate build, compatible batching, node
    /// acquisition and binding. Jobs whose selection constraints failed to
    /// evaluate are failed here, as the loop itself performs no retry.
    pub async fn run_scheduling_cycle(&self) -> CycleReport {
        let report = cycle::run_cycle(
            &self.jobs,
            &*self.policy,
            &*self.resources,
            &*self.sink,
        )
        .await;
        for failure in &report.constraint_failures {
            let _ = self.fail_job(failure.job_id, failure.reason.clone()).await;
        }
        report
    }

    /// Fails a job: every non-terminal task is aborted, counters are
    /// closed out, and the diagnostic reason is recorded.
    pub async fn fail_job(&self, job_id: JobId, reason: impl Into<String>) -> Result<()> {
        self.close_job(job_id, JobStatus::Failed, reason.into(), EventKind::JobFailed)
            .await
    }

    /// External cancellation, observed by the next scheduling cycle.
    pub async fn kill_job(&self, job_id: JobId, reason: impl Into<String>) -> Result<()> {
        self.close_job(job_id, JobStatus::Canceled, reason.into(), EventKind::JobCanceled)
            .await
    }

    async fn close_job(
        &self,
        job_id: JobId,
        status: JobStatus,
        reason: String,
        event: EventKind,
    ) -> Result<()> {
        let entry = self.entry(job_id)?;
        let released = {
            let mut guard = entry.lock().await;
            if guard.job.status.is_terminal() {
                return Ok(());
            }
            info!(job = %job_id, ?status, reason = %reason, "closing job");
            let released = guard.job.close_as(status, reason, Utc::now());
            self.sink.publish(job_id, event, &ChangeSet::new()).await;
            released
        };
        if !released.is_empty() {
            self.resources.release_nodes(released).await;
        }
        Ok(())
    }

    pub async fn pause_job(&self, job_id: JobId) -> Result<()> {
        let entry = self.entry(job_id)?;
        let mut guard = entry.lock().await;
        let JobEntry { job, view } = &mut *guard;
        job.set_paused(true);
        view.pause();
        self.sink
            .publish(job_id, EventKind::JobPaused, &ChangeSet::new())
            .await;
        Ok(())
    }

    pub async fn resume_job(&self, job_id: JobId) -> Result<()> {
        let entry = self.entry(job_id)?;
        let mut guard = entry.lock().await;
        let JobEntry { job, view } = &mut *guard;
        job.set_paused(false);
        view.resume();
        self.sink
            .publish(job_id, EventKind::JobResumed, &ChangeSet::new())
            .await;
        Ok(())
    }

    /// Makes a variable visible to subsequent flow-script evaluations.
    pub async fn set_job_variable(
        &self,
        job_id: JobId,
        key: impl Into<String>,
        value: Value,
    ) -> Result<()> {
        let entry = self.entry(job_id)?;
        entry.lock().await.job.variables.insert(key.into(), value);
        Ok(())
    }

    pub async fn job_info(&self, job_id: JobId) -> Result<JobInfo> {
        let entry = self.entry(job_id)?;
        let guard = entry.lock().await;
        let job = &guard.job;
        Ok(JobInfo {
            id: job.id,
            name: job.name.clone(),
            status: job.status,
            pending_tasks: job.pending_tasks(),
            running_tasks: job.running_tasks(),
            finished_tasks: job.finished_tasks(),
            total_tasks: job.total_tasks(),
            failure_reason: job.failure_reason.clone(),
        })
    }

    /// Snapshot of every task, sorted by identity.
    pub async fn task_snapshots(&self, job_id: JobId) -> Result<Vec<TaskSnapshot>> {
        let entry = self.entry(job_id)?;
        let guard = entry.lock().await;
        let mut tasks: Vec<TaskSnapshot> = guard
            .job
            .tasks()
            .map(|t| TaskSnapshot {
                id: t.id,
                name: t.name(),
                status: t.status,
                iteration: t.iteration,
                replication: t.replication,
                dependencies: t.dependencies.clone(),
                provenance: t.provenance.clone(),
                scheduled_time: t.scheduled_time,
            })
            .collect();
        tasks.sort_by_key(|t| t.id);
        Ok(tasks)
    }
}

/// Whether an error is an internal invariant violation that must fail the
/// affected job rather than be silently ignored.
fn is_flow_fatal(err: &EngineError) -> bool {
    matches!(
        err,
        EngineError::TargetNotFound { .. }
            | EngineError::FlowEvaluation { .. }
            | EngineError::CronInvalid { .. }
    )
}
