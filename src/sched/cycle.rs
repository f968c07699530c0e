use std::collections::VecDeque;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::runtime::changes::ChangeSet;
use crate::runtime::engine::{JobEntry, JobTable};
use crate::runtime::error::EngineError;
use crate::runtime::job::{JobId, JobStatus};
use crate::runtime::ports::{
    CompatSignature, EventKind, JobCandidates, Node, NotificationSink, Policy, ReadyTask,
    ResourceManager,
};
use crate::runtime::task::{TaskId, TaskStatus};

/// What one scheduling cycle did. Returned even when nothing was started,
/// so the owning orchestrator can decide to sleep or poll.
#[derive(Debug, Default)]
pub struct CycleReport {
    pub started: Vec<(JobId, TaskId)>,
    pub constraint_failures: Vec<ConstraintFailure>,
}

/// A selection-constraint evaluation error hit during node acquisition.
/// The loop performs no retry; the orchestrator fails the affected jobs.
#[derive(Debug)]
pub struct ConstraintFailure {
    pub job_id: JobId,
    pub tasks: Vec<TaskId>,
    pub reason: String,
}

/// A maximal run of queue-compatible tasks that fits the free-resource
/// budget.
struct Batch {
    tasks: Vec<ReadyTask>,
    needed: usize,
    signature: CompatSignature,
}

/// One scheduling cycle over every running or pending job.
///
/// Lock discipline: per-job locks are taken briefly to snapshot candidates
/// and again per bind; node acquisition happens with no job lock held.
pub async fn run_cycle(
    jobs: &JobTable,
    policy: &dyn Policy,
    resources: &dyn ResourceManager,
    sink: &dyn NotificationSink,
) -> CycleReport {
    let mut report = CycleReport::default();

    let candidates = snapshot_candidates(jobs).await;
    if candidates.is_empty() {
        return report;
    }
    let mut queue = policy.order_tasks(&candidates);
    debug!(eligible = queue.len(), "candidate queue built");

    while !queue.is_empty() {
        let free = resources.free_node_count().await;
        // no free resources is not an error: exit and let the caller retry
        if free == 0 {
            break;
        }
        let Some(batch) = next_compatible_batch(&mut queue, free) else {
            break;
        };
        debug!(tasks = batch.tasks.len(), nodes = batch.needed, "batch assembled");

        match resources.acquire_nodes(batch.needed, &batch.signature).await {
            Ok(nodes) => {
                bind_batch(jobs, batch, nodes, resources, sink, &mut report).await;
            }
            Err(EngineError::ConstraintEvaluation(reason)) => {
                warn!(reason = %reason, "node acquisition rejected the batch");
                let mut by_job: Vec<ConstraintFailure> = Vec::new();
                for task in &batch.tasks {
                    match by_job.iter_mut().find(|f| f.job_id == task.job_id) {
                        Some(f) => f.tasks.push(task.task_id),
                        None => by_job.push(ConstraintFailure {
                            job_id: task.job_id,
                            tasks: vec![task.task_id],
                            reason: reason.clone(),
                        }),
                    }
                }
                report.constraint_failures.extend(by_job);
            }
            Err(e) => {
                warn!(error = %e, "node acquisition failed");
                break;
            }
        }
    }
    report
}

/// Collects, under brief per-job locks, the ready tasks of every
/// schedulable job. Cron-gated tasks stay out of the list until their
/// scheduled time has passed.
async fn snapshot_candidates(jobs: &JobTable) -> Vec<JobCandidates> {
    let now = Utc::now();
    let entries: Vec<Arc<Mutex<JobEntry>>> = jobs.iter().map(|e| e.value().clone()).collect();
    let mut candidates = Vec::new();
    for entry in entries {
        let guard = entry.lock().await;
        let JobEntry { job, view } = &*guard;
        if !matches!(
            job.status,
            JobStatus::Pending | JobStatus::Running | JobStatus::Stalled
        ) {
            continue;
        }
        let mut ready = Vec::new();
        for id in view.eligible() {
            let Ok(task) = job.task(id) else { continue };
            if task.status != TaskStatus::Pending {
                continue;
            }
            if task.scheduled_time.is_some_and(|at| at > now) {
                continue;
            }
            ready.push(ReadyTask {
                job_id: job.id,
                task_id: id,
                nodes_needed: task.nodes_needed,
                signature: CompatSignature {
                    constraints: task.constraints.clone(),
                    exclusion: task.node_exclusion.clone(),
                },
            });
        }
        if !ready.is_empty() {
            candidates.push(JobCandidates {
                job_id: job.id,
                priority: job.priority,
                submitted_at: job.submitted_at,
                ready,
            });
        }
    }
    candidates
}

/// Pops the longest prefix of tasks sharing the head's compatibility
/// signature that fits the budget. Batching stops, pushing the offender
/// back to the front, on the first signature mismatch or the first task
/// whose requirement exceeds the remaining budget: an oversized multi-node
/// task is retried whole in a later cycle instead of being starved by
/// smaller tasks overtaking it.
fn next_compatible_batch(queue: &mut VecDeque<ReadyTask>, budget: usize) -> Option<Batch> {
    let head = queue.pop_front()?;
    if head.nodes_needed > budget {
        queue.push_front(head);
        return None;
    }
    let signature = head.signature.clone();
    let mut needed = head.nodes_needed;
    let mut remaining = budget - head.nodes_needed;
    let mut tasks = vec![head];

    while let Some(next) = queue.pop_front() {
        if next.signature != signature || next.nodes_needed > remaining {
            queue.push_front(next);
            break;
        }
        needed += next.nodes_needed;
        remaining -= next.nodes_needed;
        tasks.push(next);
    }
    Some(Batch {
        tasks,
        needed,
        signature,
    })
}

/// Consumes acquired nodes in batch order, binding each task whose
/// requirement still fits the unconsumed remainder. Nodes left over after
/// the batch, including after a partial failure, go straight back to the
/// resource manager.
async fn bind_batch(
    jobs: &JobTable,
    batch: Batch,
    nodes: Vec<Node>,
    resources: &dyn ResourceManager,
    sink: &dyn NotificationSink,
    report: &mut CycleReport,
) {
    let mut pool: VecDeque<Node> = nodes.into();
    let now = Utc::now();

    for task in batch.tasks {
        if pool.len() < task.nodes_needed {
            continue;
        }
        let Some(entry) = jobs.get(&task.job_id).map(|e| e.value().clone()) else {
            continue;
        };
        let taken: Vec<Node> = pool.drain(..task.nodes_needed).collect();

        let mut guard = entry.lock().await;
        let JobEntry { job, view } = &mut *guard;
        if !view.is_eligible(task.task_id) || job.status.is_terminal() {
            // the job moved under us; the nodes go back into the pool
            pool.extend(taken);
            continue;
        }
        let node_ids = taken.iter().map(|n| n.id.clone()).collect();
        match job.mark_submitted(task.task_id, node_ids, now) {
            Ok(()) => {
                view.start(task.task_id);
                report.started.push((task.job_id, task.task_id));
                let mut changes = ChangeSet::new();
                changes.task_updated(task.task_id);
                sink.publish(job.id, EventKind::TaskStarted, &changes).await;
            }
            Err(e) => {
                warn!(job = %task.job_id, task = task.task_id, error = %e, "bind failed");
                pool.extend(taken);
            }
        }
    }

    if !pool.is_empty() {
        let leftover = pool.into_iter().map(|n| n.id).collect();
        resources.release_nodes(leftover).await;
    }
}
