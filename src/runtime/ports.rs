use std::collections::{BTreeSet, HashSet, VecDeque};
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cron::Schedule;
use serde::Serialize;
use tokio::sync::{Mutex, mpsc};

use crate::runtime::changes::ChangeSet;
use crate::runtime::error::{EngineError, Result};
use crate::runtime::job::JobId;
use crate::runtime::task::{NodeId, TaskId};

// --- Scheduling descriptors ---

/// Two tasks may be requested from the resource manager in one batch if
/// and only if their signatures are equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CompatSignature {
    /// Sorted selection constraints a node must satisfy.
    pub constraints: Vec<String>,
    pub exclusion: BTreeSet<NodeId>,
}

/// A ready task as seen by the ordering policy and the batching step.
#[derive(Debug, Clone)]
pub struct ReadyTask {
    pub job_id: JobId,
    pub task_id: TaskId,
    pub nodes_needed: usize,
    pub signature: CompatSignature,
}

/// One job's contribution to the candidate list.
#[derive(Debug, Clone)]
pub struct JobCandidates {
    pub job_id: JobId,
    pub priority: i32,
    pub submitted_at: DateTime<Utc>,
    pub ready: Vec<ReadyTask>,
}

// --- Interfaces ---

/// Pluggable global task ordering.
pub trait Policy: Send + Sync {
    fn order_tasks(&self, jobs: &[JobCandidates]) -> VecDeque<ReadyTask>;
}

/// Node-acquisition backend. Acquisition may block on a network round-trip
/// and must therefore never be called under a job lock.
#[async_trait]
pub trait ResourceManager: Send + Sync {
    async fn free_node_count(&self) -> usize;
    /// Returns at most `count` nodes matching the signature. A constraint
    /// evaluation error is surfaced to the caller; the scheduling loop
    /// performs no retry.
    async fn acquire_nodes(&self, count: usize, signature: &CompatSignature) -> Result<Vec<Node>>;
    /// Hands acquired nodes back, by identity. Unknown ids are ignored.
    async fn release_nodes(&self, nodes: Vec<NodeId>);
}

/// Predicts the next fire time of a cron expression.
pub trait CronPredictor: Send + Sync {
    fn next_fire_time(&self, expr: &str) -> Result<DateTime<Utc>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EventKind {
    JobSubmitted,
    TaskStarted,
    TaskSkipped,
    TaskReplicated,
    JobFinished,
    JobFailed,
    JobCanceled,
    JobPaused,
    JobResumed,
}

/// Fire-and-forget event publication; the engine never awaits an
/// acknowledgement and a sink failure never fails the engine.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn publish(&self, job: JobId, event: EventKind, changes: &ChangeSet);
}

// --- In-memory implementations ---

/// Orders by job priority (highest first), then submission time, then task
/// id.
#[derive(Debug, Default)]
pub struct FifoPolicy;

impl Policy for FifoPolicy {
    fn order_tasks(&self, jobs: &[JobCandidates]) -> VecDeque<ReadyTask> {
        let mut sorted: Vec<&JobCandidates> = jobs.iter().collect();
        sorted.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.submitted_at.cmp(&b.submitted_at))
        });
        let mut queue = VecDeque::new();
        for job in sorted {
            let mut ready = job.ready.clone();
            ready.sort_by_key(|t| t.task_id);
            queue.extend(ready);
        }
        queue
    }
}

/// A compute node as handed out by the resource manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub id: NodeId,
    pub tags: BTreeSet<String>,
}

impl Node {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tags: BTreeSet::new(),
        }
    }

    pub fn with_tags<I: IntoIterator<Item = S>, S: Into<String>>(mut self, tags: I) -> Self {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }
}

/// In-memory node pool: selection constraints match node tags, excluded
/// nodes are never handed out. Constraints registered as poisoned raise a
/// constraint-evaluation error, standing in for a broken selection script.
pub struct InMemoryNodePool {
    state: Mutex<PoolState>,
    poisoned: HashSet<String>,
}

struct PoolState {
    free: Vec<Node>,
    busy: Vec<Node>,
}

impl InMemoryNodePool {
    /// `count` untagged, interchangeable nodes.
    pub fn new(count: usize) -> Self {
        Self::with_nodes((0..count).map(|i| Node::new(format!("node-{i}"))))
    }

    pub fn with_nodes(nodes: impl IntoIterator<Item = Node>) -> Self {
        Self {
            state: Mutex::new(PoolState {
                free: nodes.into_iter().collect(),
                busy: Vec::new(),
            }),
            poisoned: HashSet::new(),
        }
    }

    pub fn poison_constraint(mut self, constraint: impl Into<String>) -> Self {
        self.poisoned.insert(constraint.into());
        self
    }
}

#[async_trait]
impl ResourceManager for InMemoryNodePool {
    async fn free_node_count(&self) -> usize {
        self.state.lock().await.free.len()
    }

    async fn acquire_nodes(&self, count: usize, signature: &CompatSignature) -> Result<Vec<Node>> {
        for constraint in &signature.constraints {
            if self.poisoned.contains(constraint) {
                return Err(EngineError::ConstraintEvaluation(format!(
                    "selection constraint '{constraint}' failed to evaluate"
                )));
            }
        }
        let mut state = self.state.lock().await;
        let mut taken = Vec::new();
        let mut index = 0;
        while index < state.free.len() && taken.len() < count {
            let node = &state.free[index];
            let matches = !signature.exclusion.contains(&node.id)
                && signature.constraints.iter().all(|c| node.tags.contains(c));
            if matches {
                let node = state.free.remove(index);
                state.busy.push(node.clone());
                taken.push(node);
            } else {
                index += 1;
            }
        }
        Ok(taken)
    }

    async fn release_nodes(&self, nodes: Vec<NodeId>) {
        let mut state = self.state.lock().await;
        for id in nodes {
            if let Some(pos) = state.busy.iter().position(|n| n.id == id) {
                let node = state.busy.remove(pos);
                state.free.push(node);
            }
        }
    }
}

/// Cron prediction backed by the `cron` crate. Five-field expressions are
/// normalized to the crate's six-field form by prepending a seconds field.
#[derive(Debug, Default)]
pub struct ScheduleCronPredictor;

impl CronPredictor for ScheduleCronPredictor {
    fn next_fire_time(&self, expr: &str) -> Result<DateTime<Utc>> {
        let normalized = normalize_cron(expr);
        let schedule = Schedule::from_str(&normalized).map_err(|e| EngineError::CronInvalid {
            expr: expr.to_string(),
            reason: e.to_string(),
        })?;
        schedule
            .upcoming(Utc)
            .next()
            .ok_or_else(|| EngineError::CronInvalid {
                expr: expr.to_string(),
                reason: "no upcoming fire time".to_string(),
            })
    }
}

/// Prepends a seconds field to standard 5-field cron expressions.
pub fn normalize_cron(expr: &str) -> String {
    if expr.split_whitespace().count() == 5 {
        format!("0 {expr}")
    } else {
        expr.to_string()
    }
}

/// One published event, as delivered by [`ChannelNotificationSink`].
#[derive(Debug, Clone)]
pub struct Notification {
    pub job: JobId,
    pub event: EventKind,
    pub changes: ChangeSet,
}

/// Delivers events over an unbounded channel; the test-side counterpart of
/// the Redis sink.
pub struct ChannelNotificationSink {
    tx: mpsc::UnboundedSender<Notification>,
}

impl ChannelNotificationSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl NotificationSink for ChannelNotificationSink {
    async fn publish(&self, job: JobId, event: EventKind, changes: &ChangeSet) {
        let _ = self.tx.send(Notification {
            job,
            event,
            changes: changes.clone(),
        });
    }
}

/// Discards every event.
#[derive(Debug, Default)]
pub struct NullNotificationSink;

#[async_trait]
impl NotificationSink for NullNotificationSink {
    async fn publish(&self, _job: JobId, _event: EventKind, _changes: &ChangeSet) {}
}
