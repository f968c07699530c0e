use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::runtime::action::FlowSpec;

/// Task identity, unique within one job and stable across replication.
pub type TaskId = u64;

/// Identity of a compute node bound to a task.
pub type NodeId = String;

/// Separator between a base name and the loop iteration index.
pub const ITERATION_SEPARATOR: char = '#';
/// Separator between a (possibly iterated) name and the replication index.
pub const REPLICATION_SEPARATOR: char = '*';

/// Generic-information key carrying the cron-predicted start time of a
/// loop generation.
pub const START_AT_KEY: &str = "START_AT";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    Pending,
    Submitted,
    Running,
    Paused,
    Finished,
    Skipped,
    Failed,
    Aborted,
}

impl TaskStatus {
    /// Terminal statuses are absorbing: no transition ever leaves them.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Finished | TaskStatus::Skipped | TaskStatus::Failed | TaskStatus::Aborted
        )
    }
}

/// Role of a task in a flow block. A contiguous run of tasks bounded by a
/// Start/End pair is treated atomically by replication and skipping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowBlock {
    #[default]
    None,
    Start,
    End,
}

/// A node of the job's task graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    /// Name without iteration/replication suffixes.
    pub base_name: String,
    /// Loop generation this task belongs to, 0-based.
    pub iteration: u32,
    /// Parallel copy this task is, 0-based.
    pub replication: u32,
    pub status: TaskStatus,

    /// Ordered hard dependencies (predecessor task ids).
    pub dependencies: Vec<TaskId>,
    /// Weak edge: the IF task controlling this branch head, recorded at
    /// submission and checked by exact target resolution.
    pub if_branch: Option<TaskId>,
    /// Weak edges: branch heads joined by this continuation task.
    pub joined_branches: Vec<TaskId>,

    pub flow_block: FlowBlock,
    /// Base name of the matching BLOCK_END task, set when `flow_block` is
    /// `Start`.
    pub matching_block: Option<String>,

    /// Flow-script configuration evaluated when this task terminates.
    pub flow: Option<FlowSpec>,
    /// Why/when this task was duplicated, if it was.
    pub provenance: Option<String>,

    pub nodes_needed: usize,
    /// Selection constraints a node must satisfy, kept sorted so equal
    /// constraint sets compare equal.
    pub constraints: Vec<String>,
    pub node_exclusion: BTreeSet<NodeId>,
    pub bound_nodes: Vec<NodeId>,

    pub generic_info: HashMap<String, String>,
    /// Earliest eligible time; gates cron-delayed loop generations.
    pub scheduled_time: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
}

impl Task {
    pub fn new(id: TaskId, base_name: impl Into<String>) -> Self {
        Self {
            id,
            base_name: base_name.into(),
            iteration: 0,
            replication: 0,
            status: TaskStatus::Pending,
            dependencies: Vec::new(),
            if_branch: None,
            joined_branches: Vec::new(),
            flow_block: FlowBlock::None,
            matching_block: None,
            flow: None,
            provenance: None,
            nodes_needed: 1,
            constraints: Vec::new(),
            node_exclusion: BTreeSet::new(),
            bound_nodes: Vec::new(),
            generic_info: HashMap::new(),
            scheduled_time: None,
            started_at: None,
            finished_at: None,
            duration_ms: None,
        }
    }

    /// Display name: `base [#iteration] [*replication]`, indices rendered
    /// only when non-zero.
    pub fn name(&self) -> String {
        compose_name(&self.base_name, self.iteration, self.replication)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn depends_directly_on(&self, parent: TaskId) -> bool {
        self.dependencies.contains(&parent)
    }

    pub fn add_dependency(&mut self, parent: TaskId) {
        if !self.dependencies.contains(&parent) {
            self.dependencies.push(parent);
        }
    }

    /// Fresh pending copy of this task under a new identity. Runtime state
    /// (status, bound nodes, times) is reset; structural wiring is left to
    /// the caller.
    pub fn replicated(&self, new_id: TaskId) -> Task {
        let mut copy = self.clone();
        copy.id = new_id;
        copy.status = TaskStatus::Pending;
        copy.dependencies = Vec::new();
        copy.if_branch = None;
        copy.joined_branches = Vec::new();
        copy.bound_nodes = Vec::new();
        copy.provenance = None;
        copy.scheduled_time = None;
        copy.started_at = None;
        copy.finished_at = None;
        copy.duration_ms = None;
        copy
    }
}

pub fn compose_name(base: &str, iteration: u32, replication: u32) -> String {
    let mut name = base.to_string();
    if iteration > 0 {
        name.push(ITERATION_SEPARATOR);
        name.push_str(&iteration.to_string());
    }
    if replication > 0 {
        name.push(REPLICATION_SEPARATOR);
        name.push_str(&replication.to_string());
    }
    name
}

/// Strips iteration and replication suffixes from a display name.
pub fn initial_name(full: &str) -> &str {
    let end = full
        .find(ITERATION_SEPARATOR)
        .or_else(|| full.find(REPLICATION_SEPARATOR))
        .unwrap_or(full.len());
    &full[..end]
}
