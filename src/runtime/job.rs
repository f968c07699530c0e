use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::runtime::error::{EngineError, Result};
use crate::runtime::task::{NodeId, Task, TaskId, TaskStatus, compose_name};

pub type JobId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Pending,
    Running,
    /// Running job whose running-task count dropped to zero with work left.
    Stalled,
    Paused,
    Finished,
    Failed,
    Canceled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Finished | JobStatus::Failed | JobStatus::Canceled
        )
    }
}

/// A submitted unit of work: the task registry, its adjacency, and the
/// lifecycle counters.
///
/// Counter mutation is centralized in the `mark_*` / `register_*`
/// primitives so that `pending + running + finished == total` holds at
/// every point where the job lock is released.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub name: String,
    pub owner: String,
    pub priority: i32,
    pub status: JobStatus,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
    /// Job variables visible to flow-script evaluation.
    pub variables: HashMap<String, Value>,
    pub generic_info: HashMap<String, String>,

    tasks: HashMap<TaskId, Task>,
    name_index: HashMap<String, TaskId>,
    dependents: HashMap<TaskId, Vec<TaskId>>,
    next_task_id: TaskId,

    pending_tasks: usize,
    running_tasks: usize,
    finished_tasks: usize,
}

impl Job {
    pub fn new(name: impl Into<String>, owner: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            owner: owner.into(),
            priority: 0,
            status: JobStatus::Pending,
            submitted_at: Utc::now(),
            started_at: None,
            finished_at: None,
            failure_reason: None,
            variables: HashMap::new(),
            generic_info: HashMap::new(),
            tasks: HashMap::new(),
            name_index: HashMap::new(),
            dependents: HashMap::new(),
            next_task_id: 0,
            pending_tasks: 0,
            running_tasks: 0,
            finished_tasks: 0,
        }
    }

    pub fn alloc_task_id(&mut self) -> TaskId {
        let id = self.next_task_id;
        self.next_task_id += 1;
        id
    }

    pub fn pending_tasks(&self) -> usize {
        self.pending_tasks
    }

    pub fn running_tasks(&self) -> usize {
        self.running_tasks
    }

    pub fn finished_tasks(&self) -> usize {
        self.finished_tasks
    }

    pub fn total_tasks(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_complete(&self) -> bool {
        self.finished_tasks == self.total_tasks()
    }

    pub fn task(&self, id: TaskId) -> Result<&Task> {
        self.tasks.get(&id).ok_or(EngineError::TaskNotFound {
            job: self.id,
            task: id,
        })
    }

    pub fn task_mut(&mut self, id: TaskId) -> Result<&mut Task> {
        let job = self.id;
        self.tasks
            .get_mut(&id)
            .ok_or(EngineError::TaskNotFound { job, task: id })
    }

    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    pub fn task_by_name(&self, name: &str) -> Option<TaskId> {
        self.name_index.get(name).copied()
    }

    pub fn name_in_use(&self, name: &str) -> bool {
        self.name_index.contains_key(name)
    }

    /// Registers a task at submission time. Dependencies already present on
    /// the task are indexed.
    pub fn add_task(&mut self, task: Task) {
        self.pending_tasks += 1;
        self.insert_task(task);
    }

    fn insert_task(&mut self, task: Task) {
        self.name_index.insert(task.name(), task.id);
        for dep in &task.dependencies {
            self.dependents.entry(*dep).or_default().push(task.id);
        }
        self.dependents.entry(task.id).or_default();
        self.tasks.insert(task.id, task);
    }

    /// Adds a hard dependency edge `child -> parent`, keeping the reverse
    /// adjacency in sync.
    pub fn add_dependency(&mut self, child: TaskId, parent: TaskId) -> Result<()> {
        let task = self.task_mut(child)?;
        if !task.depends_directly_on(parent) {
            task.add_dependency(parent);
            let deps = self.dependents.entry(parent).or_default();
            if !deps.contains(&child) {
                deps.push(child);
            }
        }
        Ok(())
    }

    /// Removes a hard dependency edge, used when a loop re-points merge
    /// tasks at the new generation.
    pub fn remove_dependency(&mut self, child: TaskId, parent: TaskId) -> Result<()> {
        self.task_mut(child)?.dependencies.retain(|d| *d != parent);
        if let Some(deps) = self.dependents.get_mut(&parent) {
            deps.retain(|d| *d != child);
        }
        Ok(())
    }

    /// Tasks holding a direct hard dependency on `id`, in insertion order.
    pub fn direct_dependents(&self, id: TaskId) -> Vec<TaskId> {
        self.dependents.get(&id).cloned().unwrap_or_default()
    }

    /// Whether `descendant` reaches `ancestor` walking up hard and weak
    /// edges. A task depends on itself.
    pub fn depends_on(&self, descendant: TaskId, ancestor: TaskId) -> bool {
        let mut queue = VecDeque::from([descendant]);
        let mut seen = vec![descendant];
        while let Some(cur) = queue.pop_front() {
            if cur == ancestor {
                return true;
            }
            let Ok(task) = self.task(cur) else {
                continue;
            };
            for up in task
                .dependencies
                .iter()
                .chain(task.joined_branches.iter())
                .chain(task.if_branch.iter())
            {
                if !seen.contains(up) {
                    seen.push(*up);
                    queue.push_back(*up);
                }
            }
        }
        false
    }

    /// Walks up `from`'s dependencies (hard and weak) until a task whose
    /// display name equals `name` is met.
    pub fn find_task_up(&self, name: &str, from: TaskId) -> Option<TaskId> {
        let mut queue = VecDeque::from([from]);
        let mut seen = vec![from];
        while let Some(cur) = queue.pop_front() {
            let task = self.task(cur).ok()?;
            for up in task
                .dependencies
                .iter()
                .chain(task.joined_branches.iter())
                .chain(task.if_branch.iter())
            {
                let parent = self.task(*up).ok()?;
                if parent.name() == name {
                    return Some(*up);
                }
                if !seen.contains(up) {
                    seen.push(*up);
                    queue.push_back(*up);
                }
            }
        }
        None
    }

    /// Next free replication index within one (base name, iteration) group.
    /// Monotonic over the registry scan, so indices stay unique and
    /// contiguous from 0.
    pub fn next_replication_index(&self, base: &str, iteration: u32) -> u32 {
        let mut rep = 0;
        for task in self.tasks.values() {
            if task.base_name == base && task.iteration == iteration {
                rep = rep.max(task.replication + 1);
            }
        }
        rep
    }

    /// Registers a REPLICATE copy, allocating its replication index.
    pub fn register_replicated(&mut self, mut task: Task) -> TaskId {
        task.replication = self.next_replication_index(&task.base_name, task.iteration);
        let id = task.id;
        self.pending_tasks += 1;
        self.insert_task(task);
        id
    }

    /// Registers a LOOP copy, bumping its iteration index until the
    /// composed name is unused.
    pub fn register_iterated(&mut self, mut task: Task) -> TaskId {
        while self.name_in_use(&compose_name(
            &task.base_name,
            task.iteration,
            task.replication,
        )) {
            task.iteration += 1;
        }
        let id = task.id;
        self.pending_tasks += 1;
        self.insert_task(task);
        id
    }

    /// Marks a pending task skipped: zero duration, counters moved from
    /// pending to finished. Terminal tasks are left untouched.
    pub fn mark_skipped(&mut self, id: TaskId, at: DateTime<Utc>) -> Result<()> {
        let task = self.task_mut(id)?;
        if task.is_terminal() {
            return Ok(());
        }
        task.status = TaskStatus::Skipped;
        task.finished_at = Some(at);
        task.duration_ms = Some(0);
        self.pending_tasks -= 1;
        self.finished_tasks += 1;
        Ok(())
    }

    /// Binds nodes to a task: pending moves to running, the job starts on
    /// its first bound task.
    pub fn mark_submitted(&mut self, id: TaskId, nodes: Vec<NodeId>, at: DateTime<Utc>) -> Result<()> {
        let task = self.task_mut(id)?;
        if !matches!(task.status, TaskStatus::Pending) {
            return Err(EngineError::InvalidTransition {
                task: id,
                from: task.status,
                to: TaskStatus::Submitted,
            });
        }
        task.status = TaskStatus::Submitted;
        task.bound_nodes = nodes;
        task.started_at = Some(at);
        self.pending_tasks -= 1;
        self.running_tasks += 1;
        if matches!(self.status, JobStatus::Pending | JobStatus::Stalled) {
            if self.started_at.is_none() {
                self.started_at = Some(at);
            }
            self.status = JobStatus::Running;
        }
        Ok(())
    }

    /// Launcher confirmation: SUBMITTED becomes RUNNING.
    pub fn mark_running(&mut self, id: TaskId) -> Result<()> {
        let task = self.task_mut(id)?;
        if !matches!(task.status, TaskStatus::Submitted) {
            return Err(EngineError::InvalidTransition {
                task: id,
                from: task.status,
                to: TaskStatus::Running,
            });
        }
        task.status = TaskStatus::Running;
        Ok(())
    }

    /// Terminates a started task; running moves to finished and the job
    /// stalls when no running work remains.
    pub fn mark_finished(
        &mut self,
        id: TaskId,
        success: bool,
        duration_ms: i64,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let task = self.task_mut(id)?;
        if !matches!(task.status, TaskStatus::Submitted | TaskStatus::Running) {
            return Err(EngineError::InvalidTransition {
                task: id,
                from: task.status,
                to: TaskStatus::Finished,
            });
        }
        task.status = if success {
            TaskStatus::Finished
        } else {
            TaskStatus::Failed
        };
        task.finished_at = Some(at);
        task.duration_ms = Some(duration_ms);
        self.running_tasks -= 1;
        self.finished_tasks += 1;
        if self.running_tasks == 0
            && self.pending_tasks > 0
            && matches!(self.status, JobStatus::Running)
        {
            self.status = JobStatus::Stalled;
        }
        Ok(())
    }

    /// Pauses or resumes every pending task. Started and terminal tasks are
    /// not affected.
    pub fn set_paused(&mut self, paused: bool) {
        for task in self.tasks.values_mut() {
            match (paused, task.status) {
                (true, TaskStatus::Pending) => task.status = TaskStatus::Paused,
                (false, TaskStatus::Paused) => task.status = TaskStatus::Pending,
                _ => {}
            }
        }
        self.status = if paused {
            JobStatus::Paused
        } else if self.running_tasks > 0 {
            JobStatus::Running
        } else if self.pending_tasks > 0 && self.started_at.is_some() {
            JobStatus::Stalled
        } else if self.started_at.is_some() {
            JobStatus::Running
        } else {
            JobStatus::Pending
        };
    }

    /// Closes the job as failed or canceled: every non-terminal task is
    /// aborted and the counters are closed out so the sum invariant holds.
    /// Returns the node ids still bound to aborted tasks, for the caller
    /// to hand back to the resource manager.
    pub fn close_as(
        &mut self,
        status: JobStatus,
        reason: impl Into<String>,
        at: DateTime<Utc>,
    ) -> Vec<NodeId> {
        let mut released = Vec::new();
        for task in self.tasks.values_mut() {
            if !task.is_terminal() {
                task.status = TaskStatus::Aborted;
                task.finished_at = Some(at);
                if task.duration_ms.is_none() {
                    task.duration_ms = task
                        .started_at
                        .map(|s| (at - s).num_milliseconds());
                }
                released.append(&mut task.bound_nodes);
            }
        }
        self.pending_tasks = 0;
        self.running_tasks = 0;
        self.finished_tasks = self.total_tasks();
        self.status = status;
        self.finished_at = Some(at);
        self.failure_reason = Some(reason.into());
        released
    }
}
