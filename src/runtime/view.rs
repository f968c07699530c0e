use std::collections::{HashMap, HashSet};

use crate::runtime::action::FlowKind;
use crate::runtime::job::{Job, JobStatus};
use crate::runtime::task::{TaskId, TaskStatus};

/// Scheduler-facing live view of one job's task graph.
///
/// Tracks which tasks are eligible, running or paused, plus the adjacency
/// and unfinished-parent counters that drive readiness. Every structural
/// mutation performed by a flow resolver must be mirrored here through
/// `apply_if` / `apply_replicate` / `apply_loop` / `terminate` to keep the
/// view consistent with the task registry.
#[derive(Debug, Clone, Default)]
pub struct JobView {
    eligible: HashSet<TaskId>,
    running: HashSet<TaskId>,
    paused: HashSet<TaskId>,
    /// IF action targets held back until a resolution plugs their branch.
    branch: HashSet<TaskId>,
    parents: HashMap<TaskId, Vec<TaskId>>,
    children: HashMap<TaskId, Vec<TaskId>>,
    /// Count of not-yet-terminated hard parents per task.
    waiting: HashMap<TaskId, usize>,
    /// Tasks already released through `terminate`, so a cascade reachable
    /// via two parents never runs twice.
    retired: HashSet<TaskId>,
}

impl JobView {
    /// Builds the view from a freshly submitted job. Entry points are the
    /// tasks with no hard dependencies that are not named as an IF action
    /// target by some other task.
    pub fn new(job: &Job) -> Self {
        let mut non_eligible: HashSet<String> = HashSet::new();
        for task in job.tasks() {
            if let Some(flow) = &task.flow {
                if flow.kind == FlowKind::If {
                    for target in [&flow.target, &flow.target_else, &flow.continuation]
                        .into_iter()
                        .flatten()
                    {
                        if *target != task.name() {
                            non_eligible.insert(target.clone());
                        }
                    }
                }
            }
        }

        let mut view = JobView::default();
        for task in job.tasks() {
            view.parents.insert(task.id, task.dependencies.clone());
            view.waiting.insert(task.id, task.dependencies.len());
            view.children.entry(task.id).or_default();
            for dep in &task.dependencies {
                view.children.entry(*dep).or_default().push(task.id);
            }
            if task.if_branch.is_some() || !task.joined_branches.is_empty() {
                view.branch.insert(task.id);
            } else if task.dependencies.is_empty() && !non_eligible.contains(&task.name()) {
                view.eligible.insert(task.id);
            }
        }
        view
    }

    /// Eligible task ids, sorted for deterministic candidate ordering.
    pub fn eligible(&self) -> Vec<TaskId> {
        let mut ids: Vec<TaskId> = self.eligible.iter().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn running(&self) -> Vec<TaskId> {
        let mut ids: Vec<TaskId> = self.running.iter().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn paused(&self) -> Vec<TaskId> {
        let mut ids: Vec<TaskId> = self.paused.iter().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn is_eligible(&self, id: TaskId) -> bool {
        self.eligible.contains(&id)
    }

    /// Moves a task from eligible to running when it is bound to nodes.
    pub fn start(&mut self, id: TaskId) {
        if self.eligible.remove(&id) {
            self.running.insert(id);
        }
    }

    fn add_edge(&mut self, parent: TaskId, child: TaskId) {
        self.children.entry(parent).or_default().push(child);
        self.parents.entry(child).or_default().push(parent);
        *self.waiting.entry(child).or_default() += 1;
    }

    fn add_node(&mut self, id: TaskId, parents: Vec<TaskId>) {
        self.waiting.insert(id, parents.len());
        for parent in &parents {
            self.children.entry(*parent).or_default().push(id);
        }
        self.children.entry(id).or_default();
        self.parents.insert(id, parents);
    }

    /// Removes tasks from every candidate set. Used for skipped tasks,
    /// which stay in the adjacency for the terminate cascade but must never
    /// be offered to the scheduler.
    pub fn skip(&mut self, ids: &[TaskId]) {
        for id in ids {
            self.eligible.remove(id);
            self.paused.remove(id);
            self.branch.remove(id);
            self.waiting.insert(*id, 0);
        }
    }

    /// Releases a terminated task's children. A child whose unfinished
    /// parents drop to zero becomes eligible, or paused when the job is
    /// paused; a child already marked SKIPPED is cascaded through so merge
    /// points past a skipped block are still released.
    pub fn terminate(&mut self, job: &Job, id: TaskId) {
        if !self.retired.insert(id) {
            return;
        }
        self.running.remove(&id);
        self.eligible.remove(&id);
        self.paused.remove(&id);

        let children = self.children.get(&id).cloned().unwrap_or_default();
        for child in children {
            let count = self.waiting.entry(child).or_default();
            *count = count.saturating_sub(1);
            if *count > 0 {
                continue;
            }
            let skipped = job
                .task(child)
                .map(|t| t.status == TaskStatus::Skipped)
                .unwrap_or(false);
            if skipped {
                self.terminate(job, child);
            } else if job.status == JobStatus::Paused {
                self.paused.insert(child);
            } else {
                self.eligible.insert(child);
            }
        }
    }

    /// Mirrors an IF resolution: plugs the selected branch behind the
    /// initiator, wires the join behind the branch end, and neutralizes the
    /// unselected branch.
    pub fn apply_if(
        &mut self,
        initiator: TaskId,
        branch_start: TaskId,
        branch_end: TaskId,
        join: Option<TaskId>,
        else_target: TaskId,
        else_tasks: &[TaskId],
    ) {
        self.branch.remove(&branch_start);
        self.add_edge(initiator, branch_start);
        if let Some(join) = join {
            self.branch.remove(&join);
            self.add_edge(branch_end, join);
        }
        let mut dead: Vec<TaskId> = else_tasks.to_vec();
        if !dead.contains(&else_target) {
            dead.push(else_target);
        }
        self.skip(&dead);
    }

    /// Mirrors a REPLICATE subgraph addition. `new_ids` are the registered
    /// copies; their dependency edges are read back from the registry,
    /// which the resolver has already wired. Copies carrying weak edges go
    /// to the branch holding set like their originals.
    pub fn apply_replicate(&mut self, job: &Job, new_ids: &[TaskId]) {
        for new in new_ids {
            let Ok(task) = job.task(*new) else { continue };
            self.add_node(*new, task.dependencies.clone());
            if task.if_branch.is_some() || !task.joined_branches.is_empty() {
                self.branch.insert(*new);
            }
        }
        // fan the merge points out onto the copies
        for new in new_ids {
            for child in job.direct_dependents(*new) {
                if !new_ids.contains(&child) {
                    self.add_edge(*new, child);
                }
            }
        }
    }

    /// Mirrors a LOOP generation: the initiator retires from the running
    /// set, its children are re-pointed at the copy of the initiator, and
    /// the new generation head becomes eligible immediately (paused when
    /// the job is paused). Cron gating is enforced by the candidate filter,
    /// not here.
    pub fn apply_loop(
        &mut self,
        job: &Job,
        initiator: TaskId,
        new_ids: &[TaskId],
        new_start: TaskId,
        new_end: TaskId,
    ) {
        for new in new_ids {
            if *new == new_start {
                continue;
            }
            let Ok(task) = job.task(*new) else { continue };
            let parents: Vec<TaskId> = task
                .dependencies
                .iter()
                .copied()
                .filter(|d| new_ids.contains(d))
                .collect();
            self.add_node(*new, parents);
            if task.if_branch.is_some() || !task.joined_branches.is_empty() {
                self.branch.insert(*new);
            }
        }

        // old successors of the initiator now wait on the new generation end
        let old_children = self.children.get(&initiator).cloned().unwrap_or_default();
        for child in &old_children {
            if let Some(parents) = self.parents.get_mut(child) {
                for parent in parents.iter_mut() {
                    if *parent == initiator {
                        *parent = new_end;
                    }
                }
            }
            self.children.entry(new_end).or_default().push(*child);
        }
        if let Some(children) = self.children.get_mut(&initiator) {
            children.clear();
        }

        self.add_node(new_start, Vec::new());
        if job.status == JobStatus::Paused {
            self.paused.insert(new_start);
        } else {
            self.eligible.insert(new_start);
        }
        self.running.remove(&initiator);
    }

    /// Holds every eligible task while the job is paused.
    pub fn pause(&mut self) {
        let held: Vec<TaskId> = self.eligible.drain().collect();
        self.paused.extend(held);
    }

    pub fn resume(&mut self) {
        let released: Vec<TaskId> = self.paused.drain().collect();
        self.eligible.extend(released);
    }
}
