use crate::runtime::job::Job;
use crate::runtime::task::{TaskId, compose_name, initial_name};

/// How the exact-name strategy validates that a candidate belongs to the
/// initiator's flow scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExactRule {
    /// The candidate's recorded weak `if_branch` must be the initiator.
    /// Used for IF branch heads.
    IfBranchOf,
    /// An upward walk from the candidate must reach the initiator. Used
    /// for IF continuations.
    JoinOf,
}

/// Resolves a flow target name against the live registry: exact display
/// name first, then the base-name fallback. Terminal tasks are never
/// returned, so stale generations are never mistaken for the current one.
pub fn resolve_target(job: &Job, initiator: TaskId, name: &str, rule: ExactRule) -> Option<TaskId> {
    resolve_exact(job, initiator, name, rule).or_else(|| resolve_base_name(job, initiator, name))
}

/// Target names as written in a flow spec are base names; a task created
/// by duplication addresses targets inside its own scope, so the name is
/// re-suffixed with the initiator's iteration and replication indices.
pub fn scoped_name(job: &Job, initiator: TaskId, name: &str) -> String {
    match job.task(initiator) {
        Ok(task) => compose_name(initial_name(name), task.iteration, task.replication),
        Err(_) => name.to_string(),
    }
}

/// Exact strategy: a runnable task whose display name equals `name`
/// re-suffixed into the initiator's scope, and whose relation to the
/// initiator satisfies `rule`.
pub fn resolve_exact(job: &Job, initiator: TaskId, name: &str, rule: ExactRule) -> Option<TaskId> {
    let name = scoped_name(job, initiator, name);
    let initiator_name = job.task(initiator).ok()?.name();
    for task in job.tasks() {
        if task.is_terminal() || task.name() != name {
            continue;
        }
        let matches = match rule {
            ExactRule::IfBranchOf => task.if_branch == Some(initiator),
            ExactRule::JoinOf => job.find_task_up(&initiator_name, task.id) == Some(initiator),
        };
        if matches {
            return Some(task.id);
        }
    }
    None
}

/// Base-name fallback: the natural target was renamed by a prior loop
/// generation, so find, among runnable tasks sharing the initiator's
/// replication index, the one with the matching base name and the highest
/// iteration index.
pub fn resolve_base_name(job: &Job, initiator: TaskId, name: &str) -> Option<TaskId> {
    let initiator = job.task(initiator).ok()?;
    let base = initial_name(name);
    let mut found: Option<TaskId> = None;
    let mut best_iteration = 0;
    for task in job.tasks() {
        if task.replication != initiator.replication
            || task.is_terminal()
            || task.base_name != base
        {
            continue;
        }
        if found.is_none() || task.iteration > best_iteration {
            found = Some(task.id);
            best_iteration = task.iteration;
        }
    }
    found
}

/// Locates the matching BLOCK_END of a block start: the runnable task whose
/// base name equals the start's recorded matching-block name and whose
/// iteration/replication indices equal the start's.
pub fn find_block_end(job: &Job, start: TaskId) -> Option<TaskId> {
    let start = job.task(start).ok()?;
    let matching = start.matching_block.as_deref()?;
    job.tasks()
        .find(|t| {
            !t.is_terminal()
                && t.base_name == matching
                && t.iteration == start.iteration
                && t.replication == start.replication
        })
        .map(|t| t.id)
}
