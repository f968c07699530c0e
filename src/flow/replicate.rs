use std::collections::{HashMap, VecDeque};

use chrono::{Duration, Utc};
use tracing::{error, info};

use crate::flow::target;
use crate::runtime::changes::ChangeSet;
use crate::runtime::error::Result;
use crate::runtime::job::Job;
use crate::runtime::task::{FlowBlock, Task, TaskId};
use crate::runtime::view::JobView;

/// Copies produced by one subgraph duplication, keyed old id -> new id.
pub(crate) struct DupSet {
    pub map: HashMap<TaskId, TaskId>,
    /// Unregistered copies, ordered by original id for deterministic
    /// replication-index allocation.
    pub copies: Vec<Task>,
}

impl DupSet {
    pub fn new_ids(&self) -> Vec<TaskId> {
        self.copies.iter().map(|t| t.id).collect()
    }
}

/// Deep-copies the segment reached by walking upward from `seg_end`
/// through hard and weak edges, stopping at `seg_start` (inclusive).
///
/// Replicas left over by nested flow actions are collapsed to one copy per
/// base name, keeping the lowest (iteration, replication) instance. Edges
/// are reconstructed among the copies; the segment boundary keeps no
/// parents, the caller wires it to the initiator. With `loop_mode` every
/// copy's iteration index is incremented.
pub(crate) fn duplicate_path(
    job: &mut Job,
    seg_end: TaskId,
    seg_start: TaskId,
    loop_mode: bool,
) -> Result<DupSet> {
    // collect the originals
    let mut collected: Vec<TaskId> = Vec::new();
    let mut queue = VecDeque::from([seg_end]);
    while let Some(cur) = queue.pop_front() {
        if collected.contains(&cur) {
            continue;
        }
        collected.push(cur);
        if cur == seg_start {
            continue;
        }
        let task = job.task(cur)?;
        for up in task
            .dependencies
            .iter()
            .chain(task.joined_branches.iter())
            .chain(task.if_branch.iter())
        {
            queue.push_back(*up);
        }
    }

    // collapse replicas left over by nested replications: one copy per
    // base name, preferring the lowest iteration then replication, so a
    // new generation restarts from a single instance
    let mut kept: HashMap<String, TaskId> = HashMap::new();
    for id in &collected {
        let task = job.task(*id)?;
        match kept.get(&task.base_name) {
            Some(prev) => {
                let prev = job.task(*prev)?;
                if (task.iteration, task.replication) < (prev.iteration, prev.replication) {
                    kept.insert(task.base_name.clone(), *id);
                }
            }
            None => {
                kept.insert(task.base_name.clone(), *id);
            }
        }
    }
    // the segment boundaries themselves always survive the collapse
    for boundary in [seg_end, seg_start] {
        kept.insert(job.task(boundary)?.base_name.clone(), boundary);
    }
    let mut originals: Vec<TaskId> = kept.into_values().collect();
    originals.sort_unstable();

    let mut map: HashMap<TaskId, TaskId> = HashMap::new();
    for old in &originals {
        let new_id = job.alloc_task_id();
        map.insert(*old, new_id);
    }

    let mut copies = Vec::with_capacity(originals.len());
    for old_id in &originals {
        let old = job.task(*old_id)?.clone();
        let mut copy = old.replicated(map[old_id]);
        if loop_mode {
            copy.iteration = old.iteration + 1;
        }
        if *old_id != seg_start {
            // weak dependencies shadow hard ones, exactly one kind per task
            if let Some(branch) = old.if_branch {
                copy.if_branch = map.get(&branch).copied();
            } else if !old.joined_branches.is_empty() {
                copy.joined_branches = old
                    .joined_branches
                    .iter()
                    .filter_map(|b| map.get(b).copied())
                    .collect();
            } else {
                for parent in &old.dependencies {
                    if let Some(new_parent) = map.get(parent) {
                        copy.add_dependency(*new_parent);
                    }
                }
            }
        }
        copies.push(copy);
    }

    Ok(DupSet { map, copies })
}

/// Applies a REPLICATE action: `count - 1` additional copies of each direct
/// successor subgraph of the initiator, or a skip of those successors when
/// `count < 1`.
pub fn apply(
    job: &mut Job,
    view: &mut JobView,
    initiator: TaskId,
    count: i64,
    changes: &mut ChangeSet,
) -> Result<()> {
    info!(job = %job.id, initiator, count, "flow action REPLICATE");

    if count < 1 {
        return skip_successors(job, view, initiator, changes);
    }

    let candidates = job.direct_dependents(initiator);
    for todup in candidates {
        // a block is replicated whole, a plain task alone
        let seg_end = if job.task(todup)?.flow_block == FlowBlock::Start {
            match target::find_block_end(job, todup).filter(|end| job.depends_on(*end, todup)) {
                Some(end) => end,
                None => {
                    error!(
                        job = %job.id,
                        task = todup,
                        "REPLICATE: could not find matching block end"
                    );
                    continue;
                }
            }
        } else {
            todup
        };

        for _ in 1..count {
            let dup = duplicate_path(job, seg_end, todup, false)?;
            let new_ids = dup.new_ids();
            let initiator_name = job.task(initiator)?.name();

            for copy in dup.copies {
                let id = job.register_replicated(copy);
                let task = job.task_mut(id)?;
                task.provenance = Some(format!(
                    "REPLICATE-{}-{}",
                    initiator_name, task.replication
                ));
                changes.task_added(id);
            }

            // connect the copied segment to the initiator
            let new_start = dup.map[&todup];
            job.add_dependency(new_start, initiator)?;

            // every merge point waiting on the original end now also waits
            // on the copy
            let new_end = dup.map[&seg_end];
            for merger in job.direct_dependents(seg_end) {
                if !new_ids.contains(&merger) {
                    job.add_dependency(merger, new_end)?;
                    changes.task_updated(merger);
                }
            }

            view.apply_replicate(job, &new_ids);
        }
    }
    Ok(())
}

/// `count < 1`: abort the successor subgraphs. A BLOCK_START candidate
/// skips its whole block, located by walking backward along dependency
/// edges from the matching block end; a plain candidate skips alone.
fn skip_successors(
    job: &mut Job,
    view: &mut JobView,
    initiator: TaskId,
    changes: &mut ChangeSet,
) -> Result<()> {
    let skip_time = job
        .task(initiator)?
        .finished_at
        .unwrap_or_else(Utc::now)
        + Duration::milliseconds(1);

    for candidate in job.direct_dependents(initiator) {
        let mut to_skip = vec![candidate];
        if job.task(candidate)?.flow_block == FlowBlock::Start {
            if let Some(end) = target::find_block_end(job, candidate) {
                let mut queue = VecDeque::from([end]);
                to_skip.clear();
                while let Some(cur) = queue.pop_front() {
                    if to_skip.contains(&cur) {
                        continue;
                    }
                    to_skip.push(cur);
                    if cur == candidate {
                        continue;
                    }
                    for parent in &job.task(cur)?.dependencies {
                        queue.push_back(*parent);
                    }
                }
            }
        }
        for id in &to_skip {
            job.mark_skipped(*id, skip_time)?;
            changes.task_skipped(*id);
            info!(job = %job.id, task = *id, "task will not be executed");
        }
        view.skip(&to_skip);
    }
    Ok(())
}
