use chrono::{Duration, Utc};
use tracing::info;

use crate::flow::target::{self, ExactRule};
use crate::runtime::changes::ChangeSet;
use crate::runtime::error::{EngineError, Result};
use crate::runtime::job::Job;
use crate::runtime::task::TaskId;
use crate::runtime::view::JobView;

/// Applies an IF action: exactly the selected branch is plugged behind the
/// initiator, the unselected branch head and its direct dependents are
/// skipped, and the join (when present) is wired behind the branch end.
///
/// All three targets are resolved before the first mutation, so an
/// unresolved mandatory target leaves the job untouched.
pub fn apply(
    job: &mut Job,
    view: &mut JobView,
    initiator: TaskId,
    target_name: &str,
    else_name: &str,
    continuation: Option<&str>,
    changes: &mut ChangeSet,
) -> Result<()> {
    let branch_start = target::resolve_target(job, initiator, target_name, ExactRule::IfBranchOf)
        .ok_or_else(|| EngineError::TargetNotFound {
            initiator,
            target: target_name.to_string(),
        })?;
    let else_target = target::resolve_target(job, initiator, else_name, ExactRule::IfBranchOf)
        .ok_or_else(|| EngineError::TargetNotFound {
            initiator,
            target: else_name.to_string(),
        })?;
    // the continuation may legitimately be absent: a branch without a join
    let join = continuation
        .and_then(|name| target::resolve_target(job, initiator, name, ExactRule::JoinOf));

    // the branch is the block delimited by the start, or the start alone
    let branch_end = target::find_block_end(job, branch_start).unwrap_or(branch_start);

    info!(
        job = %job.id,
        initiator,
        branch_start,
        branch_end,
        join = ?join,
        "flow action IF"
    );

    // plug the selected branch
    job.add_dependency(branch_start, initiator)?;
    changes.task_updated(branch_start);
    if let Some(join) = join {
        job.add_dependency(join, branch_end)?;
        changes.task_updated(join);
    }

    // the unselected branch head and its direct dependents will not run
    let mut else_tasks = job.direct_dependents(else_target);
    else_tasks.retain(|t| *t != else_target);

    // a dependency on the initiator still helps reconstruct the job graph
    // on the client side, even though the else branch never executes
    job.add_dependency(else_target, initiator)?;
    changes.task_updated(else_target);

    let skip_time = job
        .task(initiator)?
        .finished_at
        .unwrap_or_else(Utc::now)
        + Duration::milliseconds(1);
    for id in else_tasks.iter().copied().chain([else_target]) {
        job.mark_skipped(id, skip_time)?;
        changes.task_skipped(id);
        info!(job = %job.id, task = id, "task will not be executed");
    }

    view.apply_if(initiator, branch_start, branch_end, join, else_target, &else_tasks);
    Ok(())
}
