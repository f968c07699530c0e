use tracing::info;

use crate::flow::replicate::duplicate_path;
use crate::flow::target;
use crate::runtime::changes::ChangeSet;
use crate::runtime::error::{EngineError, Result};
use crate::runtime::job::{Job, JobStatus};
use crate::runtime::ports::CronPredictor;
use crate::runtime::task::{START_AT_KEY, TaskId, TaskStatus};
use crate::runtime::view::JobView;

/// Applies a LOOP action: one more generation of the loop body, duplicated
/// from the target down to the initiator with the iteration index bumped,
/// optionally time-gated by a cron expression.
///
/// The initiator is not terminated through the view: `apply_loop` retires
/// it and promotes the new generation head directly.
pub fn apply(
    job: &mut Job,
    view: &mut JobView,
    initiator: TaskId,
    target_name: &str,
    cron: Option<&str>,
    predictor: &dyn CronPredictor,
    changes: &mut ChangeSet,
) -> Result<()> {
    // the loop target and its initiator share a block scope, so the target
    // is addressed inside the initiator's own generation
    let scoped = target::scoped_name(job, initiator, target_name);
    // self-loop allowed: the target may be the initiator itself
    let target = if job.task(initiator)?.name() == scoped {
        Some(initiator)
    } else {
        job.find_task_up(&scoped, initiator)
            .or_else(|| target::resolve_base_name(job, initiator, target_name))
    }
    .ok_or_else(|| EngineError::TargetNotFound {
        initiator,
        target: target_name.to_string(),
    })?;

    info!(job = %job.id, initiator, target, "flow action LOOP");

    // the whole next generation waits until the cron expression next fires
    let start_at = match cron {
        Some(expr) => Some(predictor.next_fire_time(expr)?),
        None => None,
    };

    let dup = duplicate_path(job, initiator, target, true)?;
    let new_ids = dup.new_ids();

    let paused = job.status == JobStatus::Paused;
    for copy in dup.copies {
        let original_name = copy.base_name.clone();
        let id = job.register_iterated(copy);
        let task = job.task_mut(id)?;
        if paused {
            task.status = TaskStatus::Paused;
        }
        task.provenance = Some(match start_at {
            Some(at) => format!("LOOP-{}-{}", original_name, at.to_rfc3339()),
            None => format!("LOOP-{}-{}", original_name, task.iteration),
        });
        if let Some(at) = start_at {
            task.scheduled_time = Some(at);
            task.generic_info
                .insert(START_AT_KEY.to_string(), at.to_rfc3339());
        }
        changes.task_added(id);
    }

    // connect the new generation behind the initiator
    let new_start = dup.map[&target];
    let new_end = dup.map[&initiator];
    job.add_dependency(new_start, initiator)?;

    // merge tasks that waited on the initiator now wait on its copy, the
    // end of the new generation
    for merger in job.direct_dependents(initiator) {
        if merger != new_start && !new_ids.contains(&merger) {
            job.remove_dependency(merger, initiator)?;
            job.add_dependency(merger, new_end)?;
            changes.task_updated(merger);
        }
    }

    view.apply_loop(job, initiator, &new_ids, new_start, new_end);
    Ok(())
}
