use std::sync::Arc;

use serde_json::json;
use tokio::sync::mpsc;

use gridflow::dsl::builder::JobBuilder;
use gridflow::flow::evaluator::ExprFlowEvaluator;
use gridflow::runtime::engine::{Collaborators, Engine, JobInfo, TaskOutcome};
use gridflow::runtime::job::{JobId, JobStatus};
use gridflow::runtime::ports::{
    ChannelNotificationSink, EventKind, FifoPolicy, InMemoryNodePool, Notification,
    ScheduleCronPredictor,
};
use gridflow::runtime::task::TaskStatus;

fn engine_with(nodes: usize) -> (Engine, mpsc::UnboundedReceiver<Notification>) {
    let (sink, events) = ChannelNotificationSink::new();
    let engine = Engine::new(Collaborators {
        policy: Arc::new(FifoPolicy),
        resources: Arc::new(InMemoryNodePool::new(nodes)),
        evaluator: Arc::new(ExprFlowEvaluator),
        cron: Arc::new(ScheduleCronPredictor),
        sink: Arc::new(sink),
    });
    (engine, events)
}

fn assert_counters(info: &JobInfo) {
    assert_eq!(
        info.pending_tasks + info.running_tasks + info.finished_tasks,
        info.total_tasks,
        "counter invariant broken for job {}",
        info.id
    );
}

async fn checked_drive(engine: &Engine, job: JobId, max_cycles: usize) -> JobStatus {
    for _ in 0..max_cycles {
        let report = engine.run_scheduling_cycle().await;
        assert_counters(&engine.job_info(job).await.unwrap());
        if report.started.is_empty() {
            break;
        }
        for (j, t) in report.started {
            engine.on_task_started(j, t).await.expect("start failed");
            engine
                .on_task_terminated(j, t, TaskOutcome::success())
                .await
                .expect("terminate failed");
            assert_counters(&engine.job_info(job).await.unwrap());
        }
    }
    engine.job_info(job).await.expect("job info").status
}

#[tokio::test]
async fn linear_chain_runs_to_completion() {
    let def = JobBuilder::new("linear")
        .owner("tester")
        .task("prepare")
        .done()
        .task("work")
        .depends_on(["prepare"])
        .done()
        .task("publish")
        .depends_on(["work"])
        .done()
        .build();
    let (engine, mut events) = engine_with(1);
    let job = engine.submit(def).await.expect("submit failed");

    assert_eq!(checked_drive(&engine, job, 8).await, JobStatus::Finished);
    let info = engine.job_info(job).await.unwrap();
    assert_eq!(info.finished_tasks, 3);
    assert_eq!(info.pending_tasks, 0);

    // submission and completion were published
    let mut kinds = Vec::new();
    while let Ok(event) = events.try_recv() {
        kinds.push(event.event);
    }
    assert!(kinds.contains(&EventKind::JobSubmitted));
    assert!(kinds.contains(&EventKind::TaskStarted));
    assert!(kinds.contains(&EventKind::JobFinished));
}

#[tokio::test]
async fn job_stalls_when_running_drains_with_work_left() {
    let def = JobBuilder::new("stall")
        .task("a")
        .done()
        .task("b")
        .depends_on(["a"])
        .done()
        .build();
    let (engine, _events) = engine_with(1);
    let job = engine.submit(def).await.expect("submit failed");

    let report = engine.run_scheduling_cycle().await;
    let (j, a) = report.started[0];
    engine.on_task_started(j, a).await.unwrap();
    assert_eq!(engine.job_info(job).await.unwrap().status, JobStatus::Running);

    engine
        .on_task_terminated(j, a, TaskOutcome::success())
        .await
        .unwrap();
    // nothing runs, work remains: the job is stalled until the next bind
    assert_eq!(engine.job_info(job).await.unwrap().status, JobStatus::Stalled);

    let report = engine.run_scheduling_cycle().await;
    assert_eq!(report.started.len(), 1);
    assert_eq!(engine.job_info(job).await.unwrap().status, JobStatus::Running);
}

#[tokio::test]
async fn failed_task_releases_no_dependents() {
    let def = JobBuilder::new("failing")
        .task("a")
        .done()
        .task("b")
        .depends_on(["a"])
        .done()
        .build();
    let (engine, _events) = engine_with(1);
    let job = engine.submit(def).await.expect("submit failed");

    let report = engine.run_scheduling_cycle().await;
    let (j, a) = report.started[0];
    engine.on_task_started(j, a).await.unwrap();
    engine
        .on_task_terminated(j, a, TaskOutcome::failure())
        .await
        .unwrap();

    let tasks = engine.task_snapshots(job).await.unwrap();
    let by_name = |n: &str| tasks.iter().find(|t| t.name == n).expect("task by name");
    assert_eq!(by_name("a").status, TaskStatus::Failed);
    assert_eq!(by_name("b").status, TaskStatus::Pending);

    // the dependent is never offered to the scheduler
    let report = engine.run_scheduling_cycle().await;
    assert!(report.started.is_empty());
    let info = engine.job_info(job).await.unwrap();
    assert_counters(&info);
    assert_eq!(info.status, JobStatus::Stalled);
}

#[tokio::test]
async fn paused_job_contributes_no_candidates() {
    let def = JobBuilder::new("pausable")
        .task("a")
        .done()
        .task("b")
        .depends_on(["a"])
        .done()
        .build();
    let (engine, _events) = engine_with(1);
    let job = engine.submit(def).await.expect("submit failed");

    engine.pause_job(job).await.unwrap();
    let report = engine.run_scheduling_cycle().await;
    assert!(report.started.is_empty());
    assert_eq!(engine.job_info(job).await.unwrap().status, JobStatus::Paused);

    engine.resume_job(job).await.unwrap();
    assert_eq!(checked_drive(&engine, job, 8).await, JobStatus::Finished);
}

#[tokio::test]
async fn loop_generation_born_under_pause_is_paused() {
    let def = JobBuilder::new("paused-loop")
        .variable("go", json!(true))
        .task("l")
        .loop_flow("l", "go", None)
        .done()
        .build();
    let (engine, _events) = engine_with(1);
    let job = engine.submit(def).await.expect("submit failed");

    let report = engine.run_scheduling_cycle().await;
    let (j, l) = report.started[0];
    engine.on_task_started(j, l).await.unwrap();
    // pause while the first generation is still running
    engine.pause_job(job).await.unwrap();
    engine
        .on_task_terminated(j, l, TaskOutcome::success())
        .await
        .unwrap();

    let tasks = engine.task_snapshots(job).await.unwrap();
    let next = tasks.iter().find(|t| t.name == "l#1").expect("l#1");
    assert_eq!(next.status, TaskStatus::Paused);
    let report = engine.run_scheduling_cycle().await;
    assert!(report.started.is_empty());

    // resuming releases the generation
    engine.resume_job(job).await.unwrap();
    let report = engine.run_scheduling_cycle().await;
    assert_eq!(report.started.len(), 1);
}

#[tokio::test]
async fn killed_job_aborts_and_closes_counters() {
    let def = JobBuilder::new("killable")
        .task("a")
        .done()
        .task("b")
        .depends_on(["a"])
        .done()
        .build();
    let (engine, _events) = engine_with(1);
    let job = engine.submit(def).await.expect("submit failed");

    let report = engine.run_scheduling_cycle().await;
    let (j, a) = report.started[0];
    engine.on_task_started(j, a).await.unwrap();

    engine.kill_job(job, "user request").await.unwrap();

    let info = engine.job_info(job).await.unwrap();
    assert_eq!(info.status, JobStatus::Canceled);
    assert_counters(&info);
    assert_eq!(info.finished_tasks, info.total_tasks);

    let tasks = engine.task_snapshots(job).await.unwrap();
    assert!(tasks.iter().all(|t| t.status == TaskStatus::Aborted));

    // the cancellation is an abrupt status change for the next cycle
    let report = engine.run_scheduling_cycle().await;
    assert!(report.started.is_empty());

    // terminal statuses are absorbing
    let err = engine.on_task_terminated(j, a, TaskOutcome::success()).await;
    assert!(err.is_err());
    let tasks = engine.task_snapshots(job).await.unwrap();
    assert!(tasks.iter().all(|t| t.status == TaskStatus::Aborted));
}

#[tokio::test]
async fn jobs_mutate_independently() {
    // one job's flow failure does not block the other's scheduling
    let broken = JobBuilder::new("broken")
        .task("a")
        .if_flow("left", "right", None, "missing_var > 0")
        .done()
        .task("left")
        .done()
        .task("right")
        .done()
        .build();
    let healthy = JobBuilder::new("healthy")
        .task("x")
        .done()
        .task("y")
        .depends_on(["x"])
        .done()
        .build();

    let (engine, _events) = engine_with(2);
    let broken_job = engine.submit(broken).await.expect("submit failed");
    let healthy_job = engine.submit(healthy).await.expect("submit failed");

    let report = engine.run_scheduling_cycle().await;
    assert_eq!(report.started.len(), 2);
    for (j, t) in report.started {
        engine.on_task_started(j, t).await.unwrap();
        let _ = engine.on_task_terminated(j, t, TaskOutcome::success()).await;
    }

    assert_eq!(
        engine.job_info(broken_job).await.unwrap().status,
        JobStatus::Failed
    );
    let report = engine.run_scheduling_cycle().await;
    assert_eq!(report.started.len(), 1, "healthy job keeps scheduling");
    let (j, y) = report.started[0];
    engine.on_task_started(j, y).await.unwrap();
    engine
        .on_task_terminated(j, y, TaskOutcome::success())
        .await
        .unwrap();
    assert_eq!(
        engine.job_info(healthy_job).await.unwrap().status,
        JobStatus::Finished
    );
}
