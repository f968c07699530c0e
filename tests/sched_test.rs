use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::mpsc;

use gridflow::dsl::builder::JobBuilder;
use gridflow::flow::evaluator::ExprFlowEvaluator;
use gridflow::runtime::engine::{Collaborators, Engine, TaskOutcome};
use gridflow::runtime::job::JobStatus;
use gridflow::runtime::ports::{
    ChannelNotificationSink, FifoPolicy, InMemoryNodePool, Node, Notification,
    ResourceManager, ScheduleCronPredictor,
};
use gridflow::runtime::task::TaskStatus;

fn engine_on(pool: InMemoryNodePool) -> (Engine, mpsc::UnboundedReceiver<Notification>) {
    let (sink, events) = ChannelNotificationSink::new();
    let engine = Engine::new(Collaborators {
        policy: Arc::new(FifoPolicy),
        resources: Arc::new(pool),
        evaluator: Arc::new(ExprFlowEvaluator),
        cron: Arc::new(ScheduleCronPredictor),
        sink: Arc::new(sink),
    });
    (engine, events)
}

#[tokio::test]
async fn batch_contains_exactly_the_compatible_prefix() {
    // four independent tasks: three share a signature, the fourth differs
    let def = JobBuilder::new("batching")
        .task("t1")
        .done()
        .task("t2")
        .done()
        .task("t3")
        .done()
        .task("t4")
        .constraint("gpu")
        .done()
        .build();
    let (engine, _events) = engine_on(InMemoryNodePool::new(4));
    let job = engine.submit(def).await.expect("submit failed");

    let report = engine.run_scheduling_cycle().await;
    assert_eq!(report.started.len(), 3);

    let tasks = engine.task_snapshots(job).await.unwrap();
    let started: HashSet<&str> = tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Submitted)
        .map(|t| t.name.as_str())
        .collect();
    assert_eq!(started, HashSet::from(["t1", "t2", "t3"]));
    // the incompatible task found no gpu node and stays pending
    assert_eq!(
        tasks.iter().find(|t| t.name == "t4").unwrap().status,
        TaskStatus::Pending
    );
}

#[tokio::test]
async fn oversized_multinode_task_is_not_overtaken() {
    // the head of the queue needs more nodes than are free: the cycle
    // stops rather than let the smaller task starve it
    let def = JobBuilder::new("multinode")
        .task("big")
        .nodes(3)
        .done()
        .task("small")
        .done()
        .build();
    let (engine, _events) = engine_on(InMemoryNodePool::new(2));
    let job = engine.submit(def).await.expect("submit failed");

    let report = engine.run_scheduling_cycle().await;
    assert!(report.started.is_empty());

    let tasks = engine.task_snapshots(job).await.unwrap();
    assert!(tasks.iter().all(|t| t.status == TaskStatus::Pending));
}

#[tokio::test]
async fn batching_stops_at_the_first_task_exceeding_the_budget() {
    let def = JobBuilder::new("budget")
        .task("first")
        .nodes(2)
        .done()
        .task("second")
        .nodes(2)
        .done()
        .build();
    let (engine, _events) = engine_on(InMemoryNodePool::new(3));
    let job = engine.submit(def).await.expect("submit failed");

    let report = engine.run_scheduling_cycle().await;
    assert_eq!(report.started.len(), 1);
    let tasks = engine.task_snapshots(job).await.unwrap();
    assert_eq!(
        tasks.iter().find(|t| t.name == "first").unwrap().status,
        TaskStatus::Submitted
    );
    assert_eq!(
        tasks.iter().find(|t| t.name == "second").unwrap().status,
        TaskStatus::Pending
    );
}

#[tokio::test]
async fn constraint_failure_fails_the_job_but_not_its_neighbors() {
    let bad = JobBuilder::new("bad-selection")
        .task("t")
        .constraint("boom")
        .done()
        .build();
    let good = JobBuilder::new("good")
        .task("t")
        .done()
        .build();

    let pool = InMemoryNodePool::new(2).poison_constraint("boom");
    let (engine, _events) = engine_on(pool);
    let bad_job = engine.submit(bad).await.expect("submit failed");
    let good_job = engine.submit(good).await.expect("submit failed");

    let report = engine.run_scheduling_cycle().await;
    assert_eq!(report.started.len(), 1);
    assert_eq!(report.constraint_failures.len(), 1);

    let bad_info = engine.job_info(bad_job).await.unwrap();
    assert_eq!(bad_info.status, JobStatus::Failed);
    let reason = bad_info.failure_reason.expect("diagnostic reason");
    assert!(reason.contains("boom"), "unexpected reason: {reason}");

    let good_info = engine.job_info(good_job).await.unwrap();
    assert_eq!(good_info.status, JobStatus::Running);
}

#[tokio::test]
async fn zero_free_resources_exits_the_cycle_cleanly() {
    let def = JobBuilder::new("starved").task("t").done().build();
    let (engine, _events) = engine_on(InMemoryNodePool::new(0));
    let job = engine.submit(def).await.expect("submit failed");

    let report = engine.run_scheduling_cycle().await;
    assert!(report.started.is_empty());
    assert!(report.constraint_failures.is_empty());
    assert_eq!(engine.job_info(job).await.unwrap().status, JobStatus::Pending);
}

#[tokio::test]
async fn excluded_nodes_are_never_bound() {
    let def = JobBuilder::new("exclusion")
        .task("t")
        .exclude_node("node-0")
        .done()
        .build();
    let (engine, _events) = engine_on(InMemoryNodePool::new(1));
    let job = engine.submit(def).await.expect("submit failed");

    let report = engine.run_scheduling_cycle().await;
    assert!(report.started.is_empty());
    assert_eq!(engine.job_info(job).await.unwrap().status, JobStatus::Pending);
}

#[tokio::test]
async fn tagged_nodes_satisfy_selection_constraints() {
    let def = JobBuilder::new("tagged")
        .task("t")
        .constraint("gpu")
        .done()
        .build();
    let pool = InMemoryNodePool::with_nodes([
        Node::new("cpu-0"),
        Node::new("gpu-0").with_tags(["gpu"]),
    ]);
    let (engine, _events) = engine_on(pool);
    let job = engine.submit(def).await.expect("submit failed");

    let report = engine.run_scheduling_cycle().await;
    assert_eq!(report.started.len(), 1);
    let tasks = engine.task_snapshots(job).await.unwrap();
    assert_eq!(tasks[0].status, TaskStatus::Submitted);
}

#[tokio::test]
async fn nodes_released_on_termination_are_reused() {
    // a single node serves a two-task chain across cycles
    let def = JobBuilder::new("reuse")
        .task("a")
        .done()
        .task("b")
        .depends_on(["a"])
        .done()
        .build();
    let pool = Arc::new(InMemoryNodePool::new(1));
    let (sink, _events) = ChannelNotificationSink::new();
    let engine = Engine::new(Collaborators {
        policy: Arc::new(FifoPolicy),
        resources: pool.clone(),
        evaluator: Arc::new(ExprFlowEvaluator),
        cron: Arc::new(ScheduleCronPredictor),
        sink: Arc::new(sink),
    });
    let job = engine.submit(def).await.expect("submit failed");

    let report = engine.run_scheduling_cycle().await;
    assert_eq!(report.started.len(), 1);
    assert_eq!(pool.free_node_count().await, 0);

    let (j, a) = report.started[0];
    engine.on_task_started(j, a).await.unwrap();
    engine
        .on_task_terminated(j, a, TaskOutcome::success())
        .await
        .unwrap();
    // the node is back in the pool and serves the dependent task
    assert_eq!(pool.free_node_count().await, 1);

    let report = engine.run_scheduling_cycle().await;
    assert_eq!(report.started.len(), 1);
    let (j, b) = report.started[0];
    engine.on_task_started(j, b).await.unwrap();
    engine
        .on_task_terminated(j, b, TaskOutcome::success())
        .await
        .unwrap();
    assert_eq!(engine.job_info(job).await.unwrap().status, JobStatus::Finished);
    assert_eq!(pool.free_node_count().await, 1);
}

#[tokio::test]
async fn multinode_task_binds_all_its_nodes() {
    let def = JobBuilder::new("wide").task("t").nodes(3).done().build();
    let pool = Arc::new(InMemoryNodePool::new(4));
    let (sink, _events) = ChannelNotificationSink::new();
    let engine = Engine::new(Collaborators {
        policy: Arc::new(FifoPolicy),
        resources: pool.clone(),
        evaluator: Arc::new(ExprFlowEvaluator),
        cron: Arc::new(ScheduleCronPredictor),
        sink: Arc::new(sink),
    });
    let job = engine.submit(def).await.expect("submit failed");

    let report = engine.run_scheduling_cycle().await;
    assert_eq!(report.started.len(), 1);
    // three consumed, the fourth never left the pool
    assert_eq!(pool.free_node_count().await, 1);

    let (j, t) = report.started[0];
    engine.on_task_started(j, t).await.unwrap();
    engine
        .on_task_terminated(j, t, TaskOutcome::success())
        .await
        .unwrap();
    assert_eq!(pool.free_node_count().await, 4);
    assert_eq!(engine.job_info(job).await.unwrap().status, JobStatus::Finished);
}
