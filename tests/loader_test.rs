use std::io::Write;

use tempfile::NamedTempFile;

use gridflow::dsl::builder::JobBuilder;
use gridflow::dsl::loader::load_job_from_yaml;
use gridflow::dsl::{self, JobDef};
use gridflow::runtime::error::EngineError;

fn write_yaml(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("temp file");
    file.write_all(content.as_bytes()).expect("write yaml");
    file
}

#[test]
fn loads_a_job_definition_from_yaml() {
    let file = write_yaml(
        r#"
name: nightly-batch
owner: ops
priority: 5
variables:
  width: 3
tasks:
  - name: split
    flow:
      kind: replicate
      runs: width
  - name: crunch
    depends_on: [split]
    nodes: 2
    constraints: [gpu]
  - name: merge
    depends_on: [crunch]
"#,
    );

    let def = load_job_from_yaml(file.path()).expect("load failed");
    assert_eq!(def.name, "nightly-batch");
    assert_eq!(def.owner, "ops");
    assert_eq!(def.priority, 5);
    assert_eq!(def.tasks.len(), 3);
    assert_eq!(def.tasks[1].nodes, 2);
    assert_eq!(def.tasks[1].constraints, vec!["gpu"]);

    let (job, _view) = dsl::build(def).expect("build failed");
    assert_eq!(job.total_tasks(), 3);
    assert_eq!(job.pending_tasks(), 3);
}

#[test]
fn loads_blocks_and_if_flows() {
    let file = write_yaml(
        r#"
name: branching
variables:
  route: true
tasks:
  - name: decide
    flow:
      kind: if
      target: fast
      target_else: slow
      continuation: publish
      condition: route
  - name: fast
  - name: slow
  - name: publish
  - name: body
    depends_on: [decide]
    block: start
    matching_block: tail
  - name: tail
    depends_on: [body]
    block: end
"#,
    );

    let def = load_job_from_yaml(file.path()).expect("load failed");
    let (job, _view) = dsl::build(def).expect("build failed");
    assert_eq!(job.total_tasks(), 6);
}

#[test]
fn missing_file_is_reported_with_context() {
    let err = load_job_from_yaml("/definitely/not/here.yaml").expect_err("must fail");
    assert!(err.to_string().contains("Failed to read YAML file"));
}

#[test]
fn unknown_dependency_is_rejected() {
    let def = JobBuilder::new("bad")
        .task("a")
        .depends_on(["ghost"])
        .done()
        .build();
    let err = dsl::build(def).expect_err("must fail");
    assert!(matches!(err, EngineError::Definition(_)));
    assert!(err.to_string().contains("ghost"));
}

#[test]
fn duplicate_task_names_are_rejected() {
    let def = JobBuilder::new("bad")
        .task("a")
        .done()
        .task("a")
        .done()
        .build();
    let err = dsl::build(def).expect_err("must fail");
    assert!(err.to_string().contains("duplicate"));
}

#[test]
fn reserved_name_separators_are_rejected() {
    for name in ["split#2", "split*1"] {
        let def = JobBuilder::new("bad").task(name).done().build();
        let err = dsl::build(def).expect_err("must fail");
        assert!(err.to_string().contains("reserved"));
    }
}

#[test]
fn unmatched_block_start_is_rejected() {
    let def = JobBuilder::new("bad")
        .task("s")
        .block_start("missing-end")
        .done()
        .build();
    let err = dsl::build(def).expect_err("must fail");
    assert!(err.to_string().contains("missing-end"));
}

#[test]
fn block_start_must_point_at_a_block_end() {
    let def = JobBuilder::new("bad")
        .task("s")
        .block_start("plain")
        .done()
        .task("plain")
        .done()
        .build();
    let err = dsl::build(def).expect_err("must fail");
    assert!(err.to_string().contains("not a block end"));
}

#[test]
fn if_branch_heads_cannot_carry_hard_dependencies() {
    let def = JobBuilder::new("bad")
        .task("a")
        .if_flow("left", "right", None, "true")
        .done()
        .task("left")
        .depends_on(["a"])
        .done()
        .task("right")
        .done()
        .build();
    let err = dsl::build(def).expect_err("must fail");
    assert!(err.to_string().contains("hard dependencies"));
}

#[test]
fn empty_job_is_rejected() {
    let def = JobDef {
        name: "empty".into(),
        owner: "nobody".into(),
        priority: 0,
        variables: Default::default(),
        tasks: Vec::new(),
    };
    let err = dsl::build(def).expect_err("must fail");
    assert!(err.to_string().contains("at least one task"));
}
