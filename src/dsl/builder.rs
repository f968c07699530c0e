use std::collections::HashMap;

use serde_json::Value;

use crate::dsl::{JobDef, TaskDef};
use crate::runtime::action::{FlowKind, FlowSpec};
use crate::runtime::task::FlowBlock;

/// Fluent construction of a [`JobDef`], mainly for tests and embedding.
///
/// ```
/// use gridflow::dsl::builder::JobBuilder;
///
/// let def = JobBuilder::new("demo")
///     .task("split").done()
///     .task("work").depends_on(["split"]).done()
///     .build();
/// assert_eq!(def.tasks.len(), 2);
/// ```
pub struct JobBuilder {
    name: String,
    owner: String,
    priority: i32,
    variables: HashMap<String, Value>,
    tasks: Vec<TaskDef>,
}

impl JobBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            owner: "anonymous".to_string(),
            priority: 0,
            variables: HashMap::new(),
            tasks: Vec::new(),
        }
    }

    pub fn owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = owner.into();
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn variable(mut self, key: impl Into<String>, value: Value) -> Self {
        self.variables.insert(key.into(), value);
        self
    }

    pub fn task(self, name: impl Into<String>) -> TaskBuilder {
        TaskBuilder {
            job: self,
            def: TaskDef {
                name: name.into(),
                depends_on: Vec::new(),
                block: FlowBlock::None,
                matching_block: None,
                nodes: 1,
                constraints: Vec::new(),
                exclude_nodes: Vec::new(),
                flow: None,
                generic_info: HashMap::new(),
            },
        }
    }

    pub fn build(self) -> JobDef {
        JobDef {
            name: self.name,
            owner: self.owner,
            priority: self.priority,
            variables: self.variables,
            tasks: self.tasks,
        }
    }
}

pub struct TaskBuilder {
    job: JobBuilder,
    def: TaskDef,
}

impl TaskBuilder {
    pub fn depends_on<I: IntoIterator<Item = S>, S: Into<String>>(mut self, deps: I) -> Self {
        self.def.depends_on = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn nodes(mut self, nodes: usize) -> Self {
        self.def.nodes = nodes;
        self
    }

    pub fn constraint(mut self, constraint: impl Into<String>) -> Self {
        self.def.constraints.push(constraint.into());
        self
    }

    pub fn exclude_node(mut self, node: impl Into<String>) -> Self {
        self.def.exclude_nodes.push(node.into());
        self
    }

    pub fn block_start(mut self, matching_end: impl Into<String>) -> Self {
        self.def.block = FlowBlock::Start;
        self.def.matching_block = Some(matching_end.into());
        self
    }

    pub fn block_end(mut self) -> Self {
        self.def.block = FlowBlock::End;
        self
    }

    /// IF flow: `condition` selects `target`, otherwise `target_else`.
    pub fn if_flow(
        mut self,
        target: impl Into<String>,
        target_else: impl Into<String>,
        continuation: Option<&str>,
        condition: impl Into<String>,
    ) -> Self {
        self.def.flow = Some(FlowSpec {
            kind: FlowKind::If,
            target: Some(target.into()),
            target_else: Some(target_else.into()),
            continuation: continuation.map(str::to_string),
            condition: Some(condition.into()),
            runs: None,
            cron: None,
        });
        self
    }

    /// LOOP flow: loops back to `target` while `condition` holds.
    pub fn loop_flow(
        mut self,
        target: impl Into<String>,
        condition: impl Into<String>,
        cron: Option<&str>,
    ) -> Self {
        self.def.flow = Some(FlowSpec {
            kind: FlowKind::Loop,
            target: Some(target.into()),
            target_else: None,
            continuation: None,
            condition: Some(condition.into()),
            runs: None,
            cron: cron.map(str::to_string),
        });
        self
    }

    /// REPLICATE flow: `runs` evaluates to the copy count.
    pub fn replicate_flow(mut self, runs: impl Into<String>) -> Self {
        self.def.flow = Some(FlowSpec {
            kind: FlowKind::Replicate,
            target: None,
            target_else: None,
            continuation: None,
            condition: None,
            runs: Some(runs.into()),
            cron: None,
        });
        self
    }

    pub fn done(mut self) -> JobBuilder {
        self.job.tasks.push(self.def);
        self.job
    }
}
