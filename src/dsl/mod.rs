pub mod builder;
pub mod loader;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::runtime::action::{FlowKind, FlowSpec};
use crate::runtime::error::{EngineError, Result};
use crate::runtime::job::Job;
use crate::runtime::task::{
    FlowBlock, ITERATION_SEPARATOR, REPLICATION_SEPARATOR, Task, TaskId,
};
use crate::runtime::view::JobView;

/// Raw job definition, as written in YAML or produced by the builder.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobDef {
    pub name: String,
    #[serde(default = "default_owner")]
    pub owner: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub variables: HashMap<String, Value>,
    pub tasks: Vec<TaskDef>,
}

fn default_owner() -> String {
    "anonymous".to_string()
}

/// One task of the definition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskDef {
    pub name: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub block: FlowBlock,
    /// Name of the matching BLOCK_END task, required when `block` is
    /// `start`.
    #[serde(default)]
    pub matching_block: Option<String>,
    #[serde(default = "default_nodes")]
    pub nodes: usize,
    #[serde(default)]
    pub constraints: Vec<String>,
    #[serde(default)]
    pub exclude_nodes: Vec<String>,
    #[serde(default)]
    pub flow: Option<FlowSpec>,
    #[serde(default)]
    pub generic_info: HashMap<String, String>,
}

fn default_nodes() -> usize {
    1
}

/// Validates a definition and builds the job with its live view.
///
/// Weak IF edges are recorded here: branch heads get their controlling
/// task as `if_branch`, the continuation gets both heads as
/// `joined_branches`. These relationships gate eligibility until an IF
/// resolution plugs the chosen branch.
pub fn build(def: JobDef) -> Result<(Job, JobView)> {
    if def.tasks.is_empty() {
        return Err(EngineError::Definition("a job needs at least one task".into()));
    }

    let mut job = Job::new(def.name, def.owner);
    job.priority = def.priority;
    job.variables = def.variables;

    let mut ids: HashMap<String, TaskId> = HashMap::new();
    for task in &def.tasks {
        validate_name(&task.name)?;
        if ids.contains_key(&task.name) {
            return Err(EngineError::Definition(format!(
                "duplicate task name '{}'",
                task.name
            )));
        }
        ids.insert(task.name.clone(), job.alloc_task_id());
    }

    let mut tasks: Vec<Task> = Vec::with_capacity(def.tasks.len());
    for td in &def.tasks {
        let id = ids[&td.name];
        let mut task = Task::new(id, td.name.clone());

        if td.nodes == 0 {
            return Err(EngineError::Definition(format!(
                "task '{}' needs at least one node",
                td.name
            )));
        }
        task.nodes_needed = td.nodes;
        task.constraints = td.constraints.clone();
        task.constraints.sort();
        task.node_exclusion = td.exclude_nodes.iter().cloned().collect();
        task.generic_info = td.generic_info.clone();

        for dep in &td.depends_on {
            let dep_id = *ids.get(dep).ok_or_else(|| {
                EngineError::Definition(format!(
                    "task '{}' depends on unknown task '{dep}'",
                    td.name
                ))
            })?;
            if dep_id == id {
                return Err(EngineError::Definition(format!(
                    "task '{}' cannot depend on itself",
                    td.name
                )));
            }
            task.add_dependency(dep_id);
        }

        task.flow_block = td.block;
        match td.block {
            FlowBlock::Start => {
                let end = td.matching_block.as_deref().ok_or_else(|| {
                    EngineError::Definition(format!(
                        "block start '{}' names no matching block end",
                        td.name
                    ))
                })?;
                let end_def = def.tasks.iter().find(|t| t.name == end).ok_or_else(|| {
                    EngineError::Definition(format!(
                        "block start '{}' references unknown end '{end}'",
                        td.name
                    ))
                })?;
                if end_def.block != FlowBlock::End {
                    return Err(EngineError::Definition(format!(
                        "task '{end}' is not a block end"
                    )));
                }
                task.matching_block = Some(end.to_string());
            }
            FlowBlock::None | FlowBlock::End => {
                if td.matching_block.is_some() {
                    return Err(EngineError::Definition(format!(
                        "task '{}' is not a block start but names a matching block",
                        td.name
                    )));
                }
            }
        }

        task.flow = td.flow.clone();
        tasks.push(task);
    }

    // record the weak IF edges
    for td in &def.tasks {
        let Some(flow) = &td.flow else { continue };
        let id = ids[&td.name];
        match flow.kind {
            FlowKind::If => {
                let target = flow_target(flow.target.as_deref(), &td.name, "target", &ids)?;
                let target_else =
                    flow_target(flow.target_else.as_deref(), &td.name, "target_else", &ids)?;
                if target == target_else {
                    return Err(EngineError::Definition(format!(
                        "task '{}' uses the same task for both IF branches",
                        td.name
                    )));
                }
                for branch in [target, target_else] {
                    let head = &mut tasks[branch as usize];
                    if !head.dependencies.is_empty() {
                        return Err(EngineError::Definition(format!(
                            "IF branch head '{}' cannot carry hard dependencies",
                            head.base_name
                        )));
                    }
                    head.if_branch = Some(id);
                }
                if let Some(cont) = &flow.continuation {
                    let join = *ids.get(cont.as_str()).ok_or_else(|| {
                        EngineError::Definition(format!(
                            "task '{}' joins unknown task '{cont}'",
                            td.name
                        ))
                    })?;
                    tasks[join as usize].joined_branches = vec![target, target_else];
                }
            }
            FlowKind::Loop => {
                let target = flow.target.as_deref().ok_or_else(|| {
                    EngineError::Definition(format!("loop task '{}' names no target", td.name))
                })?;
                if !ids.contains_key(target) {
                    return Err(EngineError::Definition(format!(
                        "loop task '{}' targets unknown task '{target}'",
                        td.name
                    )));
                }
            }
            FlowKind::Replicate => {
                if flow.runs.is_none() {
                    return Err(EngineError::Definition(format!(
                        "replicate task '{}' has no runs expression",
                        td.name
                    )));
                }
            }
        }
    }

    for task in tasks {
        job.add_task(task);
    }
    let view = JobView::new(&job);
    Ok((job, view))
}

fn flow_target(
    name: Option<&str>,
    owner: &str,
    field: &str,
    ids: &HashMap<String, TaskId>,
) -> Result<TaskId> {
    let name = name.ok_or_else(|| {
        EngineError::Definition(format!("IF task '{owner}' names no {field}"))
    })?;
    ids.get(name).copied().ok_or_else(|| {
        EngineError::Definition(format!("IF task '{owner}' targets unknown task '{name}'"))
    })
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(EngineError::Definition("empty task name".into()));
    }
    if name.contains(ITERATION_SEPARATOR) || name.contains(REPLICATION_SEPARATOR) {
        return Err(EngineError::Definition(format!(
            "task name '{name}' uses a reserved separator"
        )));
    }
    Ok(())
}
