use serde::{Deserialize, Serialize};

/// Structural directive produced by a terminated task's flow script.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlowAction {
    /// No structural effect; the flow continues normally.
    Continue,
    /// Conditional branching: `target` is the selected branch head,
    /// `target_else` the unselected one, `continuation` the optional join.
    If {
        target: String,
        target_else: String,
        continuation: Option<String>,
    },
    /// Bounded replication of the initiator's successor subgraph.
    /// `count <= 1` creates nothing; `count < 1` aborts the successors.
    Replicate { count: i64 },
    /// One more generation of the loop body headed by `target`, optionally
    /// gated by a cron expression.
    Loop {
        target: String,
        cron: Option<String>,
    },
}

impl FlowAction {
    pub fn kind(&self) -> &'static str {
        match self {
            FlowAction::Continue => "CONTINUE",
            FlowAction::If { .. } => "IF",
            FlowAction::Replicate { .. } => "REPLICATE",
            FlowAction::Loop { .. } => "LOOP",
        }
    }
}

/// Which action a task's flow script produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowKind {
    If,
    Replicate,
    Loop,
}

/// Declarative flow-script configuration attached to a task.
///
/// The evaluator turns this into a [`FlowAction`] when the task terminates:
/// for `If`, `condition` selects between `target` and `target_else`; for
/// `Loop`, a false `condition` ends the loop; for `Replicate`, `runs` is
/// evaluated to the copy count. Expressions see the job variables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowSpec {
    pub kind: FlowKind,
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub target_else: Option<String>,
    #[serde(default)]
    pub continuation: Option<String>,
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub runs: Option<String>,
    #[serde(default)]
    pub cron: Option<String>,
}
