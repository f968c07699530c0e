use std::collections::HashMap;

use evalexpr::{
    ContextWithMutableVariables, DefaultNumericTypes, HashMapContext, build_operator_tree,
};
use serde_json::Value;

use crate::runtime::action::{FlowAction, FlowKind};
use crate::runtime::error::{EngineError, Result};
use crate::runtime::task::Task;

/// Collaborator producing the flow action of a finished task.
pub trait FlowEvaluator: Send + Sync {
    fn evaluate(&self, task: &Task, vars: &HashMap<String, Value>) -> Result<FlowAction>;
}

/// Expression-backed evaluator over the task's declarative
/// [`FlowSpec`](crate::runtime::action::FlowSpec):
/// `condition` and `runs` are evalexpr expressions seeing the job
/// variables.
#[derive(Debug, Default)]
pub struct ExprFlowEvaluator;

impl ExprFlowEvaluator {
    fn eval_bool(task: &Task, expr: &str, vars: &HashMap<String, Value>) -> Result<bool> {
        let ctx = eval_context(vars);
        let compiled = build_operator_tree::<DefaultNumericTypes>(&clean(expr))
            .map_err(|e| eval_error(task, e))?;
        compiled
            .eval_boolean_with_context(&ctx)
            .map_err(|e| eval_error(task, e))
    }

    fn eval_int(task: &Task, expr: &str, vars: &HashMap<String, Value>) -> Result<i64> {
        let ctx = eval_context(vars);
        let compiled = build_operator_tree::<DefaultNumericTypes>(&clean(expr))
            .map_err(|e| eval_error(task, e))?;
        compiled
            .eval_int_with_context(&ctx)
            .map_err(|e| eval_error(task, e))
    }
}

impl FlowEvaluator for ExprFlowEvaluator {
    fn evaluate(&self, task: &Task, vars: &HashMap<String, Value>) -> Result<FlowAction> {
        let Some(flow) = &task.flow else {
            return Ok(FlowAction::Continue);
        };

        match flow.kind {
            FlowKind::If => {
                let target = require(task, "target", &flow.target)?;
                let target_else = require(task, "target_else", &flow.target_else)?;
                let condition = require(task, "condition", &flow.condition)?;
                // the condition is settled here; the action carries the
                // selected branch as its target
                let selected = Self::eval_bool(task, &condition, vars)?;
                let (target, target_else) = if selected {
                    (target, target_else)
                } else {
                    (target_else, target)
                };
                Ok(FlowAction::If {
                    target,
                    target_else,
                    continuation: flow.continuation.clone(),
                })
            }
            FlowKind::Loop => {
                let target = require(task, "target", &flow.target)?;
                let condition = require(task, "condition", &flow.condition)?;
                if Self::eval_bool(task, &condition, vars)? {
                    Ok(FlowAction::Loop {
                        target,
                        cron: flow.cron.clone(),
                    })
                } else {
                    Ok(FlowAction::Continue)
                }
            }
            FlowKind::Replicate => {
                let runs = require(task, "runs", &flow.runs)?;
                let count = Self::eval_int(task, &runs, vars)?;
                Ok(FlowAction::Replicate { count })
            }
        }
    }
}

fn require(task: &Task, field: &str, value: &Option<String>) -> Result<String> {
    value.clone().ok_or_else(|| EngineError::FlowEvaluation {
        task: task.id,
        reason: format!("flow spec is missing '{field}'"),
    })
}

fn eval_error(task: &Task, err: impl std::fmt::Display) -> EngineError {
    EngineError::FlowEvaluation {
        task: task.id,
        reason: err.to_string(),
    }
}

fn clean(expr: &str) -> String {
    expr.replace("${", "").replace('}', "")
}

/// Converts the job variables into an evalexpr context. Nulls, arrays and
/// objects are not representable and are left out.
fn eval_context(vars: &HashMap<String, Value>) -> HashMapContext<DefaultNumericTypes> {
    let mut ctx = HashMapContext::<DefaultNumericTypes>::new();
    for (key, value) in vars {
        let converted = match value {
            Value::String(s) => Some(evalexpr::Value::String(s.clone())),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Some(evalexpr::Value::Int(i))
                } else {
                    n.as_f64().map(evalexpr::Value::Float)
                }
            }
            Value::Bool(b) => Some(evalexpr::Value::Boolean(*b)),
            _ => None,
        };
        if let Some(v) = converted {
            let _ = ctx.set_value(key.clone(), v);
        }
    }
    ctx
}
