use serde::Serialize;

use crate::runtime::task::TaskId;

/// Accumulator of the tasks touched by one resolver invocation, handed to
/// the notification sink exactly once and cleared afterwards.
///
/// A task recorded as added is never also recorded as updated.
#[derive(Debug, Default, Clone, Serialize)]
pub struct ChangeSet {
    pub added: Vec<TaskId>,
    pub updated: Vec<TaskId>,
    pub skipped: Vec<TaskId>,
}

impl ChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn task_added(&mut self, id: TaskId) {
        if !self.added.contains(&id) {
            self.added.push(id);
        }
        self.updated.retain(|t| *t != id);
    }

    pub fn task_updated(&mut self, id: TaskId) {
        if !self.added.contains(&id) && !self.updated.contains(&id) {
            self.updated.push(id);
        }
    }

    pub fn task_skipped(&mut self, id: TaskId) {
        if !self.skipped.contains(&id) {
            self.skipped.push(id);
        }
        self.task_updated(id);
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.skipped.is_empty()
    }
}
