use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Todo,
    InProgress,
    Blocked,
    Review,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttemptStatus {
    Running,
    Complete,
    Failed,
    Error,
}

impl AttemptStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, AttemptStatus::Running)
    }
}

/// One supervised run of an agent against a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attempt {
    pub id: String,
    pub agent: String,
    pub status: AttemptStatus,
    pub started: DateTime<Utc>,
    pub ended: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockedReason {
    pub category: String,
}

/// Minimal task record the core reads and patches. Tasks are otherwise owned
/// by an external task-board store (see `interfaces::TaskStore`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    pub description: Option<String>,
    pub task_type: String,
    pub status: TaskStatus,
    pub worktree_path: Option<String>,
    pub attempt: Option<Attempt>,
    pub blocked_by: BTreeSet<String>,
    pub blocked_reason: Option<BlockedReason>,
    pub project: Option<String>,
    pub sprint: Option<String>,
}

impl Task {
    pub fn is_code_task(&self) -> bool {
        self.task_type == "code"
    }
}
