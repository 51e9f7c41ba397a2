//! Collaborators the core depends on but does not own. §1 pushes the
//! task-board store, agent configuration source, and notification delivery
//! out of scope; these traits are the seam an outer service plugs into.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::task::Task;

/// A single configured agent command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDefinition {
    #[serde(rename = "type")]
    pub agent_type: String,
    pub command: String,
    pub args: Vec<String>,
    pub enabled: bool,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentsConfig {
    pub default_agent: String,
    pub agents: Vec<AgentDefinition>,
}

impl AgentsConfig {
    pub fn resolve(&self, agent_type: Option<&str>) -> Option<&AgentDefinition> {
        let wanted = agent_type.unwrap_or(&self.default_agent);
        self.agents.iter().find(|a| a.agent_type == wanted)
    }
}

/// Patch applied to a task record by the projector (C9).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<crate::task::TaskStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempt: Option<crate::task::Attempt>,
}

/// Owned elsewhere; consumed by the Agent Supervisor (C6) and Metrics
/// Aggregator (C7).
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn get_task(&self, id: &str) -> Result<Option<Task>>;
    async fn update_task(&self, id: &str, patch: TaskPatch) -> Result<()>;
    async fn list_tasks(&self) -> Result<Vec<Task>>;
    async fn list_archived_tasks(&self) -> Result<Vec<Task>>;
}

/// Owned elsewhere; consumed by the Agent Supervisor (C6).
#[async_trait]
pub trait AgentConfigProvider: Send + Sync {
    async fn get_config(&self) -> Result<AgentsConfig>;
}

/// A notification destined for the task-board's own notification/chat
/// storage — the core only produces the payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    #[serde(rename = "type")]
    pub kind: String,
    pub title: String,
    pub message: String,
    pub task_id: String,
    pub task_title: Option<String>,
    pub project: Option<String>,
}

/// Owned elsewhere; consumed by the Failure Alert Pipe (C8). Both methods
/// are best-effort from the caller's perspective — failures are swallowed
/// by C8, not retried.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn create_notification(&self, notification: Notification) -> Result<()>;
    async fn post_webhook(&self, url: &str, payload: Value) -> Result<()>;
}
