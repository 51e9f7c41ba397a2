//! Minimal in-memory stand-ins for the external collaborators §1 pushes out
//! of core (task-board store, agent configuration, notification delivery).
//! A real deployment wires the core crates into its own task-board/REST
//! layer instead; these exist only so `veritas-engine serve` has something
//! to supervise.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::RwLock;
use veritas_types::interfaces::{AgentConfigProvider, AgentsConfig, AgentDefinition, Notification, NotificationSink, TaskPatch, TaskStore};
use veritas_types::task::Task;
use veritas_types::Result;

pub struct InMemoryTaskStore {
    tasks: RwLock<HashMap<String, Task>>,
}

impl InMemoryTaskStore {
    pub fn seeded() -> Arc<Self> {
        let mut tasks = HashMap::new();
        let demo = Task {
            id: "task_demo".to_string(),
            title: "Wire up the telemetry dashboard".to_string(),
            description: Some("Seed task so `veritas-engine serve` has something to supervise.".to_string()),
            task_type: "code".to_string(),
            status: veritas_types::task::TaskStatus::Todo,
            worktree_path: Some(".".to_string()),
            attempt: None,
            blocked_by: BTreeSet::new(),
            blocked_reason: None,
            project: Some("veritas-kanban".to_string()),
            sprint: Some("sprint-1".to_string()),
        };
        tasks.insert(demo.id.clone(), demo);
        Arc::new(Self { tasks: RwLock::new(tasks) })
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn get_task(&self, id: &str) -> Result<Option<Task>> {
        Ok(self.tasks.read().await.get(id).cloned())
    }

    async fn update_task(&self, id: &str, patch: TaskPatch) -> Result<()> {
        let mut tasks = self.tasks.write().await;
        if let Some(task) = tasks.get_mut(id) {
            if let Some(status) = patch.status {
                task.status = status;
            }
            if let Some(attempt) = patch.attempt {
                task.attempt = Some(attempt);
            }
        }
        Ok(())
    }

    async fn list_tasks(&self) -> Result<Vec<Task>> {
        Ok(self.tasks.read().await.values().cloned().collect())
    }

    async fn list_archived_tasks(&self) -> Result<Vec<Task>> {
        Ok(Vec::new())
    }
}

/// A fixed, non-reloading agent roster. A real task board reads this from
/// its own config file; the core only needs the trait.
pub struct StaticAgentConfig {
    config: AgentsConfig,
}

impl StaticAgentConfig {
    pub fn default_roster() -> Arc<Self> {
        Arc::new(Self {
            config: AgentsConfig {
                default_agent: "claude-code".to_string(),
                agents: vec![
                    AgentDefinition {
                        agent_type: "claude-code".to_string(),
                        command: "claude".to_string(),
                        args: vec!["--print".to_string()],
                        enabled: true,
                        name: "Claude Code".to_string(),
                    },
                    AgentDefinition {
                        agent_type: "amp".to_string(),
                        command: "amp".to_string(),
                        args: vec![],
                        enabled: true,
                        name: "Amp".to_string(),
                    },
                ],
            },
        })
    }
}

#[async_trait]
impl AgentConfigProvider for StaticAgentConfig {
    async fn get_config(&self) -> Result<AgentsConfig> {
        Ok(self.config.clone())
    }
}

/// Prints notifications to the tracing log instead of a chat/webhook
/// destination. Good enough for the demo wiring this binary exists for.
pub struct StdoutNotificationSink;

#[async_trait]
impl NotificationSink for StdoutNotificationSink {
    async fn create_notification(&self, notification: Notification) -> Result<()> {
        tracing::info!(
            kind = %notification.kind,
            task_id = %notification.task_id,
            at = %Utc::now(),
            "{}: {}",
            notification.title,
            notification.message
        );
        Ok(())
    }

    async fn post_webhook(&self, url: &str, payload: Value) -> Result<()> {
        tracing::info!(%url, %payload, "webhook delivery skipped, no outbound sink configured");
        Ok(())
    }
}
