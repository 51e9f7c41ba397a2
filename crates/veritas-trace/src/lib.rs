//! C4 Trace Recorder: an in-memory tree of steps per attempt, persisted as
//! pretty-printed JSON once the attempt completes.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::RwLock;
use veritas_types::{Trace, TraceStatus, TraceStep, TraceStepType};

#[derive(Clone, Copy)]
pub struct TraceConfig {
    pub enabled: bool,
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Clone)]
pub struct TraceRecorder {
    root: PathBuf,
    config: TraceConfig,
    live: Arc<RwLock<HashMap<String, Trace>>>,
}

impl TraceRecorder {
    /// `root` is the `<root>/.veritas-kanban` directory; traces land in its
    /// `traces/` subdirectory.
    pub fn new(root: impl Into<PathBuf>, config: TraceConfig) -> Self {
        Self {
            root: root.into(),
            config,
            live: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    fn path_for(&self, attempt_id: &str) -> PathBuf {
        self.root.join("traces").join(format!("{attempt_id}.json"))
    }

    pub async fn start_trace(
        &self,
        attempt_id: &str,
        task_id: &str,
        agent: &str,
        project: Option<String>,
    ) -> Option<Trace> {
        if !self.config.enabled {
            return None;
        }
        let trace = Trace {
            trace_id: attempt_id.to_string(),
            task_id: task_id.to_string(),
            agent: agent.to_string(),
            project,
            started_at: Utc::now(),
            ended_at: None,
            total_duration_ms: None,
            status: TraceStatus::Running,
            steps: Vec::new(),
        };
        self.live.write().await.insert(attempt_id.to_string(), trace.clone());
        Some(trace)
    }

    pub async fn start_step(
        &self,
        attempt_id: &str,
        step_type: TraceStepType,
        metadata: HashMap<String, serde_json::Value>,
    ) -> Option<()> {
        if !self.config.enabled {
            return None;
        }
        let mut live = self.live.write().await;
        let trace = live.get_mut(attempt_id)?;
        trace.steps.push(TraceStep {
            step_type,
            started_at: Utc::now(),
            ended_at: None,
            duration_ms: None,
            metadata,
        });
        Some(())
    }

    /// Closes the most recently opened step of `step_type` (reverse scan,
    /// stop at the first match whose `ended_at` is unset). A no-op, not an
    /// error, if no such step exists — by design.
    pub async fn end_step(&self, attempt_id: &str, step_type: TraceStepType) -> Option<()> {
        if !self.config.enabled {
            return None;
        }
        let mut live = self.live.write().await;
        let trace = live.get_mut(attempt_id)?;
        let now = Utc::now();
        if let Some(step) = trace
            .steps
            .iter_mut()
            .rev()
            .find(|s| s.step_type == step_type && s.ended_at.is_none())
        {
            step.ended_at = Some(now);
            step.duration_ms = Some((now - step.started_at).num_milliseconds());
        }
        Some(())
    }

    /// Closes any still-open steps, sets `total_duration_ms`, persists the
    /// trace to disk, and removes it from memory.
    pub async fn complete_trace(&self, attempt_id: &str, status: TraceStatus) -> Option<Trace> {
        if !self.config.enabled {
            return None;
        }
        let mut trace = {
            let mut live = self.live.write().await;
            live.remove(attempt_id)?
        };

        let ended = Utc::now();
        for step in trace.steps.iter_mut().filter(|s| s.ended_at.is_none()) {
            step.ended_at = Some(ended);
            step.duration_ms = Some((ended - step.started_at).num_milliseconds());
        }
        trace.ended_at = Some(ended);
        trace.total_duration_ms = Some((ended - trace.started_at).num_milliseconds());
        trace.status = status;

        if let Err(err) = self.persist(&trace).await {
            tracing::warn!(attempt_id, error = %err, "trace write failed");
        }

        Some(trace)
    }

    async fn persist(&self, trace: &Trace) -> anyhow::Result<()> {
        let path = self.path_for(&trace.trace_id);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_string_pretty(trace)?;
        tokio::fs::write(path, json).await?;
        Ok(())
    }

    /// Looks up an in-flight trace first, falling back to the persisted
    /// file. Reads still succeed when tracing is disabled.
    pub async fn get_trace(&self, attempt_id: &str) -> Option<Trace> {
        if let Some(trace) = self.live.read().await.get(attempt_id).cloned() {
            return Some(trace);
        }
        self.read_persisted(attempt_id).await
    }

    async fn read_persisted(&self, attempt_id: &str) -> Option<Trace> {
        let path = self.path_for(attempt_id);
        let raw = tokio::fs::read_to_string(path).await.ok()?;
        serde_json::from_str(&raw).ok()
    }

    /// Unions in-memory and on-disk traces for `task_id`, skipping any
    /// on-disk entry whose attempt is still live, sorted by `started_at`
    /// descending.
    pub async fn list_traces(&self, task_id: &str) -> Vec<Trace> {
        let live = self.live.read().await;
        let mut out: Vec<Trace> = live.values().filter(|t| t.task_id == task_id).cloned().collect();
        let live_ids: std::collections::HashSet<&String> = live.keys().collect();

        let dir = self.root.join("traces");
        if let Ok(mut entries) = tokio::fs::read_dir(&dir).await {
            while let Ok(Some(entry)) = entries.next_entry().await {
                let path = entry.path();
                let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                    continue;
                };
                if live_ids.contains(&stem.to_string()) {
                    continue;
                }
                if let Some(trace) = self.read_persisted(stem).await {
                    if trace.task_id == task_id {
                        out.push(trace);
                    }
                }
            }
        }

        out.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        out
    }
}
