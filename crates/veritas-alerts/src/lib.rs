//! C8 Failure Alert Pipe: taps the telemetry stream synchronously at emit
//! time and forwards one deduplicated alert per task to an external
//! notification sink.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use veritas_types::interfaces::{Notification, NotificationSink};
use veritas_types::telemetry::{TelemetryEvent, TelemetryPayload};

const DEDUP_SWEEP_THRESHOLD: usize = 100;
const ERROR_TRUNCATE_LEN: usize = 200;

#[derive(Debug, Clone)]
pub struct AlertConfig {
    /// `notifications.onAgentFailure` feature flag.
    pub enabled: bool,
    pub dedup_window: chrono::Duration,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self { enabled: true, dedup_window: chrono::Duration::minutes(5) }
    }
}

#[derive(Clone)]
pub struct FailureAlertPipe {
    config: AlertConfig,
    sink: Arc<dyn NotificationSink>,
    last_alert: Arc<Mutex<HashMap<String, DateTime<Utc>>>>,
}

impl FailureAlertPipe {
    pub fn new(config: AlertConfig, sink: Arc<dyn NotificationSink>) -> Self {
        Self { config, sink, last_alert: Arc::new(Mutex::new(HashMap::new())) }
    }

    /// Call once per telemetry emit. A no-op unless `event` is a failure
    /// (`run.error`, or `run.completed` with `success=false`) carrying a
    /// `taskId`. `task_title` falls back to the `taskId` when unset.
    pub async fn on_event(&self, event: &TelemetryEvent, task_title: Option<String>, project: Option<String>) {
        if !self.config.enabled || !event.payload.is_failure() {
            return;
        }
        let Some(task_id) = event.task_id.clone() else {
            return;
        };

        let mut map = self.last_alert.lock().await;
        let now = event.timestamp;
        if let Some(last) = map.get(&task_id) {
            if now - *last < self.config.dedup_window {
                return;
            }
        }
        map.insert(task_id.clone(), now);

        if map.len() > DEDUP_SWEEP_THRESHOLD {
            let window = self.config.dedup_window;
            map.retain(|_, last| now - *last < window);
        }
        drop(map);

        let agent = event.payload.agent().to_string();
        let error = failure_message(&event.payload);
        let title = task_title.unwrap_or_else(|| task_id.clone());

        let notification = Notification {
            kind: "agent-failure".to_string(),
            title: format!("{agent} failed on {title}"),
            message: truncate(&error, ERROR_TRUNCATE_LEN),
            task_id: task_id.clone(),
            task_title: Some(title),
            project,
        };

        if let Err(err) = self.sink.create_notification(notification).await {
            tracing::warn!(task_id, error = %err, "failed to deliver failure alert");
        }
    }
}

fn failure_message(payload: &TelemetryPayload) -> String {
    match payload {
        TelemetryPayload::RunError { error, .. } => error.clone(),
        TelemetryPayload::RunCompleted { error, .. } => error.clone().unwrap_or_default(),
        _ => String::new(),
    }
}

fn truncate(text: &str, max_len: usize) -> String {
    if text.chars().count() <= max_len {
        return text.to_string();
    }
    let truncated: String = text.chars().take(max_len).collect();
    format!("{truncated}...")
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::Value;
    use tokio::sync::Mutex as AsyncMutex;

    struct RecordingSink {
        notifications: Arc<AsyncMutex<Vec<Notification>>>,
    }

    #[async_trait]
    impl NotificationSink for RecordingSink {
        async fn create_notification(&self, notification: Notification) -> veritas_types::Result<()> {
            self.notifications.lock().await.push(notification);
            Ok(())
        }
        async fn post_webhook(&self, _url: &str, _payload: Value) -> veritas_types::Result<()> {
            Ok(())
        }
    }

    fn run_error_event(task_id: &str, ts: DateTime<Utc>) -> TelemetryEvent {
        TelemetryEvent {
            id: format!("evt_{ts}"),
            timestamp: ts,
            task_id: Some(task_id.to_string()),
            project: None,
            payload: TelemetryPayload::RunError { agent: "claude-code".to_string(), error: "boom".repeat(100) },
        }
    }

    #[tokio::test]
    async fn dedup_window_suppresses_second_alert() {
        let notifications = Arc::new(AsyncMutex::new(Vec::new()));
        let sink = Arc::new(RecordingSink { notifications: notifications.clone() });
        let pipe = FailureAlertPipe::new(AlertConfig::default(), sink);

        let t0 = Utc::now();
        pipe.on_event(&run_error_event("t1", t0), Some("Task One".into()), None).await;
        pipe.on_event(&run_error_event("t1", t0 + chrono::Duration::seconds(1)), Some("Task One".into()), None).await;

        assert_eq!(notifications.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn events_past_the_window_each_alert() {
        let notifications = Arc::new(AsyncMutex::new(Vec::new()));
        let sink = Arc::new(RecordingSink { notifications: notifications.clone() });
        let pipe = FailureAlertPipe::new(AlertConfig::default(), sink);

        let t0 = Utc::now();
        pipe.on_event(&run_error_event("t1", t0), None, None).await;
        pipe.on_event(&run_error_event("t1", t0 + chrono::Duration::minutes(6)), None, None).await;

        assert_eq!(notifications.lock().await.len(), 2);
    }

    #[tokio::test]
    async fn error_message_is_truncated() {
        let notifications = Arc::new(AsyncMutex::new(Vec::new()));
        let sink = Arc::new(RecordingSink { notifications: notifications.clone() });
        let pipe = FailureAlertPipe::new(AlertConfig::default(), sink);

        pipe.on_event(&run_error_event("t1", Utc::now()), None, None).await;
        let sent = notifications.lock().await;
        assert!(sent[0].message.ends_with("..."));
        assert!(sent[0].message.len() <= ERROR_TRUNCATE_LEN + 3);
    }

    #[tokio::test]
    async fn disabled_pipe_never_alerts() {
        let notifications = Arc::new(AsyncMutex::new(Vec::new()));
        let sink = Arc::new(RecordingSink { notifications: notifications.clone() });
        let pipe = FailureAlertPipe::new(AlertConfig { enabled: false, ..AlertConfig::default() }, sink);

        pipe.on_event(&run_error_event("t1", Utc::now()), None, None).await;
        assert!(notifications.lock().await.is_empty());
    }
}
