use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One telemetry record. Common header fields live alongside a tagged
/// payload so the on-disk shape stays a flat JSON object per line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryEvent {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "taskId", skip_serializing_if = "Option::is_none", default)]
    pub task_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub project: Option<String>,
    #[serde(flatten)]
    pub payload: TelemetryPayload,
}

/// Historical lines from before the `agent` field existed default to this.
pub fn default_agent_name() -> String {
    "veritas".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TelemetryPayload {
    #[serde(rename = "run.started")]
    RunStarted {
        #[serde(default = "default_agent_name")]
        agent: String,
    },
    #[serde(rename = "run.completed")]
    RunCompleted {
        #[serde(default = "default_agent_name")]
        agent: String,
        #[serde(rename = "durationMs", skip_serializing_if = "Option::is_none", default)]
        duration_ms: Option<i64>,
        #[serde(rename = "exitCode", skip_serializing_if = "Option::is_none", default)]
        exit_code: Option<i32>,
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        error: Option<String>,
    },
    #[serde(rename = "run.error")]
    RunError {
        #[serde(default = "default_agent_name")]
        agent: String,
        error: String,
    },
    #[serde(rename = "run.tokens")]
    RunTokens {
        #[serde(default = "default_agent_name")]
        agent: String,
        #[serde(rename = "inputTokens")]
        input_tokens: i64,
        #[serde(rename = "outputTokens")]
        output_tokens: i64,
        #[serde(rename = "totalTokens", skip_serializing_if = "Option::is_none", default)]
        total_tokens: Option<i64>,
        #[serde(rename = "cacheTokens", skip_serializing_if = "Option::is_none", default)]
        cache_tokens: Option<i64>,
    },
}

impl TelemetryPayload {
    /// Stable type tag, used for logging (e.g. naming a dropped event on queue overflow).
    pub fn type_tag(&self) -> &'static str {
        match self {
            TelemetryPayload::RunStarted { .. } => "run.started",
            TelemetryPayload::RunCompleted { .. } => "run.completed",
            TelemetryPayload::RunError { .. } => "run.error",
            TelemetryPayload::RunTokens { .. } => "run.tokens",
        }
    }

    pub fn agent(&self) -> &str {
        match self {
            TelemetryPayload::RunStarted { agent }
            | TelemetryPayload::RunCompleted { agent, .. }
            | TelemetryPayload::RunError { agent, .. }
            | TelemetryPayload::RunTokens { agent, .. } => agent,
        }
    }

    /// True for `run.error` and `run.completed{success:false}` — the events
    /// the failure alert pipe and failed-runs report care about.
    pub fn is_failure(&self) -> bool {
        match self {
            TelemetryPayload::RunError { .. } => true,
            TelemetryPayload::RunCompleted { success, .. } => !success,
            _ => false,
        }
    }
}

impl TelemetryEvent {
    pub fn type_tag(&self) -> &'static str {
        self.payload.type_tag()
    }
}
