use thiserror::Error;

/// Error taxonomy the core distinguishes. Precondition errors (the first
/// block) propagate to callers; the rest are logged at the point they occur
/// and never surface across an await boundary into a caller's `Result`.
#[derive(Debug, Error)]
pub enum VeritasError {
    #[error("task {0} not found")]
    TaskNotFound(String),
    #[error("task {0} is not a code task")]
    TaskNotCode(String),
    #[error("task {0} has no worktree")]
    NoWorktree(String),
    #[error("agent already running for task {0}")]
    AgentAlreadyRunning(String),
    #[error("agent {0} is not configured")]
    AgentNotConfigured(String),
    #[error("agent {0} is disabled")]
    AgentDisabled(String),
    #[error("no live agent for task {0}")]
    NoLiveAgent(String),
    #[error("stdin is not writable for task {0}")]
    StdinNotWritable(String),
    #[error("failed to spawn agent process: {0}")]
    SpawnFailed(String),
    #[error("attempt log not found for task {0} attempt {1}")]
    LogNotFound(String, String),
    #[error("telemetry write failed: {0}")]
    TelemetryWriteFailed(String),
    #[error("trace write failed: {0}")]
    TraceWriteFailed(String),
    #[error("telemetry queue overflow, dropped event of type {0}")]
    QueueOverflow(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, VeritasError>;
