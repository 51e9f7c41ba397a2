//! Shared data model and collaborator contracts for the veritas-kanban engine core.

pub mod error;
pub mod interfaces;
pub mod task;
pub mod telemetry;
pub mod trace;

pub use error::{Result, VeritasError};
pub use task::{Attempt, AttemptStatus, Task, TaskStatus};
pub use telemetry::TelemetryEvent;
pub use trace::{Trace, TraceStatus, TraceStep, TraceStepType};

/// Kind of a single chunk of agent I/O, in arrival order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputKind {
    Stdout,
    Stderr,
    Stdin,
    System,
}

/// One chunk of agent output as it was observed by the supervisor.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct AgentOutputEvent {
    pub kind: OutputKind,
    pub content: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// Events published on the event bus (C5) for a task's live attempt.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type")]
pub enum BusEvent {
    #[serde(rename = "agent:output")]
    Output {
        #[serde(rename = "outputType")]
        kind: OutputKind,
        content: String,
        timestamp: chrono::DateTime<chrono::Utc>,
    },
    #[serde(rename = "agent:complete")]
    Complete {
        #[serde(rename = "exitCode")]
        exit_code: Option<i32>,
        signal: Option<String>,
        status: AttemptStatus,
    },
    #[serde(rename = "agent:error")]
    Error { message: String },
}

pub fn new_attempt_id() -> String {
    format!("attempt_{}", random_suffix(8))
}

pub fn new_event_id() -> String {
    format!("evt_{}", random_suffix(12))
}

fn random_suffix(len: usize) -> String {
    use rand::Rng;
    const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}
