//! C9 Task-State Projector: pure functions from a supervisor transition to
//! the `TaskPatch` it applies. Kept separate from the process-spawning
//! machinery so the state machine can be driven in tests without spawning
//! anything.

use chrono::{DateTime, Utc};
use veritas_types::interfaces::TaskPatch;
use veritas_types::task::{Attempt, AttemptStatus, TaskStatus};

/// `startAgent` registers the attempt and moves the task to `in-progress`.
pub fn on_start(agent: &str, attempt_id: &str, started: DateTime<Utc>) -> TaskPatch {
    TaskPatch {
        status: Some(TaskStatus::InProgress),
        attempt: Some(Attempt {
            id: attempt_id.to_string(),
            agent: agent.to_string(),
            status: AttemptStatus::Running,
            started,
            ended: None,
            exit_code: None,
        }),
    }
}

/// Child exit, success or failure: task always lands on `review` (spec's
/// current behavior — see the open question in the design notes), attempt
/// becomes `complete` or `failed` depending on the exit code.
pub fn on_exit(prev: &Attempt, exit_code: i32, ended: DateTime<Utc>) -> TaskPatch {
    let status = if exit_code == 0 { AttemptStatus::Complete } else { AttemptStatus::Failed };
    TaskPatch {
        status: Some(TaskStatus::Review),
        attempt: Some(Attempt { status, ended: Some(ended), exit_code: Some(exit_code), ..prev.clone() }),
    }
}

/// `stopAgent`: the attempt is marked `failed` immediately; the task's own
/// status is left alone here (the exit handler that follows SIGTERM/SIGKILL
/// is what moves the task to `review`).
pub fn on_stop(prev: &Attempt, ended: DateTime<Utc>) -> TaskPatch {
    TaskPatch {
        status: None,
        attempt: Some(Attempt { status: AttemptStatus::Failed, ended: Some(ended), ..prev.clone() }),
    }
}

/// Spawn or runtime error: the attempt record is closed out as `error` so
/// it never lingers as `running`. The task's own status is left alone —
/// spec §4.6's error handler does not name a task-status transition the
/// way the exit handler does.
pub fn on_error(prev: &Attempt, ended: DateTime<Utc>) -> TaskPatch {
    TaskPatch {
        status: None,
        attempt: Some(Attempt { status: AttemptStatus::Error, ended: Some(ended), ..prev.clone() }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attempt() -> Attempt {
        Attempt {
            id: "attempt_1".into(),
            agent: "claude-code".into(),
            status: AttemptStatus::Running,
            started: Utc::now(),
            ended: None,
            exit_code: None,
        }
    }

    #[test]
    fn on_start_marks_task_in_progress() {
        let patch = on_start("claude-code", "attempt_1", Utc::now());
        assert_eq!(patch.status, Some(TaskStatus::InProgress));
        assert_eq!(patch.attempt.unwrap().status, AttemptStatus::Running);
    }

    #[test]
    fn on_exit_success_completes_and_reviews() {
        let patch = on_exit(&attempt(), 0, Utc::now());
        assert_eq!(patch.status, Some(TaskStatus::Review));
        assert_eq!(patch.attempt.unwrap().status, AttemptStatus::Complete);
    }

    #[test]
    fn on_exit_failure_fails_and_reviews() {
        let patch = on_exit(&attempt(), 1, Utc::now());
        assert_eq!(patch.status, Some(TaskStatus::Review));
        assert_eq!(patch.attempt.unwrap().status, AttemptStatus::Failed);
    }

    #[test]
    fn on_stop_fails_attempt_without_task_status() {
        let patch = on_stop(&attempt(), Utc::now());
        assert_eq!(patch.status, None);
        assert_eq!(patch.attempt.unwrap().status, AttemptStatus::Failed);
    }

    #[test]
    fn terminal_status_never_reverts_to_running() {
        let patch = on_error(&attempt(), Utc::now());
        assert_ne!(patch.attempt.unwrap().status, AttemptStatus::Running);
    }
}
