//! C6 Agent Supervisor: process lifecycle, stdio piping, state transitions.
//! Owns the process-wide "one live agent per task" registry and wires every
//! other core component (C1 log, C2 telemetry, C4 trace, C5 bus, C9
//! projector) around a spawned child's lifetime.

pub mod projector;

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{Mutex, RwLock};

use veritas_attemptlog::AttemptLogWriter;
use veritas_eventbus::EventBus;
use veritas_telemetry::store::TelemetryStore;
use veritas_trace::TraceRecorder;
use veritas_types::interfaces::{AgentConfigProvider, TaskPatch, TaskStore};
use veritas_types::task::{Attempt, AttemptStatus, TaskStatus};
use veritas_types::telemetry::TelemetryPayload;
use veritas_types::trace::{TraceStatus, TraceStepType};
use veritas_types::{new_attempt_id, BusEvent, OutputKind, Result, VeritasError};

const STDIN_PIPED_AGENTS: &[&str] = &["claude-code", "amp"];
const STOP_GRACE: std::time::Duration = std::time::Duration::from_secs(5);

/// Snapshot returned from `startAgent`/`agentStatus`.
#[derive(Debug, Clone)]
pub struct AgentStatus {
    pub task_id: String,
    pub attempt_id: String,
    pub agent: String,
    pub status: AttemptStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
}

enum RunningAgent {
    /// Reserved slot between the at-most-one check and a successful spawn.
    Starting,
    Running(RunningEntry),
}

struct RunningEntry {
    attempt_id: String,
    agent: String,
    project: Option<String>,
    started_at: DateTime<Utc>,
    pid: u32,
    stdin: Option<Arc<Mutex<ChildStdin>>>,
}

#[derive(Clone)]
pub struct Supervisor {
    running: Arc<RwLock<HashMap<String, RunningAgent>>>,
    bus: EventBus,
    log: AttemptLogWriter,
    trace: TraceRecorder,
    telemetry: TelemetryStore,
    tasks: Arc<dyn TaskStore>,
    agent_config: Arc<dyn AgentConfigProvider>,
    alerts: Option<veritas_alerts::FailureAlertPipe>,
}

impl Supervisor {
    pub fn new(
        bus: EventBus,
        log: AttemptLogWriter,
        trace: TraceRecorder,
        telemetry: TelemetryStore,
        tasks: Arc<dyn TaskStore>,
        agent_config: Arc<dyn AgentConfigProvider>,
    ) -> Self {
        Self {
            running: Arc::new(RwLock::new(HashMap::new())),
            bus,
            log,
            trace,
            telemetry,
            tasks,
            agent_config,
            alerts: None,
        }
    }

    /// Taps C8 onto this supervisor's telemetry emissions. Optional: the
    /// core functions identically with no alert sink configured.
    pub fn with_alerts(mut self, alerts: veritas_alerts::FailureAlertPipe) -> Self {
        self.alerts = Some(alerts);
        self
    }

    pub async fn start_agent(&self, task_id: &str, agent_type: Option<&str>) -> Result<AgentStatus> {
        let task = self
            .tasks
            .get_task(task_id)
            .await?
            .ok_or_else(|| VeritasError::TaskNotFound(task_id.to_string()))?;
        if !task.is_code_task() {
            return Err(VeritasError::TaskNotCode(task_id.to_string()));
        }
        let worktree = task
            .worktree_path
            .clone()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| VeritasError::NoWorktree(task_id.to_string()))?;

        let agents_config = self.agent_config.get_config().await?;
        let agent_def = agents_config
            .resolve(agent_type)
            .cloned()
            .ok_or_else(|| {
                VeritasError::AgentNotConfigured(agent_type.unwrap_or(agents_config.default_agent.as_str()).to_string())
            })?;
        if !agent_def.enabled {
            return Err(VeritasError::AgentDisabled(agent_def.agent_type.clone()));
        }

        // Claim the per-task slot before spawning so concurrent startAgent
        // calls for the same task can only ever have one winner.
        {
            let mut running = self.running.write().await;
            if running.contains_key(task_id) {
                return Err(VeritasError::AgentAlreadyRunning(task_id.to_string()));
            }
            running.insert(task_id.to_string(), RunningAgent::Starting);
        }

        let attempt_id = new_attempt_id();
        let started_at = Utc::now();

        self.trace.start_trace(&attempt_id, task_id, &agent_def.agent_type, task.project.clone()).await;
        self.trace
            .start_step(&attempt_id, TraceStepType::Init, metadata(&[("worktreePath", worktree.clone())]))
            .await;

        let prompt = build_prompt(&task);
        let cwd = expand_path(&worktree);

        let mut command = Command::new(&agent_def.command);
        command
            .args(&agent_def.args)
            .current_dir(&cwd)
            .env("FORCE_COLOR", "1")
            .env("TERM", "xterm-256color")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let spawn_result = command.spawn();
        let mut child = match spawn_result {
            Ok(child) => child,
            Err(err) => {
                self.running.write().await.remove(task_id);
                self.fail_unregistered(task_id, task.project.clone(), &attempt_id, &agent_def.agent_type, &err.to_string())
                    .await;
                return Err(VeritasError::SpawnFailed(err.to_string()));
            }
        };

        let pid = child.id().unwrap_or_default();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let mut stdin = child.stdin.take();

        let stdin_handle = if STDIN_PIPED_AGENTS.contains(&agent_def.agent_type.as_str()) {
            if let Some(mut pipe) = stdin.take() {
                let _ = pipe.write_all(prompt.as_bytes()).await;
                let _ = pipe.flush().await;
                drop(pipe); // closes stdin so the agent sees EOF
            }
            None
        } else {
            stdin.take().map(|s| Arc::new(Mutex::new(s)))
        };

        {
            let mut running = self.running.write().await;
            running.insert(
                task_id.to_string(),
                RunningAgent::Running(RunningEntry {
                    attempt_id: attempt_id.clone(),
                    agent: agent_def.agent_type.clone(),
                    project: task.project.clone(),
                    started_at,
                    pid,
                    stdin: stdin_handle,
                }),
            );
        }

        self.log
            .init_log(task_id, &task.title, &attempt_id, &agent_def.agent_type, &cwd.display().to_string(), &prompt, started_at)
            .await
            .ok();

        self.telemetry
            .emit(TelemetryPayload::RunStarted { agent: agent_def.agent_type.clone() }, Some(task_id.to_string()), task.project.clone())
            .await;

        self.trace.end_step(&attempt_id, TraceStepType::Init).await;
        self.trace
            .start_step(&attempt_id, TraceStepType::Execute, metadata(&[("pid", pid.to_string())]))
            .await;

        if let Some(stdout) = stdout {
            self.spawn_pump(stdout, OutputKind::Stdout, task_id.to_string(), attempt_id.clone());
        }
        if let Some(stderr) = stderr {
            self.spawn_pump(stderr, OutputKind::Stderr, task_id.to_string(), attempt_id.clone());
        }

        // Spawn the exit watcher before touching the task store: once the
        // child is registered, its eventual exit must always be observed
        // and the running-map entry reclaimed, even if this patch fails.
        self.spawn_exit_watcher(child, task_id.to_string(), attempt_id.clone());

        if let Err(err) = self
            .tasks
            .update_task(task_id, projector::on_start(&agent_def.agent_type, &attempt_id, started_at))
            .await
        {
            tracing::warn!(task_id, error = %err, "failed to patch task to in-progress after agent start");
        }

        Ok(AgentStatus {
            task_id: task_id.to_string(),
            attempt_id,
            agent: agent_def.agent_type,
            status: AttemptStatus::Running,
            started_at,
            ended_at: None,
            exit_code: None,
        })
    }

    fn spawn_pump(&self, stream: impl AsyncRead + Unpin + Send + 'static, kind: OutputKind, task_id: String, attempt_id: String) {
        let bus = self.bus.clone();
        let log = self.log.clone();
        tokio::spawn(async move {
            pump_stream(stream, kind, task_id, attempt_id, bus, log).await;
        });
    }

    fn spawn_exit_watcher(&self, mut child: Child, task_id: String, attempt_id: String) {
        let supervisor = self.clone();
        tokio::spawn(async move {
            let wait_result = child.wait().await;
            supervisor.handle_exit(&task_id, &attempt_id, wait_result).await;
        });
    }

    async fn handle_exit(&self, task_id: &str, attempt_id: &str, wait_result: std::io::Result<std::process::ExitStatus>) {
        let entry = {
            let running = self.running.read().await;
            match running.get(task_id) {
                Some(RunningAgent::Running(entry)) if entry.attempt_id == attempt_id => {
                    Some((entry.agent.clone(), entry.project.clone(), entry.started_at))
                }
                _ => None,
            }
        };
        let Some((agent, project, started_at)) = entry else {
            return;
        };

        match wait_result {
            Ok(status) => {
                let ended = Utc::now();
                let code = status.code().unwrap_or(-1);
                let signal = unix_signal_name(&status);
                let duration_ms = (ended - started_at).num_milliseconds();
                let success = code == 0;

                if let Some(task) = self.tasks.get_task(task_id).await.ok().flatten() {
                    if let Some(attempt) = task.attempt.clone() {
                        let _ = self.tasks.update_task(task_id, projector::on_exit(&attempt, code, ended)).await;
                    }
                }

                let telemetry_event = self
                    .telemetry
                    .emit(
                        TelemetryPayload::RunCompleted {
                            agent: agent.clone(),
                            duration_ms: Some(duration_ms),
                            exit_code: Some(code),
                            success,
                            error: None,
                        },
                        Some(task_id.to_string()),
                        project.clone(),
                    )
                    .await;

                if let Some(alerts) = &self.alerts {
                    let task_title = self.tasks.get_task(task_id).await.ok().flatten().map(|t| t.title);
                    alerts.on_event(&telemetry_event, task_title, project.clone()).await;
                }

                self.trace.end_step(attempt_id, TraceStepType::Execute).await;
                self.trace.start_step(attempt_id, TraceStepType::Complete, metadata(&[("exitCode", code.to_string())])).await;
                self.trace.end_step(attempt_id, TraceStepType::Complete).await;
                self.trace
                    .complete_trace(attempt_id, if success { TraceStatus::Completed } else { TraceStatus::Failed })
                    .await;

                self.bus
                    .publish(
                        task_id,
                        BusEvent::Complete {
                            exit_code: Some(code),
                            signal: signal.clone(),
                            status: if success { AttemptStatus::Complete } else { AttemptStatus::Failed },
                        },
                    )
                    .await;

                self.log.append_exit_line(task_id, attempt_id, code, signal.as_deref()).await;
            }
            Err(err) => {
                let ended = Utc::now();
                if let Some(task) = self.tasks.get_task(task_id).await.ok().flatten() {
                    if let Some(attempt) = task.attempt.clone() {
                        let _ = self.tasks.update_task(task_id, projector::on_error(&attempt, ended)).await;
                    }
                }

                let telemetry_event = self
                    .telemetry
                    .emit(TelemetryPayload::RunError { agent: agent.clone(), error: err.to_string() }, Some(task_id.to_string()), project.clone())
                    .await;

                if let Some(alerts) = &self.alerts {
                    let task_title = self.tasks.get_task(task_id).await.ok().flatten().map(|t| t.title);
                    alerts.on_event(&telemetry_event, task_title, project.clone()).await;
                }

                self.trace.start_step(attempt_id, TraceStepType::Error, metadata(&[("message", err.to_string())])).await;
                self.trace.complete_trace(attempt_id, TraceStatus::Error).await;
                self.bus.publish(task_id, BusEvent::Error { message: err.to_string() }).await;
                self.log
                    .append(task_id, attempt_id, OutputKind::System, &format!("\n---\nAgent error: {err}\n"))
                    .await;
            }
        }

        self.running.write().await.remove(task_id);
    }

    /// Cleanup path for a spawn failure, which never registered a live
    /// entry beyond the `Starting` placeholder already removed by the
    /// caller. Still produces the telemetry/trace/bus trail a subscriber
    /// that got in before the failure would expect to see.
    async fn fail_unregistered(&self, task_id: &str, project: Option<String>, attempt_id: &str, agent: &str, message: &str) {
        let telemetry_event = self
            .telemetry
            .emit(TelemetryPayload::RunError { agent: agent.to_string(), error: message.to_string() }, Some(task_id.to_string()), project.clone())
            .await;

        if let Some(alerts) = &self.alerts {
            let task_title = self.tasks.get_task(task_id).await.ok().flatten().map(|t| t.title);
            alerts.on_event(&telemetry_event, task_title, project).await;
        }

        self.trace.start_step(attempt_id, TraceStepType::Error, metadata(&[("message", message.to_string())])).await;
        self.trace.complete_trace(attempt_id, TraceStatus::Error).await;
        self.bus.publish(task_id, BusEvent::Error { message: message.to_string() }).await;
    }

    pub async fn send_message(&self, task_id: &str, message: &str) -> Result<()> {
        let stdin = {
            let running = self.running.read().await;
            match running.get(task_id) {
                Some(RunningAgent::Running(entry)) => entry.stdin.clone(),
                _ => return Err(VeritasError::NoLiveAgent(task_id.to_string())),
            }
        };
        let Some(stdin) = stdin else {
            return Err(VeritasError::StdinNotWritable(task_id.to_string()));
        };

        let attempt_id = {
            let running = self.running.read().await;
            match running.get(task_id) {
                Some(RunningAgent::Running(entry)) => entry.attempt_id.clone(),
                _ => return Err(VeritasError::NoLiveAgent(task_id.to_string())),
            }
        };

        let mut guard = stdin.lock().await;
        guard
            .write_all(format!("{message}\n").as_bytes())
            .await
            .map_err(|_| VeritasError::StdinNotWritable(task_id.to_string()))?;
        guard.flush().await.ok();
        drop(guard);

        self.log.append(task_id, &attempt_id, OutputKind::Stdin, message).await;
        self.bus
            .publish(
                task_id,
                BusEvent::Output { kind: OutputKind::Stdin, content: message.to_string(), timestamp: Utc::now() },
            )
            .await;
        Ok(())
    }

    /// Sends SIGTERM immediately, arms a 5s timer that escalates to SIGKILL
    /// if the entry is still registered, and returns without waiting for
    /// the exit handler to run.
    pub async fn stop_agent(&self, task_id: &str) -> Result<()> {
        let (pid, attempt_id) = {
            let running = self.running.read().await;
            match running.get(task_id) {
                Some(RunningAgent::Running(entry)) => (entry.pid, entry.attempt_id.clone()),
                _ => return Err(VeritasError::NoLiveAgent(task_id.to_string())),
            }
        };

        send_sigterm(pid);

        if let Some(task) = self.tasks.get_task(task_id).await.ok().flatten() {
            if let Some(attempt) = task.attempt.clone() {
                let _ = self.tasks.update_task(task_id, projector::on_stop(&attempt, Utc::now())).await;
            }
        }
        self.log.append(task_id, &attempt_id, OutputKind::System, "\n---\nAgent stopped by user\n").await;

        let running = self.running.clone();
        let task_id_owned = task_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(STOP_GRACE).await;
            let still_present = matches!(
                running.read().await.get(&task_id_owned),
                Some(RunningAgent::Running(entry)) if entry.attempt_id == attempt_id
            );
            if still_present {
                send_sigkill(pid);
            }
        });

        Ok(())
    }

    pub async fn agent_status(&self, task_id: &str) -> Option<AgentStatus> {
        let running = self.running.read().await;
        match running.get(task_id) {
            Some(RunningAgent::Running(entry)) => Some(AgentStatus {
                task_id: task_id.to_string(),
                attempt_id: entry.attempt_id.clone(),
                agent: entry.agent.clone(),
                status: AttemptStatus::Running,
                started_at: entry.started_at,
                ended_at: None,
                exit_code: None,
            }),
            _ => None,
        }
    }

    pub async fn attempt_log(&self, task_id: &str, attempt_id: &str) -> Result<String> {
        self.log.read(task_id, attempt_id).await
    }

    pub async fn list_attempts(&self, task_id: &str) -> Vec<String> {
        self.trace
            .list_traces(task_id)
            .await
            .into_iter()
            .map(|t| t.trace_id)
            .collect()
    }
}

fn metadata(pairs: &[(&str, String)]) -> HashMap<String, serde_json::Value> {
    pairs.iter().map(|(k, v)| (k.to_string(), serde_json::Value::String(v.clone()))).collect()
}

async fn pump_stream(
    mut stream: impl AsyncRead + Unpin,
    kind: OutputKind,
    task_id: String,
    attempt_id: String,
    bus: EventBus,
    log: AttemptLogWriter,
) {
    let mut buf = vec![0_u8; 8192];
    loop {
        let read = match stream.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(_) => break,
        };
        let content = String::from_utf8_lossy(&buf[..read]).into_owned();
        let timestamp = Utc::now();
        bus.publish(&task_id, BusEvent::Output { kind, content: content.clone(), timestamp }).await;
        log.append(&task_id, &attempt_id, kind, &content).await;
    }
}

#[cfg(unix)]
fn send_sigterm(pid: u32) {
    send_signal(pid, nix::sys::signal::Signal::SIGTERM);
}

#[cfg(unix)]
fn send_sigkill(pid: u32) {
    send_signal(pid, nix::sys::signal::Signal::SIGKILL);
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: nix::sys::signal::Signal) {
    use nix::unistd::Pid;
    if let Err(err) = nix::sys::signal::kill(Pid::from_raw(pid as i32), signal) {
        tracing::warn!(pid, %signal, %err, "failed to signal agent process");
    }
}

#[cfg(not(unix))]
fn send_sigterm(pid: u32) {
    // No direct PID-signaling primitive on Windows; escalate straight to
    // sigkill's platform fallback instead of leaving the process running.
    send_sigkill(pid);
}

#[cfg(not(unix))]
fn send_sigkill(pid: u32) {
    tracing::warn!(pid, "signal-by-pid is unix-only, relying on the Child handle to reap this process");
}

#[cfg(unix)]
fn unix_signal_name(status: &std::process::ExitStatus) -> Option<String> {
    use std::os::unix::process::ExitStatusExt;
    status.signal().map(|s| nix::sys::signal::Signal::try_from(s).map(|s| s.to_string()).unwrap_or_else(|_| format!("signal {s}")))
}

#[cfg(not(unix))]
fn unix_signal_name(_status: &std::process::ExitStatus) -> Option<String> {
    None
}

/// Builds the fixed agent prompt: title, description (if any), and a fixed
/// instructions paragraph.
fn build_prompt(task: &veritas_types::task::Task) -> String {
    let mut prompt = format!("# {}\n\n", task.title);
    if let Some(description) = &task.description {
        prompt.push_str(description);
        prompt.push_str("\n\n");
    }
    prompt.push_str(
        "## Instructions\n\nImplement the task described above in this working directory. \
         Make focused, well-tested changes and report back when finished.\n",
    );
    prompt
}

/// Expands a leading `~` to `$HOME` and `$VAR`-style environment references
/// inside the rest of the path.
fn expand_path(path: &str) -> PathBuf {
    let home_expanded = if let Some(rest) = path.strip_prefix('~') {
        let home = std::env::var("HOME").unwrap_or_default();
        format!("{home}{rest}")
    } else {
        path.to_string()
    };

    let mut out = String::with_capacity(home_expanded.len());
    let mut chars = home_expanded.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '$' {
            let mut name = String::new();
            while let Some(&next) = chars.peek() {
                if next.is_alphanumeric() || next == '_' {
                    name.push(next);
                    chars.next();
                } else {
                    break;
                }
            }
            if name.is_empty() {
                out.push('$');
            } else {
                out.push_str(&std::env::var(&name).unwrap_or_default());
            }
        } else {
            out.push(c);
        }
    }

    PathBuf::from(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expand_path_handles_home_and_env_vars() {
        std::env::set_var("HOME", "/home/test");
        std::env::set_var("VERITAS_TEST_VAR", "sub");
        assert_eq!(expand_path("~/work"), PathBuf::from("/home/test/work"));
        assert_eq!(expand_path("/abs/$VERITAS_TEST_VAR/path"), PathBuf::from("/abs/sub/path"));
    }

    #[test]
    fn build_prompt_includes_title_and_instructions() {
        let task = veritas_types::task::Task {
            id: "t1".into(),
            title: "Fix the bug".into(),
            description: Some("Users report a crash.".into()),
            task_type: "code".into(),
            status: TaskStatus::Todo,
            worktree_path: Some("/work/t1".into()),
            attempt: None,
            blocked_by: Default::default(),
            blocked_reason: None,
            project: None,
            sprint: None,
        };
        let prompt = build_prompt(&task);
        assert!(prompt.contains("Fix the bug"));
        assert!(prompt.contains("Users report a crash."));
        assert!(prompt.contains("## Instructions"));
    }

    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;
    use veritas_types::interfaces::{AgentDefinition, AgentsConfig};
    use veritas_types::task::Task;

    struct FakeTaskStore {
        tasks: StdMutex<HashMap<String, Task>>,
    }

    impl FakeTaskStore {
        fn with_task(task: Task) -> Arc<Self> {
            let mut map = HashMap::new();
            map.insert(task.id.clone(), task);
            Arc::new(Self { tasks: StdMutex::new(map) })
        }
    }

    #[async_trait]
    impl TaskStore for FakeTaskStore {
        async fn get_task(&self, id: &str) -> Result<Option<Task>> {
            Ok(self.tasks.lock().unwrap().get(id).cloned())
        }
        async fn update_task(&self, id: &str, patch: TaskPatch) -> Result<()> {
            let mut tasks = self.tasks.lock().unwrap();
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
            Ok(self.tasks.lock().unwrap().values().cloned().collect())
        }
        async fn list_archived_tasks(&self) -> Result<Vec<Task>> {
            Ok(Vec::new())
        }
    }

    struct FakeAgentConfig {
        config: AgentsConfig,
    }

    #[async_trait]
    impl AgentConfigProvider for FakeAgentConfig {
        async fn get_config(&self) -> Result<AgentsConfig> {
            Ok(self.config.clone())
        }
    }

    fn code_task(id: &str, worktree: &str) -> Task {
        Task {
            id: id.to_string(),
            title: format!("Task {id}"),
            description: None,
            task_type: "code".to_string(),
            status: TaskStatus::Todo,
            worktree_path: Some(worktree.to_string()),
            attempt: None,
            blocked_by: Default::default(),
            blocked_reason: None,
            project: None,
            sprint: None,
        }
    }

    fn sh_agent_config(script: &str) -> AgentsConfig {
        AgentsConfig {
            default_agent: "shell".to_string(),
            agents: vec![AgentDefinition {
                agent_type: "shell".to_string(),
                command: "/bin/sh".to_string(),
                args: vec!["-c".to_string(), script.to_string()],
                enabled: true,
                name: "Shell".to_string(),
            }],
        }
    }

    fn temp_root() -> PathBuf {
        std::env::temp_dir().join(format!("veritas-supervisor-{}", uuid::Uuid::new_v4()))
    }

    fn build_supervisor(tasks: Arc<FakeTaskStore>, config: AgentsConfig) -> Supervisor {
        let root = temp_root();
        Supervisor::new(
            EventBus::new(),
            AttemptLogWriter::new(&root),
            TraceRecorder::new(&root, Default::default()),
            TelemetryStore::new(&root, Default::default()),
            tasks,
            Arc::new(FakeAgentConfig { config }),
        )
    }

    #[tokio::test]
    async fn s1_happy_path_runs_to_completion() {
        std::fs::create_dir_all("/tmp").ok();
        let tasks = FakeTaskStore::with_task(code_task("t1", "/tmp"));
        let supervisor = build_supervisor(tasks.clone(), sh_agent_config("printf hello"));

        let (mut rx, _sub) = supervisor.bus.subscribe("t1").await;
        let status = supervisor.start_agent("t1", Some("shell")).await.unwrap();
        assert_eq!(status.status, AttemptStatus::Running);

        let mut saw_output = false;
        let mut saw_complete = false;
        for _ in 0..50 {
            match tokio::time::timeout(std::time::Duration::from_millis(200), rx.recv()).await {
                Ok(Some(BusEvent::Output { content, .. })) if content.contains("hello") => saw_output = true,
                Ok(Some(BusEvent::Complete { status, .. })) => {
                    saw_complete = true;
                    assert_eq!(status, AttemptStatus::Complete);
                    break;
                }
                Ok(Some(_)) => {}
                Ok(None) | Err(_) => break,
            }
        }
        assert!(saw_output, "expected stdout output event");
        assert!(saw_complete, "expected a terminal complete event");

        let task = tasks.get_task("t1").await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Review);
    }

    #[tokio::test]
    async fn s2_concurrent_start_conflicts() {
        let tasks = FakeTaskStore::with_task(code_task("t1", "/tmp"));
        let supervisor = build_supervisor(tasks, sh_agent_config("sleep 1"));

        let first = supervisor.start_agent("t1", Some("shell")).await;
        assert!(first.is_ok());
        let second = supervisor.start_agent("t1", Some("shell")).await;
        assert!(matches!(second, Err(VeritasError::AgentAlreadyRunning(_))));

        supervisor.stop_agent("t1").await.ok();
    }

    #[tokio::test]
    async fn s3_stop_agent_sends_sigterm_and_finalizes_failed() {
        let tasks = FakeTaskStore::with_task(code_task("t1", "/tmp"));
        let supervisor = build_supervisor(tasks.clone(), sh_agent_config("trap '' TERM; sleep 30"));

        let (mut rx, _sub) = supervisor.bus.subscribe("t1").await;
        supervisor.start_agent("t1", Some("shell")).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        supervisor.stop_agent("t1").await.unwrap();

        let mut terminal = None;
        for _ in 0..100 {
            match tokio::time::timeout(std::time::Duration::from_millis(200), rx.recv()).await {
                Ok(Some(event @ BusEvent::Complete { .. })) => {
                    terminal = Some(event);
                    break;
                }
                Ok(Some(_)) => {}
                Ok(None) | Err(_) => continue,
            }
        }
        assert!(terminal.is_some(), "expected a terminal event once SIGKILL lands");
    }

    #[tokio::test]
    async fn missing_task_is_rejected() {
        let tasks = FakeTaskStore::with_task(code_task("other", "/tmp"));
        let supervisor = build_supervisor(tasks, sh_agent_config("true"));
        let result = supervisor.start_agent("does-not-exist", None).await;
        assert!(matches!(result, Err(VeritasError::TaskNotFound(_))));
    }

    #[tokio::test]
    async fn disabled_agent_is_rejected() {
        let tasks = FakeTaskStore::with_task(code_task("t1", "/tmp"));
        let mut config = sh_agent_config("true");
        config.agents[0].enabled = false;
        let supervisor = build_supervisor(tasks, config);
        let result = supervisor.start_agent("t1", Some("shell")).await;
        assert!(matches!(result, Err(VeritasError::AgentDisabled(_))));
    }
}
