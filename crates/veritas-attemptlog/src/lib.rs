//! C1 Attempt Log Writer: an append-only markdown log per (task, attempt).
//! Writes are serialized per file so concurrent appends to the same
//! attempt's log never interleave bytes; different attempts proceed fully
//! in parallel.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use veritas_types::{OutputKind, VeritasError};

type Result<T> = std::result::Result<T, VeritasError>;
type FileKey = (String, String);

#[derive(Clone)]
pub struct AttemptLogWriter {
    root: PathBuf,
    locks: Arc<RwLock<HashMap<FileKey, Arc<Mutex<()>>>>>,
}

impl AttemptLogWriter {
    /// `root` is the `<root>/.veritas-kanban` directory; logs land in its
    /// `logs/` subdirectory.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            locks: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    fn path_for(&self, task_id: &str, attempt_id: &str) -> PathBuf {
        self.root.join("logs").join(format!("{task_id}_{attempt_id}.md"))
    }

    async fn lock_for(&self, task_id: &str, attempt_id: &str) -> Arc<Mutex<()>> {
        let key = (task_id.to_string(), attempt_id.to_string());
        if let Some(lock) = self.locks.read().await.get(&key) {
            return lock.clone();
        }
        let mut locks = self.locks.write().await;
        locks
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Writes the fixed markdown header for a new attempt. Truncates any
    /// previous content at this path (attempt ids are unique per run, so in
    /// practice this only ever creates the file).
    pub async fn init_log(
        &self,
        task_id: &str,
        task_title: &str,
        attempt_id: &str,
        agent: &str,
        worktree_path: &str,
        prompt: &str,
        started: DateTime<Utc>,
    ) -> Result<()> {
        let path = self.path_for(task_id, attempt_id);
        let lock = self.lock_for(task_id, attempt_id).await;
        let _guard = lock.lock().await;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let header = format!(
            "# {task_title} ({task_id})\n\n\
             - **Attempt:** {attempt_id}\n\
             - **Agent:** {agent}\n\
             - **Started:** {started}\n\
             - **Worktree:** {worktree_path}\n\n\
             ## Prompt\n\n```\n{prompt}\n```\n\n\
             ## Output\n\n"
        );

        write_with_open_options(&path, header.as_bytes(), false).await
    }

    /// Appends one chunk of agent I/O. `stdout`/`stderr` are written raw;
    /// `stdin` is wrapped in a `**You:**` block; `system` lines are written
    /// raw (callers pass a pre-formatted separator).
    ///
    /// I/O errors here are logged and swallowed — best-effort per the
    /// writer's failure contract, never propagated into the supervisor's
    /// main path.
    pub async fn append(&self, task_id: &str, attempt_id: &str, kind: OutputKind, content: &str) {
        let path = self.path_for(task_id, attempt_id);
        let lock = self.lock_for(task_id, attempt_id).await;
        let _guard = lock.lock().await;

        let formatted = match kind {
            OutputKind::Stdout | OutputKind::Stderr => content.to_string(),
            OutputKind::Stdin => format!("\n**You:**\n{content}\n"),
            OutputKind::System => content.to_string(),
        };

        if let Err(err) = write_with_open_options(&path, formatted.as_bytes(), true).await {
            tracing::warn!(task_id, attempt_id, error = %err, "attempt log append failed");
        }
    }

    /// Appends the fixed exit trailer line.
    pub async fn append_exit_line(&self, task_id: &str, attempt_id: &str, exit_code: i32, signal: Option<&str>) {
        let line = match signal {
            Some(sig) => format!("\n---\nAgent exited with code {exit_code} (signal: {sig})\n"),
            None => format!("\n---\nAgent exited with code {exit_code}\n"),
        };
        self.append(task_id, attempt_id, OutputKind::System, &line).await;
    }

    /// Returns the full log contents. `NotFound`-shaped errors surface as
    /// `VeritasError::LogNotFound` rather than a raw I/O error.
    pub async fn read(&self, task_id: &str, attempt_id: &str) -> Result<String> {
        let path = self.path_for(task_id, attempt_id);
        match tokio::fs::read_to_string(&path).await {
            Ok(contents) => Ok(contents),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(VeritasError::LogNotFound(task_id.to_string(), attempt_id.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }
}

async fn write_with_open_options(path: &Path, bytes: &[u8], append: bool) -> Result<()> {
    let mut options = OpenOptions::new();
    options.create(true).write(true);
    if append {
        options.append(true);
    } else {
        options.truncate(true);
    }
    let mut file = options.open(path).await?;
    file.write_all(bytes).await?;
    file.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_root() -> PathBuf {
        std::env::temp_dir().join(format!("veritas-attemptlog-{}", uuid::Uuid::new_v4()))
    }

    #[tokio::test]
    async fn init_then_append_round_trips() {
        let root = temp_root();
        let writer = AttemptLogWriter::new(&root);
        writer
            .init_log("t1", "Fix the bug", "attempt_1", "claude-code", "/work/t1", "do the thing", Utc::now())
            .await
            .unwrap();
        writer.append("t1", "attempt_1", OutputKind::Stdout, "hello\n").await;
        writer.append("t1", "attempt_1", OutputKind::Stdin, "go on").await;
        writer.append_exit_line("t1", "attempt_1", 0, None).await;

        let contents = writer.read("t1", "attempt_1").await.unwrap();
        assert!(contents.contains("do the thing"));
        assert!(contents.contains("hello\n"));
        assert!(contents.contains("**You:**\ngo on"));
        assert!(contents.contains("Agent exited with code 0"));
    }

    #[tokio::test]
    async fn read_missing_log_is_not_found() {
        let root = temp_root();
        let writer = AttemptLogWriter::new(&root);
        let err = writer.read("missing", "missing").await.unwrap_err();
        assert!(matches!(err, VeritasError::LogNotFound(_, _)));
    }

    #[tokio::test]
    async fn concurrent_appends_do_not_interleave() {
        let root = temp_root();
        let writer = AttemptLogWriter::new(&root);
        writer
            .init_log("t1", "Task", "attempt_1", "agent", "/work", "prompt", Utc::now())
            .await
            .unwrap();

        let mut handles = Vec::new();
        for i in 0..20 {
            let writer = writer.clone();
            handles.push(tokio::spawn(async move {
                let line = format!("{}\n", "x".repeat(i + 1));
                writer.append("t1", "attempt_1", OutputKind::Stdout, &line).await;
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let contents = writer.read("t1", "attempt_1").await.unwrap();
        // every appended line must appear intact and newline-terminated;
        // interleaving would corrupt the repeated-character runs.
        for i in 0..20 {
            assert!(contents.contains(&format!("{}\n", "x".repeat(i + 1))));
        }
    }
}
