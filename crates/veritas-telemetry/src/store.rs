//! C2 Telemetry Store: a bounded async write queue draining into
//! date-partitioned NDJSON files, plus the retention/compression sweep.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use tokio::io::AsyncWriteExt;
use tokio::sync::{oneshot, Mutex, Notify};
use veritas_types::telemetry::{TelemetryEvent, TelemetryPayload};
use veritas_types::new_event_id;

/// Depth of the in-process write queue. Chosen to absorb a burst of output
/// from several concurrently running agents without unbounded growth.
pub const MAX_QUEUE_SIZE: usize = 10_000;

#[derive(Debug, Clone, Copy)]
pub struct TelemetryConfig {
    pub enabled: bool,
    pub retention_days: u32,
    pub traces: bool,
    /// 0 disables compression entirely.
    pub compress_after_days: u32,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            retention_days: 30,
            traces: true,
            compress_after_days: 7,
        }
    }
}

enum QueueEntry {
    Event(TelemetryEvent, oneshot::Sender<()>),
    Barrier(oneshot::Sender<()>),
}

#[derive(Clone)]
pub struct TelemetryStore {
    root: PathBuf,
    config: TelemetryConfig,
    queue: Arc<Mutex<VecDeque<QueueEntry>>>,
    notify: Arc<Notify>,
}

impl TelemetryStore {
    /// `root` is the `<root>/.veritas-kanban` directory; events land in its
    /// `telemetry/` subdirectory. Spawns the dedicated writer task.
    pub fn new(root: impl Into<PathBuf>, config: TelemetryConfig) -> Self {
        let store = Self {
            root: root.into(),
            config,
            queue: Arc::new(Mutex::new(VecDeque::new())),
            notify: Arc::new(Notify::new()),
        };
        let telemetry_dir = store.telemetry_dir();
        let queue = store.queue.clone();
        let notify = store.notify.clone();
        tokio::spawn(async move {
            run_writer(telemetry_dir, queue, notify).await;
        });
        store
    }

    fn telemetry_dir(&self) -> PathBuf {
        self.root.join("telemetry")
    }

    /// Assigns `id`/`timestamp` and enqueues the event. When disabled,
    /// returns the synthesized event without persisting it. The returned
    /// future resolves once the event has been appended to disk — unless
    /// the queue was full and this event's predecessor had to be dropped,
    /// in which case the dropped caller's `emit` still resolves (it is
    /// logged via `QueueOverflow`, never left to hang).
    pub async fn emit(
        &self,
        payload: TelemetryPayload,
        task_id: Option<String>,
        project: Option<String>,
    ) -> TelemetryEvent {
        let event = TelemetryEvent {
            id: new_event_id(),
            timestamp: Utc::now(),
            task_id,
            project,
            payload,
        };

        if !self.config.enabled {
            return event;
        }

        let (tx, rx) = oneshot::channel();
        {
            let mut queue = self.queue.lock().await;
            if queue.len() >= MAX_QUEUE_SIZE {
                if let Some(QueueEntry::Event(dropped, ack)) = queue.pop_front() {
                    tracing::warn!(event_type = dropped.type_tag(), "telemetry queue overflow, dropped oldest event");
                    let _ = ack.send(());
                }
            }
            queue.push_back(QueueEntry::Event(event.clone(), tx));
        }
        self.notify.notify_one();
        let _ = rx.await;
        event
    }

    /// Awaits drain of every event enqueued before this call.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        self.queue.lock().await.push_back(QueueEntry::Barrier(tx));
        self.notify.notify_one();
        let _ = rx.await;
    }

    /// Runs the retention-delete and compression sweep once. Call at
    /// startup and on a periodic scheduled tick.
    pub async fn run_retention_sweep(&self) -> std::io::Result<()> {
        let dir = self.telemetry_dir();
        tokio::fs::create_dir_all(&dir).await?;
        let today = Utc::now().date_naive();

        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some(date) = parse_events_filename_date(name) else {
                continue;
            };
            let age_days = (today - date).num_days();

            if age_days > self.config.retention_days as i64 {
                let _ = tokio::fs::remove_file(&path).await;
                continue;
            }

            if self.config.compress_after_days > 0
                && age_days > self.config.compress_after_days as i64
                && !name.ends_with(".gz")
            {
                if let Err(err) = compress_file(&path).await {
                    tracing::warn!(file = %path.display(), error = %err, "telemetry compression failed");
                }
            }
        }

        Ok(())
    }
}

async fn run_writer(dir: PathBuf, queue: Arc<Mutex<VecDeque<QueueEntry>>>, notify: Arc<Notify>) {
    if let Err(err) = tokio::fs::create_dir_all(&dir).await {
        tracing::error!(error = %err, "telemetry writer could not create directory");
    }
    loop {
        let next = queue.lock().await.pop_front();
        match next {
            Some(QueueEntry::Event(event, ack)) => {
                if let Err(err) = append_event(&dir, &event).await {
                    tracing::warn!(error = %err, event_id = %event.id, "telemetry write failed");
                }
                let _ = ack.send(());
            }
            Some(QueueEntry::Barrier(ack)) => {
                let _ = ack.send(());
            }
            None => {
                notify.notified().await;
            }
        }
    }
}

async fn append_event(dir: &Path, event: &TelemetryEvent) -> std::io::Result<()> {
    let date = event.timestamp.date_naive();
    let path = dir.join(format!("events-{}.ndjson", date.format("%Y-%m-%d")));
    let mut line =
        serde_json::to_string(event).map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
    line.push('\n');

    let mut file = tokio::fs::OpenOptions::new().create(true).append(true).open(&path).await?;
    file.write_all(line.as_bytes()).await?;
    file.flush().await?;
    Ok(())
}

/// Parses `events-YYYY-MM-DD.ndjson` or the `.gz` variant. Any other name
/// (or malformed date) is ignored by the sweep.
fn parse_events_filename_date(name: &str) -> Option<NaiveDate> {
    let stripped = name.strip_prefix("events-")?;
    let date_part = stripped.strip_suffix(".ndjson.gz").or_else(|| stripped.strip_suffix(".ndjson"))?;
    NaiveDate::parse_from_str(date_part, "%Y-%m-%d").ok()
}

async fn compress_file(path: &Path) -> std::io::Result<()> {
    let raw = tokio::fs::read(path).await?;
    let gz_path = {
        let mut p = path.to_path_buf();
        let new_name = format!("{}.gz", p.file_name().and_then(|n| n.to_str()).unwrap_or_default());
        p.set_file_name(new_name);
        p
    };

    let compressed = tokio::task::spawn_blocking(move || -> std::io::Result<Vec<u8>> {
        use flate2::write::GzEncoder;
        use flate2::Compression;
        use std::io::Write;
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&raw)?;
        encoder.finish()
    })
    .await
    .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))??;

    tokio::fs::write(&gz_path, compressed).await?;
    tokio::fs::remove_file(path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use veritas_types::telemetry::TelemetryPayload;

    fn temp_root() -> PathBuf {
        std::env::temp_dir().join(format!("veritas-telemetry-store-{}", uuid::Uuid::new_v4()))
    }

    #[tokio::test]
    async fn emit_then_flush_persists_one_line_per_event() {
        let root = temp_root();
        let store = TelemetryStore::new(&root, TelemetryConfig::default());

        for _ in 0..5 {
            store
                .emit(TelemetryPayload::RunStarted { agent: "claude-code".into() }, Some("t1".into()), None)
                .await;
        }
        store.flush().await;

        let today = Utc::now().date_naive().format("%Y-%m-%d").to_string();
        let path = root.join("telemetry").join(format!("events-{today}.ndjson"));
        let contents = tokio::fs::read_to_string(path).await.unwrap();
        assert_eq!(contents.lines().count(), 5);
        for line in contents.lines() {
            assert!(serde_json::from_str::<TelemetryEvent>(line).is_ok());
        }
    }

    #[tokio::test]
    async fn disabled_store_does_not_persist() {
        let root = temp_root();
        let config = TelemetryConfig { enabled: false, ..TelemetryConfig::default() };
        let store = TelemetryStore::new(&root, config);
        let event = store
            .emit(TelemetryPayload::RunStarted { agent: "agent".into() }, None, None)
            .await;
        assert!(!event.id.is_empty());
        store.flush().await;
        assert!(!root.join("telemetry").exists() || tokio::fs::read_dir(root.join("telemetry")).await.unwrap().next_entry().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn retention_sweep_deletes_and_compresses_by_filename_date() {
        let root = temp_root();
        let dir = root.join("telemetry");
        tokio::fs::create_dir_all(&dir).await.unwrap();

        let today = Utc::now().date_naive();
        let d1 = today - chrono::Duration::days(1);
        let d8 = today - chrono::Duration::days(8);
        let d40 = today - chrono::Duration::days(40);

        for d in [d1, d8, d40] {
            let path = dir.join(format!("events-{}.ndjson", d.format("%Y-%m-%d")));
            tokio::fs::write(path, "{}\n").await.unwrap();
        }

        let store = TelemetryStore::new(
            &root,
            TelemetryConfig { retention_days: 30, compress_after_days: 7, ..TelemetryConfig::default() },
        );
        store.run_retention_sweep().await.unwrap();

        assert!(dir.join(format!("events-{}.ndjson", d1.format("%Y-%m-%d"))).exists());
        assert!(dir.join(format!("events-{}.ndjson.gz", d8.format("%Y-%m-%d"))).exists());
        assert!(!dir.join(format!("events-{}.ndjson", d40.format("%Y-%m-%d"))).exists());
        assert!(!dir.join(format!("events-{}.ndjson.gz", d40.format("%Y-%m-%d"))).exists());
    }
}
