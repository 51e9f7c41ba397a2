//! C3 Telemetry Query: streams date-partitioned NDJSON (transparently
//! gunzipping `.gz` files), filters, sorts and truncates.

use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDate, Utc};
use veritas_types::telemetry::TelemetryEvent;

#[derive(Debug, Clone, Default)]
pub struct QueryParams {
    pub types: Option<Vec<String>>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub task_id: Option<String>,
    pub project: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Clone)]
pub struct TelemetryQuery {
    root: PathBuf,
}

impl TelemetryQuery {
    /// `root` is the `<root>/.veritas-kanban` directory; events are read from
    /// its `telemetry/` subdirectory.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn telemetry_dir(&self) -> PathBuf {
        self.root.join("telemetry")
    }

    /// Candidate files whose filename date falls in `[since.date(), until.date()]`
    /// when bounds are given, else every telemetry file. Deliberately cheap:
    /// files outside the range are never opened.
    async fn candidate_files(&self, since: Option<NaiveDate>, until: Option<NaiveDate>) -> Vec<PathBuf> {
        let dir = self.telemetry_dir();
        let mut out = Vec::new();
        let Ok(mut entries) = tokio::fs::read_dir(&dir).await else {
            return out;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some(date) = parse_filename_date(name) else {
                continue;
            };
            if let Some(since) = since {
                if date < since {
                    continue;
                }
            }
            if let Some(until) = until {
                if date > until {
                    continue;
                }
            }
            out.push(path);
        }
        out
    }

    /// Runs the full query pipeline: candidate files → stream-parse → filter
    /// → sort desc by timestamp → truncate to `limit`.
    pub async fn query(&self, params: &QueryParams) -> Vec<TelemetryEvent> {
        let since_date = params.since.map(|d| d.date_naive());
        let until_date = params.until.map(|d| d.date_naive());
        let files = self.candidate_files(since_date, until_date).await;

        let mut events = Vec::new();
        for file in files {
            let lines = match read_lines(&file).await {
                Ok(lines) => lines,
                Err(err) => {
                    tracing::warn!(file = %file.display(), error = %err, "failed to read telemetry file");
                    continue;
                }
            };
            for line in lines {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<TelemetryEvent>(&line) {
                    Ok(event) => events.push(event),
                    Err(err) => {
                        tracing::warn!(file = %file.display(), error = %err, "skipping malformed telemetry line");
                    }
                }
            }
        }

        events.retain(|event| matches_filters(event, params));
        events.sort_by(|a, b| b.timestamp.to_rfc3339().cmp(&a.timestamp.to_rfc3339()));
        if let Some(limit) = params.limit {
            events.truncate(limit);
        }
        events
    }

    /// Queries unbounded and groups by `taskId`, each group sorted desc.
    /// Short-circuits to an empty map for an empty `task_ids`.
    pub async fn bulk_task_events(&self, task_ids: &[String]) -> HashMap<String, Vec<TelemetryEvent>> {
        if task_ids.is_empty() {
            return HashMap::new();
        }
        let wanted: std::collections::HashSet<&String> = task_ids.iter().collect();
        let all = self.query(&QueryParams::default()).await;

        let mut by_task: HashMap<String, Vec<TelemetryEvent>> = HashMap::new();
        for event in all {
            let Some(task_id) = event.task_id.clone() else {
                continue;
            };
            if !wanted.contains(&task_id) {
                continue;
            }
            by_task.entry(task_id).or_default().push(event);
        }
        for events in by_task.values_mut() {
            events.sort_by(|a, b| b.timestamp.to_rfc3339().cmp(&a.timestamp.to_rfc3339()));
        }
        by_task
    }
}

fn matches_filters(event: &TelemetryEvent, params: &QueryParams) -> bool {
    if let Some(types) = &params.types {
        if !types.iter().any(|t| t == event.type_tag()) {
            return false;
        }
    }
    if let Some(since) = params.since {
        if event.timestamp < since {
            return false;
        }
    }
    if let Some(until) = params.until {
        if event.timestamp > until {
            return false;
        }
    }
    if let Some(task_id) = &params.task_id {
        if event.task_id.as_deref() != Some(task_id.as_str()) {
            return false;
        }
    }
    if let Some(project) = &params.project {
        if event.project.as_deref() != Some(project.as_str()) {
            return false;
        }
    }
    true
}

fn parse_filename_date(name: &str) -> Option<NaiveDate> {
    let stripped = name.strip_prefix("events-")?;
    let date_part = stripped.strip_suffix(".ndjson.gz").or_else(|| stripped.strip_suffix(".ndjson"))?;
    NaiveDate::parse_from_str(date_part, "%Y-%m-%d").ok()
}

/// Reads every line of a telemetry file, transparently gunzipping `.gz`
/// files. Runs on a blocking task since `flate2`'s decoder is synchronous.
async fn read_lines(path: &Path) -> std::io::Result<Vec<String>> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || -> std::io::Result<Vec<String>> {
        let raw = std::fs::read(&path)?;
        let text = if path.extension().and_then(|e| e.to_str()) == Some("gz") {
            let mut decoder = flate2::read::GzDecoder::new(&raw[..]);
            let mut out = String::new();
            decoder.read_to_string(&mut out)?;
            out
        } else {
            String::from_utf8_lossy(&raw).into_owned()
        };
        Ok(text.lines().map(|l| l.to_string()).collect())
    })
    .await
    .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?
}

/// Percentile at index `ceil(p/100 * n) - 1`, clamped to `[0, n-1]`. Zero for
/// an empty sequence. `sorted` must already be ascending.
pub fn percentile(sorted: &[f64], p: f64) -> f64 {
    let n = sorted.len();
    if n == 0 {
        return 0.0;
    }
    let idx = ((p / 100.0) * n as f64).ceil() as i64 - 1;
    let idx = idx.clamp(0, n as i64 - 1) as usize;
    sorted[idx]
}

#[cfg(test)]
mod tests {
    use super::*;
    use veritas_types::telemetry::TelemetryPayload;

    fn temp_root() -> PathBuf {
        std::env::temp_dir().join(format!("veritas-telemetry-query-{}", uuid::Uuid::new_v4()))
    }

    async fn write_ndjson(dir: &Path, date: &str, events: &[TelemetryEvent]) {
        tokio::fs::create_dir_all(dir).await.unwrap();
        let mut body = String::new();
        for e in events {
            body.push_str(&serde_json::to_string(e).unwrap());
            body.push('\n');
        }
        tokio::fs::write(dir.join(format!("events-{date}.ndjson")), body).await.unwrap();
    }

    fn event(id: &str, ts: DateTime<Utc>, task_id: Option<&str>) -> TelemetryEvent {
        TelemetryEvent {
            id: id.to_string(),
            timestamp: ts,
            task_id: task_id.map(|s| s.to_string()),
            project: None,
            payload: TelemetryPayload::RunStarted { agent: "claude-code".into() },
        }
    }

    #[tokio::test]
    async fn query_since_filters_by_file_date_and_sorts_desc() {
        let root = temp_root();
        let dir = root.join("telemetry");

        let d1 = DateTime::parse_from_rfc3339("2024-06-01T00:00:00Z").unwrap().with_timezone(&Utc);
        let d2 = DateTime::parse_from_rfc3339("2024-06-02T00:00:00Z").unwrap().with_timezone(&Utc);

        let day1: Vec<TelemetryEvent> = (0..10).map(|i| event(&format!("a{i}"), d1, Some("t1"))).collect();
        let day2: Vec<TelemetryEvent> = (0..5).map(|i| event(&format!("b{i}"), d2, Some("t1"))).collect();
        write_ndjson(&dir, "2024-06-01", &day1).await;
        write_ndjson(&dir, "2024-06-02", &day2).await;

        let query = TelemetryQuery::new(&root);
        let results = query
            .query(&QueryParams { since: Some(d2), ..Default::default() })
            .await;
        assert_eq!(results.len(), 5);
        assert!(results.windows(2).all(|w| w[0].timestamp >= w[1].timestamp));
    }

    #[tokio::test]
    async fn malformed_lines_are_skipped_not_fatal() {
        let root = temp_root();
        let dir = root.join("telemetry");
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let good = event("ok", Utc::now(), Some("t1"));
        let body = format!("not json\n\n{}\n", serde_json::to_string(&good).unwrap());
        tokio::fs::write(dir.join(format!("events-{}.ndjson", Utc::now().format("%Y-%m-%d"))), body)
            .await
            .unwrap();

        let query = TelemetryQuery::new(&root);
        let results = query.query(&QueryParams::default()).await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, "ok");
    }

    #[tokio::test]
    async fn bulk_task_events_groups_and_sorts() {
        let root = temp_root();
        let dir = root.join("telemetry");
        let now = Utc::now();
        let events = vec![
            event("a", now - chrono::Duration::seconds(10), Some("t1")),
            event("b", now, Some("t1")),
            event("c", now, Some("t2")),
        ];
        write_ndjson(&dir, &now.format("%Y-%m-%d").to_string(), &events).await;

        let query = TelemetryQuery::new(&root);
        let grouped = query.bulk_task_events(&["t1".to_string()]).await;
        assert_eq!(grouped.len(), 1);
        assert_eq!(grouped["t1"].len(), 2);
        assert_eq!(grouped["t1"][0].id, "b");
    }

    #[tokio::test]
    async fn bulk_task_events_short_circuits_on_empty_input() {
        let root = temp_root();
        let query = TelemetryQuery::new(&root);
        let grouped = query.bulk_task_events(&[]).await;
        assert!(grouped.is_empty());
    }

    #[test]
    fn percentile_matches_formula() {
        let sorted = vec![1.0, 2.0, 3.0, 4.0, 5.0];
        assert_eq!(percentile(&sorted, 50.0), 3.0);
        assert_eq!(percentile(&sorted, 100.0), 5.0);
        assert_eq!(percentile(&sorted, 1.0), 1.0);
    }

    #[test]
    fn percentile_of_empty_is_zero() {
        assert_eq!(percentile(&[], 50.0), 0.0);
    }
}
