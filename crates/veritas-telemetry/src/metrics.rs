//! C7 Metrics Aggregator: read-only derived counters over the telemetry
//! stream (C3) and the external task store. Every operation is a single
//! streaming pass, branching on event `type`, over the files the requested
//! period touches.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Datelike, Duration as ChronoDuration, Utc};
use serde::Serialize;
use veritas_types::interfaces::TaskStore;
use veritas_types::task::TaskStatus;
use veritas_types::telemetry::TelemetryEvent;
use veritas_types::telemetry::TelemetryPayload;

use crate::query::{percentile, QueryParams, TelemetryQuery};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Period {
    Hours24,
    Days7,
    Days30,
}

impl Period {
    pub fn duration(self) -> ChronoDuration {
        match self {
            Period::Hours24 => ChronoDuration::hours(24),
            Period::Days7 => ChronoDuration::days(7),
            Period::Days30 => ChronoDuration::days(30),
        }
    }

    pub fn start(self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - self.duration()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TrendDirection {
    Up,
    Down,
    Flat,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct Trend {
    pub current: f64,
    pub previous: f64,
    pub change_pct: f64,
    pub direction: TrendDirection,
}

/// `higher_better`: true for runs/successRate, false for tokens/duration
/// (lower is better there, so a rise in value is a `down` trend).
fn compute_trend(current: f64, previous: f64, higher_better: bool) -> Trend {
    let change_pct = if previous == 0.0 {
        if current == 0.0 { 0.0 } else { 100.0 }
    } else {
        ((current - previous) / previous) * 100.0
    };

    let direction = if change_pct.abs() < 5.0 {
        TrendDirection::Flat
    } else if higher_better == (change_pct > 0.0) {
        TrendDirection::Up
    } else {
        TrendDirection::Down
    };

    Trend { current, previous, change_pct, direction }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TaskMetrics {
    pub total: usize,
    pub by_status: HashMap<String, usize>,
    pub blocked_by_reason: HashMap<String, usize>,
    pub completed: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AgentRunBreakdown {
    pub total: usize,
    pub successes: usize,
    pub failures: usize,
    pub success_rate: f64,
    pub error_rate: f64,
    pub avg_duration_ms: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunMetrics {
    pub total: usize,
    pub successes: usize,
    pub failures: usize,
    pub success_rate: f64,
    pub error_rate: f64,
    pub avg_duration_ms: f64,
    pub by_agent: HashMap<String, AgentRunBreakdown>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TokenMetrics {
    pub total_input: i64,
    pub total_output: i64,
    pub total_cache: i64,
    pub total: i64,
    pub avg: f64,
    pub p50: f64,
    pub p95: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AgentDurationBreakdown {
    pub avg_ms: f64,
    pub p50_ms: f64,
    pub p95_ms: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DurationMetrics {
    pub avg_ms: f64,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub by_agent: HashMap<String, AgentDurationBreakdown>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AllMetrics {
    pub runs: RunMetrics,
    pub tokens: TokenMetrics,
    pub durations: DurationMetrics,
}

#[derive(Debug, Clone, Serialize)]
pub struct TrendReport {
    pub runs: Trend,
    pub success_rate: Trend,
    pub total_tokens: Trend,
    pub avg_duration: Trend,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BudgetStatus {
    Ok,
    Warning,
    Danger,
}

#[derive(Debug, Clone, Serialize)]
pub struct BudgetMetrics {
    pub token_budget: i64,
    pub cost_budget: f64,
    pub tokens_used: i64,
    pub cost_used: f64,
    pub tokens_used_pct: f64,
    pub cost_used_pct: f64,
    pub burn_rate_tokens_per_day: f64,
    pub burn_rate_cost_per_day: f64,
    pub projected_tokens: f64,
    pub projected_cost: f64,
    pub projected_tokens_pct: f64,
    pub projected_cost_pct: f64,
    pub status: BudgetStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VelocityTrend {
    Accelerating,
    Slowing,
    Steady,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SprintVelocity {
    pub sprint: String,
    pub completed: usize,
    pub total: usize,
    pub rolling_average: f64,
    pub by_type: HashMap<String, usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct VelocityMetrics {
    pub sprints: Vec<SprintVelocity>,
    pub trend: VelocityTrend,
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentComparisonRecommendation {
    pub agent: String,
    pub value: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AgentComparison {
    pub reliability: Option<AgentComparisonRecommendation>,
    pub speed: Option<AgentComparisonRecommendation>,
    pub cost: Option<AgentComparisonRecommendation>,
    pub efficiency: Option<AgentComparisonRecommendation>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailedRun {
    pub timestamp: DateTime<Utc>,
    pub task_id: Option<String>,
    pub project: Option<String>,
    pub agent: String,
    pub error_message: Option<String>,
    pub duration_ms: Option<i64>,
}

#[derive(Clone)]
pub struct MetricsAggregator {
    query: TelemetryQuery,
    tasks: Arc<dyn TaskStore>,
}

impl MetricsAggregator {
    pub fn new(query: TelemetryQuery, tasks: Arc<dyn TaskStore>) -> Self {
        Self { query, tasks }
    }

    async fn events_since(&self, since: DateTime<Utc>, until: DateTime<Utc>, project: Option<&str>) -> Vec<TelemetryEvent> {
        self.query
            .query(&QueryParams {
                since: Some(since),
                until: Some(until),
                project: project.map(|p| p.to_string()),
                ..Default::default()
            })
            .await
    }

    pub async fn task_metrics(&self, project: Option<&str>) -> veritas_types::Result<TaskMetrics> {
        let mut tasks = self.tasks.list_tasks().await?;
        let archived = self.tasks.list_archived_tasks().await?;
        if let Some(project) = project {
            tasks.retain(|t| t.project.as_deref() == Some(project));
        }
        let archived_count = archived
            .iter()
            .filter(|t| project.is_none() || t.project.as_deref() == project)
            .count();

        let mut by_status: HashMap<String, usize> = HashMap::new();
        let mut blocked_by_reason: HashMap<String, usize> = HashMap::new();
        for task in &tasks {
            *by_status.entry(status_label(task.status).to_string()).or_insert(0) += 1;
            if task.status == TaskStatus::Blocked {
                let category = task
                    .blocked_reason
                    .as_ref()
                    .map(|r| r.category.clone())
                    .unwrap_or_else(|| "unspecified".to_string());
                *blocked_by_reason.entry(category).or_insert(0) += 1;
            }
        }

        let done = *by_status.get("done").unwrap_or(&0);
        Ok(TaskMetrics {
            total: tasks.len(),
            completed: done + archived_count,
            by_status,
            blocked_by_reason,
        })
    }

    pub async fn run_metrics(&self, period: Period, project: Option<&str>) -> RunMetrics {
        let now = Utc::now();
        let events = self.events_since(period.start(now), now, project).await;
        run_metrics_from(&events)
    }

    pub async fn token_metrics(&self, period: Period, project: Option<&str>) -> TokenMetrics {
        let now = Utc::now();
        let events = self.events_since(period.start(now), now, project).await;
        token_metrics_from(&events)
    }

    pub async fn duration_metrics(&self, period: Period, project: Option<&str>) -> DurationMetrics {
        let now = Utc::now();
        let events = self.events_since(period.start(now), now, project).await;
        duration_metrics_from(&events)
    }

    /// Single streaming pass constructing runs/tokens/durations together.
    pub async fn all_metrics(&self, period: Period, project: Option<&str>) -> AllMetrics {
        let now = Utc::now();
        let events = self.events_since(period.start(now), now, project).await;
        AllMetrics {
            runs: run_metrics_from(&events),
            tokens: token_metrics_from(&events),
            durations: duration_metrics_from(&events),
        }
    }

    pub async fn trends(&self, period: Period, project: Option<&str>) -> TrendReport {
        let now = Utc::now();
        let current_start = period.start(now);
        let previous_start = current_start - period.duration();

        let current = self.events_since(current_start, now, project).await;
        let previous = self.events_since(previous_start, current_start, project).await;

        let current_runs = run_metrics_from(&current);
        let previous_runs = run_metrics_from(&previous);
        let current_tokens = token_metrics_from(&current);
        let previous_tokens = token_metrics_from(&previous);

        TrendReport {
            runs: compute_trend(current_runs.total as f64, previous_runs.total as f64, true),
            success_rate: compute_trend(current_runs.success_rate, previous_runs.success_rate, true),
            total_tokens: compute_trend(current_tokens.total as f64, previous_tokens.total as f64, false),
            avg_duration: compute_trend(current_runs.avg_duration_ms, previous_runs.avg_duration_ms, false),
        }
    }

    /// Scoped to the current calendar month, regardless of `period`.
    pub async fn budget_metrics(&self, token_budget: i64, cost_budget: f64, warning_threshold: f64) -> BudgetMetrics {
        let now = Utc::now();
        let month_start = now
            .date_naive()
            .with_day(1)
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(|naive| DateTime::<Utc>::from_naive_utc_and_offset(naive, Utc))
            .unwrap_or(now);

        let events = self.events_since(month_start, now, None).await;
        let tokens = token_metrics_from(&events);
        let cost_used = cost_usd(
            events_input_tokens(&events),
            events_output_tokens(&events),
        );

        let days_elapsed = (now.date_naive() - month_start.date_naive()).num_days().max(0) as f64 + 1.0;
        let days_in_month = days_in_month(now) as f64;

        let burn_tokens = tokens.total as f64 / days_elapsed;
        let burn_cost = cost_used / days_elapsed;
        let projected_tokens = burn_tokens * days_in_month;
        let projected_cost = burn_cost * days_in_month;

        let tokens_used_pct = pct_of(tokens.total as f64, token_budget as f64);
        let cost_used_pct = pct_of(cost_used, cost_budget);
        let projected_tokens_pct = pct_of(projected_tokens, token_budget as f64);
        let projected_cost_pct = pct_of(projected_cost, cost_budget);

        let worst = tokens_used_pct.max(cost_used_pct).max(projected_tokens_pct).max(projected_cost_pct);
        let status = if worst >= 100.0 {
            BudgetStatus::Danger
        } else if worst >= warning_threshold {
            BudgetStatus::Warning
        } else {
            BudgetStatus::Ok
        };

        BudgetMetrics {
            token_budget,
            cost_budget,
            tokens_used: tokens.total,
            cost_used,
            tokens_used_pct,
            cost_used_pct,
            burn_rate_tokens_per_day: burn_tokens,
            burn_rate_cost_per_day: burn_cost,
            projected_tokens,
            projected_cost,
            projected_tokens_pct,
            projected_cost_pct,
            status,
        }
    }

    pub async fn velocity_metrics(&self, limit: usize) -> veritas_types::Result<VelocityMetrics> {
        let tasks = self.tasks.list_tasks().await?;
        let archived = self.tasks.list_archived_tasks().await?;
        let all: Vec<_> = tasks.into_iter().chain(archived).collect();

        let mut by_sprint: HashMap<String, Vec<&veritas_types::task::Task>> = HashMap::new();
        for task in &all {
            let sprint = task.sprint.clone().unwrap_or_else(|| "unassigned".to_string());
            by_sprint.entry(sprint).or_default().push(task);
        }

        let mut sprints: Vec<(String, Vec<&veritas_types::task::Task>)> = by_sprint.into_iter().collect();
        sprints.sort_by_key(|(label, _)| sprint_number(label));

        let mut rolling_window: Vec<f64> = Vec::new();
        let mut out = Vec::new();
        for (sprint, members) in &sprints {
            let completed = members.iter().filter(|t| t.status == TaskStatus::Done).count();
            let total = members.len();
            rolling_window.push(completed as f64);
            if rolling_window.len() > 3 {
                rolling_window.remove(0);
            }
            let rolling_average = rolling_window.iter().sum::<f64>() / rolling_window.len() as f64;

            let mut by_type: HashMap<String, usize> = HashMap::new();
            for t in members {
                *by_type.entry(t.task_type.clone()).or_insert(0) += 1;
            }

            out.push(SprintVelocity {
                sprint: sprint.clone(),
                completed,
                total,
                rolling_average,
                by_type,
            });
        }

        out.truncate(limit);

        let completed_series: Vec<f64> = sprints
            .iter()
            .map(|(_, members)| members.iter().filter(|t| t.status == TaskStatus::Done).count() as f64)
            .collect();
        let trend = velocity_trend(&completed_series);

        Ok(VelocityMetrics { sprints: out, trend })
    }

    pub async fn agent_comparison(&self, period: Period, min_runs: usize) -> AgentComparison {
        let now = Utc::now();
        let events = self.events_since(period.start(now), now, None).await;
        let runs = run_metrics_from(&events);
        let tokens_by_agent = tokens_by_agent_from(&events);

        let eligible: Vec<(&String, &AgentRunBreakdown)> =
            runs.by_agent.iter().filter(|(_, b)| b.total >= min_runs).collect();

        let reliability = eligible
            .iter()
            .filter(|(_, b)| b.success_rate >= 80.0)
            .max_by(|(_, a), (_, b)| a.success_rate.total_cmp(&b.success_rate))
            .map(|(agent, b)| AgentComparisonRecommendation { agent: (*agent).clone(), value: b.success_rate });

        let speed = eligible
            .iter()
            .min_by(|(_, a), (_, b)| a.avg_duration_ms.total_cmp(&b.avg_duration_ms))
            .map(|(agent, b)| AgentComparisonRecommendation { agent: (*agent).clone(), value: b.avg_duration_ms });

        let cost = eligible
            .iter()
            .filter_map(|(agent, b)| {
                let (input, output) = tokens_by_agent.get(*agent).copied().unwrap_or((0, 0));
                if b.total == 0 {
                    return None;
                }
                let avg_cost = cost_usd(input, output) / b.total as f64;
                Some((agent, avg_cost))
            })
            .min_by(|(_, a), (_, b)| a.total_cmp(b))
            .map(|(agent, value)| AgentComparisonRecommendation { agent: (*agent).clone(), value });

        let efficiency = eligible
            .iter()
            .filter_map(|(agent, b)| {
                let (input, output) = tokens_by_agent.get(*agent).copied().unwrap_or((0, 0));
                if b.successes == 0 {
                    return None;
                }
                Some((agent, (input + output) as f64 / b.successes as f64))
            })
            .min_by(|(_, a), (_, b)| a.total_cmp(b))
            .map(|(agent, value)| AgentComparisonRecommendation { agent: (*agent).clone(), value });

        AgentComparison { reliability, speed, cost, efficiency }
    }

    pub async fn failed_runs(&self, period: Period, limit: usize) -> Vec<FailedRun> {
        let now = Utc::now();
        let events = self.events_since(period.start(now), now, None).await;
        let mut out: Vec<FailedRun> = events
            .into_iter()
            .filter_map(|event| match event.payload {
                TelemetryPayload::RunCompleted { agent, duration_ms, error, success, .. } if !success => {
                    Some(FailedRun {
                        timestamp: event.timestamp,
                        task_id: event.task_id,
                        project: event.project,
                        agent,
                        error_message: error,
                        duration_ms,
                    })
                }
                TelemetryPayload::RunError { agent, error } => Some(FailedRun {
                    timestamp: event.timestamp,
                    task_id: event.task_id,
                    project: event.project,
                    agent,
                    error_message: Some(error),
                    duration_ms: None,
                }),
                _ => None,
            })
            .collect();
        out.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        out.truncate(limit);
        out
    }
}

fn status_label(status: TaskStatus) -> &'static str {
    match status {
        TaskStatus::Todo => "todo",
        TaskStatus::InProgress => "in-progress",
        TaskStatus::Blocked => "blocked",
        TaskStatus::Review => "review",
        TaskStatus::Done => "done",
    }
}

fn run_metrics_from(events: &[TelemetryEvent]) -> RunMetrics {
    let mut metrics = RunMetrics::default();
    let mut by_agent: HashMap<String, (usize, usize, i64, usize)> = HashMap::new(); // total, successes, duration sum, duration count

    for event in events {
        let (agent, success, duration_ms) = match &event.payload {
            TelemetryPayload::RunCompleted { agent, success, duration_ms, .. } => (agent.clone(), *success, *duration_ms),
            TelemetryPayload::RunError { agent, .. } => (agent.clone(), false, None),
            _ => continue,
        };

        metrics.total += 1;
        if success {
            metrics.successes += 1;
        } else {
            metrics.failures += 1;
        }

        let entry = by_agent.entry(agent).or_insert((0, 0, 0, 0));
        entry.0 += 1;
        if success {
            entry.1 += 1;
        }
        if let Some(ms) = duration_ms {
            entry.2 += ms;
            entry.3 += 1;
        }
    }

    if metrics.total > 0 {
        metrics.success_rate = metrics.successes as f64 / metrics.total as f64 * 100.0;
        metrics.error_rate = metrics.failures as f64 / metrics.total as f64 * 100.0;
    }

    let mut duration_sum = 0i64;
    let mut duration_count = 0usize;
    for (agent, (total, successes, dur_sum, dur_count)) in by_agent {
        let success_rate = if total > 0 { successes as f64 / total as f64 * 100.0 } else { 0.0 };
        let avg_duration_ms = if dur_count > 0 { dur_sum as f64 / dur_count as f64 } else { 0.0 };
        duration_sum += dur_sum;
        duration_count += dur_count;
        metrics.by_agent.insert(
            agent,
            AgentRunBreakdown {
                total,
                successes,
                failures: total - successes,
                success_rate,
                error_rate: 100.0 - success_rate,
                avg_duration_ms,
            },
        );
    }
    metrics.avg_duration_ms = if duration_count > 0 { duration_sum as f64 / duration_count as f64 } else { 0.0 };

    metrics
}

fn events_input_tokens(events: &[TelemetryEvent]) -> i64 {
    events
        .iter()
        .filter_map(|e| match &e.payload {
            TelemetryPayload::RunTokens { input_tokens, .. } => Some(*input_tokens),
            _ => None,
        })
        .sum()
}

fn events_output_tokens(events: &[TelemetryEvent]) -> i64 {
    events
        .iter()
        .filter_map(|e| match &e.payload {
            TelemetryPayload::RunTokens { output_tokens, .. } => Some(*output_tokens),
            _ => None,
        })
        .sum()
}

fn tokens_by_agent_from(events: &[TelemetryEvent]) -> HashMap<String, (i64, i64)> {
    let mut out: HashMap<String, (i64, i64)> = HashMap::new();
    for event in events {
        if let TelemetryPayload::RunTokens { agent, input_tokens, output_tokens, .. } = &event.payload {
            let entry = out.entry(agent.clone()).or_insert((0, 0));
            entry.0 += input_tokens;
            entry.1 += output_tokens;
        }
    }
    out
}

/// `input/1000*0.01 + output/1000*0.03` USD, per §4.7.
fn cost_usd(input_tokens: i64, output_tokens: i64) -> f64 {
    (input_tokens as f64 / 1000.0) * 0.01 + (output_tokens as f64 / 1000.0) * 0.03
}

fn token_metrics_from(events: &[TelemetryEvent]) -> TokenMetrics {
    let mut totals = Vec::new();
    let mut total_input = 0i64;
    let mut total_output = 0i64;
    let mut total_cache = 0i64;

    for event in events {
        if let TelemetryPayload::RunTokens { input_tokens, output_tokens, total_tokens, cache_tokens, .. } = &event.payload {
            total_input += input_tokens;
            total_output += output_tokens;
            total_cache += cache_tokens.unwrap_or(0);
            let total = total_tokens.unwrap_or(input_tokens + output_tokens);
            totals.push(total as f64);
        }
    }

    let total: i64 = totals.iter().sum::<f64>() as i64;
    let avg = if totals.is_empty() { 0.0 } else { totals.iter().sum::<f64>() / totals.len() as f64 };
    let mut sorted = totals.clone();
    sorted.sort_by(|a, b| a.total_cmp(b));

    TokenMetrics {
        total_input,
        total_output,
        total_cache,
        total,
        avg,
        p50: percentile(&sorted, 50.0),
        p95: percentile(&sorted, 95.0),
    }
}

fn duration_metrics_from(events: &[TelemetryEvent]) -> DurationMetrics {
    let mut all_durations = Vec::new();
    let mut by_agent: HashMap<String, Vec<f64>> = HashMap::new();

    for event in events {
        if let TelemetryPayload::RunCompleted { agent, duration_ms: Some(ms), .. } = &event.payload {
            if *ms > 0 {
                all_durations.push(*ms as f64);
                by_agent.entry(agent.clone()).or_default().push(*ms as f64);
            }
        }
    }

    let mut sorted_all = all_durations.clone();
    sorted_all.sort_by(|a, b| a.total_cmp(b));
    let avg_ms = if all_durations.is_empty() { 0.0 } else { all_durations.iter().sum::<f64>() / all_durations.len() as f64 };

    let mut by_agent_out = HashMap::new();
    for (agent, mut durations) in by_agent {
        durations.sort_by(|a, b| a.total_cmp(b));
        let avg = durations.iter().sum::<f64>() / durations.len() as f64;
        by_agent_out.insert(
            agent,
            AgentDurationBreakdown {
                avg_ms: avg,
                p50_ms: percentile(&durations, 50.0),
                p95_ms: percentile(&durations, 95.0),
            },
        );
    }

    DurationMetrics {
        avg_ms,
        p50_ms: percentile(&sorted_all, 50.0),
        p95_ms: percentile(&sorted_all, 95.0),
        by_agent: by_agent_out,
    }
}

fn pct_of(used: f64, budget: f64) -> f64 {
    if budget <= 0.0 {
        return 0.0;
    }
    used / budget * 100.0
}

fn days_in_month(date: DateTime<Utc>) -> u32 {
    let year = date.year();
    let month = date.month();
    let (next_year, next_month) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
    let next_start = chrono::NaiveDate::from_ymd_opt(next_year, next_month, 1).expect("valid date");
    let this_start = chrono::NaiveDate::from_ymd_opt(year, month, 1).expect("valid date");
    (next_start - this_start).num_days() as u32
}

/// Numeric suffix of a sprint label (e.g. `"Sprint 12"` → `12`); labels with
/// no trailing digits sort last.
fn sprint_number(label: &str) -> i64 {
    let digits: String = label.chars().rev().take_while(|c| c.is_ascii_digit()).collect();
    let digits: String = digits.chars().rev().collect();
    digits.parse().unwrap_or(i64::MAX)
}

fn velocity_trend(completed_series: &[f64]) -> VelocityTrend {
    if completed_series.len() < 2 {
        return VelocityTrend::Steady;
    }
    let last3_start = completed_series.len().saturating_sub(3);
    let last3 = &completed_series[last3_start..];
    let prev3_end = last3_start;
    let prev3_start = prev3_end.saturating_sub(3);
    let prev3 = &completed_series[prev3_start..prev3_end];

    if prev3.is_empty() {
        return VelocityTrend::Steady;
    }

    let mean_last = last3.iter().sum::<f64>() / last3.len() as f64;
    let mean_prev = prev3.iter().sum::<f64>() / prev3.len() as f64;

    if mean_prev == 0.0 {
        return VelocityTrend::Steady;
    }
    let change = (mean_last - mean_prev) / mean_prev * 100.0;
    if change > 10.0 {
        VelocityTrend::Accelerating
    } else if change < -10.0 {
        VelocityTrend::Slowing
    } else {
        VelocityTrend::Steady
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use veritas_types::interfaces::TaskPatch;
    use veritas_types::task::Task;

    struct FakeTaskStore {
        tasks: Vec<Task>,
        archived: Vec<Task>,
    }

    #[async_trait]
    impl TaskStore for FakeTaskStore {
        async fn get_task(&self, id: &str) -> veritas_types::Result<Option<Task>> {
            Ok(self.tasks.iter().find(|t| t.id == id).cloned())
        }
        async fn update_task(&self, _id: &str, _patch: TaskPatch) -> veritas_types::Result<()> {
            Ok(())
        }
        async fn list_tasks(&self) -> veritas_types::Result<Vec<Task>> {
            Ok(self.tasks.clone())
        }
        async fn list_archived_tasks(&self) -> veritas_types::Result<Vec<Task>> {
            Ok(self.archived.clone())
        }
    }

    fn task(id: &str, status: TaskStatus, sprint: Option<&str>) -> Task {
        Task {
            id: id.to_string(),
            title: id.to_string(),
            description: None,
            task_type: "code".to_string(),
            status,
            worktree_path: None,
            attempt: None,
            blocked_by: Default::default(),
            blocked_reason: None,
            project: None,
            sprint: sprint.map(|s| s.to_string()),
        }
    }

    fn temp_root() -> std::path::PathBuf {
        std::env::temp_dir().join(format!("veritas-metrics-{}", uuid::Uuid::new_v4()))
    }

    #[tokio::test]
    async fn task_metrics_counts_status_and_blocked_reason() {
        let mut blocked = task("t1", TaskStatus::Blocked, None);
        blocked.blocked_reason = Some(veritas_types::task::BlockedReason { category: "waiting-on-review".into() });
        let store = FakeTaskStore {
            tasks: vec![task("t0", TaskStatus::Done, None), blocked, task("t2", TaskStatus::Blocked, None)],
            archived: vec![task("a1", TaskStatus::Done, None)],
        };

        let agg = MetricsAggregator::new(TelemetryQuery::new(temp_root()), Arc::new(store));
        let metrics = agg.task_metrics(None).await.unwrap();
        assert_eq!(metrics.total, 3);
        assert_eq!(metrics.completed, 2); // 1 done + 1 archived
        assert_eq!(metrics.blocked_by_reason["waiting-on-review"], 1);
        assert_eq!(metrics.blocked_by_reason["unspecified"], 1);
    }

    #[tokio::test]
    async fn velocity_groups_by_sprint_sorted_numerically() {
        let store = FakeTaskStore {
            tasks: vec![
                task("t1", TaskStatus::Done, Some("Sprint 2")),
                task("t2", TaskStatus::Todo, Some("Sprint 2")),
                task("t3", TaskStatus::Done, Some("Sprint 10")),
            ],
            archived: vec![],
        };
        let agg = MetricsAggregator::new(TelemetryQuery::new(temp_root()), Arc::new(store));
        let velocity = agg.velocity_metrics(10).await.unwrap();
        assert_eq!(velocity.sprints[0].sprint, "Sprint 2");
        assert_eq!(velocity.sprints[1].sprint, "Sprint 10");
        assert_eq!(velocity.sprints[0].completed, 1);
        assert_eq!(velocity.sprints[0].total, 2);
    }

    #[test]
    fn budget_projection_matches_scenario_s6() {
        // tokenBudget=1_000_000, 300_000 used at day 10 of a 30-day month -> warning
        let burn = 300_000.0 / 10.0;
        let projected = burn * 30.0;
        assert_eq!(projected, 900_000.0);
        let used_pct = pct_of(300_000.0, 1_000_000.0);
        let projected_pct = pct_of(projected, 1_000_000.0);
        assert_eq!(used_pct, 30.0);
        assert_eq!(projected_pct, 90.0);
    }

    #[test]
    fn trend_direction_respects_higher_better() {
        let up_is_good = compute_trend(120.0, 100.0, true);
        assert_eq!(up_is_good.direction, TrendDirection::Up);
        let up_is_bad = compute_trend(120.0, 100.0, false);
        assert_eq!(up_is_bad.direction, TrendDirection::Down);
        let flat = compute_trend(101.0, 100.0, true);
        assert_eq!(flat.direction, TrendDirection::Flat);
    }

    #[test]
    fn trend_symmetry_disagrees_on_meaningful_delta() {
        let forward = compute_trend(120.0, 100.0, true);
        let backward = compute_trend(100.0, 120.0, true);
        assert_ne!(forward.direction, backward.direction);
    }

    #[test]
    fn run_metrics_from_events_computes_rates() {
        let now = Utc::now();
        let events = vec![
            TelemetryEvent {
                id: "1".into(),
                timestamp: now,
                task_id: None,
                project: None,
                payload: TelemetryPayload::RunCompleted {
                    agent: "claude-code".into(),
                    duration_ms: Some(1000),
                    exit_code: Some(0),
                    success: true,
                    error: None,
                },
            },
            TelemetryEvent {
                id: "2".into(),
                timestamp: now,
                task_id: None,
                project: None,
                payload: TelemetryPayload::RunError { agent: "claude-code".into(), error: "boom".into() },
            },
        ];
        let metrics = run_metrics_from(&events);
        assert_eq!(metrics.total, 2);
        assert_eq!(metrics.successes, 1);
        assert_eq!(metrics.success_rate, 50.0);
        assert_eq!(metrics.by_agent["claude-code"].total, 2);
    }
}
