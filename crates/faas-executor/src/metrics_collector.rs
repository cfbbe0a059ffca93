use faas_common::{FailureKind, Job};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;

pub const DEFAULT_WINDOW: usize = 1024;

/// Latency breakdown of one job as measured by its worker.
#[derive(Debug, Clone, Default)]
pub struct JobTimings {
    pub queue_wait: Duration,
    pub acquire: Duration,
    /// Container creation time when the pool missed.
    pub cold_start: Option<Duration>,
    pub execution: Duration,
    /// `None` when the job never reached the pool.
    pub pool_hit: Option<bool>,
}

impl JobTimings {
    /// Timings of a job leaving the queue now, with its real queue wait.
    pub fn dequeued(job: &Job) -> Self {
        Self {
            queue_wait: (chrono::Utc::now() - job.submitted_at)
                .to_std()
                .unwrap_or_default(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobOutcome {
    Succeeded,
    Failed(FailureKind),
    TimedOut,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LatencySummary {
    pub count: usize,
    pub mean_ms: f64,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub max_ms: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FunctionStats {
    pub executions: u64,
    pub failures: u64,
    pub timeouts: u64,
    pub mean_execution_ms: f64,
    pub warmups: u64,
    pub mean_warmup_ms: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub total_jobs: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub pool_hits: u64,
    pub pool_misses: u64,
    pub pool_hit_rate: f64,
    pub failures_by_kind: HashMap<FailureKind, u64>,
    pub queue_wait: LatencySummary,
    pub cold_start: LatencySummary,
    pub execution: LatencySummary,
    pub warmup: LatencySummary,
    pub per_function: HashMap<String, FunctionStats>,
}

/// Fixed-size window of recent samples.
#[derive(Debug)]
struct LatencySeries {
    samples: VecDeque<Duration>,
    window: usize,
}

impl LatencySeries {
    fn new(window: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(window.min(DEFAULT_WINDOW)),
            window,
        }
    }

    fn push(&mut self, sample: Duration) {
        if self.samples.len() == self.window {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    fn summary(&self) -> LatencySummary {
        if self.samples.is_empty() {
            return LatencySummary::default();
        }
        let mut sorted: Vec<f64> = self
            .samples
            .iter()
            .map(|d| d.as_secs_f64() * 1000.0)
            .collect();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let count = sorted.len();
        LatencySummary {
            count,
            mean_ms: sorted.iter().sum::<f64>() / count as f64,
            p50_ms: nearest_rank(&sorted, 50.0),
            p95_ms: nearest_rank(&sorted, 95.0),
            p99_ms: nearest_rank(&sorted, 99.0),
            max_ms: sorted[count - 1],
        }
    }
}

fn nearest_rank(sorted: &[f64], percentile: f64) -> f64 {
    let rank = ((percentile / 100.0) * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

#[derive(Debug, Default)]
struct FunctionCounters {
    executions: u64,
    failures: u64,
    timeouts: u64,
    execution_total: Duration,
    warmups: u64,
    warmup_total: Duration,
}

#[derive(Debug)]
struct MetricsState {
    total_jobs: u64,
    succeeded: u64,
    failed: u64,
    timed_out: u64,
    pool_hits: u64,
    pool_misses: u64,
    failures_by_kind: HashMap<FailureKind, u64>,
    queue_wait: LatencySeries,
    cold_start: LatencySeries,
    execution: LatencySeries,
    warmup: LatencySeries,
    per_function: HashMap<String, FunctionCounters>,
}

/// Additive counters and latency windows. Nothing here feeds back into
/// scheduling.
pub struct MetricsCollector {
    state: RwLock<MetricsState>,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW)
    }
}

impl MetricsCollector {
    pub fn new(window: usize) -> Self {
        let window = window.max(1);
        Self {
            state: RwLock::new(MetricsState {
                total_jobs: 0,
                succeeded: 0,
                failed: 0,
                timed_out: 0,
                pool_hits: 0,
                pool_misses: 0,
                failures_by_kind: HashMap::new(),
                queue_wait: LatencySeries::new(window),
                cold_start: LatencySeries::new(window),
                execution: LatencySeries::new(window),
                warmup: LatencySeries::new(window),
                per_function: HashMap::new(),
            }),
        }
    }

    pub async fn record(&self, job: &Job, timings: &JobTimings, outcome: JobOutcome) {
        let mut state = self.state.write().await;
        state.total_jobs += 1;
        state.queue_wait.push(timings.queue_wait);

        match timings.pool_hit {
            Some(true) => state.pool_hits += 1,
            Some(false) => state.pool_misses += 1,
            None => {}
        }
        if let Some(cold) = timings.cold_start {
            state.cold_start.push(cold);
        }

        let ran = timings.pool_hit.is_some();
        if ran {
            state.execution.push(timings.execution);
        }

        match outcome {
            JobOutcome::Succeeded => state.succeeded += 1,
            JobOutcome::TimedOut => {
                state.timed_out += 1;
                *state
                    .failures_by_kind
                    .entry(FailureKind::ExecutionTimeout)
                    .or_insert(0) += 1;
            }
            JobOutcome::Failed(kind) => {
                state.failed += 1;
                *state.failures_by_kind.entry(kind).or_insert(0) += 1;
            }
        }

        let function = state
            .per_function
            .entry(job.function_id.clone())
            .or_default();
        if ran {
            function.executions += 1;
            function.execution_total += timings.execution;
        }
        match outcome {
            JobOutcome::Succeeded => {}
            JobOutcome::TimedOut => function.timeouts += 1,
            JobOutcome::Failed(_) => function.failures += 1,
        }

        debug!(job_id = %job.id, ?outcome, "Job metrics recorded");
    }

    /// Creation time of a container made ahead of demand.
    pub async fn record_warmup(&self, function_id: &str, elapsed: Duration) {
        let mut state = self.state.write().await;
        state.warmup.push(elapsed);
        let function = state
            .per_function
            .entry(function_id.to_string())
            .or_default();
        function.warmups += 1;
        function.warmup_total += elapsed;
    }

    pub async fn snapshot(&self) -> MetricsSnapshot {
        let state = self.state.read().await;
        let lookups = state.pool_hits + state.pool_misses;
        MetricsSnapshot {
            total_jobs: state.total_jobs,
            succeeded: state.succeeded,
            failed: state.failed,
            timed_out: state.timed_out,
            pool_hits: state.pool_hits,
            pool_misses: state.pool_misses,
            pool_hit_rate: if lookups == 0 {
                0.0
            } else {
                state.pool_hits as f64 / lookups as f64
            },
            failures_by_kind: state.failures_by_kind.clone(),
            queue_wait: state.queue_wait.summary(),
            cold_start: state.cold_start.summary(),
            execution: state.execution.summary(),
            warmup: state.warmup.summary(),
            per_function: state
                .per_function
                .iter()
                .map(|(id, c)| (id.clone(), function_stats(c)))
                .collect(),
        }
    }
}

fn mean_ms(total: Duration, count: u64) -> f64 {
    if count == 0 {
        0.0
    } else {
        total.as_secs_f64() * 1000.0 / count as f64
    }
}

fn function_stats(counters: &FunctionCounters) -> FunctionStats {
    FunctionStats {
        executions: counters.executions,
        failures: counters.failures,
        timeouts: counters.timeouts,
        mean_execution_ms: mean_ms(counters.execution_total, counters.executions),
        warmups: counters.warmups,
        mean_warmup_ms: mean_ms(counters.warmup_total, counters.warmups),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percentiles_nearest_rank() {
        let mut series = LatencySeries::new(DEFAULT_WINDOW);
        for ms in 1..=100 {
            series.push(Duration::from_millis(ms));
        }
        let summary = series.summary();
        assert_eq!(summary.count, 100);
        assert_eq!(summary.p50_ms, 50.0);
        assert_eq!(summary.p95_ms, 95.0);
        assert_eq!(summary.p99_ms, 99.0);
        assert_eq!(summary.max_ms, 100.0);
        assert!((summary.mean_ms - 50.5).abs() < 1e-9);
    }

    #[test]
    fn test_series_window_is_bounded() {
        let mut series = LatencySeries::new(3);
        for ms in [10, 20, 30, 40] {
            series.push(Duration::from_millis(ms));
        }
        let summary = series.summary();
        assert_eq!(summary.count, 3);
        assert_eq!(summary.max_ms, 40.0);
        assert_eq!(summary.p50_ms, 30.0);
    }

    #[tokio::test]
    async fn test_record_aggregates() {
        let metrics = MetricsCollector::default();
        let job = Job::new("echo", serde_json::Value::Null);

        let miss = JobTimings {
            queue_wait: Duration::from_millis(5),
            cold_start: Some(Duration::from_millis(300)),
            execution: Duration::from_millis(20),
            pool_hit: Some(false),
            ..Default::default()
        };
        let hit = JobTimings {
            pool_hit: Some(true),
            cold_start: None,
            ..miss.clone()
        };

        metrics.record(&job, &miss, JobOutcome::Succeeded).await;
        metrics.record(&job, &hit, JobOutcome::Succeeded).await;
        metrics
            .record(&job, &hit, JobOutcome::Failed(FailureKind::ExecutionError))
            .await;
        metrics.record(&job, &hit, JobOutcome::TimedOut).await;
        metrics
            .record(&job, &JobTimings::default(), JobOutcome::Failed(FailureKind::Cancelled))
            .await;
        metrics.record_warmup("echo", Duration::from_millis(250)).await;

        let snapshot = metrics.snapshot().await;
        assert_eq!(snapshot.total_jobs, 5);
        assert_eq!(snapshot.succeeded, 2);
        assert_eq!(snapshot.failed, 2);
        assert_eq!(snapshot.timed_out, 1);
        assert_eq!(snapshot.pool_hits, 3);
        assert_eq!(snapshot.pool_misses, 1);
        assert!((snapshot.pool_hit_rate - 0.75).abs() < 1e-9);
        assert_eq!(snapshot.failures_by_kind[&FailureKind::ExecutionError], 1);
        assert_eq!(snapshot.failures_by_kind[&FailureKind::ExecutionTimeout], 1);
        assert_eq!(snapshot.cold_start.count, 1);
        assert_eq!(snapshot.execution.count, 4);

        let echo = &snapshot.per_function["echo"];
        assert_eq!(echo.executions, 4);
        assert_eq!(echo.failures, 2);
        assert_eq!(echo.timeouts, 1);
        assert_eq!(echo.warmups, 1);
        assert!((echo.mean_warmup_ms - 250.0).abs() < 1e-9);

        // Serializes for external reporting.
        serde_json::to_string(&snapshot).unwrap();
    }
}
