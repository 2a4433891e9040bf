// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! In-process metrics for worker runs and merges.
//!
//! Kept deliberately small: a swarm session is a short-lived CLI process and
//! the numbers end up in the session summary rather than a metrics backend.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

/// Global metrics instance.
pub static GLOBAL_METRICS: Lazy<Metrics> = Lazy::new(Metrics::new);

/// Central metrics collection.
#[derive(Debug)]
pub struct Metrics {
    /// Worker runs keyed by terminal status.
    workers: RwLock<HashMap<String, WorkerMetrics>>,

    /// General operation timings (provisioning, merges, deliveries).
    operations: RwLock<HashMap<String, OperationMetrics>>,

    merges: MergeCounters,
    tokens: TokenCounters,
    start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            workers: RwLock::new(HashMap::new()),
            operations: RwLock::new(HashMap::new()),
            merges: MergeCounters::default(),
            tokens: TokenCounters::default(),
            start_time: Instant::now(),
        }
    }

    /// Record one finished worker run.
    pub fn record_worker(&self, status: &str, duration: Duration) {
        let mut workers = self.workers.write().unwrap_or_else(PoisonError::into_inner);
        workers
            .entry(status.to_string())
            .or_insert_with(WorkerMetrics::new)
            .record(duration);
    }

    /// Record a generic operation.
    pub fn record_operation(&self, name: &str, duration: Duration) {
        let mut ops = self.operations.write().unwrap_or_else(PoisonError::into_inner);
        ops.entry(name.to_string())
            .or_insert_with(OperationMetrics::new)
            .record(duration);
    }

    /// Record the classification of one merge candidate.
    pub fn record_merge(&self, kind: MergeKind) {
        let counter = match kind {
            MergeKind::Applied => &self.merges.applied,
            MergeKind::Conflict => &self.merges.conflict,
            MergeKind::Held => &self.merges.held,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Record token usage reported by a worker.
    pub fn record_tokens(&self, input: u64, output: u64) {
        self.tokens.input.fetch_add(input, Ordering::Relaxed);
        self.tokens.output.fetch_add(output, Ordering::Relaxed);
    }

    pub fn worker_metrics(&self, status: &str) -> Option<WorkerMetrics> {
        self.workers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(status)
            .cloned()
    }

    pub fn operation_metrics(&self, name: &str) -> Option<OperationMetrics> {
        self.operations
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Take a serializable snapshot of all metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let workers = self.workers.read().unwrap_or_else(PoisonError::into_inner);
        let operations = self.operations.read().unwrap_or_else(PoisonError::into_inner);

        MetricsSnapshot {
            workers: workers
                .iter()
                .map(|(k, v)| (k.clone(), v.summary()))
                .collect(),
            operations: operations
                .iter()
                .map(|(k, v)| (k.clone(), v.summary()))
                .collect(),
            merges_applied: self.merges.applied.load(Ordering::Relaxed),
            merges_conflicted: self.merges.conflict.load(Ordering::Relaxed),
            merges_held: self.merges.held.load(Ordering::Relaxed),
            input_tokens: self.tokens.input.load(Ordering::Relaxed),
            output_tokens: self.tokens.output.load(Ordering::Relaxed),
            uptime_ms: self.uptime().as_millis() as u64,
        }
    }

    /// Reset all metrics.
    pub fn reset(&self) {
        self.workers.write().unwrap_or_else(PoisonError::into_inner).clear();
        self.operations.write().unwrap_or_else(PoisonError::into_inner).clear();
        for counter in [
            &self.merges.applied,
            &self.merges.conflict,
            &self.merges.held,
            &self.tokens.input,
            &self.tokens.output,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// How a merge candidate was classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeKind {
    Applied,
    Conflict,
    Held,
}

#[derive(Debug, Default)]
struct MergeCounters {
    applied: AtomicU64,
    conflict: AtomicU64,
    held: AtomicU64,
}

#[derive(Debug, Default)]
struct TokenCounters {
    input: AtomicU64,
    output: AtomicU64,
}

/// Run counts and durations for workers ending in one status.
#[derive(Debug, Clone)]
pub struct WorkerMetrics {
    pub runs: u64,
    pub total_duration: Duration,
    pub max_duration: Duration,
}

impl WorkerMetrics {
    pub fn new() -> Self {
        Self {
            runs: 0,
            total_duration: Duration::ZERO,
            max_duration: Duration::ZERO,
        }
    }

    pub fn record(&mut self, duration: Duration) {
        self.runs += 1;
        self.total_duration += duration;
        self.max_duration = self.max_duration.max(duration);
    }

    pub fn avg_duration(&self) -> Duration {
        if self.runs == 0 {
            Duration::ZERO
        } else {
            self.total_duration / self.runs as u32
        }
    }

    fn summary(&self) -> TimingSummary {
        TimingSummary {
            count: self.runs,
            avg_ms: self.avg_duration().as_millis() as u64,
            max_ms: self.max_duration.as_millis() as u64,
            p90_ms: None,
        }
    }
}

impl Default for WorkerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Generic operation metrics with histogram.
#[derive(Debug, Clone)]
pub struct OperationMetrics {
    pub count: u64,
    pub total_duration: Duration,
    pub max_duration: Duration,
    pub histogram: Histogram,
}

impl OperationMetrics {
    pub fn new() -> Self {
        Self {
            count: 0,
            total_duration: Duration::ZERO,
            max_duration: Duration::ZERO,
            histogram: Histogram::default(),
        }
    }

    pub fn record(&mut self, duration: Duration) {
        self.count += 1;
        self.total_duration += duration;
        self.max_duration = self.max_duration.max(duration);
        self.histogram.record(duration);
    }

    pub fn avg_duration(&self) -> Duration {
        if self.count == 0 {
            Duration::ZERO
        } else {
            self.total_duration / self.count as u32
        }
    }

    fn summary(&self) -> TimingSummary {
        TimingSummary {
            count: self.count,
            avg_ms: self.avg_duration().as_millis() as u64,
            max_ms: self.max_duration.as_millis() as u64,
            p90_ms: Some(self.histogram.percentile(90.0).as_millis() as u64),
        }
    }
}

impl Default for OperationMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Fixed-bucket latency histogram.
///
/// Buckets are in milliseconds and sized for git operations and worker runs:
/// 10ms, 100ms, 1s, 10s, 1min, 10min, +inf.
#[derive(Debug, Clone)]
pub struct Histogram {
    buckets: Vec<u64>,
    counts: Vec<u64>,
}

impl Histogram {
    /// Create a histogram with custom bucket boundaries (in milliseconds).
    pub fn with_buckets(buckets: Vec<u64>) -> Self {
        let counts = vec![0; buckets.len() + 1];
        Self { buckets, counts }
    }

    pub fn record(&mut self, duration: Duration) {
        let millis = duration.as_millis() as u64;
        let idx = self
            .buckets
            .iter()
            .position(|&b| millis <= b)
            .unwrap_or(self.buckets.len());
        self.counts[idx] += 1;
    }

    pub fn counts(&self) -> &[u64] {
        &self.counts
    }

    /// Approximate percentile, reported as the upper bucket boundary.
    pub fn percentile(&self, p: f64) -> Duration {
        let total: u64 = self.counts.iter().sum();
        if total == 0 {
            return Duration::ZERO;
        }

        let target = (total as f64 * p / 100.0).ceil() as u64;
        let mut cumulative = 0u64;

        for (i, &count) in self.counts.iter().enumerate() {
            cumulative += count;
            if cumulative >= target {
                let millis = match self.buckets.get(i) {
                    Some(&bound) => bound,
                    None => self.buckets.last().copied().unwrap_or(0) * 10,
                };
                return Duration::from_millis(millis);
            }
        }

        Duration::ZERO
    }
}

impl Default for Histogram {
    fn default() -> Self {
        Self::with_buckets(vec![10, 100, 1_000, 10_000, 60_000, 600_000])
    }
}

/// Count and latency summary in a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimingSummary {
    pub count: u64,
    pub avg_ms: u64,
    pub max_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub p90_ms: Option<u64>,
}

/// A snapshot of all metrics at a point in time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub workers: HashMap<String, TimingSummary>,
    pub operations: HashMap<String, TimingSummary>,
    pub merges_applied: u64,
    pub merges_conflicted: u64,
    pub merges_held: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub uptime_ms: u64,
}

impl MetricsSnapshot {
    /// Format as a short human-readable report.
    pub fn format_report(&self) -> String {
        let mut report = String::new();

        report.push_str(&format!(
            "Merges: {} applied, {} conflicted, {} held\n",
            self.merges_applied, self.merges_conflicted, self.merges_held
        ));
        report.push_str(&format!(
            "Tokens: {} input, {} output\n",
            self.input_tokens, self.output_tokens
        ));

        let mut statuses: Vec<_> = self.workers.iter().collect();
        statuses.sort_by(|a, b| a.0.cmp(b.0));
        for (status, summary) in statuses {
            report.push_str(&format!(
                "Workers {}: {} (avg {}ms, max {}ms)\n",
                status, summary.count, summary.avg_ms, summary.max_ms
            ));
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_metrics() {
        let mut metrics = WorkerMetrics::new();
        metrics.record(Duration::from_millis(100));
        metrics.record(Duration::from_millis(300));

        assert_eq!(metrics.runs, 2);
        assert_eq!(metrics.avg_duration(), Duration::from_millis(200));
        assert_eq!(metrics.max_duration, Duration::from_millis(300));
    }

    #[test]
    fn test_histogram_percentiles() {
        let mut hist = Histogram::default();
        for _ in 0..100 {
            hist.record(Duration::from_millis(500));
        }
        assert_eq!(hist.counts()[2], 100);
        assert_eq!(hist.percentile(90.0), Duration::from_millis(1_000));
    }

    #[test]
    fn test_snapshot_counts_merges_and_workers() {
        let metrics = Metrics::new();
        metrics.record_worker("completed", Duration::from_millis(40));
        metrics.record_worker("completed", Duration::from_millis(60));
        metrics.record_worker("timed_out", Duration::from_secs(2));
        metrics.record_merge(MergeKind::Applied);
        metrics.record_merge(MergeKind::Held);
        metrics.record_tokens(1000, 250);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.workers["completed"].count, 2);
        assert_eq!(snapshot.workers["completed"].avg_ms, 50);
        assert_eq!(snapshot.workers["timed_out"].count, 1);
        assert_eq!(snapshot.merges_applied, 1);
        assert_eq!(snapshot.merges_held, 1);
        assert_eq!(snapshot.merges_conflicted, 0);
        assert_eq!(snapshot.input_tokens, 1000);

        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["merges_applied"], 1);
    }

    #[test]
    fn test_metrics_reset() {
        let metrics = Metrics::new();
        metrics.record_operation("git.merge", Duration::from_millis(5));
        metrics.record_merge(MergeKind::Conflict);
        metrics.reset();

        assert!(metrics.operation_metrics("git.merge").is_none());
        assert_eq!(metrics.snapshot().merges_conflicted, 0);
    }

    #[test]
    fn test_format_report() {
        let metrics = Metrics::new();
        metrics.record_worker("failed", Duration::from_millis(10));
        let report = metrics.snapshot().format_report();
        assert!(report.contains("Merges: 0 applied"));
        assert!(report.contains("Workers failed: 1"));
    }
}
