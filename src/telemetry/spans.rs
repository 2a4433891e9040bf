// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Span helpers for consistent instrumentation.

use std::time::{Duration, Instant};
use tracing::{info_span, Span};

/// RAII guard for timing one worker run.
///
/// Records duration and terminal status to the global metrics on `finish`.
pub struct WorkerSpan {
    start: Instant,
    span: Span,
}

impl WorkerSpan {
    /// Start a span for a worker.
    pub fn start(worker_id: &str, request_id: &str) -> Self {
        let span = info_span!(
            "worker",
            worker = %worker_id,
            request = %request_id,
            pid = tracing::field::Empty,
            duration_ms = tracing::field::Empty,
            status = tracing::field::Empty,
        );

        Self {
            start: Instant::now(),
            span,
        }
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    pub fn record_pid(&self, pid: u32) {
        self.span.record("pid", pid as i64);
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Finish the span with the worker's terminal status.
    pub fn finish(self, status: &str) {
        let duration = self.start.elapsed();

        self.span.record("duration_ms", duration.as_secs_f64() * 1000.0);
        self.span.record("status", status);

        super::metrics::GLOBAL_METRICS.record_worker(status, duration);

        tracing::debug!(parent: &self.span, "worker finished");
    }
}

/// RAII guard for timing any operation.
///
/// Records to metrics on `finish`; dropping without finishing only closes the span.
pub struct TimedOperation {
    name: &'static str,
    start: Instant,
    span: Span,
}

impl TimedOperation {
    pub fn start(name: &'static str) -> Self {
        let span = info_span!(
            "operation",
            op = %name,
            duration_ms = tracing::field::Empty,
        );

        Self {
            name,
            start: Instant::now(),
            span,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    pub fn finish(self) {
        let duration = self.start.elapsed();
        self.span.record("duration_ms", duration.as_secs_f64() * 1000.0);
        super::metrics::GLOBAL_METRICS.record_operation(self.name, duration);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::metrics::GLOBAL_METRICS;

    #[test]
    fn test_worker_span_records_status() {
        let span = WorkerSpan::start("w-span-test", "req-1");
        span.record_pid(4242);
        span.finish("span_test_status");

        let metrics = GLOBAL_METRICS.worker_metrics("span_test_status").unwrap();
        assert!(metrics.runs >= 1);
    }

    #[test]
    fn test_timed_operation() {
        let op = TimedOperation::start("test.timed_op");
        std::thread::sleep(Duration::from_millis(1));
        assert!(op.elapsed().as_micros() > 0);
        op.finish();

        assert!(GLOBAL_METRICS.operation_metrics("test.timed_op").is_some());
    }
}
