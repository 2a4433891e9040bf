// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Telemetry, tracing, and metrics infrastructure.
//!
//! - **Tracing**: structured logging with spans around dispatches, worker runs
//!   and merges
//! - **Metrics**: worker runs by terminal status, merge classifications and
//!   operation timings
//!
//! # Usage
//!
//! ```rust,ignore
//! use codi_swarm::telemetry::{init_telemetry, TelemetryConfig};
//!
//! let _guard = init_telemetry(&TelemetryConfig::from_flags(verbose, debug))?;
//! ```
//!
//! Public async operations carry `#[instrument]` with worker and request ids
//! as fields. Never record worker prompts or output in span fields.

mod init;
pub mod metrics;
mod spans;

pub use init::{init_telemetry, TelemetryConfig, TelemetryGuard};
pub use metrics::{
    Histogram, MergeKind, Metrics, MetricsSnapshot, OperationMetrics, TimingSummary,
    WorkerMetrics, GLOBAL_METRICS,
};
pub use spans::{TimedOperation, WorkerSpan};
