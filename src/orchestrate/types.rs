// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Core types for swarm orchestration.
//!
//! Work requests flow in from the dispatch interpreter, worker handles track
//! one attempt at running a request, and worker results and merge outcomes
//! flow back out to the merge coordinator and response channel.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Name of the structured report a worker writes into its worktree.
pub const RESULT_FILE_NAME: &str = ".codi-swarm-result.json";

/// Generate a short random identifier with a prefix.
pub fn short_id(prefix: &str) -> String {
    let raw = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", prefix, &raw[..8])
}

// ============================================================================
// Request Shape
// ============================================================================

/// Execution shape for a batch of work requests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    #[default]
    FanOut,
    Pipeline,
    MapReduce,
    Debate,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FanOut => "fan-out",
            Self::Pipeline => "pipeline",
            Self::MapReduce => "map-reduce",
            Self::Debate => "debate",
        }
    }

    /// Parse a loosely written strategy name.
    ///
    /// Case and `_`/space separators are ignored; `mapreduce` is accepted.
    pub fn parse_loose(value: &str) -> Option<Self> {
        let normalized = value.trim().to_lowercase().replace(['_', ' '], "-");
        match normalized.as_str() {
            "fan-out" | "fanout" | "parallel" => Some(Self::FanOut),
            "pipeline" | "sequential" => Some(Self::Pipeline),
            "map-reduce" | "mapreduce" => Some(Self::MapReduce),
            "debate" => Some(Self::Debate),
            _ => None,
        }
    }
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Launch priority within a fan-out batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    /// Sort key; lower launches first.
    pub fn rank(&self) -> u8 {
        match self {
            Self::High => 0,
            Self::Normal => 1,
            Self::Low => 2,
        }
    }
}

/// How much of a worker's result goes back to the supervisor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReturnFormat {
    #[default]
    Summary,
    Diff,
    Full,
}

// ============================================================================
// Work Request
// ============================================================================

/// One unit of objective-driven work. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkRequest {
    pub id: String,
    pub objective: String,
    /// Paths or glob patterns the request is expected to touch. Empty means unrestricted.
    #[serde(default)]
    pub scope: Vec<String>,
    #[serde(default)]
    pub context: String,
    pub strategy: Strategy,
    pub timeout_ms: u64,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub return_format: ReturnFormat,
}

impl WorkRequest {
    /// Create a fan-out request with a fresh id.
    pub fn new(objective: impl Into<String>, timeout: Duration) -> Self {
        Self {
            id: short_id("req"),
            objective: objective.into(),
            scope: Vec::new(),
            context: String::new(),
            strategy: Strategy::FanOut,
            timeout_ms: timeout.as_millis() as u64,
            priority: Priority::Normal,
            return_format: ReturnFormat::Summary,
        }
    }

    pub fn with_scope(mut self, scope: Vec<String>) -> Self {
        self.scope = scope;
        self
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = context.into();
        self
    }

    pub fn with_strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_return_format(mut self, format: ReturnFormat) -> Self {
        self.return_format = format;
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Whether any path is acceptable for this request.
    pub fn is_unrestricted(&self) -> bool {
        self.scope.is_empty()
    }
}

// ============================================================================
// Worker Status
// ============================================================================

/// Lifecycle of a worker handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    /// Queued, waiting for a slot or an unpaused queue.
    Pending,
    Running,
    Completed,
    TimedOut,
    Failed,
    Cancelled,
}

impl WorkerStatus {
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Pending | Self::Running)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_active()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::TimedOut => "timed_out",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Worker Handle
// ============================================================================

/// One attempt at running a work request.
///
/// A retry produces a new handle with a new worker id and worktree. The
/// session is referenced by id only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerHandle {
    pub worker_id: String,
    pub request_id: String,
    pub session_id: String,
    pub worktree_path: PathBuf,
    pub branch: String,
    /// Commit the worktree was created from; the change set is diffed against it.
    pub base_commit: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub status: WorkerStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,
    pub attempt: u32,
}

impl WorkerHandle {
    pub fn new(
        worker_id: impl Into<String>,
        request_id: impl Into<String>,
        session_id: impl Into<String>,
        worktree: &Worktree,
    ) -> Self {
        Self {
            worker_id: worker_id.into(),
            request_id: request_id.into(),
            session_id: session_id.into(),
            worktree_path: worktree.path.clone(),
            branch: worktree.branch.clone(),
            base_commit: worktree.base_commit.clone(),
            pid: None,
            status: WorkerStatus::Pending,
            started_at: None,
            deadline: None,
            attempt: 0,
        }
    }

    /// Mark the handle running with a deadline `timeout` from now.
    pub fn mark_running(&mut self, pid: Option<u32>, timeout: Duration) {
        let now = Utc::now();
        self.pid = pid;
        self.status = WorkerStatus::Running;
        self.started_at = Some(now);
        self.deadline = chrono::Duration::from_std(timeout)
            .ok()
            .and_then(|d| now.checked_add_signed(d));
    }

    pub fn worktree(&self) -> Worktree {
        Worktree {
            path: self.worktree_path.clone(),
            branch: self.branch.clone(),
            base_commit: self.base_commit.clone(),
        }
    }
}

/// An isolated working copy checked out on its own branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Worktree {
    pub path: PathBuf,
    pub branch: String,
    pub base_commit: String,
}

impl Worktree {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn result_file(&self) -> PathBuf {
        self.path.join(RESULT_FILE_NAME)
    }
}

/// What to do with a worktree once its result has been consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseMode {
    /// Remove the working copy and delete the branch.
    Discard,
    /// Remove the working copy but keep the branch for inspection.
    KeepBranch,
    /// Leave everything in place (pending approval or debugging).
    Retain,
}

// ============================================================================
// Worker Report
// ============================================================================

/// Status the worker itself claims in its report.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportStatus {
    #[default]
    Success,
    Partial,
    Failed,
    Blocked,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestsStatus {
    Passed,
    Failed,
    #[default]
    Skipped,
}

impl TestsStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Passed => "passed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

/// Structured report written by the worker to [`RESULT_FILE_NAME`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerReport {
    pub status: ReportStatus,
    pub summary: String,
    pub files_modified: Vec<String>,
    pub files_created: Vec<String>,
    pub files_deleted: Vec<String>,
    pub key_decisions: Vec<String>,
    pub warnings: Vec<String>,
    pub tests_status: TestsStatus,
    pub confidence: f64,
}

impl Default for WorkerReport {
    fn default() -> Self {
        Self {
            status: ReportStatus::Success,
            summary: String::new(),
            files_modified: Vec::new(),
            files_created: Vec::new(),
            files_deleted: Vec::new(),
            key_decisions: Vec::new(),
            warnings: Vec::new(),
            tests_status: TestsStatus::Skipped,
            confidence: 0.5,
        }
    }
}

impl WorkerReport {
    /// Confidence assigned when the worker left no usable report.
    pub const FALLBACK_CONFIDENCE: f64 = 0.4;

    /// Parse a report, clamping confidence into `0..=1`.
    pub fn from_json(content: &str) -> Result<Self, serde_json::Error> {
        let mut report: Self = serde_json::from_str(content)?;
        report.confidence = if report.confidence.is_nan() {
            0.0
        } else {
            report.confidence.clamp(0.0, 1.0)
        };
        Ok(report)
    }

    /// Report used when the worker did not write a valid one.
    pub fn fallback(summary: impl Into<String>, files_modified: Vec<String>) -> Self {
        Self {
            status: ReportStatus::Partial,
            summary: summary.into(),
            files_modified,
            warnings: vec!["Missing or invalid worker result file".to_string()],
            confidence: Self::FALLBACK_CONFIDENCE,
            ..Default::default()
        }
    }
}

// ============================================================================
// Change Set & Usage
// ============================================================================

/// File modifications a worker produced, relative to its base commit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSet {
    /// Changed paths, relative to the repository root.
    pub files: Vec<String>,
    /// Unified diff.
    pub patch: String,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.files.is_empty() && self.patch.trim().is_empty()
    }

    /// SHA-256 of the patch, used to group identical proposals.
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.patch.as_bytes());
        digest.iter().map(|b| format!("{:02x}", b)).collect()
    }
}

/// Token usage reported by (or estimated for) a worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub cached_input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    pub fn add(&mut self, other: &TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.cached_input_tokens += other.cached_input_tokens;
        self.output_tokens += other.output_tokens;
    }
}

// ============================================================================
// Worker Result
// ============================================================================

/// Terminal output of one worker handle. Consumed once by the merge coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerResult {
    pub worker_id: String,
    pub request_id: String,
    pub status: WorkerStatus,
    pub change_set: ChangeSet,
    /// Compressed stdout.
    pub output_excerpt: String,
    /// Compressed stderr.
    pub stderr_excerpt: String,
    /// True when captured after a forced kill.
    pub partial: bool,
    pub report: WorkerReport,
    pub usage: TokenUsage,
    pub cost: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub branch: String,
    pub worktree_path: PathBuf,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub attempt: u32,
}

impl WorkerResult {
    /// Result for a unit of work that never got a running process.
    pub fn not_started(
        worker_id: impl Into<String>,
        request_id: impl Into<String>,
        status: WorkerStatus,
        error: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        let error = error.into();
        Self {
            worker_id: worker_id.into(),
            request_id: request_id.into(),
            status,
            change_set: ChangeSet::default(),
            output_excerpt: String::new(),
            stderr_excerpt: String::new(),
            partial: false,
            report: WorkerReport {
                status: ReportStatus::Failed,
                summary: error.clone(),
                confidence: 0.0,
                ..Default::default()
            },
            usage: TokenUsage::default(),
            cost: 0.0,
            exit_code: None,
            error: Some(error),
            branch: String::new(),
            worktree_path: PathBuf::new(),
            started_at: now,
            ended_at: now,
            attempt: 0,
        }
    }

    pub fn duration(&self) -> Duration {
        (self.ended_at - self.started_at).to_std().unwrap_or_default()
    }

    /// The worktree this result came from. Results do not track the base commit.
    pub fn worktree(&self) -> Worktree {
        Worktree {
            path: self.worktree_path.clone(),
            branch: self.branch.clone(),
            base_commit: String::new(),
        }
    }

    /// Whether this result has a worktree that needs releasing.
    pub fn has_worktree(&self) -> bool {
        !self.branch.is_empty() && !self.worktree_path.as_os_str().is_empty()
    }
}

// ============================================================================
// Merge Outcome
// ============================================================================

/// How held candidates should be merged on approval.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeResolution {
    /// Plain merge; abort on conflict.
    #[default]
    Abort,
    /// Resolve conflicting hunks in favour of the base.
    Ours,
    /// Resolve conflicting hunks in favour of the worker.
    Theirs,
}

/// Classification of one worker result at the merge stage.
///
/// `conflict` and `applied` are never both true.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeOutcome {
    pub worker_id: String,
    pub request_id: String,
    pub branch: String,
    pub applied: bool,
    pub conflict: bool,
    #[serde(default)]
    pub out_of_scope_paths: Vec<String>,
    pub requires_approval: bool,
    #[serde(default)]
    pub message: String,
}

impl MergeOutcome {
    fn base(result: &WorkerResult) -> Self {
        Self {
            worker_id: result.worker_id.clone(),
            request_id: result.request_id.clone(),
            branch: result.branch.clone(),
            applied: false,
            conflict: false,
            out_of_scope_paths: Vec::new(),
            requires_approval: false,
            message: String::new(),
        }
    }

    pub fn applied(result: &WorkerResult, message: impl Into<String>) -> Self {
        Self {
            applied: true,
            message: message.into(),
            ..Self::base(result)
        }
    }

    pub fn conflict(result: &WorkerResult, message: impl Into<String>) -> Self {
        Self {
            conflict: true,
            message: message.into(),
            ..Self::base(result)
        }
    }

    /// Not applied; waiting for an explicit approval action.
    pub fn held(
        result: &WorkerResult,
        out_of_scope_paths: Vec<String>,
        conflict: bool,
        message: impl Into<String>,
    ) -> Self {
        Self {
            conflict,
            out_of_scope_paths,
            requires_approval: true,
            message: message.into(),
            ..Self::base(result)
        }
    }

    /// Not applied and not held; nothing to merge.
    pub fn skipped(result: &WorkerResult, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::base(result)
        }
    }

    pub fn label(&self) -> &'static str {
        if self.applied {
            "applied"
        } else if self.requires_approval {
            "pending_approval"
        } else if self.conflict {
            "conflict"
        } else {
            "not_applied"
        }
    }
}

/// Control socket path for a session.
pub fn socket_path_for_session(socket_dir: &Path, session_id: &str) -> PathBuf {
    socket_dir.join(format!("codi-swarm-{}.sock", session_id))
}
