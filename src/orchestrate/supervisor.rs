// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Worker process supervision.
//!
//! [`WorkerSupervisor::run`] drives one worker handle from launch to a
//! terminal [`WorkerResult`]: it waits for a concurrency slot, launches the
//! worker in its worktree, enforces the deadline, then commits and diffs
//! whatever the worker left behind. Nothing a worker does can fail the caller;
//! every failure is folded into the result and a diagnostic.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, instrument, warn};

use crate::config::{ResolvedConfig, WorkerConfig};
use crate::error::{Diagnostic, DiagnosticKind};
use crate::telemetry::{WorkerSpan, GLOBAL_METRICS};

use super::budget::BudgetTracker;
use super::compress::ResultCompressor;
use super::dispatch::{last_agent_message, total_usage};
use super::events::{EventBus, SessionEvent};
use super::git;
use super::process::{shutdown, LaunchSpec, ProcessLauncher, WorkerProcess};
use super::scope::describe_scope;
use super::types::{
    ChangeSet, ReportStatus, Strategy, TokenUsage, WorkRequest, WorkerHandle, WorkerReport,
    WorkerResult, WorkerStatus,
};

/// Environment variable holding the report path.
pub const RESULT_FILE_ENV: &str = "CODI_SWARM_RESULT_FILE";
pub const WORKER_ID_ENV: &str = "CODI_SWARM_WORKER_ID";
pub const REQUEST_ID_ENV: &str = "CODI_SWARM_REQUEST_ID";
pub const SESSION_ID_ENV: &str = "CODI_SWARM_SESSION_ID";

/// How long to wait for output readers after the process is gone.
const OUTPUT_JOIN_BOUND: Duration = Duration::from_secs(2);

/// Scratch file for patches emitted on stdout.
const PATCH_FILE_NAME: &str = ".codi-swarm-patch.diff";

const NO_REPORT_SUMMARY: &str = "Worker completed without result file";

// ============================================================================
// Worker table
// ============================================================================

/// What the session knows about one worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerEntry {
    pub worker_id: String,
    pub request_id: String,
    pub objective: String,
    pub strategy: Strategy,
    pub status: WorkerStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handle: Option<WorkerHandle>,
    pub requires_approval: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

impl WorkerEntry {
    pub fn branch(&self) -> Option<&str> {
        self.handle.as_ref().map(|h| h.branch.as_str())
    }
}

/// Worker entries for a session, indexed by worker id, in registration order.
#[derive(Debug, Default)]
pub struct WorkerTable {
    entries: RwLock<Vec<WorkerEntry>>,
}

impl WorkerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a pending worker for `request`.
    pub fn register(&self, worker_id: &str, request: &WorkRequest) {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        if entries.iter().any(|e| e.worker_id == worker_id) {
            return;
        }
        entries.push(WorkerEntry {
            worker_id: worker_id.to_string(),
            request_id: request.id.clone(),
            objective: request.objective.clone(),
            strategy: request.strategy,
            status: WorkerStatus::Pending,
            handle: None,
            requires_approval: false,
            summary: None,
        });
    }

    fn update(&self, worker_id: &str, f: impl FnOnce(&mut WorkerEntry)) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        match entries.iter_mut().find(|e| e.worker_id == worker_id) {
            Some(entry) => {
                f(entry);
                true
            }
            None => false,
        }
    }

    pub fn attach_handle(&self, handle: &WorkerHandle) {
        let handle = handle.clone();
        self.update(&handle.worker_id.clone(), move |entry| {
            entry.status = handle.status;
            entry.handle = Some(handle);
        });
    }

    pub fn set_status(&self, worker_id: &str, status: WorkerStatus) {
        self.update(worker_id, |entry| {
            entry.status = status;
            if let Some(handle) = entry.handle.as_mut() {
                handle.status = status;
            }
        });
    }

    pub fn set_requires_approval(&self, worker_id: &str, requires_approval: bool) {
        self.update(worker_id, |entry| entry.requires_approval = requires_approval);
    }

    /// Record a terminal result.
    pub fn complete(&self, result: &WorkerResult) {
        self.update(&result.worker_id, |entry| {
            entry.status = result.status;
            entry.summary = Some(result.report.summary.clone());
            if let Some(handle) = entry.handle.as_mut() {
                handle.status = result.status;
            }
        });
    }

    pub fn get(&self, worker_id: &str) -> Option<WorkerEntry> {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|e| e.worker_id == worker_id)
            .cloned()
    }

    pub fn snapshot(&self) -> Vec<WorkerEntry> {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn active_count(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|e| e.status.is_active())
            .count()
    }
}

// ============================================================================
// Supervisor
// ============================================================================

/// How a worker process stopped.
enum Ending {
    Exited(std::io::Result<Option<i32>>),
    TimedOut,
    Cancelled,
}

/// A reserved worker slot; released on drop.
#[derive(Debug)]
pub struct WorkerSlot(OwnedSemaphorePermit);

/// Runs worker handles with bounded concurrency.
pub struct WorkerSupervisor {
    session_id: String,
    config: WorkerConfig,
    launcher: Arc<dyn ProcessLauncher>,
    compressor: ResultCompressor,
    budget: Arc<BudgetTracker>,
    events: EventBus,
    workers: Arc<WorkerTable>,
    permits: Arc<Semaphore>,
    cancels: Mutex<HashMap<String, watch::Sender<bool>>>,
    cancel_all: watch::Sender<bool>,
}

impl std::fmt::Debug for WorkerSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerSupervisor")
            .field("session_id", &self.session_id)
            .field("max_workers", &self.config.max_workers)
            .finish()
    }
}

impl WorkerSupervisor {
    pub fn new(
        session_id: impl Into<String>,
        config: &ResolvedConfig,
        launcher: Arc<dyn ProcessLauncher>,
        budget: Arc<BudgetTracker>,
        events: EventBus,
    ) -> Self {
        let (cancel_all, _) = watch::channel(false);
        Self {
            session_id: session_id.into(),
            config: config.worker.clone(),
            launcher,
            compressor: ResultCompressor::from_config(&config.results),
            budget,
            events,
            workers: Arc::new(WorkerTable::new()),
            permits: Arc::new(Semaphore::new(config.worker.max_workers.max(1))),
            cancels: Mutex::new(HashMap::new()),
            cancel_all,
        }
    }

    pub fn workers(&self) -> &Arc<WorkerTable> {
        &self.workers
    }

    pub fn budget(&self) -> &Arc<BudgetTracker> {
        &self.budget
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Register a queued worker so it can be reported and cancelled before it starts.
    pub fn enqueue(&self, worker_id: &str, request: &WorkRequest) {
        self.workers.register(worker_id, request);
        self.cancel_sender(worker_id);
        self.emit_status(worker_id, &request.id, WorkerStatus::Pending, None);
    }

    fn cancel_sender(&self, worker_id: &str) -> watch::Sender<bool> {
        let mut cancels = self.cancels.lock().unwrap_or_else(|e| e.into_inner());
        cancels
            .entry(worker_id.to_string())
            .or_insert_with(|| watch::channel(*self.cancel_all.borrow()).0)
            .clone()
    }

    /// Cancel one queued or running worker. Returns false for unknown or finished workers.
    pub fn cancel_worker(&self, worker_id: &str) -> bool {
        let Some(entry) = self.workers.get(worker_id) else {
            return false;
        };
        if entry.status.is_terminal() {
            return false;
        }
        info!(worker = %worker_id, "cancelling worker");
        self.cancel_sender(worker_id).send_replace(true);
        true
    }

    /// Cancel every worker, queued or running, and refuse new ones.
    pub fn cancel_all(&self) {
        info!("cancelling all workers");
        self.cancel_all.send_replace(true);
        let cancels = self.cancels.lock().unwrap_or_else(|e| e.into_inner());
        for sender in cancels.values() {
            sender.send_replace(true);
        }
    }

    /// Resolves once `worker_id` (or every worker) is cancelled.
    pub async fn wait_cancelled(&self, worker_id: &str) {
        let mut rx = self.cancel_sender(worker_id).subscribe();
        cancelled(&mut rx).await;
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.cancel_all.borrow()
    }

    pub fn is_cancelled(&self, worker_id: &str) -> bool {
        if self.is_shutting_down() {
            return true;
        }
        self.cancels
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(worker_id)
            .is_some_and(|s| *s.borrow())
    }

    fn emit_status(&self, worker_id: &str, request_id: &str, status: WorkerStatus, branch: Option<&str>) {
        self.events.emit(SessionEvent::WorkerStatus {
            worker_id: worker_id.to_string(),
            request_id: request_id.to_string(),
            status,
            branch: branch.map(str::to_string),
        });
    }

    /// Record a result for a unit that never reached `run` (provisioning failed, cancelled in queue).
    pub fn record_unstarted(&self, result: WorkerResult) -> WorkerResult {
        self.workers.complete(&result);
        self.forget_cancel(&result.worker_id);
        self.emit_completed(&result);
        result
    }

    fn forget_cancel(&self, worker_id: &str) {
        self.cancels
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(worker_id);
    }

    fn emit_completed(&self, result: &WorkerResult) {
        self.events.emit(SessionEvent::WorkerCompleted {
            worker_id: result.worker_id.clone(),
            request_id: result.request_id.clone(),
            status: result.status,
            partial: result.partial,
            summary: result.report.summary.clone(),
            cost: result.cost,
        });
    }

    /// Wait for a free worker slot. `None` when the worker is cancelled first.
    ///
    /// Callers that provision a worktree take the slot before provisioning, so
    /// live worktrees stay within `max_workers`.
    pub async fn acquire_slot(&self, worker_id: &str) -> Option<WorkerSlot> {
        let mut cancel_rx = self.cancel_sender(worker_id).subscribe();
        tokio::select! {
            biased;
            _ = cancelled(&mut cancel_rx) => None,
            permit = self.permits.clone().acquire_owned() => permit.ok().map(WorkerSlot),
        }
    }

    /// Run one worker handle to a terminal result, waiting for a slot first.
    pub async fn run(&self, handle: WorkerHandle, request: &WorkRequest, extra_context: &str) -> WorkerResult {
        let slot = self.acquire_slot(&handle.worker_id).await;
        self.run_in_slot(handle, request, extra_context, slot).await
    }

    /// Run one worker handle in a slot already taken with [`Self::acquire_slot`].
    #[instrument(skip_all, fields(worker = %handle.worker_id, request = %request.id))]
    pub async fn run_in_slot(
        &self,
        mut handle: WorkerHandle,
        request: &WorkRequest,
        extra_context: &str,
        slot: Option<WorkerSlot>,
    ) -> WorkerResult {
        let span = WorkerSpan::start(&handle.worker_id, &request.id);
        self.workers.register(&handle.worker_id, request);
        self.workers.attach_handle(&handle);
        let mut cancel_rx = self.cancel_sender(&handle.worker_id).subscribe();

        let result = self
            .run_inner(&mut handle, request, extra_context, slot, &mut cancel_rx, &span)
            .await;

        self.workers.complete(&result);
        self.forget_cancel(&handle.worker_id);
        self.emit_completed(&result);
        span.finish(result.status.as_str());
        result
    }

    async fn run_inner(
        &self,
        handle: &mut WorkerHandle,
        request: &WorkRequest,
        extra_context: &str,
        slot: Option<WorkerSlot>,
        cancel_rx: &mut watch::Receiver<bool>,
        span: &WorkerSpan,
    ) -> WorkerResult {
        let started_at = Utc::now();
        let worker_id = handle.worker_id.clone();

        let Some(_slot) = slot else {
            return self.unstarted(handle, WorkerStatus::Cancelled, "Cancelled before start");
        };
        if *cancel_rx.borrow() {
            return self.unstarted(handle, WorkerStatus::Cancelled, "Cancelled before start");
        }

        if let Err(e) = self.budget.can_spawn() {
            self.events.diagnostic(
                Diagnostic::new(DiagnosticKind::BudgetExceeded, e.to_string())
                    .with_worker(&worker_id)
                    .with_request(&request.id),
            );
            return self.unstarted(handle, WorkerStatus::Failed, format!("Budget exceeded: {}", e));
        }

        let worktree = handle.worktree();
        let result_file = worktree.result_file();
        let prompt = build_prompt(request, extra_context, &result_file);
        let spec = self.launch_spec(handle, &prompt, &result_file);

        let mut process = match self.launcher.launch(&spec) {
            Ok(process) => process,
            Err(e) => {
                self.events.diagnostic(
                    Diagnostic::new(
                        DiagnosticKind::WorkerCrash,
                        format!("failed to launch {}: {}", spec.program, e),
                    )
                    .with_worker(&worker_id)
                    .with_request(&request.id),
                );
                return self.unstarted(handle, WorkerStatus::Failed, format!("Failed to launch worker: {}", e));
            }
        };

        let timeout = request.timeout();
        handle.mark_running(process.id(), timeout);
        if let Some(pid) = handle.pid {
            span.record_pid(pid);
        }
        self.workers.attach_handle(handle);
        self.emit_status(&worker_id, &request.id, WorkerStatus::Running, Some(&handle.branch));
        debug!(pid = ?handle.pid, timeout_ms = request.timeout_ms, "worker launched");

        let ending = tokio::select! {
            exit = process.wait() => Ending::Exited(exit),
            _ = tokio::time::sleep(timeout) => Ending::TimedOut,
            _ = cancelled(cancel_rx) => Ending::Cancelled,
        };

        let grace = self.config.grace_period();
        let (status, exit_code, error) = match ending {
            Ending::Exited(Ok(Some(0))) => (WorkerStatus::Completed, Some(0), None),
            Ending::Exited(Ok(code)) => {
                let message = match code {
                    Some(code) => format!("Worker exited with code {}", code),
                    None => "Worker terminated by signal".to_string(),
                };
                (WorkerStatus::Failed, code, Some(message))
            }
            Ending::Exited(Err(e)) => {
                let _ = shutdown(process.as_mut(), grace).await;
                (WorkerStatus::Failed, None, Some(format!("Failed waiting for worker: {}", e)))
            }
            Ending::TimedOut => {
                warn!(timeout_ms = request.timeout_ms, "worker timed out, terminating");
                let code = shutdown(process.as_mut(), grace).await;
                (
                    WorkerStatus::TimedOut,
                    code,
                    Some(format!("Worker timed out after {}ms", request.timeout_ms)),
                )
            }
            Ending::Cancelled => {
                info!("worker cancelled, terminating");
                let code = shutdown(process.as_mut(), grace).await;
                (WorkerStatus::Cancelled, code, Some("Worker cancelled".to_string()))
            }
        };

        let output = process.collect_output(OUTPUT_JOIN_BOUND).await;
        drop(process);

        let worktree_path = worktree.path().to_path_buf();
        let parsed_report = read_report(&result_file).await;
        if status == WorkerStatus::Completed {
            apply_emitted_patch(&worktree_path, &output.stdout).await;
        }
        let change_set = capture_change_set(&worktree_path, &handle.base_commit, &worker_id).await;

        let mut report = parsed_report.unwrap_or_else(|| {
            WorkerReport::fallback(fallback_summary(&output.stdout), change_set.files.clone())
        });
        if status == WorkerStatus::TimedOut && report.status == ReportStatus::Success {
            report.status = ReportStatus::Partial;
        }

        match status {
            WorkerStatus::TimedOut => self.events.diagnostic(
                Diagnostic::new(
                    DiagnosticKind::WorkerTimeout,
                    format!(
                        "exceeded {}ms; partial change set has {} file(s)",
                        request.timeout_ms,
                        change_set.files.len()
                    ),
                )
                .with_worker(&worker_id)
                .with_request(&request.id),
            ),
            WorkerStatus::Failed => {
                let tail = output.stderr.lines().last().unwrap_or("").trim().to_string();
                let message = match (&error, tail.is_empty()) {
                    (Some(e), false) => format!("{}: {}", e, tail),
                    (Some(e), true) => e.clone(),
                    (None, _) => tail,
                };
                self.events.diagnostic(
                    Diagnostic::new(DiagnosticKind::WorkerCrash, message)
                        .with_worker(&worker_id)
                        .with_request(&request.id),
                );
            }
            _ => {}
        }

        let usage = total_usage(&output.stdout)
            .unwrap_or_else(|| BudgetTracker::estimate_usage_from_text(&output.stdout));
        let cost = self.record_usage(&usage, &worker_id, &request.id);

        WorkerResult {
            worker_id,
            request_id: request.id.clone(),
            status,
            change_set,
            output_excerpt: self.compressor.compress_output(&output.stdout),
            stderr_excerpt: self.compressor.compress_output(&output.stderr),
            partial: status == WorkerStatus::TimedOut,
            report,
            usage,
            cost,
            exit_code,
            error,
            branch: handle.branch.clone(),
            worktree_path,
            started_at,
            ended_at: Utc::now(),
            attempt: handle.attempt,
        }
    }

    fn launch_spec(&self, handle: &WorkerHandle, prompt: &str, result_file: &Path) -> LaunchSpec {
        let mut spec = LaunchSpec::new(&self.config.command, &handle.worktree_path)
            .args(self.config.args.iter().cloned());
        if let Some(model) = &self.config.model {
            spec = spec.arg("--model").arg(model);
        }
        spec.arg(prompt)
            .env(RESULT_FILE_ENV, result_file.display().to_string())
            .env(WORKER_ID_ENV, &handle.worker_id)
            .env(REQUEST_ID_ENV, &handle.request_id)
            .env(SESSION_ID_ENV, &self.session_id)
    }

    fn record_usage(&self, usage: &TokenUsage, worker_id: &str, request_id: &str) -> f64 {
        GLOBAL_METRICS.record_tokens(usage.input_tokens, usage.output_tokens);
        let update = self
            .budget
            .add_usage(usage, self.config.model.as_deref(), worker_id);
        if update.crossed_warning {
            warn!(
                total_cost = update.snapshot.total_cost,
                "budget warning threshold crossed"
            );
        }
        self.events.emit(SessionEvent::BudgetUpdated {
            snapshot: update.snapshot,
            warning: update.crossed_warning,
        });
        if let Err(e) = self.budget.worker_within_budget(worker_id) {
            self.events.diagnostic(
                Diagnostic::new(DiagnosticKind::BudgetExceeded, e.to_string())
                    .with_worker(worker_id)
                    .with_request(request_id),
            );
        }
        update.cost
    }

    fn unstarted(&self, handle: &WorkerHandle, status: WorkerStatus, error: impl Into<String>) -> WorkerResult {
        let mut result = WorkerResult::not_started(&handle.worker_id, &handle.request_id, status, error);
        result.branch = handle.branch.clone();
        result.worktree_path = handle.worktree_path.clone();
        result.attempt = handle.attempt;
        result
    }
}

/// Resolves once the receiver has seen `true`.
async fn cancelled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Prompt handed to a worker; always the final argument.
pub fn build_prompt(request: &WorkRequest, extra_context: &str, result_file: &Path) -> String {
    let mut prompt = String::new();
    prompt.push_str("You are a codi-swarm worker running in an isolated git worktree.\n\n");
    prompt.push_str("Task:\n");
    prompt.push_str(request.objective.trim());
    prompt.push_str("\n\nAllowed scope patterns:\n");
    if request.scope.is_empty() {
        prompt.push_str(&format!("- {}\n", describe_scope(&request.scope)));
    } else {
        for pattern in &request.scope {
            prompt.push_str(&format!("- {}\n", pattern));
        }
    }

    let context = request.context.trim();
    let extra = extra_context.trim();
    if !context.is_empty() || !extra.is_empty() {
        prompt.push_str("\nContext:\n");
        if !context.is_empty() {
            prompt.push_str(context);
            prompt.push('\n');
        }
        if !extra.is_empty() {
            prompt.push_str("\nAdditional context:\n");
            prompt.push_str(extra);
            prompt.push('\n');
        }
    }

    prompt.push_str("\nConstraints:\n");
    prompt.push_str("- Only modify files that match the allowed scope patterns.\n");
    prompt.push_str("- Do not commit; your changes are committed for you.\n");
    prompt.push_str("- Keep changes minimal and focused on the task.\n");

    prompt.push_str(&format!(
        "\nWhen you are done, write a JSON report to {}:\n",
        result_file.display()
    ));
    prompt.push_str(
        "{\"status\": \"success|partial|failed|blocked\", \"summary\": \"...\", \
         \"files_modified\": [], \"files_created\": [], \"files_deleted\": [], \
         \"key_decisions\": [], \"warnings\": [], \
         \"tests_status\": \"passed|failed|skipped\", \"confidence\": 0.0}\n",
    );
    prompt
}

/// Read and remove the worker's report. `None` when missing or invalid.
async fn read_report(path: &Path) -> Option<WorkerReport> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) => {
            debug!("no worker report at {}: {}", path.display(), e);
            return None;
        }
    };
    if let Err(e) = tokio::fs::remove_file(path).await {
        warn!("failed to remove worker report {}: {}", path.display(), e);
    }
    match WorkerReport::from_json(&content) {
        Ok(report) => Some(report),
        Err(e) => {
            warn!("invalid worker report {}: {}", path.display(), e);
            None
        }
    }
}

/// Summary for workers that left no report.
fn fallback_summary(stdout: &str) -> String {
    if let Some(message) = last_agent_message(stdout) {
        return message;
    }
    stdout
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| NO_REPORT_SUMMARY.to_string())
}

/// Extract the last fenced `diff`/`patch` block from worker output.
pub fn extract_patch(text: &str) -> Option<String> {
    let mut found = None;
    let mut current: Option<String> = None;
    for line in text.lines() {
        let trimmed = line.trim_start();
        match current.as_mut() {
            Some(body) => {
                if trimmed.starts_with("```") {
                    found = current.take().filter(|b| !b.trim().is_empty());
                } else {
                    body.push_str(line);
                    body.push('\n');
                }
            }
            None => {
                if let Some(info) = trimmed.strip_prefix("```") {
                    if matches!(info.trim(), "diff" | "patch") {
                        current = Some(String::new());
                    }
                }
            }
        }
    }
    found
}

/// Workers may emit a patch instead of editing files; apply it when the tree is clean.
async fn apply_emitted_patch(worktree: &Path, stdout: &str) {
    if !matches!(git::has_changes(worktree).await, Ok(false)) {
        return;
    }
    let Some(patch) = last_agent_message(stdout)
        .and_then(|m| extract_patch(&m))
        .or_else(|| extract_patch(stdout))
    else {
        return;
    };

    let patch_file = worktree.join(PATCH_FILE_NAME);
    if let Err(e) = tokio::fs::write(&patch_file, &patch).await {
        warn!("failed to stage emitted patch: {}", e);
        return;
    }
    let patch_arg = patch_file.display().to_string();
    match git::run_git(worktree, &["apply", "--whitespace=nowarn", &patch_arg]).await {
        Ok(_) => debug!("applied patch emitted on stdout"),
        Err(e) => warn!("emitted patch did not apply: {}", e),
    }
    let _ = tokio::fs::remove_file(&patch_file).await;
}

/// Commit everything in the worktree and diff it against the base commit.
async fn capture_change_set(worktree: &Path, base_commit: &str, worker_id: &str) -> ChangeSet {
    if !worktree.exists() {
        warn!("worktree {} vanished before capture", worktree.display());
        return ChangeSet::default();
    }
    let message = format!("chore(codi-swarm): {} output", worker_id);
    if let Err(e) = git::commit_all(worktree, &message).await {
        warn!("failed to commit worker output: {}", e);
    }
    match git::diff_between(worktree, base_commit, "HEAD").await {
        Ok(change_set) => change_set,
        Err(e) => {
            warn!("failed to diff worker output: {}", e);
            ChangeSet::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BudgetConfig;
    use crate::orchestrate::isolation::WorkspaceIsolator;
    use crate::orchestrate::process::TokioLauncher;
    use crate::orchestrate::test_support::create_test_repo;
    use crate::orchestrate::worktree::GitWorktreeIsolator;
    use tempfile::TempDir;

    struct Fixture {
        _repo: TempDir,
        _base: TempDir,
        isolator: GitWorktreeIsolator,
    }

    fn fixture() -> Fixture {
        let repo = create_test_repo();
        let base = TempDir::new().unwrap();
        let isolator = GitWorktreeIsolator::new(repo.path(), base.path(), "sess-test");
        Fixture {
            _repo: repo,
            _base: base,
            isolator,
        }
    }

    fn config(script: &str) -> ResolvedConfig {
        let mut config = ResolvedConfig::default();
        config.worker.command = "sh".to_string();
        config.worker.args = vec!["-c".to_string(), script.to_string(), "sh".to_string()];
        config.worker.grace_period_ms = 200;
        config
    }

    fn supervisor(config: &ResolvedConfig) -> WorkerSupervisor {
        WorkerSupervisor::new(
            "sess-test",
            config,
            Arc::new(TokioLauncher),
            Arc::new(BudgetTracker::new(config.budget.clone())),
            EventBus::new("sess-test"),
        )
    }

    async fn handle_for(fx: &Fixture, worker_id: &str, request: &WorkRequest) -> WorkerHandle {
        let worktree = fx.isolator.provision(worker_id, "HEAD").await.unwrap();
        WorkerHandle::new(worker_id, &request.id, "sess-test", &worktree)
    }

    fn request(objective: &str, timeout: Duration) -> WorkRequest {
        WorkRequest::new(objective, timeout)
    }

    #[test]
    fn test_build_prompt_sections() {
        let request = request("Add a jump", Duration::from_secs(5))
            .with_scope(vec!["src/player/**".to_string()])
            .with_context("Use the physics module");
        let prompt = build_prompt(&request, "Previous step w-1 summary: done", Path::new("/wt/r.json"));

        assert!(prompt.contains("Task:\nAdd a jump"));
        assert!(prompt.contains("- src/player/**"));
        assert!(prompt.contains("Use the physics module"));
        assert!(prompt.contains("Additional context:\nPrevious step w-1 summary: done"));
        assert!(prompt.contains("/wt/r.json"));

        let unrestricted = build_prompt(&WorkRequest::new("x", Duration::from_secs(1)), "", Path::new("r"));
        assert!(unrestricted.contains("- **/*"));
        assert!(!unrestricted.contains("Context:"));
    }

    #[test]
    fn test_fallback_summary() {
        let jsonl = r#"{"type":"item.completed","item":{"type":"agent_message","text":"All done"}}"#;
        assert_eq!(fallback_summary(jsonl), "All done");
        assert_eq!(fallback_summary("working\nfinished\n\n"), "finished");
        assert_eq!(fallback_summary(""), NO_REPORT_SUMMARY);
    }

    #[test]
    fn test_extract_patch() {
        let text = "Here you go:\n```diff\n--- a/x\n+++ b/x\n```\nthanks\n```rust\nfn x() {}\n```\n";
        assert_eq!(extract_patch(text).unwrap(), "--- a/x\n+++ b/x\n");
        assert!(extract_patch("no fences").is_none());
        assert!(extract_patch("```diff\n```\n").is_none());
    }

    #[test]
    fn test_worker_table() {
        let table = WorkerTable::new();
        let request = request("a", Duration::from_secs(1));
        table.register("w-1", &request);
        table.register("w-1", &request);
        assert_eq!(table.snapshot().len(), 1);
        assert_eq!(table.active_count(), 1);

        table.set_requires_approval("w-1", true);
        let mut result = WorkerResult::not_started("w-1", &request.id, WorkerStatus::Failed, "boom");
        result.report.summary = "boom".to_string();
        table.complete(&result);

        let entry = table.get("w-1").unwrap();
        assert_eq!(entry.status, WorkerStatus::Failed);
        assert!(entry.requires_approval);
        assert_eq!(entry.summary.as_deref(), Some("boom"));
        assert_eq!(table.active_count(), 0);
        assert!(table.get("w-2").is_none());
    }

    #[tokio::test]
    async fn test_run_completed_with_report() {
        let fx = fixture();
        let script = r#"
            echo "hello" > hello.txt
            printf '{"status":"success","summary":"wrote hello","confidence":0.9}' > "$CODI_SWARM_RESULT_FILE"
            echo done
        "#;
        let config = config(script);
        let supervisor = supervisor(&config);
        let request = request("Write hello", Duration::from_secs(20));
        let handle = handle_for(&fx, "w-1", &request).await;

        let result = supervisor.run(handle, &request, "").await;

        assert_eq!(result.status, WorkerStatus::Completed);
        assert_eq!(result.exit_code, Some(0));
        assert!(!result.partial);
        assert_eq!(result.report.summary, "wrote hello");
        assert_eq!(result.report.confidence, 0.9);
        assert_eq!(result.change_set.files, vec!["hello.txt"]);
        assert!(result.output_excerpt.contains("done"));
        assert!(result.cost > 0.0);
        // The report itself never lands in the change set.
        assert!(!result.change_set.patch.contains("wrote hello"));
        assert_eq!(
            supervisor.workers().get("w-1").unwrap().status,
            WorkerStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_run_without_report_uses_fallback() {
        let fx = fixture();
        let config = config("echo data > data.txt; echo 'last words'");
        let supervisor = supervisor(&config);
        let request = request("Write data", Duration::from_secs(20));
        let handle = handle_for(&fx, "w-1", &request).await;

        let result = supervisor.run(handle, &request, "").await;

        assert_eq!(result.status, WorkerStatus::Completed);
        assert_eq!(result.report.status, ReportStatus::Partial);
        assert_eq!(result.report.summary, "last words");
        assert_eq!(result.report.confidence, WorkerReport::FALLBACK_CONFIDENCE);
        assert_eq!(result.report.files_modified, vec!["data.txt"]);
    }

    #[tokio::test]
    async fn test_run_nonzero_exit_is_failed() {
        let fx = fixture();
        let config = config("echo oops >&2; exit 3");
        let supervisor = supervisor(&config);
        let request = request("Fail", Duration::from_secs(20));
        let handle = handle_for(&fx, "w-1", &request).await;

        let result = supervisor.run(handle, &request, "").await;

        assert_eq!(result.status, WorkerStatus::Failed);
        assert_eq!(result.exit_code, Some(3));
        assert!(result.stderr_excerpt.contains("oops"));
        let diagnostics = supervisor.events.diagnostics();
        assert!(diagnostics
            .iter()
            .any(|d| d.kind == DiagnosticKind::WorkerCrash && d.message.contains("oops")));
    }

    #[tokio::test]
    async fn test_run_timeout_captures_partial_change_set() {
        let fx = fixture();
        let config = config("echo partial > partial.txt; sleep 30");
        let supervisor = supervisor(&config);
        let request = request("Hang", Duration::from_millis(500));
        let handle = handle_for(&fx, "w-1", &request).await;
        let path = handle.worktree_path.clone();

        let result = supervisor.run(handle, &request, "").await;

        assert_eq!(result.status, WorkerStatus::TimedOut);
        assert!(result.partial);
        assert_eq!(result.change_set.files, vec!["partial.txt"]);
        assert!(path.join("partial.txt").exists());
        assert!(supervisor
            .events
            .diagnostics()
            .iter()
            .any(|d| d.kind == DiagnosticKind::WorkerTimeout));
    }

    #[tokio::test]
    async fn test_missing_program_is_failed_result() {
        let fx = fixture();
        let mut config = config("true");
        config.worker.command = "/nonexistent/codi-swarm-worker".to_string();
        let supervisor = supervisor(&config);
        let request = request("Nothing", Duration::from_secs(5));
        let handle = handle_for(&fx, "w-1", &request).await;

        let result = supervisor.run(handle, &request, "").await;

        assert_eq!(result.status, WorkerStatus::Failed);
        assert!(result.error.unwrap().contains("Failed to launch worker"));
    }

    #[tokio::test]
    async fn test_cancel_running_worker() {
        let fx = fixture();
        let config = config("sleep 30");
        let supervisor = Arc::new(supervisor(&config));
        let request = request("Sleep", Duration::from_secs(60));
        let handle = handle_for(&fx, "w-1", &request).await;

        let task = {
            let supervisor = supervisor.clone();
            let request = request.clone();
            tokio::spawn(async move { supervisor.run(handle, &request, "").await })
        };

        for _ in 0..100 {
            if supervisor
                .workers()
                .get("w-1")
                .is_some_and(|e| e.status == WorkerStatus::Running)
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(supervisor.cancel_worker("w-1"));

        let result = tokio::time::timeout(Duration::from_secs(10), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.status, WorkerStatus::Cancelled);
        assert!(!supervisor.cancel_worker("w-1"));
    }

    #[tokio::test]
    async fn test_cancelled_in_queue_never_launches() {
        let fx = fixture();
        let config = config("echo ran > ran.txt");
        let supervisor = supervisor(&config);
        let request = request("Queued", Duration::from_secs(5));
        supervisor.enqueue("w-1", &request);
        assert!(supervisor.cancel_worker("w-1"));
        assert!(supervisor.is_cancelled("w-1"));

        let handle = handle_for(&fx, "w-1", &request).await;
        let path = handle.worktree_path.clone();
        let result = supervisor.run(handle, &request, "").await;

        assert_eq!(result.status, WorkerStatus::Cancelled);
        assert!(!path.join("ran.txt").exists());
    }

    #[tokio::test]
    async fn test_budget_block() {
        let fx = fixture();
        let mut config = config("true");
        config.budget = BudgetConfig {
            max_total_tokens: 10,
            ..Default::default()
        };
        let supervisor = supervisor(&config);
        supervisor.budget().add_usage(
            &TokenUsage {
                input_tokens: 20,
                cached_input_tokens: 0,
                output_tokens: 0,
            },
            None,
            "earlier",
        );
        let request = request("Spend", Duration::from_secs(5));
        let handle = handle_for(&fx, "w-1", &request).await;

        let result = supervisor.run(handle, &request, "").await;

        assert_eq!(result.status, WorkerStatus::Failed);
        assert!(supervisor
            .events
            .diagnostics()
            .iter()
            .any(|d| d.kind == DiagnosticKind::BudgetExceeded));
    }

    #[tokio::test]
    async fn test_emitted_patch_is_applied() {
        let fx = fixture();
        let script = "printf '```diff\\n--- a/README.md\\n+++ b/README.md\\n@@ -1 +1 @@\\n-# Test\\n+# Patched\\n```\\n'";
        let config = config(script);
        let supervisor = supervisor(&config);
        let request = request("Patch readme", Duration::from_secs(20));
        let handle = handle_for(&fx, "w-1", &request).await;

        let result = supervisor.run(handle, &request, "").await;

        assert_eq!(result.status, WorkerStatus::Completed);
        assert_eq!(result.change_set.files, vec!["README.md"]);
        assert!(result.change_set.patch.contains("+# Patched"));
    }
}
