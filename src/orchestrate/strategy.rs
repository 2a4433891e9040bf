// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Execution strategies.
//!
//! A [`StrategyEngine`] turns a batch of work requests into worker runs and
//! merge outcomes. The four shapes are a closed set matched on [`Strategy`]:
//!
//! - **fan-out**: every request runs concurrently; results merge as one batch
//!   in request order once all of them are terminal.
//! - **pipeline**: one request at a time, each merged before the next is
//!   provisioned. A failed, conflicting or held step halts the rest.
//! - **map-reduce**: the map requests run as a fan-out, then a reducer runs in
//!   a worktree with every map output merged into it. Only the reducer merges.
//! - **debate**: participants run concurrently for a number of rounds, seeing
//!   each other's previous proposals; a [`DebatePolicy`] picks one winner.

use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

use crate::config::{DebateConfig, DebatePolicyKind, ResolvedConfig};
use crate::error::{Diagnostic, DiagnosticKind};
use crate::telemetry::TimedOperation;

use super::compress::{ReportEntry, ResultCompressor};
use super::dispatch::SwarmDirective;
use super::events::EventBus;
use super::git;
use super::isolation::{IsolationError, WorkspaceIsolator};
use super::merge::{merge_branch, merge_message, MergeAttempt, MergeCoordinator};
use super::scope::{union_scopes, ScopeChecker};
use super::supervisor::WorkerSupervisor;
use super::types::{
    short_id, MergeOutcome, MergeResolution, ReturnFormat, Strategy, WorkRequest, WorkerHandle,
    WorkerResult, WorkerStatus, Worktree,
};

const DEFAULT_REDUCE_OBJECTIVE: &str =
    "Consolidate the map outputs already merged into this worktree into one coherent change set.";

const ADJUDICATOR_TIMEOUT: Duration = Duration::from_secs(120);

// ============================================================================
// Queue gate
// ============================================================================

/// Pause switch for queued work. Running workers are unaffected.
#[derive(Debug, Clone)]
pub struct QueueGate {
    paused: Arc<watch::Sender<bool>>,
}

impl Default for QueueGate {
    fn default() -> Self {
        Self::new()
    }
}

impl QueueGate {
    pub fn new() -> Self {
        let (paused, _) = watch::channel(false);
        Self {
            paused: Arc::new(paused),
        }
    }

    pub fn pause(&self) {
        info!("queue paused");
        self.paused.send_replace(true);
    }

    pub fn resume(&self) {
        info!("queue resumed");
        self.paused.send_replace(false);
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    /// Resolves immediately unless paused, otherwise on resume.
    pub async fn wait_until_open(&self) {
        let mut rx = self.paused.subscribe();
        loop {
            if !*rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

// ============================================================================
// Debate policies
// ============================================================================

/// Picks the debate winner among final-round candidates.
///
/// Candidates are completed results with changes, in worker order. The
/// returned id must be one of them.
#[async_trait]
pub trait DebatePolicy: Send + Sync {
    fn name(&self) -> &'static str;

    async fn select(&self, candidates: &[WorkerResult]) -> Option<String>;
}

/// Highest reported confidence; ties go to the earliest worker.
#[derive(Debug, Default, Clone, Copy)]
pub struct HighestConfidence;

#[async_trait]
impl DebatePolicy for HighestConfidence {
    fn name(&self) -> &'static str {
        "highest-confidence"
    }

    async fn select(&self, candidates: &[WorkerResult]) -> Option<String> {
        highest_confidence(candidates.iter()).map(|r| r.worker_id.clone())
    }
}

fn highest_confidence<'a>(candidates: impl Iterator<Item = &'a WorkerResult>) -> Option<&'a WorkerResult> {
    candidates.fold(None, |best: Option<&WorkerResult>, candidate| match best {
        Some(best) if best.report.confidence >= candidate.report.confidence => Some(best),
        _ => Some(candidate),
    })
}

/// Largest group of identical change sets wins.
///
/// Groups are keyed by patch fingerprint; ties go to the group seen first and
/// the group's most confident member is returned.
#[derive(Debug, Default, Clone, Copy)]
pub struct MajorityVote;

#[async_trait]
impl DebatePolicy for MajorityVote {
    fn name(&self) -> &'static str {
        "majority"
    }

    async fn select(&self, candidates: &[WorkerResult]) -> Option<String> {
        let mut groups: Vec<(String, Vec<&WorkerResult>)> = Vec::new();
        for candidate in candidates {
            let fingerprint = candidate.change_set.fingerprint();
            match groups.iter_mut().find(|(f, _)| *f == fingerprint) {
                Some((_, members)) => members.push(candidate),
                None => groups.push((fingerprint, vec![candidate])),
            }
        }

        let mut largest: Option<&Vec<&WorkerResult>> = None;
        for (_, members) in &groups {
            if largest.map_or(true, |l| members.len() > l.len()) {
                largest = Some(members);
            }
        }
        largest
            .and_then(|members| highest_confidence(members.iter().copied()))
            .map(|r| r.worker_id.clone())
    }
}

/// Asks an external program.
///
/// The command runs under `sh -c`, receives the candidates as a JSON array on
/// stdin and prints the winning worker id. Any failure falls back to
/// [`HighestConfidence`].
#[derive(Debug, Clone)]
pub struct CommandAdjudicator {
    command: String,
    timeout: Duration,
}

#[derive(Serialize)]
struct CandidateView<'a> {
    worker_id: &'a str,
    summary: &'a str,
    confidence: f64,
    files: &'a [String],
    patch: &'a str,
}

impl CommandAdjudicator {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            timeout: ADJUDICATOR_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn ask(&self, payload: &str) -> io::Result<String> {
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(payload.as_bytes()).await?;
        }

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "adjudicator timed out"))??;
        if !output.status.success() {
            return Err(io::Error::other(format!(
                "adjudicator exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .unwrap_or("")
            .to_string())
    }
}

#[async_trait]
impl DebatePolicy for CommandAdjudicator {
    fn name(&self) -> &'static str {
        "command"
    }

    async fn select(&self, candidates: &[WorkerResult]) -> Option<String> {
        let views: Vec<CandidateView<'_>> = candidates
            .iter()
            .map(|c| CandidateView {
                worker_id: &c.worker_id,
                summary: &c.report.summary,
                confidence: c.report.confidence,
                files: &c.change_set.files,
                patch: &c.change_set.patch,
            })
            .collect();

        match serde_json::to_string(&views) {
            Ok(payload) => match self.ask(&payload).await {
                Ok(answer) if candidates.iter().any(|c| c.worker_id == answer) => return Some(answer),
                Ok(answer) => warn!("adjudicator picked unknown worker '{}'", answer),
                Err(e) => warn!("adjudicator failed: {}", e),
            },
            Err(e) => warn!("failed to encode debate candidates: {}", e),
        }
        HighestConfidence.select(candidates).await
    }
}

/// Policy named by the debate configuration.
pub fn policy_from_config(config: &DebateConfig) -> Arc<dyn DebatePolicy> {
    match (config.policy, config.adjudicator_command.as_deref()) {
        (DebatePolicyKind::Majority, _) => Arc::new(MajorityVote),
        (DebatePolicyKind::Command, Some(command)) if !command.trim().is_empty() => {
            Arc::new(CommandAdjudicator::new(command))
        }
        _ => Arc::new(HighestConfidence),
    }
}

// ============================================================================
// Batch report
// ============================================================================

/// Everything one strategy run produced.
#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub strategy: Strategy,
    /// Requests that ran, including synthesized ones (reducer, debate copies).
    pub requests: Vec<WorkRequest>,
    pub results: Vec<WorkerResult>,
    pub outcomes: Vec<MergeOutcome>,
    /// Requests never started because the batch halted.
    pub not_started: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub winner: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub abort_reason: Option<String>,
}

impl BatchReport {
    fn new(strategy: Strategy, requests: Vec<WorkRequest>) -> Self {
        Self {
            strategy,
            requests,
            results: Vec::new(),
            outcomes: Vec::new(),
            not_started: Vec::new(),
            winner: None,
            abort_reason: None,
        }
    }

    pub fn outcome_for(&self, worker_id: &str) -> Option<&MergeOutcome> {
        self.outcomes.iter().rev().find(|o| o.worker_id == worker_id)
    }

    pub fn format_for(&self, request_id: &str) -> ReturnFormat {
        self.requests
            .iter()
            .find(|r| r.id == request_id)
            .map(|r| r.return_format)
            .unwrap_or_default()
    }

    pub fn entries(&self) -> Vec<ReportEntry<'_>> {
        self.results
            .iter()
            .map(|result| ReportEntry {
                result,
                outcome: self.outcome_for(&result.worker_id),
                format: self.format_for(&result.request_id),
            })
            .collect()
    }

    pub fn applied_count(&self) -> usize {
        self.outcomes.iter().filter(|o| o.applied).count()
    }

    /// Aggregated text for the supervisor.
    pub fn render(&self, compressor: &ResultCompressor, title: &str) -> String {
        let mut text = compressor.aggregate(title, &self.entries());
        text.push_str(&format!(
            "\nStrategy: {} ({} of {} merged)\n",
            self.strategy,
            self.applied_count(),
            self.results.len()
        ));
        if let Some(winner) = &self.winner {
            text.push_str(&format!("Debate winner: {}\n", winner));
        }
        if !self.not_started.is_empty() {
            text.push_str(&format!("Not started: {}\n", self.not_started.join(", ")));
        }
        if let Some(reason) = &self.abort_reason {
            text.push_str(&format!("Session aborted: {}\n", reason));
        }
        text
    }
}

// ============================================================================
// Engine
// ============================================================================

/// Drives work requests through the supervisor and merge coordinator.
pub struct StrategyEngine {
    session_id: String,
    config: ResolvedConfig,
    isolator: Arc<dyn WorkspaceIsolator>,
    supervisor: Arc<WorkerSupervisor>,
    merger: Arc<MergeCoordinator>,
    policy: Arc<dyn DebatePolicy>,
    gate: QueueGate,
    events: EventBus,
    provision_failures: AtomicU32,
    abort_reason: Mutex<Option<String>>,
}

impl std::fmt::Debug for StrategyEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StrategyEngine")
            .field("session_id", &self.session_id)
            .field("policy", &self.policy.name())
            .field("paused", &self.gate.is_paused())
            .finish()
    }
}

impl StrategyEngine {
    pub fn new(
        session_id: impl Into<String>,
        config: &ResolvedConfig,
        isolator: Arc<dyn WorkspaceIsolator>,
        supervisor: Arc<WorkerSupervisor>,
        merger: Arc<MergeCoordinator>,
        events: EventBus,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            config: config.clone(),
            isolator,
            supervisor,
            merger,
            policy: policy_from_config(&config.debate),
            gate: QueueGate::new(),
            events,
            provision_failures: AtomicU32::new(0),
            abort_reason: Mutex::new(None),
        }
    }

    pub fn with_policy(mut self, policy: Arc<dyn DebatePolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn gate(&self) -> &QueueGate {
        &self.gate
    }

    /// Why the engine stopped accepting work, if it did.
    pub fn abort_reason(&self) -> Option<String> {
        self.abort_reason
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn abort(&self, reason: impl Into<String>) {
        let mut current = self.abort_reason.lock().unwrap_or_else(|e| e.into_inner());
        if current.is_none() {
            let reason = reason.into();
            warn!("strategy engine aborting: {}", reason);
            *current = Some(reason);
        }
    }

    fn halted(&self) -> bool {
        self.supervisor.is_shutting_down() || self.abort_reason().is_some()
    }

    /// Run a batch with the given shape.
    #[instrument(skip_all, fields(strategy = %swarm.strategy, requests = swarm.requests.len()))]
    pub async fn execute(self: &Arc<Self>, swarm: &SwarmDirective) -> BatchReport {
        let op = TimedOperation::start("strategy.execute");
        let requests = swarm.requests.clone();
        let mut report = match swarm.strategy {
            Strategy::FanOut => self.fan_out(requests).await,
            Strategy::Pipeline => self.pipeline(requests).await,
            Strategy::MapReduce => self.map_reduce(requests, swarm.reduce.as_deref()).await,
            Strategy::Debate => self.debate(requests, swarm.rounds, swarm.participants).await,
        };
        report.abort_reason = self.abort_reason();
        op.finish();
        report
    }

    async fn resolve_base(&self) -> String {
        let base_ref = &self.config.worktree.base_ref;
        match git::rev_parse(self.merger.repo_root(), base_ref).await {
            Ok(commit) => commit,
            Err(e) => {
                warn!("could not resolve base '{}': {}", base_ref, e);
                base_ref.clone()
            }
        }
    }

    async fn fan_out(self: &Arc<Self>, requests: Vec<WorkRequest>) -> BatchReport {
        let base = self.resolve_base().await;
        let units = requests.iter().map(|r| (r.clone(), String::new())).collect();
        let results = self.run_concurrent(units, &base).await;
        let outcomes = self.consume(&results, &requests).await;

        let mut report = BatchReport::new(Strategy::FanOut, requests);
        report.results = results;
        report.outcomes = outcomes;
        report
    }

    async fn pipeline(self: &Arc<Self>, requests: Vec<WorkRequest>) -> BatchReport {
        let mut report = BatchReport::new(Strategy::Pipeline, requests.clone());
        let mut rolling = String::new();

        for (index, request) in requests.iter().enumerate() {
            if self.halted() {
                report.not_started = requests[index..].iter().map(|r| r.id.clone()).collect();
                break;
            }

            let base = self.resolve_base().await;
            let worker_id = short_id("w");
            self.supervisor.enqueue(&worker_id, request);
            let result = self.run_unit(worker_id, request, &base, &rolling, &[]).await;
            let outcome = self
                .consume(std::slice::from_ref(&result), std::slice::from_ref(request))
                .await
                .pop()
                .unwrap_or_else(|| MergeOutcome::skipped(&result, "Not merged"));

            let halt = result.status != WorkerStatus::Completed
                || outcome.conflict
                || outcome.requires_approval;
            if outcome.conflict && !outcome.requires_approval {
                self.abort(format!(
                    "pipeline step {} ({}) conflicted with the base",
                    index + 1,
                    result.worker_id
                ));
            }

            rolling.push_str(&format!(
                "Previous step {} summary: {}\n",
                result.worker_id,
                result.report.summary.trim()
            ));
            report.results.push(result);
            report.outcomes.push(outcome);

            if halt {
                info!(step = index + 1, "pipeline halted");
                report.not_started = requests[index + 1..].iter().map(|r| r.id.clone()).collect();
                break;
            }
        }
        report
    }

    async fn map_reduce(self: &Arc<Self>, maps: Vec<WorkRequest>, reduce: Option<&str>) -> BatchReport {
        let base = self.resolve_base().await;
        let units = maps.iter().map(|r| (r.clone(), String::new())).collect();
        let map_results = self.run_concurrent(units, &base).await;
        let mut report = BatchReport::new(Strategy::MapReduce, maps.clone());

        // A map that edited outside its scope is held for approval and never
        // reaches the reducer's worktree.
        let mut outcomes: Vec<Option<MergeOutcome>> = vec![None; map_results.len()];
        if !self.supervisor.is_shutting_down() {
            for (index, (result, request)) in map_results.iter().zip(&maps).enumerate() {
                if escapes_scope(result, request) {
                    outcomes[index] = Some(self.merger.merge_candidate(result, request).await);
                }
            }
        }
        let foldable: Vec<WorkerResult> = map_results
            .iter()
            .zip(&outcomes)
            .filter(|(_, held)| held.is_none())
            .map(|(result, _)| result.clone())
            .collect();
        let usable = foldable
            .iter()
            .any(|r| r.status == WorkerStatus::Completed && !r.change_set.is_empty());

        if self.halted() || !usable {
            let message = if usable {
                "Session stopped before reduce"
            } else {
                "No map output to reduce"
            };
            for (result, held) in map_results.iter().zip(outcomes) {
                let outcome = match held {
                    Some(outcome) => outcome,
                    None => self.merger.dismiss(result, message).await,
                };
                report.outcomes.push(outcome);
            }
            report.results = map_results;
            return report;
        }

        let reducer = reducer_request(&maps, reduce, self.config.worker.timeout_ceiling());
        let mut extra = String::from("Map phase results:\n");
        for (result, held) in map_results.iter().zip(&outcomes) {
            let note = if held.is_some() {
                " [held for approval, not in this worktree]"
            } else {
                ""
            };
            extra.push_str(&format!(
                "- {} ({}){}: {}\n",
                result.worker_id,
                result.status,
                note,
                result.report.summary.trim()
            ));
        }

        let worker_id = short_id("w");
        self.supervisor.enqueue(&worker_id, &reducer);
        let reduce_result = self.run_unit(worker_id, &reducer, &base, &extra, &foldable).await;

        for (result, held) in map_results.iter().zip(outcomes) {
            let outcome = match held {
                Some(outcome) => outcome,
                None => {
                    let message = format!("Folded into reducer {}", reduce_result.worker_id);
                    self.merger.dismiss(result, message).await
                }
            };
            report.outcomes.push(outcome);
        }
        report.outcomes.extend(
            self.consume(std::slice::from_ref(&reduce_result), std::slice::from_ref(&reducer))
                .await,
        );

        report.requests.push(reducer);
        report.results = map_results;
        report.results.push(reduce_result);
        report
    }

    async fn debate(
        self: &Arc<Self>,
        requests: Vec<WorkRequest>,
        rounds: Option<u32>,
        participants: Option<usize>,
    ) -> BatchReport {
        let rounds = rounds.unwrap_or(self.config.debate.rounds).max(1);
        let participants = debate_participants(
            &requests,
            participants.unwrap_or(self.config.debate.participants),
        );
        let mut report = BatchReport::new(Strategy::Debate, participants.clone());
        let base = self.resolve_base().await;

        let mut previous: Vec<WorkerResult> = Vec::new();
        for round in 1..=rounds {
            if self.halted() {
                break;
            }
            debug!(round, rounds, "debate round");
            let units = participants
                .iter()
                .enumerate()
                .map(|(i, r)| (r.clone(), debate_context(round, rounds, i, &previous, &self.config)))
                .collect();
            let results = self.run_concurrent(units, &base).await;

            for result in &previous {
                self.merger
                    .supersede(result, format!("Superseded by debate round {}", round))
                    .await;
            }
            previous = results;
        }

        let candidates: Vec<WorkerResult> = previous
            .iter()
            .filter(|r| r.status == WorkerStatus::Completed && !r.change_set.is_empty())
            .cloned()
            .collect();
        let winner = if candidates.is_empty() || self.halted() {
            None
        } else {
            match self.policy.select(&candidates).await {
                Some(id) if candidates.iter().any(|c| c.worker_id == id) => Some(id),
                _ => candidates.first().map(|c| c.worker_id.clone()),
            }
        };
        info!(policy = self.policy.name(), winner = ?winner, "debate converged");

        for (result, request) in previous.iter().zip(&participants) {
            let outcome = match &winner {
                Some(id) if *id == result.worker_id => {
                    self.merger.merge_candidate(result, request).await
                }
                Some(id) => self.merger.dismiss(result, format!("Lost debate to {}", id)).await,
                None => self.merger.dismiss(result, "No debate winner selected").await,
            };
            report.outcomes.push(outcome);
        }

        report.winner = winner;
        report.results = previous;
        report
    }

    /// Merge results in order, or just release them once the session is stopping.
    async fn consume(&self, results: &[WorkerResult], requests: &[WorkRequest]) -> Vec<MergeOutcome> {
        if self.supervisor.is_shutting_down() {
            let mut outcomes = Vec::with_capacity(results.len());
            for result in results {
                outcomes.push(self.merger.dismiss(result, "Session cancelled").await);
            }
            return outcomes;
        }
        let pairs: Vec<(&WorkerResult, &WorkRequest)> = results.iter().zip(requests).collect();
        self.merger.merge_batch(&pairs).await
    }

    /// Run units concurrently; results come back in input order.
    ///
    /// Units are queued by priority (high first) and the supervisor's slots are
    /// handed out in queue order.
    async fn run_concurrent(
        self: &Arc<Self>,
        units: Vec<(WorkRequest, String)>,
        base: &str,
    ) -> Vec<WorkerResult> {
        let worker_ids: Vec<String> = units.iter().map(|_| short_id("w")).collect();
        let mut order: Vec<usize> = (0..units.len()).collect();
        order.sort_by_key(|&i| (units[i].0.priority.rank(), i));

        for &i in &order {
            self.supervisor.enqueue(&worker_ids[i], &units[i].0);
        }

        let mut tasks = JoinSet::new();
        for &i in &order {
            let engine = Arc::clone(self);
            let (request, extra) = units[i].clone();
            let worker_id = worker_ids[i].clone();
            let base = base.to_string();
            tasks.spawn(async move {
                let result = engine.run_unit(worker_id, &request, &base, &extra, &[]).await;
                (i, result)
            });
        }

        let mut slots: Vec<Option<WorkerResult>> = vec![None; units.len()];
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((i, result)) => slots[i] = Some(result),
                Err(e) => warn!("worker task failed: {}", e),
            }
        }

        slots
            .into_iter()
            .enumerate()
            .map(|(i, slot)| {
                slot.unwrap_or_else(|| {
                    self.supervisor.record_unstarted(WorkerResult::not_started(
                        &worker_ids[i],
                        &units[i].0.id,
                        WorkerStatus::Failed,
                        "Worker task panicked",
                    ))
                })
            })
            .collect()
    }

    /// Run one request, retrying failed attempts with fresh handles.
    async fn run_unit(
        &self,
        worker_id: String,
        request: &WorkRequest,
        base: &str,
        extra: &str,
        preload: &[WorkerResult],
    ) -> WorkerResult {
        let retries = self.config.worker.retry_count;
        let mut worker_id = worker_id;
        let mut attempt = 0;
        loop {
            let result = self
                .run_attempt(&worker_id, request, base, extra, preload, attempt)
                .await;
            let retry = matches!(result.status, WorkerStatus::Failed | WorkerStatus::TimedOut)
                && attempt < retries
                && !self.halted();
            if !retry {
                return result;
            }

            info!(worker = %worker_id, attempt = attempt + 1, "retrying failed worker");
            self.merger
                .dismiss(&result, format!("Attempt {} failed; retried", attempt + 1))
                .await;
            attempt += 1;
            worker_id = short_id("w");
            self.supervisor.enqueue(&worker_id, request);
        }
    }

    async fn run_attempt(
        &self,
        worker_id: &str,
        request: &WorkRequest,
        base: &str,
        extra: &str,
        preload: &[WorkerResult],
        attempt: u32,
    ) -> WorkerResult {
        tokio::select! {
            _ = self.gate.wait_until_open() => {}
            _ = self.supervisor.wait_cancelled(worker_id) => {}
        }

        let not_started = |status: WorkerStatus, error: String| {
            let mut result = WorkerResult::not_started(worker_id, &request.id, status, error);
            result.attempt = attempt;
            self.supervisor.record_unstarted(result)
        };
        if self.supervisor.is_cancelled(worker_id) {
            return not_started(WorkerStatus::Cancelled, "Cancelled before start".to_string());
        }
        if let Some(reason) = self.abort_reason() {
            return not_started(WorkerStatus::Cancelled, format!("Session aborted: {}", reason));
        }

        // Take the worker slot before provisioning so checkouts stay within max_workers.
        let Some(slot) = self.supervisor.acquire_slot(worker_id).await else {
            return not_started(WorkerStatus::Cancelled, "Cancelled before start".to_string());
        };
        let worktree = match self.isolator.provision(worker_id, base).await {
            Ok(worktree) => worktree,
            Err(e) => {
                self.provision_failed(worker_id, request, &e);
                return not_started(WorkerStatus::Failed, format!("Provisioning failed: {}", e));
            }
        };

        let mut extra = extra.to_string();
        if !preload.is_empty() {
            extra.push_str(&self.preload(&worktree, preload).await);
        }

        let mut handle = WorkerHandle::new(worker_id, &request.id, &self.session_id, &worktree);
        handle.attempt = attempt;
        self.supervisor.run_in_slot(handle, request, &extra, Some(slot)).await
    }

    fn provision_failed(&self, worker_id: &str, request: &WorkRequest, error: &IsolationError) {
        let failures = self.provision_failures.fetch_add(1, Ordering::SeqCst) + 1;
        self.events.diagnostic(
            Diagnostic::new(DiagnosticKind::ProvisionFailure, error.to_string())
                .with_worker(worker_id)
                .with_request(&request.id),
        );
        let limit = self.config.worker.max_provision_failures;
        if limit > 0 && failures >= limit {
            self.abort(format!("worktree provisioning failed {} times", failures));
        }
    }

    /// Merge map outputs into the reducer's worktree; returns notes for its prompt.
    async fn preload(&self, worktree: &Worktree, maps: &[WorkerResult]) -> String {
        let compressor = ResultCompressor::from_config(&self.config.results);
        let mut notes = String::from("\nMap outputs merged into this worktree:\n");
        for map in maps {
            if map.status != WorkerStatus::Completed || map.change_set.is_empty() {
                notes.push_str(&format!(
                    "- {} produced no usable changes ({})\n",
                    map.worker_id, map.status
                ));
                continue;
            }
            let message = merge_message(&map.worker_id, "map output");
            match merge_branch(&worktree.path, &map.branch, &message, MergeResolution::Abort).await {
                Ok(MergeAttempt::Merged(_)) => {
                    notes.push_str(&format!("- {} merged cleanly\n", map.worker_id));
                }
                Ok(MergeAttempt::Conflict(details)) => {
                    notes.push_str(&format!(
                        "- {} CONFLICTED and was not applied; reconcile it yourself.\n  {}\n```diff\n{}\n```\n",
                        map.worker_id,
                        details.lines().next().unwrap_or(""),
                        compressor.truncate_diff(&map.change_set.patch)
                    ));
                }
                Err(e) => {
                    notes.push_str(&format!("- {} could not be merged: {}\n", map.worker_id, e));
                }
            }
        }
        notes
    }
}

/// Whether a completed result changed paths its request did not allow.
fn escapes_scope(result: &WorkerResult, request: &WorkRequest) -> bool {
    result.status == WorkerStatus::Completed
        && !ScopeChecker::new(&request.scope)
            .out_of_scope(&result.change_set.files)
            .is_empty()
}

/// The synthesized reduce request for a set of map requests.
pub fn reducer_request(maps: &[WorkRequest], reduce: Option<&str>, ceiling: Duration) -> WorkRequest {
    let objective = reduce
        .map(str::trim)
        .filter(|r| !r.is_empty())
        .unwrap_or(DEFAULT_REDUCE_OBJECTIVE);
    let timeout = maps.iter().map(WorkRequest::timeout).max().unwrap_or(ceiling);
    let format = maps.first().map(|r| r.return_format).unwrap_or_default();

    WorkRequest::new(objective, timeout)
        .with_scope(union_scopes(maps.iter().map(|r| r.scope.as_slice())))
        .with_strategy(Strategy::MapReduce)
        .with_return_format(format)
}

/// Debate participants: the listed requests, or copies of a single one.
pub fn debate_participants(requests: &[WorkRequest], count: usize) -> Vec<WorkRequest> {
    if requests.len() != 1 {
        return requests.to_vec();
    }
    let original = &requests[0];
    (1..=count.max(1))
        .map(|n| {
            let mut copy = original.clone();
            copy.id = format!("{}-p{}", original.id, n);
            copy.strategy = Strategy::Debate;
            copy
        })
        .collect()
}

fn debate_context(
    round: u32,
    rounds: u32,
    index: usize,
    previous: &[WorkerResult],
    config: &ResolvedConfig,
) -> String {
    if round == 1 || previous.is_empty() {
        return format!(
            "Debate round {} of {}. Other participants are solving the same task independently; propose your best solution.",
            round, rounds
        );
    }

    let compressor = ResultCompressor::from_config(&config.results);
    let mut context = format!(
        "Debate round {} of {}. Review the other participants' proposals from round {} and produce your best solution; adopt, combine or improve on them.\n",
        round,
        rounds,
        round - 1
    );
    for (j, other) in previous.iter().enumerate() {
        if j == index {
            continue;
        }
        context.push_str(&format!(
            "\nProposal from {} ({}, confidence {:.2}):\n{}\n",
            other.worker_id,
            other.status,
            other.report.confidence,
            other.report.summary.trim()
        ));
        if !other.change_set.patch.trim().is_empty() {
            context.push_str(&format!(
                "```diff\n{}\n```\n",
                compressor.truncate_diff(&other.change_set.patch)
            ));
        }
    }
    context
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BudgetConfig;
    use crate::orchestrate::budget::BudgetTracker;
    use crate::orchestrate::process::TokioLauncher;
    use crate::orchestrate::test_support::{create_test_repo, git};
    use crate::orchestrate::types::{ChangeSet, Priority};
    use crate::orchestrate::worktree::GitWorktreeIsolator;
    use tempfile::TempDir;

    struct Fixture {
        repo: TempDir,
        _base: TempDir,
        engine: Arc<StrategyEngine>,
        supervisor: Arc<WorkerSupervisor>,
    }

    fn fixture(script: &str, tweak: impl FnOnce(&mut ResolvedConfig)) -> Fixture {
        let repo = create_test_repo();
        let base = TempDir::new().unwrap();
        let mut config = ResolvedConfig::default();
        config.worker.command = "sh".to_string();
        config.worker.args = vec!["-c".to_string(), script.to_string(), "sh".to_string()];
        config.worker.grace_period_ms = 200;
        config.budget = BudgetConfig {
            max_total_cost: 0.0,
            max_worker_cost: 0.0,
            max_total_tokens: 0,
            warn_at_percent: 80,
        };
        tweak(&mut config);

        let events = EventBus::new("sess-strategy");
        let isolator: Arc<dyn WorkspaceIsolator> =
            Arc::new(GitWorktreeIsolator::new(repo.path(), base.path(), "sess-strategy"));
        let supervisor = Arc::new(WorkerSupervisor::new(
            "sess-strategy",
            &config,
            Arc::new(TokioLauncher),
            Arc::new(BudgetTracker::new(config.budget.clone())),
            events.clone(),
        ));
        let merger = Arc::new(MergeCoordinator::new(
            repo.path(),
            &config.worktree,
            isolator.clone(),
            events.clone(),
        ));
        let engine = Arc::new(StrategyEngine::new(
            "sess-strategy",
            &config,
            isolator,
            supervisor.clone(),
            merger,
            events,
        ));
        Fixture {
            repo,
            _base: base,
            engine,
            supervisor,
        }
    }

    fn swarm(strategy: Strategy, objectives: &[&str]) -> SwarmDirective {
        SwarmDirective {
            strategy,
            requests: objectives
                .iter()
                .map(|o| WorkRequest::new(*o, Duration::from_secs(30)).with_strategy(strategy))
                .collect(),
            wait: true,
            rounds: None,
            participants: None,
            reduce: None,
        }
    }

    fn candidate(worker_id: &str, confidence: f64, patch: &str) -> WorkerResult {
        let mut result = WorkerResult::not_started(worker_id, "req-1", WorkerStatus::Completed, "");
        result.report.confidence = confidence;
        result.change_set = ChangeSet {
            files: vec!["a.txt".to_string()],
            patch: patch.to_string(),
        };
        result
    }

    #[tokio::test]
    async fn test_highest_confidence_prefers_earliest_on_tie() {
        let candidates = vec![
            candidate("w-1", 0.6, "+a"),
            candidate("w-2", 0.9, "+b"),
            candidate("w-3", 0.9, "+c"),
        ];
        assert_eq!(HighestConfidence.select(&candidates).await.as_deref(), Some("w-2"));
        assert_eq!(HighestConfidence.select(&[]).await, None);
    }

    #[tokio::test]
    async fn test_majority_vote_groups_identical_patches() {
        let candidates = vec![
            candidate("w-1", 0.9, "+solo"),
            candidate("w-2", 0.5, "+shared"),
            candidate("w-3", 0.7, "+shared"),
        ];
        assert_eq!(MajorityVote.select(&candidates).await.as_deref(), Some("w-3"));

        let split = vec![candidate("w-1", 0.2, "+a"), candidate("w-2", 0.9, "+b")];
        assert_eq!(MajorityVote.select(&split).await.as_deref(), Some("w-1"));
    }

    #[tokio::test]
    async fn test_command_adjudicator() {
        let candidates = vec![candidate("w-1", 0.9, "+a"), candidate("w-2", 0.1, "+b")];

        let picks_second = CommandAdjudicator::new("cat > /dev/null; echo w-2");
        assert_eq!(picks_second.select(&candidates).await.as_deref(), Some("w-2"));

        let reads_stdin = CommandAdjudicator::new("grep -q '\"worker_id\":\"w-1\"' && echo w-1");
        assert_eq!(reads_stdin.select(&candidates).await.as_deref(), Some("w-1"));

        let unknown = CommandAdjudicator::new("echo nobody");
        assert_eq!(unknown.select(&candidates).await.as_deref(), Some("w-1"));

        let failing = CommandAdjudicator::new("exit 1");
        assert_eq!(failing.select(&candidates).await.as_deref(), Some("w-1"));
    }

    #[test]
    fn test_policy_from_config() {
        let mut config = DebateConfig::default();
        assert_eq!(policy_from_config(&config).name(), "highest-confidence");
        config.policy = DebatePolicyKind::Majority;
        assert_eq!(policy_from_config(&config).name(), "majority");
        config.policy = DebatePolicyKind::Command;
        assert_eq!(policy_from_config(&config).name(), "highest-confidence");
        config.adjudicator_command = Some("echo w-1".to_string());
        assert_eq!(policy_from_config(&config).name(), "command");
    }

    #[test]
    fn test_reducer_request() {
        let maps = vec![
            WorkRequest::new("a", Duration::from_secs(10)).with_scope(vec!["src/".to_string()]),
            WorkRequest::new("b", Duration::from_secs(40)).with_scope(vec!["tests/".to_string()]),
        ];
        let reducer = reducer_request(&maps, None, Duration::from_secs(300));
        assert_eq!(reducer.objective, DEFAULT_REDUCE_OBJECTIVE);
        assert_eq!(reducer.scope, vec!["src/", "tests/"]);
        assert_eq!(reducer.timeout(), Duration::from_secs(40));
        assert_eq!(reducer.strategy, Strategy::MapReduce);

        let open = vec![WorkRequest::new("a", Duration::from_secs(10))];
        let reducer = reducer_request(&open, Some("combine"), Duration::from_secs(300));
        assert_eq!(reducer.objective, "combine");
        assert!(reducer.scope.is_empty());
    }

    #[test]
    fn test_debate_participants() {
        let one = vec![WorkRequest::new("design", Duration::from_secs(10))];
        let copies = debate_participants(&one, 3);
        assert_eq!(copies.len(), 3);
        assert_eq!(copies[1].id, format!("{}-p2", one[0].id));
        assert!(copies.iter().all(|c| c.objective == "design"));

        let two = vec![
            WorkRequest::new("a", Duration::from_secs(10)),
            WorkRequest::new("b", Duration::from_secs(10)),
        ];
        assert_eq!(debate_participants(&two, 5), two);
    }

    #[test]
    fn test_debate_context_shows_other_proposals() {
        let config = ResolvedConfig::default();
        let previous = vec![candidate("w-1", 0.5, "+mine"), candidate("w-2", 0.8, "+theirs")];
        let context = debate_context(2, 2, 0, &previous, &config);
        assert!(context.starts_with("Debate round 2 of 2."));
        assert!(context.contains("Proposal from w-2"));
        assert!(context.contains("+theirs"));
        assert!(!context.contains("+mine"));
        assert!(debate_context(1, 2, 0, &[], &config).contains("independently"));
    }

    #[tokio::test]
    async fn test_queue_gate() {
        let gate = QueueGate::new();
        gate.wait_until_open().await;

        gate.pause();
        assert!(gate.is_paused());
        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.wait_until_open().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        gate.resume();
        tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_fan_out_merges_in_request_order() {
        let fx = fixture(r#"echo "$CODI_SWARM_WORKER_ID" > "$CODI_SWARM_WORKER_ID.txt""#, |_| {});
        let mut batch = swarm(Strategy::FanOut, &["one", "two", "three"]);
        batch.requests[2].priority = Priority::High;

        let report = fx.engine.execute(&batch).await;

        assert_eq!(report.results.len(), 3);
        for (result, request) in report.results.iter().zip(&batch.requests) {
            assert_eq!(result.request_id, request.id);
            assert_eq!(result.status, WorkerStatus::Completed);
            assert!(fx.repo.path().join(format!("{}.txt", result.worker_id)).exists());
        }
        assert_eq!(report.applied_count(), 3);
        let ids: Vec<_> = report.outcomes.iter().map(|o| o.worker_id.clone()).collect();
        let expected: Vec<_> = report.results.iter().map(|r| r.worker_id.clone()).collect();
        assert_eq!(ids, expected);
    }

    #[tokio::test]
    async fn test_worktrees_wait_for_a_worker_slot() {
        let log = TempDir::new().unwrap();
        // Each worker counts sibling worktrees whose worker has not finished yet.
        let script = format!(
            r#"
            log="{}"
            here=$(pwd -P)
            live=0
            for dir in "$(dirname "$here")"/*/; do
              [ -e "$log/$(basename "$dir")" ] || live=$((live + 1))
            done
            echo "$live" >> "$log/live"
            sleep 0.2
            echo x > "out-$CODI_SWARM_WORKER_ID.txt"
            touch "$log/$(basename "$here")"
            "#,
            log.path().display()
        );
        let fx = fixture(&script, |config| config.worker.max_workers = 1);

        let report = fx
            .engine
            .execute(&swarm(Strategy::FanOut, &["one", "two", "three"]))
            .await;

        assert_eq!(report.applied_count(), 3);
        let counts = std::fs::read_to_string(log.path().join("live")).unwrap();
        assert_eq!(counts.lines().collect::<Vec<_>>(), vec!["1", "1", "1"]);
    }

    #[tokio::test]
    async fn test_pipeline_halts_after_failed_step() {
        let script = r#"
            case "$1" in
              *step-two*) exit 1 ;;
              *step-one*) echo one > one.txt ;;
              *step-three*) echo three > three.txt ;;
            esac
        "#;
        let fx = fixture(script, |_| {});
        let batch = swarm(Strategy::Pipeline, &["step-one", "step-two", "step-three"]);

        let report = fx.engine.execute(&batch).await;

        assert_eq!(report.results.len(), 2);
        assert_eq!(report.results[0].status, WorkerStatus::Completed);
        assert_eq!(report.results[1].status, WorkerStatus::Failed);
        assert_eq!(report.not_started, vec![batch.requests[2].id.clone()]);
        assert!(fx.repo.path().join("one.txt").exists());
        assert!(!fx.repo.path().join("three.txt").exists());
        assert!(report.abort_reason.is_none());
    }

    #[tokio::test]
    async fn test_pipeline_steps_see_previous_merges() {
        let script = r#"
            case "$1" in
              *first*) echo 1 > first.txt ;;
              *second*) if [ -f first.txt ]; then echo 2 > second.txt; else exit 1; fi ;;
            esac
        "#;
        let fx = fixture(script, |_| {});
        let report = fx
            .engine
            .execute(&swarm(Strategy::Pipeline, &["first", "second"]))
            .await;

        assert_eq!(report.applied_count(), 2);
        assert!(fx.repo.path().join("second.txt").exists());
    }

    #[tokio::test]
    async fn test_map_reduce_preloads_map_outputs() {
        let script = r#"
            case "$1" in
              *Consolidate*) if [ -f a.txt ] && [ -f b.txt ]; then echo ok > reduced.txt; fi ;;
              *alpha*) echo a > a.txt ;;
              *beta*) echo b > b.txt ;;
            esac
        "#;
        let fx = fixture(script, |_| {});
        let report = fx
            .engine
            .execute(&swarm(Strategy::MapReduce, &["alpha", "beta"]))
            .await;

        assert_eq!(report.results.len(), 3);
        assert_eq!(report.requests.len(), 3);
        let reducer = report.results.last().unwrap();
        assert_eq!(reducer.status, WorkerStatus::Completed);
        assert!(report.outcome_for(&reducer.worker_id).unwrap().applied);
        assert_eq!(report.applied_count(), 1);
        for name in ["a.txt", "b.txt", "reduced.txt"] {
            assert!(fx.repo.path().join(name).exists(), "{} missing", name);
        }
    }

    #[tokio::test]
    async fn test_map_reduce_holds_out_of_scope_map() {
        let script = r#"
            case "$1" in
              *Consolidate*)
                if [ -f docs/x.md ]; then echo leaked > leaked.txt; fi
                echo ok > reduced.txt ;;
              *alpha*) mkdir -p docs && echo x > docs/x.md ;;
              *beta*) echo b > b.txt ;;
            esac
        "#;
        let fx = fixture(script, |_| {});
        let mut batch = swarm(Strategy::MapReduce, &["alpha", "beta"]);
        batch.requests[0].scope = vec!["src/".to_string()];

        let report = fx.engine.execute(&batch).await;

        let alpha = &report.results[0];
        let held = report.outcome_for(&alpha.worker_id).unwrap();
        assert!(held.requires_approval);
        assert!(!held.applied);
        assert_eq!(held.out_of_scope_paths, vec!["docs/x.md".to_string()]);

        let reducer = report.results.last().unwrap();
        assert!(report.outcome_for(&reducer.worker_id).unwrap().applied);
        assert!(!fx.repo.path().join("docs/x.md").exists());
        assert!(!fx.repo.path().join("leaked.txt").exists());
        assert!(fx.repo.path().join("b.txt").exists());
        assert!(fx.repo.path().join("reduced.txt").exists());
    }

    #[tokio::test]
    async fn test_debate_merges_exactly_one_proposal() {
        let fx = fixture(r#"echo "$CODI_SWARM_WORKER_ID" > README.md"#, |_| {});
        let mut batch = swarm(Strategy::Debate, &["pick a readme"]);
        batch.rounds = Some(2);
        batch.participants = Some(2);

        let report = fx.engine.execute(&batch).await;

        assert_eq!(report.results.len(), 2);
        assert_eq!(report.applied_count(), 1);
        let winner = report.winner.clone().unwrap();
        let readme = std::fs::read_to_string(fx.repo.path().join("README.md")).unwrap();
        assert_eq!(readme.trim(), winner);

        let loser = report.results.iter().find(|r| r.worker_id != winner).unwrap();
        let outcome = report.outcome_for(&loser.worker_id).unwrap();
        assert!(!outcome.applied);
        assert!(!loser.worktree_path.exists());
        assert!(!git(fx.repo.path(), &["branch", "--list", &loser.branch]).is_empty());
    }

    #[tokio::test]
    async fn test_paused_queue_holds_workers() {
        let fx = fixture("echo x > x.txt", |_| {});
        fx.engine.gate().pause();

        let task = {
            let engine = fx.engine.clone();
            tokio::spawn(async move { engine.execute(&swarm(Strategy::FanOut, &["wait"])).await })
        };
        tokio::time::sleep(Duration::from_millis(200)).await;
        let entries = fx.supervisor.workers().snapshot();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].status, WorkerStatus::Pending);

        fx.engine.gate().resume();
        let report = tokio::time::timeout(Duration::from_secs(30), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.applied_count(), 1);
    }

    #[tokio::test]
    async fn test_cancel_queued_worker() {
        let fx = fixture("echo x > x.txt", |_| {});
        fx.engine.gate().pause();

        let task = {
            let engine = fx.engine.clone();
            tokio::spawn(async move { engine.execute(&swarm(Strategy::FanOut, &["queued"])).await })
        };
        tokio::time::sleep(Duration::from_millis(200)).await;
        let worker_id = fx.supervisor.workers().snapshot()[0].worker_id.clone();
        assert!(fx.supervisor.cancel_worker(&worker_id));

        let report = tokio::time::timeout(Duration::from_secs(10), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.results[0].status, WorkerStatus::Cancelled);
        assert!(!fx.repo.path().join("x.txt").exists());
    }

    #[tokio::test]
    async fn test_retry_uses_fresh_handle() {
        let fx = fixture("exit 2", |config| config.worker.retry_count = 1);
        let report = fx.engine.execute(&swarm(Strategy::FanOut, &["flaky"])).await;

        assert_eq!(report.results.len(), 1);
        assert_eq!(report.results[0].attempt, 1);
        assert_eq!(report.results[0].status, WorkerStatus::Failed);
        assert_eq!(fx.supervisor.workers().snapshot().len(), 2);
    }

    #[tokio::test]
    async fn test_repeated_provision_failures_abort() {
        let fx = fixture("true", |config| {
            config.worktree.base_ref = "no-such-ref".to_string();
            config.worker.max_provision_failures = 2;
        });
        let report = fx
            .engine
            .execute(&swarm(Strategy::Pipeline, &["a", "b", "c"]))
            .await;

        // First failure halts the pipeline; the second batch trips the limit.
        assert_eq!(report.results[0].status, WorkerStatus::Failed);
        assert!(report.abort_reason.is_none());

        let report = fx.engine.execute(&swarm(Strategy::FanOut, &["d"])).await;
        assert_eq!(report.results[0].status, WorkerStatus::Failed);
        assert!(report.abort_reason.unwrap().contains("provisioning failed 2 times"));
    }
}
