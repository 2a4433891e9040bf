// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Session controller.
//!
//! A [`Session`] owns one orchestration run against a base repository. It
//! turns supervisor output into dispatches and runs them through the strategy
//! engine, answering through the response channel.
//!
//! ```text
//! Created ──► Running(idle ⇄ dispatching) ⇄ Merging
//!                 │                            │
//!                 └──► Completed | Aborted | Cancelled ◄──┘
//! ```
//!
//! Once terminal, a session accepts no further work.

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

use crate::config::{ChannelMode, ResolvedConfig};
use crate::error::{Diagnostic, SessionError};

use super::budget::{BudgetSnapshot, BudgetTracker};
use super::compress::ResultCompressor;
use super::dispatch::{Directive, Dispatch, DispatchInterpreter, SwarmDirective};
use super::events::{EventBus, SessionEvent};
use super::git;
use super::ipc::{ClientMessage, IpcServer, ServerMessage};
use super::isolation::WorkspaceIsolator;
use super::merge::{MergeCoordinator, MergeError};
use super::process::{ProcessLauncher, TokioLauncher};
use super::response::{ArtifactSink, Delivery, ResponseChannel, ResponseSink, SocketSink};
use super::strategy::{BatchReport, DebatePolicy, StrategyEngine};
use super::supervisor::WorkerSupervisor;
use super::types::{
    short_id, MergeOutcome, MergeResolution, ReleaseMode, Strategy, WorkRequest, WorkerStatus,
};
use super::worktree::GitWorktreeIsolator;

/// Session records directory, relative to the repository root.
pub const HISTORY_DIR: &str = ".codi-swarm/history";

// ============================================================================
// State machine
// ============================================================================

/// Whether a running session is executing a dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Idle,
    Dispatching,
}

/// Lifecycle state of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SessionState {
    Created,
    Running { phase: RunPhase },
    Merging,
    Completed,
    Aborted { reason: String },
    Cancelled,
}

impl SessionState {
    pub fn running() -> Self {
        Self::Running {
            phase: RunPhase::Idle,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running {
                phase: RunPhase::Idle,
            } => "running",
            Self::Running {
                phase: RunPhase::Dispatching,
            } => "dispatching",
            Self::Merging => "merging",
            Self::Completed => "completed",
            Self::Aborted { .. } => "aborted",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Aborted { .. } | Self::Cancelled)
    }

    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running { .. })
    }

    /// Whether `next` is a legal successor of this state.
    pub fn can_transition_to(&self, next: &SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (Created, Running { .. }) | (Created, Aborted { .. }) => true,
            (Running { .. }, Running { .. }) => true,
            (Running { .. }, Merging) | (Merging, Running { .. }) => true,
            (Running { .. } | Merging, Completed | Aborted { .. } | Cancelled) => true,
            _ => false,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Aborted { reason } => write!(f, "aborted ({})", reason),
            other => f.write_str(other.name()),
        }
    }
}

// ============================================================================
// Records and reports
// ============================================================================

/// One worker as it appears in the session record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSummary {
    pub worker_id: String,
    pub request_id: String,
    pub status: WorkerStatus,
    pub partial: bool,
    pub summary: String,
    pub branch: String,
    pub attempt: u32,
    pub cost: f64,
    pub duration_ms: u64,
}

/// Everything a finished session leaves behind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: String,
    pub state: SessionState,
    pub repo_root: PathBuf,
    pub strategies: Vec<Strategy>,
    pub requests: Vec<WorkRequest>,
    pub workers: Vec<WorkerSummary>,
    pub outcomes: Vec<MergeOutcome>,
    pub diagnostics: Vec<Diagnostic>,
    pub budget: BudgetSnapshot,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

/// Destination for finished session records.
pub trait RecordSink: Send + Sync {
    /// Persist `record`; returns where it went.
    fn write(&self, record: &SessionRecord) -> Result<String, SessionError>;
}

/// Writes one pretty-printed JSON file per session.
#[derive(Debug, Clone)]
pub struct JsonRecordSink {
    dir: PathBuf,
}

impl JsonRecordSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, session_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", session_id))
    }
}

impl RecordSink for JsonRecordSink {
    fn write(&self, record: &SessionRecord) -> Result<String, SessionError> {
        std::fs::create_dir_all(&self.dir)?;
        let content = serde_json::to_string_pretty(record)
            .map_err(|e| SessionError::RecordFailed(e.to_string()))?;
        let path = self.path_for(&record.id);
        std::fs::write(&path, content)?;
        Ok(path.display().to_string())
    }
}

/// One row of the status report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerStatusLine {
    pub worker_id: String,
    pub request_id: String,
    pub objective: String,
    pub status: WorkerStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    pub requires_approval: bool,
    pub running: bool,
}

/// Answer to `check_workers` and `status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReport {
    pub session_id: String,
    pub state: String,
    pub paused: bool,
    pub workers: Vec<WorkerStatusLine>,
    pub pending_approvals: Vec<String>,
    pub budget: BudgetSnapshot,
}

/// Render a status report as response text.
pub fn render_status(report: &StatusReport) -> String {
    let mut text = format!(
        "## codi-swarm status\n\nSession: {} ({})\nQueue: {}\n",
        report.session_id,
        report.state,
        if report.paused { "paused" } else { "open" }
    );
    if report.workers.is_empty() {
        text.push_str("\nNo workers.\n");
    } else {
        text.push('\n');
        for worker in &report.workers {
            text.push_str(&format!(
                "- {} [{}] {}",
                worker.worker_id, worker.status, worker.objective
            ));
            if let Some(branch) = &worker.branch {
                text.push_str(&format!(" ({})", branch));
            }
            if worker.requires_approval {
                text.push_str(" - awaiting approval");
            }
            text.push('\n');
        }
    }
    if !report.pending_approvals.is_empty() {
        text.push_str(&format!(
            "\nPending approvals: {}\n",
            report.pending_approvals.join(", ")
        ));
    }
    text.push_str(&format!(
        "\nBudget: {} tokens, ${:.4}\n",
        report.budget.total_tokens, report.budget.total_cost
    ));
    text
}

fn render_outcomes(outcomes: &[MergeOutcome]) -> String {
    let mut text = String::from("## codi-swarm: merge_results\n\n");
    if outcomes.is_empty() {
        text.push_str("Nothing was awaiting approval.\n");
    }
    for outcome in outcomes {
        text.push_str(&format!("- {}: {}", outcome.worker_id, outcome.label()));
        if !outcome.message.is_empty() {
            text.push_str(&format!(" - {}", outcome.message));
        }
        text.push('\n');
    }
    text
}

/// What one handled dispatch produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchReply {
    pub marker: String,
    pub text: String,
    /// Where the response landed; absent when delivery failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

// ============================================================================
// Builder
// ============================================================================

/// Assembles a [`Session`], substituting collaborators for tests and embedders.
pub struct SessionBuilder {
    repo: PathBuf,
    config: ResolvedConfig,
    session_id: Option<String>,
    launcher: Option<Arc<dyn ProcessLauncher>>,
    isolator: Option<Arc<dyn WorkspaceIsolator>>,
    sink: Option<Arc<dyn ResponseSink>>,
    server: Option<Arc<IpcServer>>,
    policy: Option<Arc<dyn DebatePolicy>>,
    record_sink: Option<Arc<dyn RecordSink>>,
}

impl SessionBuilder {
    pub fn new(repo: impl Into<PathBuf>, config: ResolvedConfig) -> Self {
        Self {
            repo: repo.into(),
            config,
            session_id: None,
            launcher: None,
            isolator: None,
            sink: None,
            server: None,
            policy: None,
            record_sink: None,
        }
    }

    pub fn session_id(mut self, id: impl Into<String>) -> Self {
        self.session_id = Some(id.into());
        self
    }

    pub fn launcher(mut self, launcher: Arc<dyn ProcessLauncher>) -> Self {
        self.launcher = Some(launcher);
        self
    }

    pub fn isolator(mut self, isolator: Arc<dyn WorkspaceIsolator>) -> Self {
        self.isolator = Some(isolator);
        self
    }

    pub fn response_sink(mut self, sink: Arc<dyn ResponseSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Control socket used by the socket response mode.
    pub fn control_server(mut self, server: Arc<IpcServer>) -> Self {
        self.server = Some(server);
        self
    }

    pub fn debate_policy(mut self, policy: Arc<dyn DebatePolicy>) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn record_sink(mut self, sink: Arc<dyn RecordSink>) -> Self {
        self.record_sink = Some(sink);
        self
    }

    /// Build and start the session.
    ///
    /// When the repository cannot be read the session is returned already
    /// aborted, so callers always get something to report on.
    pub async fn build(self) -> Session {
        let id = self.session_id.unwrap_or_else(|| short_id("s"));
        let config = self.config;
        let (repo_root, unavailable) = match git::repo_root(&self.repo).await {
            Ok(root) => (root, None),
            Err(e) => (self.repo.clone(), Some(e.to_string())),
        };

        let events = EventBus::new(&id);
        let isolator = self.isolator.unwrap_or_else(|| {
            Arc::new(GitWorktreeIsolator::new(
                &repo_root,
                &config.worktree.base_dir,
                &id,
            )) as Arc<dyn WorkspaceIsolator>
        });
        let launcher = self
            .launcher
            .unwrap_or_else(|| Arc::new(TokioLauncher) as Arc<dyn ProcessLauncher>);
        let budget = Arc::new(BudgetTracker::new(config.budget.clone()));
        let supervisor = Arc::new(WorkerSupervisor::new(
            &id,
            &config,
            launcher,
            budget,
            events.clone(),
        ));
        let merger = Arc::new(MergeCoordinator::new(
            &repo_root,
            &config.worktree,
            isolator.clone(),
            events.clone(),
        ));
        let mut engine = StrategyEngine::new(
            &id,
            &config,
            isolator.clone(),
            supervisor.clone(),
            merger.clone(),
            events.clone(),
        );
        if let Some(policy) = self.policy {
            engine = engine.with_policy(policy);
        }

        let artifact = || -> (Arc<dyn ResponseSink>, String) {
            let sink = ArtifactSink::new(&repo_root, &config.results.response_dir, &id);
            let location = sink.path().display().to_string();
            (Arc::new(sink), location)
        };
        let (sink, response_location) = match (self.sink, config.channel.mode, self.server) {
            (Some(sink), _, _) => (sink, "custom sink".to_string()),
            (None, ChannelMode::Socket, Some(server)) => {
                let location = server.socket_path().display().to_string();
                (Arc::new(SocketSink::new(server)) as Arc<dyn ResponseSink>, location)
            }
            (None, ChannelMode::Socket, None) => {
                warn!("socket response mode without a control server, writing the artifact instead");
                artifact()
            }
            (None, ChannelMode::Artifact, _) => artifact(),
        };

        let record_sink = self
            .record_sink
            .unwrap_or_else(|| {
                Arc::new(JsonRecordSink::new(repo_root.join(HISTORY_DIR))) as Arc<dyn RecordSink>
            });
        let (in_flight, _) = watch::channel(0usize);

        let session = Session {
            inner: Arc::new(SessionInner {
                id,
                interpreter: DispatchInterpreter::new(config.worker.timeout_ceiling()),
                compressor: ResultCompressor::from_config(&config.results),
                channel: ResponseChannel::new(sink, &config.channel, events.clone()),
                response_location,
                repo_root,
                config,
                started_at: Utc::now(),
                ended_at: Mutex::new(None),
                state: Mutex::new(SessionState::Created),
                events,
                isolator,
                supervisor,
                merger,
                engine: Arc::new(engine),
                history: Mutex::new(History::default()),
                background: Mutex::new(JoinSet::new()),
                in_flight,
                record_sink: Some(record_sink),
            }),
        };

        match unavailable {
            Some(reason) => {
                let error = SessionError::RepositoryUnavailable {
                    path: session.inner.repo_root.display().to_string(),
                    reason,
                };
                warn!("{}", error);
                session.force_state(SessionState::Aborted {
                    reason: error.to_string(),
                });
            }
            None => session.start().await,
        }
        session
    }
}

// ============================================================================
// Session
// ============================================================================

#[derive(Default)]
struct History {
    reports: Vec<BatchReport>,
    approvals: Vec<MergeOutcome>,
}

struct SessionInner {
    id: String,
    repo_root: PathBuf,
    config: ResolvedConfig,
    started_at: DateTime<Utc>,
    ended_at: Mutex<Option<DateTime<Utc>>>,
    state: Mutex<SessionState>,
    events: EventBus,
    interpreter: DispatchInterpreter,
    isolator: Arc<dyn WorkspaceIsolator>,
    supervisor: Arc<WorkerSupervisor>,
    merger: Arc<MergeCoordinator>,
    engine: Arc<StrategyEngine>,
    channel: ResponseChannel,
    response_location: String,
    compressor: ResultCompressor,
    history: Mutex<History>,
    background: Mutex<JoinSet<()>>,
    in_flight: watch::Sender<usize>,
    record_sink: Option<Arc<dyn RecordSink>>,
}

impl SessionInner {
    fn state(&self) -> SessionState {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Apply a validated transition and announce it.
    fn transition(&self, next: SessionState) -> Result<(), SessionError> {
        let from = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if *state == next {
                return Ok(());
            }
            if state.is_terminal() {
                return Err(SessionError::Terminal(state.name().to_string()));
            }
            if !state.can_transition_to(&next) {
                return Err(SessionError::InvalidTransition {
                    from: state.name().to_string(),
                    to: next.name().to_string(),
                });
            }
            std::mem::replace(&mut *state, next.clone())
        };
        debug!(session = %self.id, "state {} -> {}", from.name(), next.name());
        self.events.emit(SessionEvent::StateChanged {
            from: from.name().to_string(),
            to: next.name().to_string(),
        });
        Ok(())
    }

    /// Running phase matching the in-flight count.
    fn settled_running(&self) -> SessionState {
        let phase = if *self.in_flight.borrow() > 0 {
            RunPhase::Dispatching
        } else {
            RunPhase::Idle
        };
        SessionState::Running { phase }
    }

    fn end_dispatch(&self) {
        self.in_flight.send_modify(|n| *n = n.saturating_sub(1));
        if self.state().is_running() {
            let _ = self.transition(self.settled_running());
        }
    }
}

/// Keeps a dispatch counted as in flight until dropped.
struct DispatchGuard {
    inner: Arc<SessionInner>,
}

impl Drop for DispatchGuard {
    fn drop(&mut self) {
        self.inner.end_dispatch();
    }
}

/// One orchestration session. Cheap to clone; clones share everything.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("state", &self.inner.state())
            .field("repo_root", &self.inner.repo_root)
            .finish()
    }
}

impl Session {
    pub fn builder(repo: impl Into<PathBuf>, config: ResolvedConfig) -> SessionBuilder {
        SessionBuilder::new(repo, config)
    }

    /// Open a session on `repo` with default collaborators.
    pub async fn open(repo: impl Into<PathBuf>, config: ResolvedConfig) -> Session {
        SessionBuilder::new(repo, config).build().await
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn state(&self) -> SessionState {
        self.inner.state()
    }

    pub fn repo_root(&self) -> &Path {
        &self.inner.repo_root
    }

    pub fn config(&self) -> &ResolvedConfig {
        &self.inner.config
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub fn supervisor(&self) -> &Arc<WorkerSupervisor> {
        &self.inner.supervisor
    }

    pub fn merger(&self) -> &Arc<MergeCoordinator> {
        &self.inner.merger
    }

    /// Where responses are delivered.
    pub fn response_location(&self) -> &str {
        &self.inner.response_location
    }

    pub fn diagnostics(&self) -> Vec<Diagnostic> {
        self.inner.events.diagnostics()
    }

    pub fn is_paused(&self) -> bool {
        self.inner.engine.gate().is_paused()
    }

    fn force_state(&self, next: SessionState) {
        if let Err(e) = self.inner.transition(next) {
            debug!("state change ignored: {}", e);
        }
    }

    async fn start(&self) {
        match self.inner.isolator.cleanup_stale().await {
            Ok(0) => {}
            Ok(removed) => info!("removed {} stale worktrees", removed),
            Err(e) => warn!("stale worktree cleanup failed: {}", e),
        }
        self.force_state(SessionState::running());
        info!(session = %self.inner.id, repo = ?self.inner.repo_root, "session started");
    }

    fn ensure_accepting(&self) -> Result<(), SessionError> {
        let state = self.state();
        if state.is_terminal() {
            return Err(SessionError::Terminal(state.name().to_string()));
        }
        if self.inner.supervisor.is_shutting_down() {
            return Err(SessionError::Terminal("cancelling".to_string()));
        }
        if state == SessionState::Created {
            return Err(SessionError::InvalidTransition {
                from: state.name().to_string(),
                to: "dispatching".to_string(),
            });
        }
        Ok(())
    }

    fn begin_dispatch(&self) -> DispatchGuard {
        self.inner.in_flight.send_modify(|n| *n += 1);
        if self.state().is_running() {
            self.force_state(SessionState::Running {
                phase: RunPhase::Dispatching,
            });
        }
        DispatchGuard {
            inner: Arc::clone(&self.inner),
        }
    }

    fn skip(&self, diagnostic: Diagnostic) {
        let message = diagnostic.message.clone();
        self.inner.events.diagnostic(diagnostic);
        self.inner
            .events
            .emit(SessionEvent::DispatchSkipped { message });
    }

    // ------------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------------

    /// Handle every dispatch block in a piece of supervisor output, in order.
    ///
    /// Invalid blocks are skipped with a diagnostic; the rest still run.
    #[instrument(skip_all, fields(session = %self.inner.id))]
    pub async fn handle_output(&self, text: &str) -> Result<Vec<DispatchReply>, SessionError> {
        self.ensure_accepting()?;
        let batch = self.inner.interpreter.interpret(text);
        for diagnostic in batch.diagnostics {
            self.skip(diagnostic);
        }

        let mut replies = Vec::new();
        for dispatch in batch.dispatches {
            if self.state().is_terminal() {
                self.inner.events.emit(SessionEvent::DispatchSkipped {
                    message: format!(
                        "{} ignored: session is {}",
                        dispatch.directive.kind().as_str(),
                        self.state().name()
                    ),
                });
                continue;
            }
            replies.push(self.handle_dispatch(dispatch, None).await?);
        }
        Ok(replies)
    }

    /// Run one dispatch and deliver its response.
    ///
    /// `reply_to` links the response to a control message.
    pub async fn handle_dispatch(
        &self,
        dispatch: Dispatch,
        reply_to: Option<String>,
    ) -> Result<DispatchReply, SessionError> {
        self.ensure_accepting()?;
        let _guard = self.begin_dispatch();
        let kind = dispatch.directive.kind();
        self.inner.events.emit(SessionEvent::DispatchReceived {
            directive: kind.as_str().to_string(),
            request_id: dispatch.request_id.clone(),
            requests: dispatch.directive.requests().len(),
        });
        let marker = Delivery::new(dispatch.request_id.as_deref(), "").marker;

        let text = match dispatch.directive {
            Directive::SpawnAgent { request } => {
                let swarm = SwarmDirective {
                    strategy: Strategy::FanOut,
                    requests: vec![request],
                    wait: true,
                    rounds: None,
                    participants: None,
                    reduce: None,
                };
                self.run_swarm(&swarm).await
            }
            Directive::SpawnSwarm(swarm) if !swarm.wait => {
                self.launch_background(swarm, &marker, reply_to.clone())
            }
            Directive::SpawnSwarm(swarm) => self.run_swarm(&swarm).await,
            Directive::CheckWorkers { worker_ids } => render_status(&self.status(&worker_ids)),
            Directive::MergeResults {
                worker_ids,
                resolution,
            } => match self.approve(&worker_ids, resolution).await {
                Ok(outcomes) => render_outcomes(&outcomes),
                Err(e) => format!("## codi-swarm: merge_results\n\nFailed: {}\n", e),
            },
        };

        let location = self.deliver(&marker, &text, reply_to).await;
        self.check_abort();
        Ok(DispatchReply {
            marker,
            text,
            location,
        })
    }

    async fn run_swarm(&self, swarm: &SwarmDirective) -> String {
        let report = self.inner.engine.execute(swarm).await;
        let title = format!("codi-swarm: {}", swarm.strategy);
        let text = report.render(&self.inner.compressor, &title);
        let workers = self.inner.supervisor.workers();
        for outcome in &report.outcomes {
            workers.set_requires_approval(&outcome.worker_id, outcome.requires_approval);
        }
        self.inner
            .history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .reports
            .push(report);
        text
    }

    fn launch_background(
        &self,
        swarm: SwarmDirective,
        marker: &str,
        reply_to: Option<String>,
    ) -> String {
        let final_marker = format!("{}-final", marker);
        let message = format!(
            "Launched {} swarm with {} requests in the background. Results will follow under {}.\n",
            swarm.strategy,
            swarm.requests.len(),
            final_marker
        );

        let session = self.clone();
        let guard = self.begin_dispatch();
        self.inner
            .background
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .spawn(async move {
                let _guard = guard;
                let text = session.run_swarm(&swarm).await;
                session.deliver(&final_marker, &text, reply_to).await;
                session.check_abort();
            });
        message
    }

    async fn deliver(&self, marker: &str, text: &str, reply_to: Option<String>) -> Option<String> {
        let delivery = Delivery::new(Some(marker), text).reply_to(reply_to);
        match self.inner.channel.deliver(delivery).await {
            Ok(location) => Some(location),
            Err(e) => {
                warn!("response {} was not delivered: {}", marker, e);
                None
            }
        }
    }

    fn check_abort(&self) {
        if let Some(reason) = self.inner.engine.abort_reason() {
            if !self.state().is_terminal() {
                self.abort(reason);
            }
        }
    }

    // ------------------------------------------------------------------------
    // Status
    // ------------------------------------------------------------------------

    /// Worker status, limited to `worker_ids` when non-empty.
    pub fn status(&self, worker_ids: &[String]) -> StatusReport {
        let workers = self
            .inner
            .supervisor
            .workers()
            .snapshot()
            .into_iter()
            .filter(|entry| worker_ids.is_empty() || worker_ids.contains(&entry.worker_id))
            .map(|entry| WorkerStatusLine {
                requires_approval: self.inner.merger.is_pending(&entry.worker_id),
                running: entry.status.is_active(),
                branch: entry.branch().map(str::to_string),
                worker_id: entry.worker_id,
                request_id: entry.request_id,
                objective: entry.objective,
                status: entry.status,
            })
            .collect();

        StatusReport {
            session_id: self.inner.id.clone(),
            state: self.state().name().to_string(),
            paused: self.is_paused(),
            workers,
            pending_approvals: self
                .inner
                .merger
                .pending()
                .into_iter()
                .map(|p| p.result.worker_id)
                .collect(),
            budget: self.inner.supervisor.budget().snapshot(),
        }
    }

    // ------------------------------------------------------------------------
    // Control actions
    // ------------------------------------------------------------------------

    /// Merge held workers; all held workers when `worker_ids` is empty.
    #[instrument(skip(self))]
    pub async fn approve(
        &self,
        worker_ids: &[String],
        resolution: MergeResolution,
    ) -> Result<Vec<MergeOutcome>, SessionError> {
        self.ensure_accepting()?;
        let entered = self.state().is_running();
        if entered {
            self.force_state(SessionState::Merging);
        }
        let result = self.inner.merger.approve(worker_ids, resolution).await;
        if entered && self.state() == SessionState::Merging {
            self.force_state(self.inner.settled_running());
        }

        let outcomes = result.map_err(|e| match e {
            MergeError::NotPending(id) => SessionError::WorkerNotFound(id),
            MergeError::Git(e) => SessionError::MergeFailed(e.to_string()),
        })?;
        let workers = self.inner.supervisor.workers();
        for outcome in &outcomes {
            workers.set_requires_approval(&outcome.worker_id, outcome.requires_approval);
        }
        self.inner
            .history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .approvals
            .extend(outcomes.iter().cloned());
        Ok(outcomes)
    }

    /// Stop launching queued workers. Running workers continue.
    pub fn pause(&self) -> Result<(), SessionError> {
        self.ensure_accepting()?;
        self.inner.engine.gate().pause();
        info!(session = %self.inner.id, "queue paused");
        Ok(())
    }

    pub fn resume(&self) -> Result<(), SessionError> {
        self.ensure_accepting()?;
        self.inner.engine.gate().resume();
        info!(session = %self.inner.id, "queue resumed");
        Ok(())
    }

    pub fn cancel_worker(&self, worker_id: &str) -> Result<(), SessionError> {
        self.ensure_accepting()?;
        if self.inner.supervisor.cancel_worker(worker_id) {
            Ok(())
        } else {
            Err(SessionError::WorkerNotFound(worker_id.to_string()))
        }
    }

    /// Cancel every worker, wait for them to stop and release their worktrees.
    ///
    /// Held worktrees stay until the session record is written.
    #[instrument(skip(self), fields(session = %self.inner.id))]
    pub async fn cancel(&self) -> Result<(), SessionError> {
        let state = self.state();
        if state.is_terminal() {
            return Err(SessionError::Terminal(state.name().to_string()));
        }
        if !state.can_transition_to(&SessionState::Cancelled) {
            return Err(SessionError::InvalidTransition {
                from: state.name().to_string(),
                to: SessionState::Cancelled.name().to_string(),
            });
        }

        info!("cancelling session");
        self.inner.supervisor.cancel_all();
        self.wait_idle().await;
        self.sweep_worktrees().await;
        self.inner.transition(SessionState::Cancelled)
    }

    /// Stop the session without waiting for workers.
    pub fn abort(&self, reason: impl Into<String>) {
        let reason = reason.into();
        warn!(session = %self.inner.id, "aborting session: {}", reason);
        self.inner.supervisor.cancel_all();
        self.force_state(SessionState::Aborted { reason });
    }

    /// Wait for outstanding work, settle the state and write the session record.
    #[instrument(skip(self), fields(session = %self.inner.id))]
    pub async fn finish(&self) -> Result<SessionRecord, SessionError> {
        self.wait_idle().await;
        if !self.state().is_terminal() {
            self.sweep_worktrees().await;
            self.inner.transition(SessionState::Completed)?;
        }
        *self.inner.ended_at.lock().unwrap_or_else(|e| e.into_inner()) = Some(Utc::now());

        let record = self.record();
        if let Some(sink) = &self.inner.record_sink {
            match sink.write(&record) {
                Ok(location) => info!("session record written to {}", location),
                Err(e) => warn!("{}", e),
            }
        }
        Ok(record)
    }

    async fn wait_idle(&self) {
        let mut in_flight = self.inner.in_flight.subscribe();
        let _ = in_flight.wait_for(|n| *n == 0).await;

        let mut tasks = std::mem::take(&mut *self.inner.background.lock().unwrap_or_else(|e| e.into_inner()));
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                warn!("background swarm task failed: {}", e);
            }
        }
    }

    /// Release worktrees that are not awaiting approval, keeping branches.
    async fn sweep_worktrees(&self) {
        let held: HashSet<String> = self
            .inner
            .merger
            .pending()
            .into_iter()
            .map(|p| p.result.branch)
            .collect();
        let worktrees = match self.inner.isolator.list().await {
            Ok(worktrees) => worktrees,
            Err(e) => {
                warn!("could not list worktrees: {}", e);
                return;
            }
        };
        for worktree in worktrees.iter().filter(|wt| !held.contains(&wt.branch)) {
            if let Err(e) = self
                .inner
                .isolator
                .release(worktree, ReleaseMode::KeepBranch)
                .await
            {
                warn!("failed to release {:?}: {}", worktree.path, e);
            }
        }
    }

    /// Snapshot of everything the session has done so far.
    pub fn record(&self) -> SessionRecord {
        let history = self.inner.history.lock().unwrap_or_else(|e| e.into_inner());
        let mut strategies = Vec::new();
        let mut requests = Vec::new();
        let mut workers = Vec::new();
        let mut outcomes = Vec::new();
        for report in &history.reports {
            if !strategies.contains(&report.strategy) {
                strategies.push(report.strategy);
            }
            requests.extend(report.requests.iter().cloned());
            outcomes.extend(report.outcomes.iter().cloned());
            workers.extend(report.results.iter().map(|r| WorkerSummary {
                worker_id: r.worker_id.clone(),
                request_id: r.request_id.clone(),
                status: r.status,
                partial: r.partial,
                summary: r.report.summary.clone(),
                branch: r.branch.clone(),
                attempt: r.attempt,
                cost: r.cost,
                duration_ms: r.duration().as_millis() as u64,
            }));
        }
        outcomes.extend(history.approvals.iter().cloned());

        let state = self.state();
        SessionRecord {
            id: self.inner.id.clone(),
            state,
            repo_root: self.inner.repo_root.clone(),
            strategies,
            requests,
            workers,
            outcomes,
            diagnostics: self.inner.events.diagnostics(),
            budget: self.inner.supervisor.budget().snapshot(),
            started_at: self.inner.started_at,
            ended_at: *self.inner.ended_at.lock().unwrap_or_else(|e| e.into_inner()),
        }
    }

    // ------------------------------------------------------------------------
    // Control socket
    // ------------------------------------------------------------------------

    /// Answer one control message. The flag is set when the session should
    /// stop serving.
    pub async fn handle_control(&self, msg: ClientMessage) -> (ServerMessage, bool) {
        let id = msg.id().to_string();
        debug!(kind = msg.kind(), "control message");
        let (result, stop): (Result<Value, SessionError>, bool) = match msg {
            ClientMessage::Ping { .. } => return (ServerMessage::pong(Some(id)), false),
            ClientMessage::Status { .. } => (
                Ok(serde_json::to_value(self.status(&[])).unwrap_or_default()),
                false,
            ),
            ClientMessage::PauseQueue { .. } => (self.pause().map(|_| json!({"paused": true})), false),
            ClientMessage::ResumeQueue { .. } => {
                (self.resume().map(|_| json!({"paused": false})), false)
            }
            ClientMessage::CancelWorker { worker_id, .. } => (
                self.cancel_worker(&worker_id)
                    .map(|_| json!({"cancelled": worker_id})),
                false,
            ),
            ClientMessage::Approve {
                worker_ids,
                resolution,
                ..
            } => (
                self.approve(&worker_ids, resolution)
                    .await
                    .map(|outcomes| json!({"outcomes": outcomes})),
                false,
            ),
            ClientMessage::CancelSession { .. } => (
                self.cancel()
                    .await
                    .map(|_| json!({"state": SessionState::Cancelled.name()})),
                true,
            ),
            ClientMessage::Dispatch {
                directive,
                payload,
                request_id,
                ..
            } => match self.inner.interpreter.interpret_payload(&directive, &payload) {
                Ok(mut dispatch) => {
                    if request_id.is_some() {
                        dispatch.request_id = request_id;
                    }
                    (
                        self.handle_dispatch(dispatch, Some(id.clone()))
                            .await
                            .map(|reply| serde_json::to_value(reply).unwrap_or_default()),
                        false,
                    )
                }
                Err(diagnostic) => {
                    let message = diagnostic.message.clone();
                    self.skip(diagnostic);
                    return (ServerMessage::error(Some(id), message), false);
                }
            },
        };

        let reply = match result {
            Ok(payload) => ServerMessage::ack(id, payload),
            Err(e) => ServerMessage::error(Some(id), e.to_string()),
        };
        (reply, stop)
    }

    /// Serve control messages until a client cancels the session or the
    /// receiver closes. Session events are broadcast to every client.
    pub async fn serve_control(
        &self,
        server: Arc<IpcServer>,
        mut incoming: mpsc::Receiver<(String, ClientMessage)>,
    ) {
        let forward = {
            let server = Arc::clone(&server);
            let mut events = self.inner.events.subscribe();
            tokio::spawn(async move {
                loop {
                    match events.recv().await {
                        Ok(record) => {
                            let _ = server.broadcast(&ServerMessage::event(record)).await;
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!("control clients missed {} events", skipped);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            })
        };

        let (stop_tx, mut stop_rx) = watch::channel(false);
        let mut handlers = JoinSet::new();
        loop {
            tokio::select! {
                received = incoming.recv() => {
                    let Some((client_id, msg)) = received else { break };
                    let session = self.clone();
                    let server = Arc::clone(&server);
                    let stop_tx = stop_tx.clone();
                    handlers.spawn(async move {
                        let (reply, stop) = session.handle_control(msg).await;
                        if let Err(e) = server.send(&client_id, &reply).await {
                            debug!(client = %client_id, "reply not sent: {}", e);
                        }
                        if stop {
                            stop_tx.send_replace(true);
                        }
                    });
                }
                _ = stop_rx.changed() => break,
            }
        }

        handlers.abort_all();
        forward.abort();
        info!(session = %self.inner.id, "control loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BudgetConfig;
    use crate::error::DiagnosticKind;
    use crate::orchestrate::response::MockResponseSink;
    use crate::orchestrate::test_support::{create_test_repo, git};
    use tempfile::TempDir;

    const WRITE_FILE: &str = "printf 'work\\n' > \"out-$CODI_SWARM_WORKER_ID.txt\"";

    fn config(script: &str, base: &Path) -> ResolvedConfig {
        let mut config = ResolvedConfig::default();
        config.worker.command = "sh".to_string();
        config.worker.args = vec!["-c".to_string(), script.to_string(), "sh".to_string()];
        config.worker.grace_period_ms = 200;
        config.worktree.base_dir = base.to_path_buf();
        config.budget = BudgetConfig {
            max_total_cost: 0.0,
            max_worker_cost: 0.0,
            max_total_tokens: 0,
            warn_at_percent: 80,
        };
        config
    }

    async fn open(repo: &TempDir, base: &TempDir, script: &str) -> Session {
        Session::builder(repo.path(), config(script, base.path()))
            .session_id("sess-test")
            .build()
            .await
    }

    #[test]
    fn test_state_transitions() {
        let running = SessionState::running();
        let dispatching = SessionState::Running {
            phase: RunPhase::Dispatching,
        };
        let aborted = SessionState::Aborted {
            reason: "x".to_string(),
        };

        assert!(SessionState::Created.can_transition_to(&running));
        assert!(SessionState::Created.can_transition_to(&aborted));
        assert!(!SessionState::Created.can_transition_to(&SessionState::Cancelled));
        assert!(running.can_transition_to(&dispatching));
        assert!(dispatching.can_transition_to(&SessionState::Merging));
        assert!(SessionState::Merging.can_transition_to(&running));
        assert!(SessionState::Merging.can_transition_to(&SessionState::Cancelled));
        assert!(!SessionState::Completed.can_transition_to(&running));
        assert!(!SessionState::Cancelled.can_transition_to(&SessionState::Completed));
        assert!(!aborted.can_transition_to(&running));

        assert_eq!(dispatching.name(), "dispatching");
        assert!(aborted.is_terminal());
        assert_eq!(aborted.to_string(), "aborted (x)");
    }

    #[test]
    fn test_render_status() {
        let report = StatusReport {
            session_id: "s-1".to_string(),
            state: "running".to_string(),
            paused: true,
            workers: vec![WorkerStatusLine {
                worker_id: "w-1".to_string(),
                request_id: "r-1".to_string(),
                objective: "Add tests".to_string(),
                status: WorkerStatus::Completed,
                branch: Some("codi-swarm/s-1/w-1".to_string()),
                requires_approval: true,
                running: false,
            }],
            pending_approvals: vec!["w-1".to_string()],
            budget: BudgetSnapshot::default(),
        };
        insta::assert_snapshot!(render_status(&report), @r###"
        ## codi-swarm status

        Session: s-1 (running)
        Queue: paused

        - w-1 [completed] Add tests (codi-swarm/s-1/w-1) - awaiting approval

        Pending approvals: w-1

        Budget: 0 tokens, $0.0000
        "###);
    }

    #[tokio::test]
    async fn test_unreadable_repository_aborts() {
        let dir = TempDir::new().unwrap();
        let base = TempDir::new().unwrap();
        let session = Session::open(dir.path(), config("true", base.path())).await;

        match session.state() {
            SessionState::Aborted { reason } => assert!(reason.contains("Repository unavailable")),
            other => panic!("unexpected state {:?}", other),
        }
        assert!(matches!(
            session.handle_output("nothing").await,
            Err(SessionError::Terminal(_))
        ));
        assert!(matches!(session.pause(), Err(SessionError::Terminal(_))));
    }

    #[tokio::test]
    async fn test_spawn_agent_merges_and_writes_artifact() {
        let repo = create_test_repo();
        let base = TempDir::new().unwrap();
        let session = open(&repo, &base, WRITE_FILE).await;
        assert_eq!(session.state(), SessionState::running());

        let output = "Working on it.\n\
            ```spawn_agent\n\
            {\"request_id\": \"req 1\", \"objective\": \"Write a file\"}\n\
            ```\n";
        let replies = session.handle_output(output).await.unwrap();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].marker, "req-1");
        assert!(replies[0].text.contains("1 of 1 merged"));

        let artifact = std::fs::read_to_string(session.response_location()).unwrap();
        assert!(artifact.contains("req-1"));

        let log = git(repo.path(), &["log", "--oneline"]);
        assert!(log.lines().count() >= 2);
        assert_eq!(session.state(), SessionState::running());

        let record = session.finish().await.unwrap();
        assert_eq!(record.state, SessionState::Completed);
        assert_eq!(record.strategies, vec![Strategy::FanOut]);
        assert_eq!(record.workers.len(), 1);
        assert!(repo.path().join(HISTORY_DIR).join("sess-test.json").exists());
    }

    #[tokio::test]
    async fn test_malformed_block_skipped_rest_runs() {
        let repo = create_test_repo();
        let base = TempDir::new().unwrap();
        let session = open(&repo, &base, "true").await;

        let output = "```spawn_agent\n{not json at all\n```\n\
            ```check_workers\n{}\n```\n";
        let replies = session.handle_output(output).await.unwrap();
        assert_eq!(replies.len(), 1);
        assert!(replies[0].text.contains("codi-swarm status"));
        assert!(session
            .diagnostics()
            .iter()
            .any(|d| d.kind == DiagnosticKind::MalformedDispatch));
    }

    #[tokio::test]
    async fn test_background_swarm_delivers_final_response() {
        let repo = create_test_repo();
        let base = TempDir::new().unwrap();
        let session = open(&repo, &base, WRITE_FILE).await;

        let payload = json!({
            "strategy": "fan_out",
            "wait": false,
            "request_id": "bg",
            "tasks": [{"objective": "one"}, {"objective": "two"}]
        });
        let dispatch = session
            .inner
            .interpreter
            .interpret_payload("spawn_swarm", &payload)
            .unwrap();
        let reply = session.handle_dispatch(dispatch, None).await.unwrap();
        assert!(reply.text.contains("bg-final"));

        let record = session.finish().await.unwrap();
        assert_eq!(record.workers.len(), 2);
        let artifact = std::fs::read_to_string(session.response_location()).unwrap();
        assert!(artifact.contains("bg-final"));
        assert!(artifact.contains("2 of 2 merged"));
    }

    #[tokio::test]
    async fn test_delivery_failure_recorded() {
        let repo = create_test_repo();
        let base = TempDir::new().unwrap();
        let mut sink = MockResponseSink::new();
        sink.expect_deliver()
            .returning(|_| Err(crate::orchestrate::response::ChannelError::NoClients));
        let mut cfg = config("true", base.path());
        cfg.channel.delivery_retries = 1;
        cfg.channel.retry_backoff_ms = 1;
        let session = Session::builder(repo.path(), cfg)
            .response_sink(Arc::new(sink))
            .build()
            .await;

        let replies = session
            .handle_output("```check_workers\n{}\n```")
            .await
            .unwrap();
        assert!(replies[0].location.is_none());
        assert!(session
            .diagnostics()
            .iter()
            .any(|d| d.kind == DiagnosticKind::ChannelFailure));
    }

    #[tokio::test]
    async fn test_control_messages() {
        let repo = create_test_repo();
        let base = TempDir::new().unwrap();
        let session = open(&repo, &base, "true").await;

        let (reply, stop) = session.handle_control(ClientMessage::ping()).await;
        assert!(matches!(reply, ServerMessage::Pong { .. }));
        assert!(!stop);

        let (reply, _) = session.handle_control(ClientMessage::pause_queue()).await;
        assert!(matches!(reply, ServerMessage::Ack { .. }));
        assert!(session.is_paused());

        let (reply, _) = session.handle_control(ClientMessage::status()).await;
        match reply {
            ServerMessage::Ack { payload, .. } => assert_eq!(payload["paused"], true),
            other => panic!("unexpected reply {:?}", other),
        }

        let (reply, _) = session
            .handle_control(ClientMessage::cancel_worker("w-missing"))
            .await;
        assert!(matches!(reply, ServerMessage::Error { ref message, .. } if message.contains("w-missing")));

        let (reply, _) = session
            .handle_control(ClientMessage::dispatch("explode", json!({}), None))
            .await;
        assert!(matches!(reply, ServerMessage::Error { .. }));

        let (reply, stop) = session.handle_control(ClientMessage::cancel_session()).await;
        assert!(matches!(reply, ServerMessage::Ack { .. }));
        assert!(stop);
        assert_eq!(session.state(), SessionState::Cancelled);
        assert!(matches!(session.cancel().await, Err(SessionError::Terminal(_))));
    }

    #[tokio::test]
    async fn test_approve_unknown_worker() {
        let repo = create_test_repo();
        let base = TempDir::new().unwrap();
        let session = open(&repo, &base, "true").await;

        let err = session
            .approve(&["w-nope".to_string()], MergeResolution::Abort)
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::WorkerNotFound(ref id) if id == "w-nope"));
        assert_eq!(session.state(), SessionState::running());
    }
}
