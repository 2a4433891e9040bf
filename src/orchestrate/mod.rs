// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Parallel worker orchestration.
//!
//! A supervising agent emits dispatch blocks in its output. The session turns
//! each block into work requests, runs every request as an isolated worker
//! process in its own git worktree and merges the results back into the base
//! repository.
//!
//! # Architecture
//!
//! - **Session**: owns one run, its state machine and the control socket.
//!
//! - **DispatchInterpreter**: finds and normalizes dispatch blocks.
//!
//! - **StrategyEngine**: runs a batch as fan-out, pipeline, map-reduce or
//!   debate.
//!
//! - **WorkerSupervisor**: launches, times out and cancels worker processes.
//!
//! - **WorkspaceIsolator**: provisions and releases git worktrees.
//!
//! - **MergeCoordinator**: merges finished branches, holding out-of-scope or
//!   conflicting ones for approval.
//!
//! - **ResponseChannel**: sends aggregated results back to the supervisor.
//!
//! ```text
//! supervisor output
//!        │
//!        ▼
//! DispatchInterpreter ──► StrategyEngine ──► WorkerSupervisor ──► worker (worktree)
//!                               │                                     │
//!                               ▼                                     ▼
//!                        MergeCoordinator ◄──────────────────── WorkerResult
//!                               │
//!                               ▼
//!                        ResponseChannel ──► supervisor
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use codi_swarm::config::ResolvedConfig;
//! use codi_swarm::orchestrate::Session;
//!
//! let session = Session::open(".", ResolvedConfig::default()).await;
//! let replies = session.handle_output(&supervisor_output).await?;
//! let record = session.finish().await?;
//! ```

pub mod budget;
pub mod compress;
pub mod dispatch;
pub mod events;
pub mod git;
pub mod ipc;
pub mod isolation;
pub mod merge;
pub mod process;
pub mod response;
pub mod scope;
pub mod session;
pub mod strategy;
pub mod supervisor;
pub mod types;
pub mod worktree;

#[cfg(test)]
pub(crate) mod test_support;

// Re-export main types for convenience
pub use budget::{BudgetSnapshot, BudgetTracker};
pub use compress::ResultCompressor;
pub use dispatch::{Directive, Dispatch, DispatchBatch, DispatchInterpreter, SwarmDirective};
pub use events::{EngineObserver, EventBus, EventRecord, SessionEvent};
pub use ipc::{ClientMessage, IpcClient, IpcError, IpcServer, ServerMessage};
pub use isolation::{IsolationError, WorkspaceIsolator};
pub use merge::{MergeCoordinator, MergeError};
pub use process::{ProcessLauncher, TokioLauncher, WorkerProcess};
pub use response::{
    ArtifactSink, ChannelError, Delivery, ResponseChannel, ResponseSink, SocketSink,
};
pub use session::{
    render_status, DispatchReply, JsonRecordSink, RecordSink, RunPhase, Session, SessionBuilder,
    SessionRecord, SessionState, StatusReport,
};
pub use strategy::{
    BatchReport, CommandAdjudicator, DebatePolicy, HighestConfidence, MajorityVote, QueueGate,
    StrategyEngine,
};
pub use supervisor::{WorkerSlot, WorkerSupervisor, WorkerTable};
pub use types::{
    socket_path_for_session, ChangeSet, MergeOutcome, MergeResolution, Priority, ReleaseMode,
    ReturnFormat, Strategy, WorkRequest, WorkerHandle, WorkerResult, WorkerStatus, Worktree,
};
pub use worktree::GitWorktreeIsolator;
