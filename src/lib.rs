// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! codi-swarm - parallel coding workers in isolated git worktrees.
//!
//! A supervising agent asks for work by emitting dispatch blocks. codi-swarm
//! runs each requested unit of work as a short-lived worker process on its own
//! branch and worktree, merges what the workers produce back into the base
//! repository and answers the supervisor with a compressed summary.
//!
//! # Architecture
//!
//! The crate is organized into the following modules:
//!
//! - [`config`] - Configuration loading and merging
//! - [`error`] - Error types, diagnostics and result aliases
//! - [`orchestrate`] - Sessions, strategies, workers, worktrees and merges
//! - [`telemetry`] - Tracing, metrics, and observability infrastructure
//!
//! # Example
//!
//! ```rust,ignore
//! use codi_swarm::config::{load_config, CliOptions};
//! use codi_swarm::orchestrate::Session;
//!
//! let config = load_config(&repo, CliOptions::default())?;
//! let session = Session::open(&repo, config).await;
//! for reply in session.handle_output(&supervisor_output).await? {
//!     println!("{}", reply.text);
//! }
//! session.finish().await?;
//! ```

pub mod config;
pub mod error;
pub mod orchestrate;
pub mod telemetry;

// Re-export commonly used types at crate root
pub use error::{ConfigError, Diagnostic, DiagnosticKind, Result, SessionError};
pub use orchestrate::{
    MergeOutcome, Session, SessionBuilder, SessionRecord, SessionState, Strategy, WorkRequest,
    WorkerResult, WorkerStatus,
};

/// codi-swarm version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_public_exports() {
        let state = SessionState::running();
        assert_eq!(state.name(), "running");
        assert_eq!(Strategy::default(), Strategy::FanOut);
    }
}
