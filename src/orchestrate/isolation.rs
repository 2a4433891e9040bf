// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Workspace isolation trait and naming helpers.
//!
//! Each worker gets a private working copy of the project tree checked out on
//! its own branch. Names are derived from the session and worker ids:
//!
//! ```text
//! branch: codi-swarm/<session>/<worker>
//! path:   <base_dir>/<session>/<worker>
//! ```

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use super::git::GitError;
use super::types::{ReleaseMode, Worktree};

/// Branch namespace for every branch the engine creates.
pub const BRANCH_PREFIX: &str = "codi-swarm";

/// Error type for workspace isolation operations.
#[derive(Debug, thiserror::Error)]
pub enum IsolationError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Git(#[from] GitError),

    #[error("Branch already in use: {0}")]
    BranchInUse(String),

    #[error("Base revision not found: {0}")]
    BaseNotFound(String),

    #[error("Invalid workspace: {0}")]
    InvalidWorkspace(String),

    #[error("Worktree creation failed: {0}")]
    WorktreeCreationFailed(String),
}

/// Creates and destroys isolated workspaces for workers.
#[async_trait]
pub trait WorkspaceIsolator: Send + Sync {
    /// Create a working copy for `worker_id` on a new branch from `base_ref`.
    ///
    /// No two calls within one isolator return the same path or branch.
    async fn provision(&self, worker_id: &str, base_ref: &str) -> Result<Worktree, IsolationError>;

    /// Release a working copy according to `mode`.
    async fn release(&self, worktree: &Worktree, mode: ReleaseMode) -> Result<(), IsolationError>;

    /// Working copies currently held by this isolator.
    async fn list(&self) -> Result<Vec<Worktree>, IsolationError>;

    /// Remove working copies left behind under the base directory by earlier runs.
    ///
    /// Returns how many were removed.
    async fn cleanup_stale(&self) -> Result<usize, IsolationError>;

    /// Release every working copy still held, keeping their branches.
    async fn release_all(&self) -> Result<(), IsolationError>;
}

/// Find the repository root (directory containing `.git`) above `path`.
pub fn find_repo_root(path: &Path) -> Option<PathBuf> {
    path.ancestors()
        .find(|ancestor| ancestor.join(".git").exists())
        .map(Path::to_path_buf)
}

/// Sanitize a name for use as a branch component or directory name.
///
/// Converts slashes and other problematic characters to dashes.
pub fn sanitize_branch_name(branch: &str) -> String {
    let replaced: String = branch
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' | '~' | '^' | ' ' => '-',
            other => other,
        })
        .collect();
    replaced.replace("..", "-").trim_matches('-').to_string()
}

/// Short form of a session id used in branch and directory names.
pub fn session_slug(session_id: &str) -> String {
    let sanitized = sanitize_branch_name(session_id);
    sanitized.chars().take(12).collect()
}

/// Branch name for a worker.
pub fn branch_name_for(session_id: &str, worker_id: &str) -> String {
    format!(
        "{}/{}/{}",
        BRANCH_PREFIX,
        session_slug(session_id),
        sanitize_branch_name(worker_id)
    )
}

/// Working copy path for a worker.
pub fn worktree_path_for(base_dir: &Path, session_id: &str, worker_id: &str) -> PathBuf {
    base_dir
        .join(session_slug(session_id))
        .join(sanitize_branch_name(worker_id))
}
