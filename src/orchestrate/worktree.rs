// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Git worktree isolator.
//!
//! Uses `git worktree` to give every worker its own checkout under a shared
//! base directory, grouped by session.
//!
//! # Directory Structure
//!
//! ```text
//! /project/                        # Main repo
//! ├── .git/
//! └── src/
//!
//! <base_dir>/<session>/<worker>/   # Worker worktree
//! ├── .git                         # Worktree link file
//! └── src/
//! ```

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use super::git::{self, GitOutput};
use super::isolation::{
    branch_name_for, session_slug, worktree_path_for, IsolationError, WorkspaceIsolator,
};
use super::types::{ReleaseMode, Worktree};

/// Git worktree isolator for one session.
pub struct GitWorktreeIsolator {
    /// Path to the main repository root.
    repo_root: PathBuf,
    /// Directory holding every session's worktrees.
    base_dir: PathBuf,
    session_id: String,
    /// Tracked worktrees by branch name.
    worktrees: Arc<RwLock<HashMap<String, Worktree>>>,
    /// Every branch name handed out, so none is reused within the session.
    reserved: Mutex<HashSet<String>>,
    /// `git worktree add` contends on repository metadata; run one at a time.
    create_lock: Mutex<()>,
}

impl GitWorktreeIsolator {
    /// Create an isolator. A relative `base_dir` is resolved against the repo root.
    pub fn new(
        repo_root: impl AsRef<Path>,
        base_dir: impl AsRef<Path>,
        session_id: impl Into<String>,
    ) -> Self {
        let repo_root = repo_root.as_ref().to_path_buf();
        let base_dir = if base_dir.as_ref().is_absolute() {
            base_dir.as_ref().to_path_buf()
        } else {
            repo_root.join(base_dir)
        };
        Self {
            repo_root,
            base_dir,
            session_id: session_id.into(),
            worktrees: Arc::new(RwLock::new(HashMap::new())),
            reserved: Mutex::new(HashSet::new()),
            create_lock: Mutex::new(()),
        }
    }

    pub fn repo_root(&self) -> &Path {
        &self.repo_root
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Directory holding this session's worktrees.
    pub fn session_dir(&self) -> PathBuf {
        self.base_dir.join(session_slug(&self.session_id))
    }

    /// Run a git command in the main repository.
    async fn git(&self, args: &[&str]) -> Result<GitOutput, IsolationError> {
        Ok(git::run_git(&self.repo_root, args).await?)
    }

    /// Check if a branch exists locally.
    async fn branch_exists(&self, branch: &str) -> bool {
        let reference = format!("refs/heads/{}", branch);
        self.git(&["rev-parse", "--verify", "--quiet", &reference])
            .await
            .is_ok()
    }

    /// List all worktrees registered with the repository.
    async fn list_git_worktrees(&self) -> Result<Vec<WorktreeEntry>, IsolationError> {
        let output = self.git(&["worktree", "list", "--porcelain"]).await?;
        Ok(parse_worktree_list(&output.stdout))
    }

    /// Remove a worktree directory, falling back to deleting it and pruning.
    async fn remove_worktree_dir(&self, path: &Path) -> Result<(), IsolationError> {
        let path_str = path.to_string_lossy().to_string();
        if let Err(e) = self.git(&["worktree", "remove", "--force", &path_str]).await {
            warn!("Failed to remove worktree via git: {}", e);
            if path.exists() {
                tokio::fs::remove_dir_all(path).await?;
            }
            let _ = self.git(&["worktree", "prune"]).await;
        }
        Ok(())
    }
}

/// One entry from `git worktree list --porcelain`.
#[derive(Debug, Clone, Default, PartialEq)]
struct WorktreeEntry {
    path: PathBuf,
    head: String,
    branch: Option<String>,
    is_bare: bool,
}

fn parse_worktree_list(output: &str) -> Vec<WorktreeEntry> {
    let mut entries = Vec::new();
    let mut current = WorktreeEntry::default();

    for line in output.lines() {
        if let Some(path) = line.strip_prefix("worktree ") {
            if !current.path.as_os_str().is_empty() {
                entries.push(std::mem::take(&mut current));
            }
            current.path = PathBuf::from(path);
        } else if let Some(head) = line.strip_prefix("HEAD ") {
            current.head = head.to_string();
        } else if let Some(branch) = line.strip_prefix("branch refs/heads/") {
            current.branch = Some(branch.to_string());
        } else if line == "bare" {
            current.is_bare = true;
        }
    }

    if !current.path.as_os_str().is_empty() {
        entries.push(current);
    }
    entries
}

/// Canonical form of a path when it exists, for comparing against git's output.
fn normalize(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
}

#[async_trait]
impl WorkspaceIsolator for GitWorktreeIsolator {
    async fn provision(&self, worker_id: &str, base_ref: &str) -> Result<Worktree, IsolationError> {
        let branch = branch_name_for(&self.session_id, worker_id);
        let worktree_path = worktree_path_for(&self.base_dir, &self.session_id, worker_id);

        {
            let mut reserved = self.reserved.lock().await;
            if !reserved.insert(branch.clone()) {
                return Err(IsolationError::BranchInUse(branch));
            }
        }

        let _guard = self.create_lock.lock().await;

        let base_commit = git::rev_parse(&self.repo_root, base_ref)
            .await
            .map_err(|_| IsolationError::BaseNotFound(base_ref.to_string()))?;

        if self.branch_exists(&branch).await {
            return Err(IsolationError::BranchInUse(branch));
        }
        if worktree_path.exists() {
            return Err(IsolationError::InvalidWorkspace(format!(
                "Directory already exists: {:?}",
                worktree_path
            )));
        }
        if let Some(parent) = worktree_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        info!("Creating worktree for {} at {:?}", branch, worktree_path);
        let worktree_path_str = worktree_path.to_string_lossy().to_string();
        let result = self
            .git(&[
                "worktree",
                "add",
                "-b",
                &branch,
                &worktree_path_str,
                &base_commit,
            ])
            .await;

        match result {
            Ok(_) => {
                let worktree = Worktree {
                    path: worktree_path,
                    branch: branch.clone(),
                    base_commit,
                };
                self.worktrees
                    .write()
                    .await
                    .insert(branch.clone(), worktree.clone());
                debug!("Created worktree for {} at {:?}", branch, worktree.path);
                Ok(worktree)
            }
            Err(e) => {
                error!("Failed to create worktree: {}", e);
                Err(IsolationError::WorktreeCreationFailed(e.to_string()))
            }
        }
    }

    async fn release(&self, worktree: &Worktree, mode: ReleaseMode) -> Result<(), IsolationError> {
        if mode == ReleaseMode::Retain {
            debug!("Retaining worktree for {} at {:?}", worktree.branch, worktree.path);
            return Ok(());
        }

        info!("Removing worktree for {} at {:?}", worktree.branch, worktree.path);
        self.remove_worktree_dir(&worktree.path).await?;

        if mode == ReleaseMode::Discard {
            if let Err(e) = self.git(&["branch", "-D", &worktree.branch]).await {
                debug!("Branch {} not deleted: {}", worktree.branch, e);
            }
        }

        self.worktrees.write().await.remove(&worktree.branch);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Worktree>, IsolationError> {
        let tracked = self.worktrees.read().await;
        let mut result: Vec<Worktree> = tracked
            .values()
            .filter(|wt| wt.path.exists())
            .cloned()
            .collect();
        result.sort_by(|a, b| a.branch.cmp(&b.branch));
        Ok(result)
    }

    async fn cleanup_stale(&self) -> Result<usize, IsolationError> {
        let base = normalize(&self.base_dir);
        let tracked: HashSet<PathBuf> = {
            let worktrees = self.worktrees.read().await;
            worktrees.values().map(|wt| normalize(&wt.path)).collect()
        };

        let mut removed = 0;
        for entry in self.list_git_worktrees().await? {
            if entry.is_bare {
                continue;
            }
            let path = normalize(&entry.path);
            if !path.starts_with(&base) || tracked.contains(&path) {
                continue;
            }
            info!("Removing stale worktree at {:?}", entry.path);
            match self.remove_worktree_dir(&entry.path).await {
                Ok(()) => removed += 1,
                Err(e) => warn!("Failed to remove stale worktree {:?}: {}", entry.path, e),
            }
        }

        let _ = self.git(&["worktree", "prune"]).await;
        Ok(removed)
    }

    async fn release_all(&self) -> Result<(), IsolationError> {
        let worktrees: Vec<Worktree> = {
            let tracked = self.worktrees.read().await;
            tracked.values().cloned().collect()
        };

        for worktree in worktrees {
            if let Err(e) = self.release(&worktree, ReleaseMode::KeepBranch).await {
                warn!("Failed to release worktree {:?}: {}", worktree.path, e);
            }
        }

        let _ = self.git(&["worktree", "prune"]).await;
        Ok(())
    }
}
