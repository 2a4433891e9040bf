// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::path::Path;
use std::process::Command;

use codi_swarm::config::{BudgetConfig, ResolvedConfig};
use codi_swarm::orchestrate::Session;
use tempfile::TempDir;

/// Worker that writes a file named after itself.
pub const WRITE_OWN_FILE: &str = "printf 'work\\n' > \"out-$CODI_SWARM_WORKER_ID.txt\"";

/// A base repository plus a scratch directory for worktrees.
pub struct Workspace {
    pub repo: TempDir,
    pub worktrees: TempDir,
}

impl Workspace {
    pub fn new() -> Self {
        let repo = TempDir::new().unwrap();
        let path = repo.path();
        git(path, &["init"]);
        git(path, &["symbolic-ref", "HEAD", "refs/heads/main"]);
        git(path, &["config", "user.email", "test@example.com"]);
        git(path, &["config", "user.name", "Test User"]);
        std::fs::write(path.join("README.md"), "# Test\n").unwrap();
        git(path, &["add", "."]);
        git(path, &["commit", "-m", "Initial commit"]);

        Self {
            repo,
            worktrees: TempDir::new().unwrap(),
        }
    }

    pub fn path(&self) -> &Path {
        self.repo.path()
    }

    /// Config running `script` through `sh -c`; the prompt arrives as `$1`.
    pub fn config(&self, script: &str) -> ResolvedConfig {
        let mut config = ResolvedConfig::default();
        config.worker.command = "sh".to_string();
        config.worker.args = vec!["-c".to_string(), script.to_string(), "sh".to_string()];
        config.worker.grace_period_ms = 200;
        config.worktree.base_dir = self.worktrees.path().to_path_buf();
        config.channel.retry_backoff_ms = 1;
        config.budget = BudgetConfig {
            max_total_cost: 0.0,
            max_worker_cost: 0.0,
            max_total_tokens: 0,
            warn_at_percent: 80,
        };
        config
    }

    pub async fn open(&self, script: &str) -> Session {
        Session::open(self.path(), self.config(script)).await
    }

    /// Git worktrees other than the main checkout.
    pub fn extra_worktrees(&self) -> usize {
        git(self.path(), &["worktree", "list", "--porcelain"])
            .lines()
            .filter(|l| l.starts_with("worktree "))
            .count()
            .saturating_sub(1)
    }

    pub fn has_branch(&self, branch: &str) -> bool {
        !git(self.path(), &["branch", "--list", branch]).trim().is_empty()
    }
}

/// A fenced dispatch block as a supervisor would write it.
pub fn block(directive: &str, payload: serde_json::Value) -> String {
    format!("```{}\n{}\n```\n", directive, payload)
}

/// Run git synchronously, panicking on failure.
pub fn git(cwd: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .args(args)
        .current_dir(cwd)
        .output()
        .unwrap();
    assert!(
        output.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).to_string()
}
