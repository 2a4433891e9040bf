// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Async git command runner.
//!
//! Every git invocation made by the provisioner, the worker supervisor and
//! the merge coordinator goes through here so that output capture and error
//! mapping stay uniform.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;
use tracing::trace;

use super::types::ChangeSet;

/// Author name used for commits made by the engine.
pub const IDENTITY_NAME: &str = "codi-swarm";
/// Author email used for commits made by the engine.
pub const IDENTITY_EMAIL: &str = "codi-swarm@localhost";

/// Error from running git.
#[derive(Debug, thiserror::Error)]
pub enum GitError {
    #[error("failed to execute git {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("git {command} failed (exit code {code}): {message}")]
    Failed {
        command: String,
        code: i32,
        message: String,
    },
}

/// Captured output of a git command.
#[derive(Debug, Clone, Default)]
pub struct GitOutput {
    /// Standard output with trailing whitespace removed.
    pub stdout: String,
    /// Standard error, trimmed.
    pub stderr: String,
    pub success: bool,
    pub code: i32,
}

impl GitOutput {
    /// Non-empty stdout lines.
    pub fn lines(&self) -> Vec<&str> {
        self.stdout.lines().filter(|l| !l.trim().is_empty()).collect()
    }

    /// Stderr if present, otherwise stdout.
    pub fn message(&self) -> &str {
        if self.stderr.is_empty() {
            self.stdout.trim()
        } else {
            &self.stderr
        }
    }
}

/// Run git and return its output regardless of exit status.
pub async fn run_git_unchecked(cwd: &Path, args: &[&str]) -> Result<GitOutput, GitError> {
    trace!(cwd = %cwd.display(), ?args, "git");

    let output = Command::new("git")
        .args(args)
        .current_dir(cwd)
        .env("GIT_TERMINAL_PROMPT", "0")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|source| GitError::Spawn {
            command: args.first().unwrap_or(&"").to_string(),
            source,
        })?;

    Ok(GitOutput {
        stdout: String::from_utf8_lossy(&output.stdout).trim_end().to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        success: output.status.success(),
        code: output.status.code().unwrap_or(-1),
    })
}

/// Run git, mapping a non-zero exit into [`GitError::Failed`].
pub async fn run_git(cwd: &Path, args: &[&str]) -> Result<GitOutput, GitError> {
    let output = run_git_unchecked(cwd, args).await?;
    if output.success {
        Ok(output)
    } else {
        Err(GitError::Failed {
            command: args.first().unwrap_or(&"").to_string(),
            code: output.code,
            message: output.message().to_string(),
        })
    }
}

/// Top-level directory of the repository containing `cwd`.
pub async fn repo_root(cwd: &Path) -> Result<PathBuf, GitError> {
    let output = run_git(cwd, &["rev-parse", "--show-toplevel"]).await?;
    Ok(PathBuf::from(output.stdout.trim()))
}

/// Resolve a revision to a full commit id.
pub async fn rev_parse(cwd: &Path, rev: &str) -> Result<String, GitError> {
    let spec = format!("{}^{{commit}}", rev);
    let output = run_git(cwd, &["rev-parse", "--verify", &spec]).await?;
    Ok(output.stdout.trim().to_string())
}

/// Whether the working tree has uncommitted changes (including untracked files).
pub async fn has_changes(cwd: &Path) -> Result<bool, GitError> {
    let output = run_git(cwd, &["status", "--porcelain"]).await?;
    Ok(!output.stdout.trim().is_empty())
}

/// Stage everything and commit with the engine identity.
///
/// Returns `false` when there was nothing to commit.
pub async fn commit_all(cwd: &Path, message: &str) -> Result<bool, GitError> {
    if !has_changes(cwd).await? {
        return Ok(false);
    }

    run_git(cwd, &["add", "-A"]).await?;

    let name = format!("user.name={}", IDENTITY_NAME);
    let email = format!("user.email={}", IDENTITY_EMAIL);
    run_git(
        cwd,
        &["-c", &name, "-c", &email, "commit", "--no-verify", "-m", message],
    )
    .await?;
    Ok(true)
}

/// Change set between two revisions.
pub async fn diff_between(cwd: &Path, base: &str, head: &str) -> Result<ChangeSet, GitError> {
    let range = format!("{}..{}", base, head);
    let names = run_git(cwd, &["diff", "--name-only", &range]).await?;
    let patch = run_git(cwd, &["diff", &range]).await?;

    Ok(ChangeSet {
        files: names.lines().iter().map(|l| l.trim().to_string()).collect(),
        patch: patch.stdout,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrate::test_support::create_test_repo;

    #[tokio::test]
    async fn test_run_git_failure_maps_error() {
        let repo = create_test_repo();
        let err = run_git(repo.path(), &["rev-parse", "--verify", "no-such-ref"])
            .await
            .unwrap_err();
        match err {
            GitError::Failed { command, code, .. } => {
                assert_eq!(command, "rev-parse");
                assert_ne!(code, 0);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_repo_root_and_rev_parse() {
        let repo = create_test_repo();
        let nested = repo.path().join("nested");
        std::fs::create_dir_all(&nested).unwrap();

        let root = repo_root(&nested).await.unwrap();
        assert_eq!(
            root.canonicalize().unwrap(),
            repo.path().canonicalize().unwrap()
        );

        let head = rev_parse(repo.path(), "HEAD").await.unwrap();
        assert_eq!(head.len(), 40);
    }

    #[tokio::test]
    async fn test_repo_root_outside_repository() {
        let dir = tempfile::tempdir().unwrap();
        assert!(repo_root(dir.path()).await.is_err());
    }

    #[tokio::test]
    async fn test_commit_all_and_diff() {
        let repo = create_test_repo();
        let base = rev_parse(repo.path(), "HEAD").await.unwrap();

        assert!(!commit_all(repo.path(), "nothing").await.unwrap());

        std::fs::write(repo.path().join("new.txt"), "hello\n").unwrap();
        assert!(commit_all(repo.path(), "add new").await.unwrap());
        assert!(!has_changes(repo.path()).await.unwrap());

        let change_set = diff_between(repo.path(), &base, "HEAD").await.unwrap();
        assert_eq!(change_set.files, vec!["new.txt"]);
        assert!(change_set.patch.contains("+hello"));

        let author = run_git(repo.path(), &["log", "-1", "--format=%an"]).await.unwrap();
        assert_eq!(author.stdout, IDENTITY_NAME);
    }
}
