// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Merge coordination.
//!
//! The coordinator is the only writer of the base repository. Each candidate
//! is classified into a [`MergeOutcome`]; clean in-scope change sets are merged
//! with a `--no-ff` commit, out-of-scope ones are held for approval, and
//! conflicts are aborted and reported. Once a result is consumed its worktree
//! is released according to the outcome.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::config::WorktreeConfig;
use crate::error::{Diagnostic, DiagnosticKind};
use crate::telemetry::{MergeKind, GLOBAL_METRICS};

use super::events::{EventBus, SessionEvent};
use super::git::{self, GitError, IDENTITY_EMAIL, IDENTITY_NAME};
use super::isolation::WorkspaceIsolator;
use super::scope::ScopeChecker;
use super::types::{
    MergeOutcome, MergeResolution, ReleaseMode, WorkRequest, WorkerResult, WorkerStatus,
};

/// Characters of the objective kept in merge commit messages.
const MESSAGE_OBJECTIVE_CHARS: usize = 72;

#[derive(Debug, Error)]
pub enum MergeError {
    #[error(transparent)]
    Git(#[from] GitError),

    #[error("Worker {0} has no pending approval")]
    NotPending(String),
}

/// Result of one `git merge` attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeAttempt {
    Merged(String),
    Conflict(String),
}

/// A held candidate waiting for an approval action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingApproval {
    pub result: WorkerResult,
    pub request: WorkRequest,
    pub outcome: MergeOutcome,
}

/// Commit message for merging a worker branch.
pub fn merge_message(worker_id: &str, objective: &str) -> String {
    let objective: String = objective
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .chars()
        .take(MESSAGE_OBJECTIVE_CHARS)
        .collect();
    format!("chore(codi-swarm): merge {} - {}", worker_id, objective)
}

/// Merge `branch` into the branch checked out at `cwd`, aborting on failure.
pub async fn merge_branch(
    cwd: &Path,
    branch: &str,
    message: &str,
    resolution: MergeResolution,
) -> Result<MergeAttempt, GitError> {
    let name = format!("user.name={}", IDENTITY_NAME);
    let email = format!("user.email={}", IDENTITY_EMAIL);
    let mut args: Vec<&str> = vec!["-c", &name, "-c", &email, "merge", "--no-ff", "-m", message];
    match resolution {
        MergeResolution::Ours => args.extend(["-X", "ours"]),
        MergeResolution::Theirs => args.extend(["-X", "theirs"]),
        MergeResolution::Abort => {}
    }
    args.push(branch);

    let output = git::run_git_unchecked(cwd, &args).await?;
    if output.success {
        return Ok(MergeAttempt::Merged(output.stdout.trim().to_string()));
    }

    let _ = git::run_git_unchecked(cwd, &["merge", "--abort"]).await;
    let details = if output.stdout.contains("CONFLICT") {
        output.stdout.trim().to_string()
    } else {
        output.message().to_string()
    };
    Ok(MergeAttempt::Conflict(if details.is_empty() {
        "merge conflict".to_string()
    } else {
        details
    }))
}

/// Whether merging `branch` at `cwd` would conflict. Leaves the tree untouched.
pub async fn probe_conflict(cwd: &Path, branch: &str) -> Result<bool, GitError> {
    let output = git::run_git_unchecked(cwd, &["merge", "--no-commit", "--no-ff", branch]).await?;
    let _ = git::run_git_unchecked(cwd, &["merge", "--abort"]).await;
    Ok(!output.success)
}

/// Serializes every write to the base repository.
pub struct MergeCoordinator {
    repo_root: PathBuf,
    isolator: Arc<dyn WorkspaceIsolator>,
    auto_merge: bool,
    cleanup: bool,
    keep_unmerged_branches: bool,
    apply_lock: tokio::sync::Mutex<()>,
    applied: Mutex<HashMap<String, MergeOutcome>>,
    pending: Mutex<Vec<PendingApproval>>,
    events: EventBus,
}

impl std::fmt::Debug for MergeCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MergeCoordinator")
            .field("repo_root", &self.repo_root)
            .field("auto_merge", &self.auto_merge)
            .finish()
    }
}

impl MergeCoordinator {
    pub fn new(
        repo_root: impl Into<PathBuf>,
        config: &WorktreeConfig,
        isolator: Arc<dyn WorkspaceIsolator>,
        events: EventBus,
    ) -> Self {
        Self {
            repo_root: repo_root.into(),
            isolator,
            auto_merge: config.auto_merge,
            cleanup: config.cleanup,
            keep_unmerged_branches: config.keep_unmerged_branches,
            apply_lock: tokio::sync::Mutex::new(()),
            applied: Mutex::new(HashMap::new()),
            pending: Mutex::new(Vec::new()),
            events,
        }
    }

    pub fn repo_root(&self) -> &Path {
        &self.repo_root
    }

    /// Held candidates, oldest first.
    pub fn pending(&self) -> Vec<PendingApproval> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn is_pending(&self, worker_id: &str) -> bool {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .any(|p| p.result.worker_id == worker_id)
    }

    fn applied_outcome(&self, worker_id: &str) -> Option<MergeOutcome> {
        self.applied
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(worker_id)
            .cloned()
    }

    /// Classify and, when allowed, merge one candidate.
    #[instrument(skip_all, fields(worker = %result.worker_id))]
    pub async fn merge_candidate(&self, result: &WorkerResult, request: &WorkRequest) -> MergeOutcome {
        if let Some(outcome) = self.applied_outcome(&result.worker_id) {
            debug!("already applied, replay is a no-op");
            return outcome;
        }

        if result.status != WorkerStatus::Completed {
            return self
                .dismiss(result, format!("Worker {}; not merged", result.status))
                .await;
        }
        if result.change_set.is_empty() {
            return self.dismiss(result, "No changes to merge").await;
        }

        let out_of_scope = ScopeChecker::new(&request.scope).out_of_scope(&result.change_set.files);
        if !out_of_scope.is_empty() || !self.auto_merge {
            return self.hold(result, request, out_of_scope).await;
        }

        let message = merge_message(&result.worker_id, &request.objective);
        let attempt = {
            let _guard = self.apply_lock.lock().await;
            merge_branch(&self.repo_root, &result.branch, &message, MergeResolution::Abort).await
        };
        let outcome = self.classify_attempt(result, attempt);
        self.finalize(result, &outcome, None).await;
        outcome
    }

    /// Merge candidates independently in the given order.
    pub async fn merge_batch(&self, candidates: &[(&WorkerResult, &WorkRequest)]) -> Vec<MergeOutcome> {
        let mut outcomes = Vec::with_capacity(candidates.len());
        for (result, request) in candidates {
            outcomes.push(self.merge_candidate(result, request).await);
        }
        outcomes
    }

    /// Consume a result without merging it.
    pub async fn dismiss(&self, result: &WorkerResult, message: impl Into<String>) -> MergeOutcome {
        let outcome = MergeOutcome::skipped(result, message);
        self.finalize(result, &outcome, None).await;
        outcome
    }

    /// Consume a result that a later one replaces; its branch is deleted.
    pub async fn supersede(&self, result: &WorkerResult, message: impl Into<String>) -> MergeOutcome {
        let outcome = MergeOutcome::skipped(result, message);
        let mode = if self.cleanup {
            ReleaseMode::Discard
        } else {
            ReleaseMode::Retain
        };
        self.finalize(result, &outcome, Some(mode)).await;
        outcome
    }

    async fn hold(
        &self,
        result: &WorkerResult,
        request: &WorkRequest,
        out_of_scope: Vec<String>,
    ) -> MergeOutcome {
        let conflict = {
            let _guard = self.apply_lock.lock().await;
            match probe_conflict(&self.repo_root, &result.branch).await {
                Ok(conflict) => conflict,
                Err(e) => {
                    warn!("conflict probe failed: {}", e);
                    false
                }
            }
        };

        let message = if out_of_scope.is_empty() {
            "Awaiting approval (auto merge disabled)".to_string()
        } else {
            self.events.diagnostic(
                Diagnostic::new(
                    DiagnosticKind::OutOfScopeEdit,
                    format!("edited outside scope: {}", out_of_scope.join(", ")),
                )
                .with_worker(&result.worker_id)
                .with_request(&result.request_id),
            );
            format!("Out of scope: {}", out_of_scope.join(", "))
        };
        let outcome = MergeOutcome::held(result, out_of_scope, conflict, message);

        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(PendingApproval {
                result: result.clone(),
                request: request.clone(),
                outcome: outcome.clone(),
            });
        self.events.emit(SessionEvent::ApprovalRequired {
            worker_id: result.worker_id.clone(),
            request_id: result.request_id.clone(),
            out_of_scope_paths: outcome.out_of_scope_paths.clone(),
            conflict,
        });
        self.finalize(result, &outcome, None).await;
        outcome
    }

    /// Merge held candidates; all of them when `worker_ids` is empty.
    ///
    /// Approving an already-applied worker returns its original outcome.
    #[instrument(skip(self))]
    pub async fn approve(
        &self,
        worker_ids: &[String],
        resolution: MergeResolution,
    ) -> Result<Vec<MergeOutcome>, MergeError> {
        let targets: Vec<String> = if worker_ids.is_empty() {
            self.pending()
                .into_iter()
                .map(|p| p.result.worker_id)
                .collect()
        } else {
            worker_ids.to_vec()
        };

        for id in &targets {
            if self.applied_outcome(id).is_none() && !self.is_pending(id) {
                return Err(MergeError::NotPending(id.clone()));
            }
        }

        let mut outcomes = Vec::with_capacity(targets.len());
        for id in &targets {
            if let Some(outcome) = self.applied_outcome(id) {
                outcomes.push(outcome);
                continue;
            }
            let Some(pending) = self.take_pending(id) else {
                continue;
            };

            let message = merge_message(id, &pending.request.objective);
            let attempt = {
                let _guard = self.apply_lock.lock().await;
                merge_branch(&self.repo_root, &pending.result.branch, &message, resolution).await
            };
            let mut outcome = self.classify_attempt(&pending.result, attempt);
            outcome.out_of_scope_paths = pending.outcome.out_of_scope_paths.clone();

            if !outcome.applied {
                // Stays held so it can be retried with another resolution.
                outcome.requires_approval = true;
                let mut pending = pending;
                pending.outcome = outcome.clone();
                self.pending
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .push(pending);
                self.events.emit(SessionEvent::MergeOutcome {
                    outcome: outcome.clone(),
                });
            } else {
                self.finalize(&pending.result, &outcome, None).await;
            }
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    /// Release every held candidate without merging (session cancel).
    pub async fn reject_all(&self) -> Vec<MergeOutcome> {
        let drained: Vec<PendingApproval> = std::mem::take(
            &mut *self.pending.lock().unwrap_or_else(|e| e.into_inner()),
        );
        let mut outcomes = Vec::with_capacity(drained.len());
        for pending in drained {
            outcomes.push(self.dismiss(&pending.result, "Approval withdrawn").await);
        }
        outcomes
    }

    fn take_pending(&self, worker_id: &str) -> Option<PendingApproval> {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        let index = pending.iter().position(|p| p.result.worker_id == worker_id)?;
        Some(pending.remove(index))
    }

    fn classify_attempt(
        &self,
        result: &WorkerResult,
        attempt: Result<MergeAttempt, GitError>,
    ) -> MergeOutcome {
        match attempt {
            Ok(MergeAttempt::Merged(details)) => {
                info!(branch = %result.branch, "merged worker branch");
                let outcome = MergeOutcome::applied(result, details);
                self.applied
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(result.worker_id.clone(), outcome.clone());
                outcome
            }
            Ok(MergeAttempt::Conflict(details)) => {
                warn!(branch = %result.branch, "merge conflict");
                self.events.diagnostic(
                    Diagnostic::new(DiagnosticKind::MergeConflict, details.clone())
                        .with_worker(&result.worker_id)
                        .with_request(&result.request_id),
                );
                MergeOutcome::conflict(result, details)
            }
            Err(e) => {
                self.events.diagnostic(
                    Diagnostic::new(DiagnosticKind::MergeConflict, format!("merge failed: {}", e))
                        .with_worker(&result.worker_id)
                        .with_request(&result.request_id),
                );
                MergeOutcome::conflict(result, e.to_string())
            }
        }
    }

    /// Release policy for a consumed result.
    pub fn release_mode(&self, result: &WorkerResult, outcome: &MergeOutcome) -> ReleaseMode {
        if !self.cleanup || outcome.requires_approval {
            ReleaseMode::Retain
        } else if outcome.applied
            || result.status == WorkerStatus::Cancelled
            || (result.status == WorkerStatus::Completed && result.change_set.is_empty())
            || !self.keep_unmerged_branches
        {
            ReleaseMode::Discard
        } else {
            ReleaseMode::KeepBranch
        }
    }

    async fn finalize(&self, result: &WorkerResult, outcome: &MergeOutcome, mode: Option<ReleaseMode>) {
        let kind = if outcome.applied {
            Some(MergeKind::Applied)
        } else if outcome.requires_approval {
            Some(MergeKind::Held)
        } else if outcome.conflict {
            Some(MergeKind::Conflict)
        } else {
            None
        };
        if let Some(kind) = kind {
            GLOBAL_METRICS.record_merge(kind);
        }
        self.events.emit(SessionEvent::MergeOutcome {
            outcome: outcome.clone(),
        });

        if !result.has_worktree() {
            return;
        }
        let mode = mode.unwrap_or_else(|| self.release_mode(result, outcome));
        if mode == ReleaseMode::Retain {
            return;
        }
        if let Err(e) = self.isolator.release(&result.worktree(), mode).await {
            warn!(worker = %result.worker_id, "failed to release worktree: {}", e);
        }
    }
}
