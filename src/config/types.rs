// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Configuration type definitions.
//!
//! Defines the structure of on-disk configuration files and the fully
//! resolved configuration the engine runs with. Files may be JSON or YAML.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// On-disk configuration for codi-swarm.
///
/// Can be defined in `.codi-swarm.json` or `.codi-swarm/config.json` in the
/// project root, or in `~/.codi-swarm/config.json`. Every field is optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigFile {
    /// Worker process settings
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker: Option<WorkerSection>,

    /// Worktree provisioning settings
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worktree: Option<WorktreeSection>,

    /// Result compression settings
    #[serde(skip_serializing_if = "Option::is_none")]
    pub results: Option<ResultsSection>,

    /// Response channel settings
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<ChannelSection>,

    /// Token and cost budget
    #[serde(skip_serializing_if = "Option::is_none")]
    pub budget: Option<BudgetSection>,

    /// Debate strategy settings
    #[serde(skip_serializing_if = "Option::is_none")]
    pub debate: Option<DebateSection>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerSection {
    /// Worker executable
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,

    /// Arguments placed before the prompt
    #[serde(skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<String>>,

    /// Model passed to the worker and used for pricing
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_workers: Option<usize>,

    /// Ceiling for per-request timeouts, in seconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub grace_period_ms: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_count: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_provision_failures: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorktreeSection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_dir: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_ref: Option<String>,

    /// Remove worktrees once their result has been consumed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cleanup: Option<bool>,

    /// Merge in-scope results without asking
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auto_merge: Option<bool>,

    /// Keep branches of failed or conflicting workers for inspection
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keep_unmerged_branches: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultsSection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_summary_tokens: Option<usize>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_diff_lines: Option<usize>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_output_lines: Option<usize>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_output_bytes: Option<usize>,

    /// Directory for response artifacts, relative to the repository
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelSection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<ChannelMode>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub socket_dir: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub delivery_retries: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_backoff_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetSection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_total_cost: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_worker_cost: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_total_tokens: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub warn_at_percent: Option<u8>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DebateSection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rounds: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub participants: Option<usize>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub policy: Option<DebatePolicyKind>,

    /// Program that picks a debate winner when `policy` is `command`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub adjudicator_command: Option<String>,
}

/// How responses reach the supervisor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelMode {
    /// Append to a watched markdown file.
    #[default]
    Artifact,
    /// Send over the control socket.
    Socket,
}

/// Convergence rule used to select a debate winner.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DebatePolicyKind {
    #[default]
    HighestConfidence,
    Majority,
    Command,
}

// ============================================================================
// Resolved configuration
// ============================================================================

/// Fully resolved configuration with all defaults applied.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResolvedConfig {
    pub worker: WorkerConfig,
    pub worktree: WorktreeConfig,
    pub results: ResultsConfig,
    pub channel: ChannelConfig,
    pub budget: BudgetConfig,
    pub debate: DebateConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub command: String,
    pub args: Vec<String>,
    pub model: Option<String>,
    pub max_workers: usize,
    pub timeout_secs: u64,
    pub grace_period_ms: u64,
    pub retry_count: u32,
    pub max_provision_failures: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            command: "codex".to_string(),
            args: vec!["exec".to_string(), "--json".to_string()],
            model: None,
            max_workers: 4,
            timeout_secs: 300,
            grace_period_ms: 2000,
            retry_count: 0,
            max_provision_failures: 3,
        }
    }
}

impl WorkerConfig {
    /// Upper bound for any request timeout.
    pub fn timeout_ceiling(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorktreeConfig {
    pub base_dir: PathBuf,
    pub base_ref: String,
    pub cleanup: bool,
    pub auto_merge: bool,
    pub keep_unmerged_branches: bool,
}

impl Default for WorktreeConfig {
    fn default() -> Self {
        Self {
            base_dir: std::env::temp_dir().join("codi-swarm"),
            base_ref: "HEAD".to_string(),
            cleanup: true,
            auto_merge: true,
            keep_unmerged_branches: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultsConfig {
    pub max_summary_tokens: usize,
    pub max_diff_lines: usize,
    pub max_output_lines: usize,
    pub max_output_bytes: usize,
    pub response_dir: PathBuf,
}

impl Default for ResultsConfig {
    fn default() -> Self {
        Self {
            max_summary_tokens: 500,
            max_diff_lines: 200,
            max_output_lines: 400,
            max_output_bytes: 64 * 1024,
            response_dir: PathBuf::from(".codi-swarm").join("responses"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub mode: ChannelMode,
    pub socket_dir: PathBuf,
    pub delivery_retries: u32,
    pub retry_backoff_ms: u64,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            mode: ChannelMode::Artifact,
            socket_dir: std::env::temp_dir(),
            delivery_retries: 3,
            retry_backoff_ms: 100,
        }
    }
}

impl ChannelConfig {
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetConfig {
    pub max_total_cost: f64,
    pub max_worker_cost: f64,
    pub max_total_tokens: u64,
    pub warn_at_percent: u8,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            max_total_cost: 5.0,
            max_worker_cost: 1.5,
            max_total_tokens: 200_000,
            warn_at_percent: 80,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebateConfig {
    pub rounds: u32,
    pub participants: usize,
    pub policy: DebatePolicyKind,
    pub adjudicator_command: Option<String>,
}

impl Default for DebateConfig {
    fn default() -> Self {
        Self {
            rounds: 2,
            participants: 2,
            policy: DebatePolicyKind::HighestConfidence,
            adjudicator_command: None,
        }
    }
}

impl ResolvedConfig {
    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker.command.trim().is_empty() {
            return Err(ConfigError::invalid("worker.command", "must not be empty"));
        }
        if self.worker.max_workers == 0 {
            return Err(ConfigError::invalid("worker.maxWorkers", "must be at least 1"));
        }
        if self.worker.timeout_secs == 0 {
            return Err(ConfigError::invalid("worker.timeoutSecs", "must be at least 1"));
        }
        if self.debate.rounds == 0 {
            return Err(ConfigError::invalid("debate.rounds", "must be at least 1"));
        }
        if self.debate.participants == 0 {
            return Err(ConfigError::invalid("debate.participants", "must be at least 1"));
        }
        if self.budget.warn_at_percent > 100 {
            return Err(ConfigError::invalid(
                "budget.warnAtPercent",
                "must be between 0 and 100",
            ));
        }
        if self.debate.policy == DebatePolicyKind::Command
            && self
                .debate
                .adjudicator_command
                .as_deref()
                .map_or(true, |c| c.trim().is_empty())
        {
            return Err(ConfigError::invalid(
                "debate.adjudicatorCommand",
                "required when policy is \"command\"",
            ));
        }
        Ok(())
    }
}
