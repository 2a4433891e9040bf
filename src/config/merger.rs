// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Configuration merging.
//!
//! Handles merging configurations from different sources with proper precedence.

use super::types::{ChannelMode, ConfigFile, ResolvedConfig};

/// CLI options that can override configuration.
#[derive(Debug, Clone, Default)]
pub struct CliOptions {
    pub max_workers: Option<usize>,
    pub timeout_secs: Option<u64>,
    pub worker_command: Option<String>,
    pub worker_model: Option<String>,
    pub channel_mode: Option<ChannelMode>,
    pub auto_merge: Option<bool>,
}

/// Default configuration values.
pub fn default_config() -> ResolvedConfig {
    ResolvedConfig::default()
}

/// Merge multiple configurations with precedence.
///
/// Precedence (highest to lowest):
/// 1. CLI options
/// 2. Local config (.codi-swarm.local.json)
/// 3. Workspace config (.codi-swarm.json)
/// 4. Global config (~/.codi-swarm/config.json)
/// 5. Default values
pub fn merge_config(
    global: Option<ConfigFile>,
    workspace: Option<ConfigFile>,
    local: Option<ConfigFile>,
    cli: CliOptions,
) -> ResolvedConfig {
    let mut result = default_config();

    for config in [global, workspace, local].into_iter().flatten() {
        apply_config_file(&mut result, &config);
    }

    // CLI options have the highest precedence
    apply_cli_options(&mut result, &cli);

    result
}

fn apply_config_file(result: &mut ResolvedConfig, config: &ConfigFile) {
    if let Some(ref worker) = config.worker {
        if let Some(ref command) = worker.command {
            result.worker.command = command.clone();
        }
        if let Some(ref args) = worker.args {
            result.worker.args = args.clone();
        }
        if worker.model.is_some() {
            result.worker.model = worker.model.clone();
        }
        if let Some(max) = worker.max_workers {
            result.worker.max_workers = max;
        }
        if let Some(timeout) = worker.timeout_secs {
            result.worker.timeout_secs = timeout;
        }
        if let Some(grace) = worker.grace_period_ms {
            result.worker.grace_period_ms = grace;
        }
        if let Some(retries) = worker.retry_count {
            result.worker.retry_count = retries;
        }
        if let Some(threshold) = worker.max_provision_failures {
            result.worker.max_provision_failures = threshold;
        }
    }

    if let Some(ref worktree) = config.worktree {
        if let Some(ref base_dir) = worktree.base_dir {
            result.worktree.base_dir = base_dir.clone();
        }
        if let Some(ref base_ref) = worktree.base_ref {
            result.worktree.base_ref = base_ref.clone();
        }
        if let Some(cleanup) = worktree.cleanup {
            result.worktree.cleanup = cleanup;
        }
        if let Some(auto_merge) = worktree.auto_merge {
            result.worktree.auto_merge = auto_merge;
        }
        if let Some(keep) = worktree.keep_unmerged_branches {
            result.worktree.keep_unmerged_branches = keep;
        }
    }

    if let Some(ref results) = config.results {
        if let Some(tokens) = results.max_summary_tokens {
            result.results.max_summary_tokens = tokens;
        }
        if let Some(lines) = results.max_diff_lines {
            result.results.max_diff_lines = lines;
        }
        if let Some(lines) = results.max_output_lines {
            result.results.max_output_lines = lines;
        }
        if let Some(bytes) = results.max_output_bytes {
            result.results.max_output_bytes = bytes;
        }
        if let Some(ref dir) = results.response_dir {
            result.results.response_dir = dir.clone();
        }
    }

    if let Some(ref channel) = config.channel {
        if let Some(mode) = channel.mode {
            result.channel.mode = mode;
        }
        if let Some(ref dir) = channel.socket_dir {
            result.channel.socket_dir = dir.clone();
        }
        if let Some(retries) = channel.delivery_retries {
            result.channel.delivery_retries = retries;
        }
        if let Some(backoff) = channel.retry_backoff_ms {
            result.channel.retry_backoff_ms = backoff;
        }
    }

    if let Some(ref budget) = config.budget {
        if let Some(cost) = budget.max_total_cost {
            result.budget.max_total_cost = cost;
        }
        if let Some(cost) = budget.max_worker_cost {
            result.budget.max_worker_cost = cost;
        }
        if let Some(tokens) = budget.max_total_tokens {
            result.budget.max_total_tokens = tokens;
        }
        if let Some(percent) = budget.warn_at_percent {
            result.budget.warn_at_percent = percent;
        }
    }

    if let Some(ref debate) = config.debate {
        if let Some(rounds) = debate.rounds {
            result.debate.rounds = rounds;
        }
        if let Some(participants) = debate.participants {
            result.debate.participants = participants;
        }
        if let Some(policy) = debate.policy {
            result.debate.policy = policy;
        }
        if debate.adjudicator_command.is_some() {
            result.debate.adjudicator_command = debate.adjudicator_command.clone();
        }
    }
}

fn apply_cli_options(result: &mut ResolvedConfig, cli: &CliOptions) {
    if let Some(max) = cli.max_workers {
        result.worker.max_workers = max;
    }

    if let Some(timeout) = cli.timeout_secs {
        result.worker.timeout_secs = timeout;
    }

    if let Some(ref command) = cli.worker_command {
        result.worker.command = command.clone();
    }

    if cli.worker_model.is_some() {
        result.worker.model = cli.worker_model.clone();
    }

    if let Some(mode) = cli.channel_mode {
        result.channel.mode = mode;
    }

    if let Some(auto_merge) = cli.auto_merge {
        result.worktree.auto_merge = auto_merge;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::super::types::{BudgetSection, WorkerSection, WorktreeSection};

    #[test]
    fn test_default_config() {
        let config = default_config();
        assert_eq!(config.worker.command, "codex");
        assert!(config.worktree.auto_merge);
    }

    #[test]
    fn test_merge_config_precedence() {
        let global = ConfigFile {
            worker: Some(WorkerSection {
                command: Some("global-agent".to_string()),
                max_workers: Some(2),
                ..Default::default()
            }),
            ..Default::default()
        };

        let workspace = ConfigFile {
            worker: Some(WorkerSection {
                max_workers: Some(6),
                ..Default::default()
            }),
            ..Default::default()
        };

        let local = ConfigFile {
            worker: Some(WorkerSection {
                max_workers: Some(8),
                ..Default::default()
            }),
            ..Default::default()
        };

        let cli = CliOptions {
            worker_command: Some("cli-agent".to_string()),
            ..Default::default()
        };

        let result = merge_config(Some(global), Some(workspace), Some(local), cli);

        assert_eq!(result.worker.command, "cli-agent");
        assert_eq!(result.worker.max_workers, 8);
    }

    #[test]
    fn test_merge_keeps_unset_defaults() {
        let workspace = ConfigFile {
            budget: Some(BudgetSection {
                max_total_cost: Some(1.0),
                ..Default::default()
            }),
            ..Default::default()
        };

        let result = merge_config(None, Some(workspace), None, CliOptions::default());

        assert_eq!(result.budget.max_total_cost, 1.0);
        assert_eq!(result.budget.max_total_tokens, 200_000);
        assert_eq!(result.worker.timeout_secs, 300);
    }

    #[test]
    fn test_cli_options_override() {
        let workspace = ConfigFile {
            worktree: Some(WorktreeSection {
                auto_merge: Some(true),
                ..Default::default()
            }),
            ..Default::default()
        };

        let cli = CliOptions {
            auto_merge: Some(false),
            timeout_secs: Some(30),
            channel_mode: Some(ChannelMode::Socket),
            ..Default::default()
        };

        let result = merge_config(None, Some(workspace), None, cli);

        assert!(!result.worktree.auto_merge);
        assert_eq!(result.worker.timeout_secs, 30);
        assert_eq!(result.channel.mode, ChannelMode::Socket);
    }
}
