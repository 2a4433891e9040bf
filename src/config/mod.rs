// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Configuration module for codi-swarm.
//!
//! Handles loading, merging, and validation of configuration from multiple sources:
//! - Global config: ~/.codi-swarm/config.json
//! - Workspace config: .codi-swarm.json, .codi-swarm/config.json, or codi-swarm.config.json
//! - Local config: .codi-swarm.local.json (gitignored, for personal overrides)
//! - CLI options: command-line arguments
//!
//! Configuration is merged with precedence (CLI > local > workspace > global > defaults).

mod loader;
mod merger;
mod types;

pub use loader::{
    find_workspace_root, get_example_config, get_global_config_dir, get_global_config_path,
    init_config, load_config_file, load_global_config, load_local_config, load_workspace_config,
    save_workspace_config, CONFIG_FILES, GLOBAL_CONFIG_DIR, GLOBAL_CONFIG_FILE, LOCAL_CONFIG_FILE,
};

pub use merger::{default_config, merge_config, CliOptions};

pub use types::{
    BudgetConfig, BudgetSection, ChannelConfig, ChannelMode, ChannelSection, ConfigFile,
    DebateConfig, DebatePolicyKind, DebateSection, ResolvedConfig, ResultsConfig, ResultsSection,
    WorkerConfig, WorkerSection, WorktreeConfig, WorktreeSection,
};

use crate::error::ConfigError;
use std::path::Path;

/// Load, merge and validate all configuration sources for a workspace.
pub fn load_config(
    workspace_root: &Path,
    cli_options: CliOptions,
) -> Result<ResolvedConfig, ConfigError> {
    let global = load_global_config()?;
    let workspace = load_workspace_config(workspace_root)?;
    let local = load_local_config(workspace_root)?;

    let config = merge_config(global, workspace, local, cli_options);
    config.validate()?;
    Ok(config)
}
