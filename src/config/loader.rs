// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Configuration loading from files.
//!
//! Handles loading configuration from JSON and YAML files in various locations.

use std::path::{Path, PathBuf};

use crate::error::ConfigError;

use super::types::{
    BudgetSection, ConfigFile, DebateSection, WorkerSection, WorktreeSection,
};

/// Config file names to search for (in order).
pub const CONFIG_FILES: &[&str] = &[
    ".codi-swarm.json",
    ".codi-swarm/config.json",
    "codi-swarm.config.json",
    ".codi-swarm.yaml",
    ".codi-swarm.yml",
    ".codi-swarm/config.yaml",
    "codi-swarm.config.yaml",
];

/// Local config file name (for per-directory overrides).
pub const LOCAL_CONFIG_FILE: &str = ".codi-swarm.local.json";

/// Global config directory name.
pub const GLOBAL_CONFIG_DIR: &str = ".codi-swarm";

/// Global config file name.
pub const GLOBAL_CONFIG_FILE: &str = "config.json";

/// Get the global config directory path.
pub fn get_global_config_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(GLOBAL_CONFIG_DIR))
}

/// Get the global config file path.
pub fn get_global_config_path() -> Option<PathBuf> {
    get_global_config_dir().map(|dir| dir.join(GLOBAL_CONFIG_FILE))
}

/// Load global configuration from ~/.codi-swarm/config.json.
pub fn load_global_config() -> Result<Option<ConfigFile>, ConfigError> {
    let path = match get_global_config_path() {
        Some(p) => p,
        None => return Ok(None),
    };

    if !path.exists() {
        return Ok(None);
    }

    load_config_file(&path).map(Some)
}

/// Load workspace configuration from the workspace root.
///
/// The first file from [`CONFIG_FILES`] that exists wins.
pub fn load_workspace_config(workspace_root: &Path) -> Result<Option<ConfigFile>, ConfigError> {
    for filename in CONFIG_FILES {
        let path = workspace_root.join(filename);
        if path.exists() {
            return load_config_file(&path).map(Some);
        }
    }
    Ok(None)
}

/// Load local configuration from .codi-swarm.local.json.
pub fn load_local_config(workspace_root: &Path) -> Result<Option<ConfigFile>, ConfigError> {
    let path = workspace_root.join(LOCAL_CONFIG_FILE);
    if !path.exists() {
        return Ok(None);
    }
    load_config_file(&path).map(Some)
}

/// Load a configuration file (JSON or YAML).
pub fn load_config_file(path: &Path) -> Result<ConfigFile, ConfigError> {
    let content = std::fs::read_to_string(path)?;

    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("");

    match extension.to_lowercase().as_str() {
        "yaml" | "yml" => serde_yaml::from_str(&content).map_err(ConfigError::from),
        _ => serde_json::from_str(&content).map_err(ConfigError::from),
    }
}

/// Save workspace configuration to a file.
pub fn save_workspace_config(
    workspace_root: &Path,
    config: &ConfigFile,
    filename: Option<&str>,
) -> Result<PathBuf, ConfigError> {
    let filename = filename.unwrap_or(CONFIG_FILES[0]);
    let path = workspace_root.join(filename);

    let content = serde_json::to_string_pretty(config)?;
    std::fs::write(&path, content)?;

    Ok(path)
}

/// Initialize a new config file with the example or provided configuration.
pub fn init_config(
    workspace_root: &Path,
    config: Option<ConfigFile>,
) -> Result<PathBuf, ConfigError> {
    let config = config.unwrap_or_else(get_example_config);
    save_workspace_config(workspace_root, &config, None)
}

/// Find the workspace root by searching for config files.
///
/// Walks up the directory tree from `start` until it finds a directory
/// containing a config file or reaches the filesystem root.
pub fn find_workspace_root(start: &Path) -> Option<PathBuf> {
    let mut current = start.to_path_buf();

    loop {
        for filename in CONFIG_FILES {
            if current.join(filename).exists() {
                return Some(current);
            }
        }

        match current.parent() {
            Some(parent) => current = parent.to_path_buf(),
            None => return None,
        }
    }
}

/// Get an example configuration.
pub fn get_example_config() -> ConfigFile {
    ConfigFile {
        worker: Some(WorkerSection {
            command: Some("codex".to_string()),
            args: Some(vec!["exec".to_string(), "--json".to_string()]),
            model: Some("o4-mini".to_string()),
            max_workers: Some(4),
            timeout_secs: Some(300),
            ..Default::default()
        }),
        worktree: Some(WorktreeSection {
            auto_merge: Some(true),
            keep_unmerged_branches: Some(true),
            ..Default::default()
        }),
        budget: Some(BudgetSection {
            max_total_cost: Some(5.0),
            warn_at_percent: Some(80),
            ..Default::default()
        }),
        debate: Some(DebateSection {
            rounds: Some(2),
            participants: Some(2),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_config_files_order() {
        assert_eq!(CONFIG_FILES[0], ".codi-swarm.json");
        assert!(CONFIG_FILES.iter().any(|f| f.ends_with(".yaml")));
    }

    #[test]
    fn test_global_config_dir() {
        let dir = get_global_config_dir();
        assert!(dir.is_some());
        assert!(dir.unwrap().ends_with(".codi-swarm"));
    }

    #[test]
    fn test_load_workspace_config_not_found() {
        let temp = TempDir::new().unwrap();
        let result = load_workspace_config(temp.path());
        assert!(result.is_ok());
        assert!(result.unwrap().is_none());
    }

    #[test]
    fn test_load_workspace_config_json() {
        let temp = TempDir::new().unwrap();
        std::fs::write(
            temp.path().join(".codi-swarm.json"),
            r#"{"worker": {"command": "agent", "maxWorkers": 2}}"#,
        )
        .unwrap();

        let config = load_workspace_config(temp.path()).unwrap().unwrap();
        let worker = config.worker.unwrap();
        assert_eq!(worker.command, Some("agent".to_string()));
        assert_eq!(worker.max_workers, Some(2));
    }

    #[test]
    fn test_load_workspace_config_yaml() {
        let temp = TempDir::new().unwrap();
        let config_dir = temp.path().join(".codi-swarm");
        std::fs::create_dir(&config_dir).unwrap();
        std::fs::write(
            config_dir.join("config.yaml"),
            "worker:\n  command: yaml-agent\n  timeoutSecs: 42\n",
        )
        .unwrap();

        let config = load_workspace_config(temp.path()).unwrap().unwrap();
        let worker = config.worker.unwrap();
        assert_eq!(worker.command, Some("yaml-agent".to_string()));
        assert_eq!(worker.timeout_secs, Some(42));
    }

    #[test]
    fn test_load_invalid_json() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join(".codi-swarm.json"), "{not json").unwrap();
        let result = load_workspace_config(temp.path());
        assert!(matches!(result, Err(ConfigError::JsonError(_))));
    }

    #[test]
    fn test_find_workspace_root() {
        let temp = TempDir::new().unwrap();
        let subdir = temp.path().join("a").join("b").join("c");
        std::fs::create_dir_all(&subdir).unwrap();
        std::fs::write(temp.path().join(".codi-swarm.json"), "{}").unwrap();

        let found = find_workspace_root(&subdir);
        assert_eq!(found.unwrap(), temp.path());
    }

    #[test]
    fn test_init_config() {
        let temp = TempDir::new().unwrap();
        let path = init_config(temp.path(), None).unwrap();
        assert!(path.exists());
        assert_eq!(path.file_name().unwrap(), ".codi-swarm.json");

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("\"maxWorkers\": 4"));
        assert!(load_config_file(&path).is_ok());
    }
}
