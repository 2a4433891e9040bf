// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Error types for codi-swarm.
//!
//! Each subsystem owns a `thiserror` enum for the failures it can report.
//! Failures the engine recovers from are additionally folded into a
//! [`Diagnostic`], which is attached to the session record and surfaced to
//! observers and the supervisor.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur during configuration loading.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    NotFound(String),

    #[error("Invalid config format: {0}")]
    InvalidFormat(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("IO error reading config: {0}")]
    IoError(String),

    #[error("YAML parsing error: {0}")]
    YamlError(String),

    #[error("JSON parsing error: {0}")]
    JsonError(String),
}

impl ConfigError {
    /// Create an invalid value error.
    pub fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound(err.to_string()),
            _ => Self::IoError(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(err: serde_json::Error) -> Self {
        Self::JsonError(err.to_string())
    }
}

impl From<serde_yaml::Error> for ConfigError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::YamlError(err.to_string())
    }
}

/// Errors raised by the session controller itself.
#[derive(Error, Debug)]
pub enum SessionError {
    /// The base project tree is not a readable git repository.
    #[error("Repository unavailable at {path}: {reason}")]
    RepositoryUnavailable { path: String, reason: String },

    #[error("Invalid session transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Session is terminal ({0}); no further work is accepted")]
    Terminal(String),

    #[error("Worker not found: {0}")]
    WorkerNotFound(String),

    #[error("Merge failed: {0}")]
    MergeFailed(String),

    #[error("Failed to write session record: {0}")]
    RecordFailed(String),

    #[error("IO error: {0}")]
    IoError(String),
}

impl From<std::io::Error> for SessionError {
    fn from(err: std::io::Error) -> Self {
        Self::IoError(err.to_string())
    }
}

/// Category of a recovered failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticKind {
    /// A dispatch block was skipped.
    MalformedDispatch,
    /// A worktree could not be provisioned.
    ProvisionFailure,
    /// A worker exceeded its deadline.
    WorkerTimeout,
    /// A worker exited abnormally or could not be launched.
    WorkerCrash,
    /// A change set did not apply cleanly.
    MergeConflict,
    /// A change set touched paths outside its scope hints.
    OutOfScopeEdit,
    /// A response could not be delivered.
    ChannelFailure,
    /// The budget policy refused to launch a worker.
    BudgetExceeded,
}

impl DiagnosticKind {
    /// Whether this kind should be logged at warning level.
    pub fn is_warning(&self) -> bool {
        !matches!(self, Self::OutOfScopeEdit)
    }
}

impl std::fmt::Display for DiagnosticKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::MalformedDispatch => "malformed_dispatch",
            Self::ProvisionFailure => "provision_failure",
            Self::WorkerTimeout => "worker_timeout",
            Self::WorkerCrash => "worker_crash",
            Self::MergeConflict => "merge_conflict",
            Self::OutOfScopeEdit => "out_of_scope_edit",
            Self::ChannelFailure => "channel_failure",
            Self::BudgetExceeded => "budget_exceeded",
        };
        f.write_str(name)
    }
}

/// Structured record of a recovered error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub kind: DiagnosticKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub at: DateTime<Utc>,
}

impl Diagnostic {
    /// Create a diagnostic not tied to a worker.
    pub fn new(kind: DiagnosticKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            worker_id: None,
            request_id: None,
            at: Utc::now(),
        }
    }

    /// Attach the worker this diagnostic concerns.
    pub fn with_worker(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = Some(worker_id.into());
        self
    }

    /// Attach the work request this diagnostic concerns.
    pub fn with_request(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.worker_id {
            Some(worker) => write!(f, "[{}] {}: {}", self.kind, worker, self.message),
            None => write!(f, "[{}] {}", self.kind, self.message),
        }
    }
}

/// Result type alias using anyhow for flexible error handling.
pub type Result<T> = anyhow::Result<T>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_from_json() {
        let result: std::result::Result<serde_json::Value, _> = serde_json::from_str("invalid json");
        let json_err = result.unwrap_err();
        let config_err: ConfigError = json_err.into();
        assert!(matches!(config_err, ConfigError::JsonError(_)));
    }

    #[test]
    fn test_config_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let config_err: ConfigError = io_err.into();
        assert!(matches!(config_err, ConfigError::NotFound(_)));
    }

    #[test]
    fn test_diagnostic_display() {
        let diag = Diagnostic::new(DiagnosticKind::WorkerTimeout, "deadline exceeded")
            .with_worker("w-1234");
        assert_eq!(diag.to_string(), "[worker_timeout] w-1234: deadline exceeded");

        let diag = Diagnostic::new(DiagnosticKind::MalformedDispatch, "missing objective");
        assert_eq!(diag.to_string(), "[malformed_dispatch] missing objective");
    }

    #[test]
    fn test_diagnostic_serialization() {
        let diag = Diagnostic::new(DiagnosticKind::OutOfScopeEdit, "docs/x.md")
            .with_request("req-1");
        let json = serde_json::to_string(&diag).unwrap();
        assert!(json.contains("\"kind\":\"out_of_scope_edit\""));
        assert!(json.contains("\"request_id\":\"req-1\""));
        assert!(!json.contains("worker_id"));
    }

    #[test]
    fn test_session_error_display() {
        let err = SessionError::InvalidTransition {
            from: "completed".to_string(),
            to: "running".to_string(),
        };
        assert_eq!(err.to_string(), "Invalid session transition: completed -> running");
    }
}
