// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Dispatch interpreter.
//!
//! The supervisor emits directives as fenced blocks in its output:
//!
//! ````text
//! ```spawn_swarm
//! {"strategy": "pipeline", "tasks": [{"task": "write tests"}, {"task": "fix bugs"}]}
//! ```
//! ````
//!
//! Each block is normalized into a [`Dispatch`]. Field names are resolved
//! through [`FIELD_SYNONYMS`]; missing optional fields take defaults. A block
//! that cannot be normalized is skipped with a `malformed_dispatch`
//! diagnostic and never affects the blocks around it.

use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::error::{Diagnostic, DiagnosticKind};

use super::types::{MergeResolution, Priority, ReturnFormat, Strategy, TokenUsage, WorkRequest};

static BLOCK_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"```(spawn_agent|spawn_swarm|check_workers|merge_results)[ \t]*\r?\n(?s:(.*?))```")
        .expect("dispatch block regex")
});

static TRAILING_COMMA_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r",\s*([}\]])").expect("trailing comma regex"));

/// Canonical field name and the keys accepted for it, in lookup order.
pub const FIELD_SYNONYMS: &[(&str, &[&str])] = &[
    ("objective", &["objective", "task", "description", "prompt"]),
    ("scope", &["scope", "files", "paths"]),
    ("context", &["context", "notes", "constraints"]),
    ("workers", &["tasks", "workers", "agents"]),
    ("timeout", &["timeout", "timeout_secs", "timeout_seconds"]),
    ("rounds", &["rounds", "debate_rounds"]),
    ("reduce", &["reduce", "reducer"]),
    ("resolution", &["resolve_conflicts", "resolution"]),
];

/// Why a block was rejected.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DispatchError {
    #[error("unknown directive: {0}")]
    UnknownDirective(String),

    #[error("invalid JSON payload: {0}")]
    InvalidJson(String),

    #[error("payload must be a JSON object")]
    NotAnObject,

    #[error("missing objective (expected one of: objective, task, description, prompt)")]
    MissingObjective,

    #[error("invalid field '{field}': {message}")]
    InvalidField { field: String, message: String },

    #[error("spawn_swarm requires a worker list or an objective")]
    NoRequests,
}

impl DispatchError {
    fn field(field: &str, message: impl Into<String>) -> Self {
        Self::InvalidField {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

/// Directive names the supervisor may emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DirectiveKind {
    SpawnAgent,
    SpawnSwarm,
    CheckWorkers,
    MergeResults,
}

impl DirectiveKind {
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim() {
            "spawn_agent" => Some(Self::SpawnAgent),
            "spawn_swarm" => Some(Self::SpawnSwarm),
            "check_workers" => Some(Self::CheckWorkers),
            "merge_results" => Some(Self::MergeResults),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SpawnAgent => "spawn_agent",
            Self::SpawnSwarm => "spawn_swarm",
            Self::CheckWorkers => "check_workers",
            Self::MergeResults => "merge_results",
        }
    }
}

/// A normalized `spawn_swarm` directive.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SwarmDirective {
    pub strategy: Strategy,
    /// Requests in the order they were listed.
    pub requests: Vec<WorkRequest>,
    /// Block until the swarm finishes before responding.
    pub wait: bool,
    /// Debate rounds override.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rounds: Option<u32>,
    /// Debate participant count override.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub participants: Option<usize>,
    /// Reducer objective for map-reduce.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reduce: Option<String>,
}

/// A normalized directive.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "directive", rename_all = "snake_case")]
pub enum Directive {
    SpawnAgent { request: WorkRequest },
    SpawnSwarm(SwarmDirective),
    CheckWorkers { worker_ids: Vec<String> },
    MergeResults {
        worker_ids: Vec<String>,
        resolution: MergeResolution,
    },
}

impl Directive {
    pub fn kind(&self) -> DirectiveKind {
        match self {
            Self::SpawnAgent { .. } => DirectiveKind::SpawnAgent,
            Self::SpawnSwarm(_) => DirectiveKind::SpawnSwarm,
            Self::CheckWorkers { .. } => DirectiveKind::CheckWorkers,
            Self::MergeResults { .. } => DirectiveKind::MergeResults,
        }
    }

    /// Work requests this directive creates.
    pub fn requests(&self) -> &[WorkRequest] {
        match self {
            Self::SpawnAgent { request } => std::slice::from_ref(request),
            Self::SpawnSwarm(swarm) => &swarm.requests,
            _ => &[],
        }
    }
}

/// One interpreted block.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Dispatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(flatten)]
    pub directive: Directive,
}

/// Everything interpreted from one piece of supervisor output.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DispatchBatch {
    pub dispatches: Vec<Dispatch>,
    pub diagnostics: Vec<Diagnostic>,
}

/// Turns supervisor output into dispatches.
#[derive(Debug, Clone)]
pub struct DispatchInterpreter {
    timeout_ceiling: Duration,
}

impl DispatchInterpreter {
    /// `timeout_ceiling` is both the default request timeout and its upper bound.
    pub fn new(timeout_ceiling: Duration) -> Self {
        Self { timeout_ceiling }
    }

    /// Interpret every dispatch block in `text`, in order.
    pub fn interpret(&self, text: &str) -> DispatchBatch {
        let mut batch = DispatchBatch::default();
        for captures in BLOCK_RE.captures_iter(text) {
            let name = captures.get(1).map_or("", |m| m.as_str());
            let body = captures.get(2).map_or("", |m| m.as_str());
            match self.interpret_block(name, body) {
                Ok(dispatch) => batch.dispatches.push(dispatch),
                Err(diagnostic) => batch.diagnostics.push(diagnostic),
            }
        }
        batch
    }

    /// Interpret one block body (JSON text, repaired if needed).
    pub fn interpret_block(&self, directive: &str, body: &str) -> Result<Dispatch, Diagnostic> {
        let payload = parse_payload(body).map_err(|e| skipped(directive, &e, None))?;
        self.interpret_payload(directive, &payload)
    }

    /// Interpret an already-parsed payload.
    pub fn interpret_payload(&self, directive: &str, payload: &Value) -> Result<Dispatch, Diagnostic> {
        let request_id = payload
            .as_object()
            .and_then(|map| map.get("request_id"))
            .and_then(scalar_string);

        self.normalize(directive, payload)
            .map(|directive| Dispatch {
                request_id: request_id.clone(),
                directive,
            })
            .map_err(|e| skipped(directive, &e, request_id.as_deref()))
    }

    fn normalize(&self, directive: &str, payload: &Value) -> Result<Directive, DispatchError> {
        let kind = DirectiveKind::parse(directive)
            .ok_or_else(|| DispatchError::UnknownDirective(directive.to_string()))?;
        let map = payload.as_object().ok_or(DispatchError::NotAnObject)?;

        match kind {
            DirectiveKind::SpawnAgent => Ok(Directive::SpawnAgent {
                request: self.normalize_request(map, Strategy::FanOut, "")?,
            }),
            DirectiveKind::SpawnSwarm => Ok(Directive::SpawnSwarm(self.normalize_swarm(map)?)),
            DirectiveKind::CheckWorkers => Ok(Directive::CheckWorkers {
                worker_ids: worker_ids(map)?,
            }),
            DirectiveKind::MergeResults => Ok(Directive::MergeResults {
                worker_ids: worker_ids(map)?,
                resolution: resolution(map)?,
            }),
        }
    }

    fn normalize_swarm(&self, map: &Map<String, Value>) -> Result<SwarmDirective, DispatchError> {
        let strategy = match lookup(map, "strategy") {
            None => Strategy::FanOut,
            Some(Value::String(s)) => Strategy::parse_loose(s).unwrap_or_else(|| {
                debug!("unknown strategy '{}', using fan-out", s);
                Strategy::FanOut
            }),
            Some(_) => return Err(DispatchError::field("strategy", "expected a string")),
        };
        let shared_context = optional_text(map, "context")?.unwrap_or_default();

        let mut requests = Vec::new();
        match lookup(map, "workers") {
            Some(Value::Array(items)) => {
                for item in items {
                    let request = match item {
                        Value::Object(task) => {
                            self.normalize_request(task, strategy, &shared_context)?
                        }
                        Value::String(objective) if !objective.trim().is_empty() => {
                            let mut task = Map::new();
                            task.insert("objective".to_string(), Value::String(objective.clone()));
                            self.normalize_request(&task, strategy, &shared_context)?
                        }
                        _ => {
                            return Err(DispatchError::field(
                                "tasks",
                                "entries must be objects or objective strings",
                            ))
                        }
                    };
                    requests.push(request);
                }
            }
            Some(_) => return Err(DispatchError::field("tasks", "expected a list")),
            None => {}
        }

        if requests.is_empty() {
            if lookup(map, "objective").is_none() {
                return Err(DispatchError::NoRequests);
            }
            requests.push(self.normalize_request(map, strategy, "")?);
        }

        let reduce = match lookup(map, "reduce") {
            None => None,
            Some(Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
            Some(Value::Object(reducer)) => Some(required_objective(reducer)?),
            Some(_) => {
                return Err(DispatchError::field(
                    "reduce",
                    "expected an objective string or object",
                ))
            }
        };

        Ok(SwarmDirective {
            strategy,
            requests,
            wait: optional_bool(map, "wait")?.unwrap_or(true),
            rounds: optional_count(map, "rounds")?,
            participants: optional_count::<u32>(map, "participants")?.map(|n| n as usize),
            reduce,
        })
    }

    fn normalize_request(
        &self,
        map: &Map<String, Value>,
        strategy: Strategy,
        shared_context: &str,
    ) -> Result<WorkRequest, DispatchError> {
        let objective = required_objective(map)?;
        let scope = scope(map)?;

        let own_context = optional_text(map, "context")?.unwrap_or_default();
        let context = match (shared_context.trim(), own_context.trim()) {
            ("", own) => own.to_string(),
            (shared, "") => shared.to_string(),
            (shared, own) => format!("{}\n{}", shared, own),
        };

        let timeout = match lookup(map, "timeout") {
            None => self.timeout_ceiling,
            Some(value) => {
                let secs = number(value)
                    .filter(|n| *n > 0.0)
                    .ok_or_else(|| DispatchError::field("timeout", "expected positive seconds"))?;
                Duration::from_secs_f64(secs.min(self.timeout_ceiling.as_secs_f64()))
            }
        };

        let priority = match optional_string(map, "priority")? {
            None => Priority::Normal,
            Some(p) => match p.trim().to_lowercase().as_str() {
                "high" => Priority::High,
                "low" => Priority::Low,
                _ => Priority::Normal,
            },
        };

        let return_format = match optional_string(map, "return_format")? {
            None => ReturnFormat::Summary,
            Some(f) => coerce_return_format(&f),
        };

        Ok(WorkRequest::new(objective, timeout)
            .with_scope(scope)
            .with_context(context)
            .with_strategy(strategy)
            .with_priority(priority)
            .with_return_format(return_format))
    }
}

fn skipped(directive: &str, error: &DispatchError, request_id: Option<&str>) -> Diagnostic {
    warn!("Skipping invalid dispatch block for {}: {}", directive, error);
    let diagnostic = Diagnostic::new(
        DiagnosticKind::MalformedDispatch,
        format!("{}: {}", directive, error),
    );
    match request_id {
        Some(id) => diagnostic.with_request(id),
        None => diagnostic,
    }
}

/// Parse a JSON object, repairing trailing commas and single quotes on failure.
fn parse_payload(body: &str) -> Result<Value, DispatchError> {
    let value = match serde_json::from_str::<Value>(body) {
        Ok(value) => value,
        Err(original) => {
            let repaired = repair_json(body);
            let value = serde_json::from_str::<Value>(&repaired)
                .map_err(|_| DispatchError::InvalidJson(original.to_string()))?;
            warn!("Used fuzzy JSON repair for dispatch payload");
            value
        }
    };
    if value.is_object() {
        Ok(value)
    } else {
        Err(DispatchError::NotAnObject)
    }
}

fn repair_json(raw: &str) -> String {
    let repaired = TRAILING_COMMA_RE.replace_all(raw.trim(), "$1").to_string();
    if repaired.contains('\'') && !repaired.contains('"') {
        repaired.replace('\'', "\"")
    } else {
        repaired
    }
}

/// Resolve a canonical field through the synonym table.
///
/// Fields without a table entry are looked up by their own name. Null values
/// count as absent.
fn lookup<'a>(map: &'a Map<String, Value>, canonical: &str) -> Option<&'a Value> {
    let keys: &[&str] = FIELD_SYNONYMS
        .iter()
        .find(|(name, _)| *name == canonical)
        .map(|(_, keys)| *keys)
        .unwrap_or(std::slice::from_ref(&canonical));
    keys.iter()
        .filter_map(|key| map.get(*key))
        .find(|value| !value.is_null())
}

fn required_objective(map: &Map<String, Value>) -> Result<String, DispatchError> {
    match lookup(map, "objective") {
        Some(Value::String(s)) if !s.trim().is_empty() => Ok(s.trim().to_string()),
        Some(Value::String(_)) | None => Err(DispatchError::MissingObjective),
        Some(_) => Err(DispatchError::field("objective", "expected a string")),
    }
}

fn scope(map: &Map<String, Value>) -> Result<Vec<String>, DispatchError> {
    match lookup(map, "scope") {
        None => Ok(Vec::new()),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(Vec::new()),
        Some(Value::String(s)) => Ok(vec![s.trim().to_string()]),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| match item {
                Value::String(s) => Ok(s.trim().to_string()),
                _ => Err(DispatchError::field("scope", "entries must be strings")),
            })
            .filter(|entry| entry.as_ref().map_or(true, |s| !s.is_empty()))
            .collect(),
        Some(_) => Err(DispatchError::field("scope", "expected a string or list")),
    }
}

fn optional_string(map: &Map<String, Value>, field: &str) -> Result<Option<String>, DispatchError> {
    match lookup(map, field) {
        None => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(DispatchError::field(field, "expected a string")),
    }
}

/// A string, or a list of strings joined with newlines.
fn optional_text(map: &Map<String, Value>, field: &str) -> Result<Option<String>, DispatchError> {
    match lookup(map, field) {
        None => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| {
                item.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| DispatchError::field(field, "entries must be strings"))
            })
            .collect::<Result<Vec<_>, _>>()
            .map(|lines| Some(lines.join("\n"))),
        Some(_) => Err(DispatchError::field(field, "expected a string")),
    }
}

fn optional_bool(map: &Map<String, Value>, field: &str) -> Result<Option<bool>, DispatchError> {
    match lookup(map, field) {
        None => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(*b)),
        Some(Value::String(s)) => match s.trim().to_lowercase().as_str() {
            "true" | "yes" => Ok(Some(true)),
            "false" | "no" => Ok(Some(false)),
            _ => Err(DispatchError::field(field, "expected a boolean")),
        },
        Some(_) => Err(DispatchError::field(field, "expected a boolean")),
    }
}

fn optional_positive(map: &Map<String, Value>, field: &str) -> Result<Option<u64>, DispatchError> {
    match lookup(map, field) {
        None => Ok(None),
        Some(value) => number(value)
            .filter(|n| *n >= 1.0 && n.fract() == 0.0)
            .map(|n| Some(n as u64))
            .ok_or_else(|| DispatchError::field(field, "expected a positive integer")),
    }
}

/// A positive integer that must fit the target type; never truncated.
fn optional_count<T: TryFrom<u64>>(map: &Map<String, Value>, field: &str) -> Result<Option<T>, DispatchError> {
    optional_positive(map, field)?
        .map(|n| T::try_from(n).map_err(|_| DispatchError::field(field, format!("{} is too large", n))))
        .transpose()
}

/// A JSON number or a numeric string.
fn number(value: &Value) -> Option<f64> {
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    parsed.filter(|n| n.is_finite())
}

fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn coerce_return_format(value: &str) -> ReturnFormat {
    match value.trim().to_lowercase().as_str() {
        "summary" => ReturnFormat::Summary,
        "diff" => ReturnFormat::Diff,
        "full" => ReturnFormat::Full,
        other if other.contains("diff") => ReturnFormat::Diff,
        _ => ReturnFormat::Summary,
    }
}

fn worker_ids(map: &Map<String, Value>) -> Result<Vec<String>, DispatchError> {
    let value = ["worker_ids", "workers", "ids"]
        .iter()
        .filter_map(|key| map.get(*key))
        .find(|value| !value.is_null());
    match value {
        None => Ok(Vec::new()),
        Some(Value::String(s)) => Ok(vec![s.trim().to_string()]),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| {
                item.as_str()
                    .map(|s| s.trim().to_string())
                    .ok_or_else(|| DispatchError::field("worker_ids", "entries must be strings"))
            })
            .collect(),
        Some(_) => Err(DispatchError::field("worker_ids", "expected a list of strings")),
    }
}

fn resolution(map: &Map<String, Value>) -> Result<MergeResolution, DispatchError> {
    match lookup(map, "resolution") {
        None => Ok(MergeResolution::Abort),
        Some(Value::String(s)) => match s.trim().to_lowercase().as_str() {
            "abort" | "" => Ok(MergeResolution::Abort),
            "ours" => Ok(MergeResolution::Ours),
            "theirs" => Ok(MergeResolution::Theirs),
            other => Err(DispatchError::field(
                "resolve_conflicts",
                format!("expected abort, ours or theirs, got '{}'", other),
            )),
        },
        Some(_) => Err(DispatchError::field("resolve_conflicts", "expected a string")),
    }
}

// ============================================================================
// Worker JSON-lines output
// ============================================================================

fn json_event(line: &str) -> Option<Value> {
    let line = line.trim();
    if !line.starts_with('{') {
        return None;
    }
    serde_json::from_str(line).ok()
}

/// Assistant text from an `item.completed` / `agent_message` event line.
pub fn parse_agent_message(line: &str) -> Option<String> {
    let event = json_event(line)?;
    if event.get("type")?.as_str()? != "item.completed" {
        return None;
    }
    let item = event.get("item")?;
    if item.get("type")?.as_str()? != "agent_message" {
        return None;
    }
    item.get("text")?.as_str().map(str::to_string)
}

/// Token usage from a `turn.completed` event line.
pub fn parse_usage(line: &str) -> Option<TokenUsage> {
    let event = json_event(line)?;
    if event.get("type")?.as_str()? != "turn.completed" {
        return None;
    }
    let usage = event.get("usage")?.as_object()?;
    let field = |name: &str| usage.get(name).and_then(Value::as_u64).unwrap_or(0);
    Some(TokenUsage {
        input_tokens: field("input_tokens"),
        cached_input_tokens: field("cached_input_tokens"),
        output_tokens: field("output_tokens"),
    })
}

/// The last assistant message in a worker's stdout.
pub fn last_agent_message(stdout: &str) -> Option<String> {
    stdout.lines().rev().find_map(parse_agent_message)
}

/// Usage summed over every `turn.completed` event, if any were reported.
pub fn total_usage(stdout: &str) -> Option<TokenUsage> {
    stdout.lines().filter_map(parse_usage).fold(None, |acc, usage| {
        let mut total = acc.unwrap_or_default();
        total.add(&usage);
        Some(total)
    })
}
