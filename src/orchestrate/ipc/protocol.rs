// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Control channel protocol.
//!
//! Uses newline-delimited JSON over a Unix domain socket. Every message carries
//! a unique `id` and a UTC `timestamp`; replies name the message they answer in
//! `reply_to`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::super::events::EventRecord;
use super::super::types::MergeResolution;

// ============================================================================
// Message Envelope
// ============================================================================

/// Generate a unique message ID.
pub fn generate_message_id() -> String {
    Uuid::new_v4().to_string()
}

/// Get current timestamp.
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

// ============================================================================
// Client -> Server Messages
// ============================================================================

/// Messages sent from a control client to the session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Run a directive, as if it had been found in supervisor output.
    Dispatch {
        id: String,
        timestamp: DateTime<Utc>,
        /// Directive name (`spawn_agent`, `spawn_swarm`, ...).
        directive: String,
        /// Directive body.
        payload: serde_json::Value,
        /// Labels the response.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },

    /// Ask for the worker status report.
    Status { id: String, timestamp: DateTime<Utc> },

    /// Stop launching queued workers.
    PauseQueue { id: String, timestamp: DateTime<Utc> },

    /// Resume launching queued workers.
    ResumeQueue { id: String, timestamp: DateTime<Utc> },

    /// Cancel one worker.
    CancelWorker {
        id: String,
        timestamp: DateTime<Utc>,
        worker_id: String,
    },

    /// Approve held workers (all held when empty).
    Approve {
        id: String,
        timestamp: DateTime<Utc>,
        #[serde(default)]
        worker_ids: Vec<String>,
        #[serde(default)]
        resolution: MergeResolution,
    },

    /// Cancel the whole session.
    CancelSession { id: String, timestamp: DateTime<Utc> },

    /// Health check.
    Ping { id: String, timestamp: DateTime<Utc> },
}

impl ClientMessage {
    pub fn dispatch(
        directive: impl Into<String>,
        payload: serde_json::Value,
        request_id: Option<String>,
    ) -> Self {
        Self::Dispatch {
            id: generate_message_id(),
            timestamp: now(),
            directive: directive.into(),
            payload,
            request_id,
        }
    }

    pub fn status() -> Self {
        Self::Status {
            id: generate_message_id(),
            timestamp: now(),
        }
    }

    pub fn pause_queue() -> Self {
        Self::PauseQueue {
            id: generate_message_id(),
            timestamp: now(),
        }
    }

    pub fn resume_queue() -> Self {
        Self::ResumeQueue {
            id: generate_message_id(),
            timestamp: now(),
        }
    }

    pub fn cancel_worker(worker_id: impl Into<String>) -> Self {
        Self::CancelWorker {
            id: generate_message_id(),
            timestamp: now(),
            worker_id: worker_id.into(),
        }
    }

    pub fn approve(worker_ids: Vec<String>, resolution: MergeResolution) -> Self {
        Self::Approve {
            id: generate_message_id(),
            timestamp: now(),
            worker_ids,
            resolution,
        }
    }

    pub fn cancel_session() -> Self {
        Self::CancelSession {
            id: generate_message_id(),
            timestamp: now(),
        }
    }

    pub fn ping() -> Self {
        Self::Ping {
            id: generate_message_id(),
            timestamp: now(),
        }
    }

    /// Message ID.
    pub fn id(&self) -> &str {
        match self {
            Self::Dispatch { id, .. }
            | Self::Status { id, .. }
            | Self::PauseQueue { id, .. }
            | Self::ResumeQueue { id, .. }
            | Self::CancelWorker { id, .. }
            | Self::Approve { id, .. }
            | Self::CancelSession { id, .. }
            | Self::Ping { id, .. } => id,
        }
    }

    /// Wire name of the message type.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Dispatch { .. } => "dispatch",
            Self::Status { .. } => "status",
            Self::PauseQueue { .. } => "pause_queue",
            Self::ResumeQueue { .. } => "resume_queue",
            Self::CancelWorker { .. } => "cancel_worker",
            Self::Approve { .. } => "approve",
            Self::CancelSession { .. } => "cancel_session",
            Self::Ping { .. } => "ping",
        }
    }
}

// ============================================================================
// Server -> Client Messages
// ============================================================================

/// Messages sent from the session to control clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Request accepted; `payload` carries the result.
    Ack {
        id: String,
        timestamp: DateTime<Utc>,
        reply_to: String,
        #[serde(default)]
        payload: serde_json::Value,
    },

    /// Aggregated results for the supervisor.
    Response {
        id: String,
        timestamp: DateTime<Utc>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reply_to: Option<String>,
        marker: String,
        text: String,
    },

    /// Live session event.
    Event {
        id: String,
        timestamp: DateTime<Utc>,
        event: EventRecord,
    },

    /// Request failed.
    Error {
        id: String,
        timestamp: DateTime<Utc>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reply_to: Option<String>,
        message: String,
    },

    /// Answer to `ping`.
    Pong {
        id: String,
        timestamp: DateTime<Utc>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reply_to: Option<String>,
    },
}

impl ServerMessage {
    pub fn ack(reply_to: impl Into<String>, payload: serde_json::Value) -> Self {
        Self::Ack {
            id: generate_message_id(),
            timestamp: now(),
            reply_to: reply_to.into(),
            payload,
        }
    }

    pub fn response(reply_to: Option<String>, marker: impl Into<String>, text: impl Into<String>) -> Self {
        Self::Response {
            id: generate_message_id(),
            timestamp: now(),
            reply_to,
            marker: marker.into(),
            text: text.into(),
        }
    }

    pub fn event(event: EventRecord) -> Self {
        Self::Event {
            id: generate_message_id(),
            timestamp: now(),
            event,
        }
    }

    pub fn error(reply_to: Option<String>, message: impl Into<String>) -> Self {
        Self::Error {
            id: generate_message_id(),
            timestamp: now(),
            reply_to,
            message: message.into(),
        }
    }

    pub fn pong(reply_to: Option<String>) -> Self {
        Self::Pong {
            id: generate_message_id(),
            timestamp: now(),
            reply_to,
        }
    }

    /// The client message this answers, if any.
    pub fn reply_to(&self) -> Option<&str> {
        match self {
            Self::Ack { reply_to, .. } => Some(reply_to),
            Self::Response { reply_to, .. }
            | Self::Error { reply_to, .. }
            | Self::Pong { reply_to, .. } => reply_to.as_deref(),
            Self::Event { .. } => None,
        }
    }

    /// Whether this is a direct answer (ack, error, pong) rather than a stream item.
    pub fn is_reply(&self) -> bool {
        matches!(self, Self::Ack { .. } | Self::Error { .. } | Self::Pong { .. })
            && self.reply_to().is_some()
    }
}

// ============================================================================
// Serialization
// ============================================================================

/// Encode a message to a newline-delimited JSON string.
pub fn encode<T: Serialize>(msg: &T) -> Result<String, serde_json::Error> {
    let mut json = serde_json::to_string(msg)?;
    json.push('\n');
    Ok(json)
}

/// Decode a message from a JSON string.
pub fn decode<'a, T: Deserialize<'a>>(json: &'a str) -> Result<T, serde_json::Error> {
    serde_json::from_str(json.trim())
}

/// Parse multiple newline-delimited messages from a buffer.
pub fn decode_messages<'a, T: Deserialize<'a>>(buffer: &'a str) -> Vec<Result<T, serde_json::Error>> {
    buffer
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| serde_json::from_str(line.trim()))
        .collect()
}
