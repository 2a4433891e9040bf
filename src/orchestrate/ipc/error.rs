// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Control channel error types.

use std::io;
use thiserror::Error;

/// Errors that can occur on the control channel.
#[derive(Debug, Error)]
pub enum IpcError {
    /// Failed to connect to the control socket.
    #[error("Failed to connect to control socket: {0}")]
    ConnectFailed(String),

    /// Server has not been started.
    #[error("Server not started")]
    NotStarted,

    /// Client is not connected.
    #[error("Not connected")]
    NotConnected,

    /// Control client is not connected.
    #[error("Client not connected: {0}")]
    ClientNotConnected(String),

    /// Invalid message received.
    #[error("Invalid IPC message: {0}")]
    InvalidMessage(String),

    /// The session answered with an error message.
    #[error("Request rejected: {0}")]
    Rejected(String),

    /// Connection closed unexpectedly.
    #[error("IPC connection closed unexpectedly")]
    ConnectionClosed,

    /// Timeout waiting for a reply.
    #[error("IPC operation timed out")]
    Timeout,

    /// General transport error.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl IpcError {
    /// Create an IPC error from an IO error with context.
    pub fn from_io_error(context: &str, err: io::Error) -> Self {
        IpcError::Transport(format!("{}: {}", context, err))
    }
}

/// Result type for IPC operations.
pub type IpcResult<T> = Result<T, IpcError>;
