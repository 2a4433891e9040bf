// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Control channel between a running session and its operators.
//!
//! ```text
//! ┌─────────────────┐              ┌─────────────────┐
//! │     Session     │              │  CLI / native   │
//! │                 │    Unix      │   supervisor    │
//! │  ┌───────────┐  │   socket     │  ┌───────────┐  │
//! │  │  Server   │◄─┼──────────────┼──│  Client   │  │
//! │  └───────────┘  │              │  └───────────┘  │
//! └─────────────────┘              └─────────────────┘
//! ```
//!
//! # Protocol
//!
//! Messages are newline-delimited JSON (NDJSON), one object per line, each
//! with `type`, `id` and `timestamp`. The socket lives at
//! `<socket_dir>/codi-swarm-<session_id>.sock`.
//!
//! ## Client → Session
//!
//! - `dispatch` - Run a directive (`directive`, `payload`, `request_id?`)
//! - `status` - Worker status report
//! - `pause_queue` / `resume_queue` - Hold or release queued workers
//! - `cancel_worker` - Cancel one worker
//! - `approve` - Merge held workers with a conflict resolution
//! - `cancel_session` - Cancel everything
//! - `ping` - Health check
//!
//! ## Session → Client
//!
//! - `ack` - Request handled (`reply_to`, `payload`)
//! - `response` - Aggregated results for the supervisor
//! - `event` - Live session event
//! - `error` - Request failed
//! - `pong` - Answer to `ping`

pub mod client;
pub mod error;
pub mod protocol;
pub mod server;
pub mod transport;

pub use client::IpcClient;
pub use error::{IpcError, IpcResult};
pub use protocol::{decode, decode_messages, encode, ClientMessage, ServerMessage};
pub use server::IpcServer;
