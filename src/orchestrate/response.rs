// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Response channel.
//!
//! Aggregated results go back to the supervisor either as marked blocks
//! appended to a per-session markdown artifact, or as `response` messages to
//! clients of the control socket. Delivery is retried with backoff; a final
//! failure becomes a `channel_failure` diagnostic and never undoes work.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument, warn};

use crate::config::ChannelConfig;
use crate::error::{Diagnostic, DiagnosticKind};

use super::events::{EventBus, SessionEvent};
use super::ipc::{IpcServer, ServerMessage};

const MARKER_PREFIX: &str = "codi-swarm-response";
const MARKER_OPEN: &str = "<!-- codi-swarm-response:";

static BLOCK_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)<!-- codi-swarm-response:([^:\s]+):start -->\n(.*?)\n<!-- codi-swarm-response:([^:\s]+):end -->")
        .expect("valid response block regex")
});

/// Response delivery errors.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("No control clients connected")]
    NoClients,

    #[error("Control channel error: {0}")]
    Ipc(String),
}

/// One response headed for the supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub marker: String,
    pub text: String,
    /// Control message this answers, when it came over the socket.
    pub reply_to: Option<String>,
}

impl Delivery {
    /// A delivery labelled with `marker`, or a fresh uuid when there is none.
    pub fn new(marker: Option<&str>, text: impl Into<String>) -> Self {
        let marker = marker
            .map(sanitize_marker)
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        Self {
            marker,
            text: text.into(),
            reply_to: None,
        }
    }

    pub fn reply_to(mut self, message_id: Option<String>) -> Self {
        self.reply_to = message_id;
        self
    }
}

fn sanitize_marker(marker: &str) -> String {
    marker
        .trim()
        .chars()
        .map(|c| if c.is_whitespace() || c == ':' { '-' } else { c })
        .collect()
}

/// Where responses end up.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ResponseSink: Send + Sync {
    /// Deliver once; returns a human-readable location.
    async fn deliver(&self, delivery: &Delivery) -> Result<String, ChannelError>;
}

/// Appends marked blocks to `<repo>/<response_dir>/<session_id>.md`.
#[derive(Debug, Clone)]
pub struct ArtifactSink {
    path: PathBuf,
}

impl ArtifactSink {
    pub fn new(repo_root: &Path, response_dir: &Path, session_id: &str) -> Self {
        Self {
            path: repo_root.join(response_dir).join(format!("{}.md", session_id)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ResponseSink for ArtifactSink {
    async fn deliver(&self, delivery: &Delivery) -> Result<String, ChannelError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(render_block(&delivery.marker, &delivery.text).as_bytes())
            .await?;
        file.flush().await?;
        Ok(self.path.display().to_string())
    }
}

/// Sends `response` messages to every connected control client.
pub struct SocketSink {
    server: Arc<IpcServer>,
}

impl SocketSink {
    pub fn new(server: Arc<IpcServer>) -> Self {
        Self { server }
    }
}

#[async_trait]
impl ResponseSink for SocketSink {
    async fn deliver(&self, delivery: &Delivery) -> Result<String, ChannelError> {
        let message = ServerMessage::response(
            delivery.reply_to.clone(),
            delivery.marker.clone(),
            delivery.text.clone(),
        );
        let sent = self
            .server
            .broadcast(&message)
            .await
            .map_err(|e| ChannelError::Ipc(e.to_string()))?;
        if sent == 0 {
            return Err(ChannelError::NoClients);
        }
        Ok(format!("{} ({} clients)", self.server.socket_path().display(), sent))
    }
}

/// A response block as it appears in the artifact.
/// Text lines that look like block markers get one extra leading `\` so
/// Text lines that look like block markers get one extra leading `\\` so
/// they cannot close the block; [`parse_blocks`] strips it again.
pub fn render_block(marker: &str, text: &str) -> String {
    let body = text
        .trim_end()
        .split('\n')
        .map(|line| {
            if is_marker_like(line) {
                format!("\\{}", line)
            } else {
                line.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "<!-- {prefix}:{marker}:start -->\n{body}\n<!-- {prefix}:{marker}:end -->\n\n",
        prefix = MARKER_PREFIX,
        marker = marker,
        body = body
    )
}

/// A marker line, possibly already escaped with leading backslashes.
fn is_marker_like(line: &str) -> bool {
    line.trim_start_matches('\\').starts_with(MARKER_OPEN)
}

fn unescape_body(body: &str) -> String {
    body.split('\n')
        .map(|line| match line.strip_prefix('\\') {
            Some(rest) if is_marker_like(rest) => rest,
            _ => line,
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Parse response blocks out of an artifact, in order.
pub fn parse_blocks(content: &str) -> Vec<Delivery> {
    BLOCK_RE
        .captures_iter(content)
        .filter(|caps| caps[1] == caps[3])
        .map(|caps| Delivery {
            marker: caps[1].to_string(),
            text: unescape_body(&caps[2]),
            reply_to: None,
        })
        .collect()
}

/// Delivers responses through a sink with bounded retries.
pub struct ResponseChannel {
    sink: Arc<dyn ResponseSink>,
    retries: u32,
    backoff: Duration,
    events: EventBus,
}

impl std::fmt::Debug for ResponseChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseChannel")
            .field("retries", &self.retries)
            .field("backoff", &self.backoff)
            .finish()
    }
}

impl ResponseChannel {
    pub fn new(sink: Arc<dyn ResponseSink>, config: &ChannelConfig, events: EventBus) -> Self {
        Self {
            sink,
            retries: config.delivery_retries,
            backoff: config.retry_backoff(),
            events,
        }
    }

    /// Deliver, retrying with doubling backoff. Returns the location on success.
    #[instrument(skip_all, fields(marker = %delivery.marker))]
    pub async fn deliver(&self, delivery: Delivery) -> Result<String, ChannelError> {
        let mut attempt = 0;
        loop {
            match self.sink.deliver(&delivery).await {
                Ok(location) => {
                    debug!(attempt, "response delivered to {}", location);
                    self.events.emit(SessionEvent::ResponseWritten {
                        marker: delivery.marker.clone(),
                        location: location.clone(),
                    });
                    return Ok(location);
                }
                Err(e) if attempt < self.retries => {
                    warn!(attempt, "response delivery failed, retrying: {}", e);
                    tokio::time::sleep(self.backoff * 2u32.saturating_pow(attempt)).await;
                    attempt += 1;
                }
                Err(e) => {
                    self.events.diagnostic(
                        Diagnostic::new(
                            DiagnosticKind::ChannelFailure,
                            format!(
                                "response {} not delivered after {} attempts: {}",
                                delivery.marker,
                                attempt + 1,
                                e
                            ),
                        )
                        .with_request(&delivery.marker),
                    );
                    return Err(e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn channel_config(retries: u32) -> ChannelConfig {
        ChannelConfig {
            delivery_retries: retries,
            retry_backoff_ms: 1,
            ..Default::default()
        }
    }

    #[test]
    fn test_delivery_marker() {
        assert_eq!(Delivery::new(Some("req 1"), "x").marker, "req-1");
        assert_eq!(Delivery::new(Some("a:b"), "x").marker, "a-b");
        let generated = Delivery::new(None, "x").marker;
        assert!(uuid::Uuid::parse_str(&generated).is_ok());
        assert_ne!(Delivery::new(Some("  "), "x").marker, "");
    }

    #[test]
    fn test_render_block() {
        insta::assert_snapshot!(render_block("req-7", "## codi-swarm: done\n\nAll merged.\n"), @r"
        <!-- codi-swarm-response:req-7:start -->
        ## codi-swarm: done

        All merged.
        <!-- codi-swarm-response:req-7:end -->
        ");
    }

    #[test]
    fn test_marker_lines_in_text_stay_inside_block() {
        let text = "before\n<!-- codi-swarm-response:r-1:end -->\n\\<!-- codi-swarm-response:x:start -->\nafter";
        let rendered = render_block("r-1", text);
        assert!(rendered.contains("\n\\<!-- codi-swarm-response:r-1:end -->\n"));
        assert!(rendered.contains("\n\\\\<!-- codi-swarm-response:x:start -->\n"));

        let content = format!("{}{}", rendered, render_block("r-2", "next"));
        let blocks = parse_blocks(&content);
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].marker, "r-1");
        assert_eq!(blocks[0].text, text);
        assert_eq!(blocks[1].text, "next");
    }

    #[tokio::test]
    async fn test_artifact_sink_appends_blocks() {
        let repo = TempDir::new().unwrap();
        let sink = ArtifactSink::new(repo.path(), Path::new(".codi-swarm/responses"), "s-1");
        assert_eq!(
            sink.path(),
            repo.path().join(".codi-swarm/responses/s-1.md")
        );

        sink.deliver(&Delivery::new(Some("one"), "first")).await.unwrap();
        let location = sink.deliver(&Delivery::new(Some("two"), "second\nline")).await.unwrap();
        assert_eq!(location, sink.path().display().to_string());

        let content = std::fs::read_to_string(sink.path()).unwrap();
        let blocks = parse_blocks(&content);
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].marker, "one");
        assert_eq!(blocks[0].text, "first");
        assert_eq!(blocks[1].text, "second\nline");
    }

    #[tokio::test]
    async fn test_channel_retries_then_succeeds() {
        let mut sink = MockResponseSink::new();
        let mut seq = mockall::Sequence::new();
        sink.expect_deliver()
            .times(2)
            .in_sequence(&mut seq)
            .returning(|_| Err(ChannelError::NoClients));
        sink.expect_deliver()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|d| Ok(format!("mock:{}", d.marker)));

        let events = EventBus::new("s-1");
        let mut rx = events.subscribe();
        let channel = ResponseChannel::new(Arc::new(sink), &channel_config(3), events.clone());

        let location = channel.deliver(Delivery::new(Some("r-1"), "text")).await.unwrap();
        assert_eq!(location, "mock:r-1");
        assert!(events.diagnostics().is_empty());

        let record = rx.recv().await.unwrap();
        assert!(matches!(
            record.event,
            SessionEvent::ResponseWritten { ref marker, .. } if marker == "r-1"
        ));
    }

    #[tokio::test]
    async fn test_channel_gives_up_with_diagnostic() {
        let mut sink = MockResponseSink::new();
        sink.expect_deliver()
            .times(3)
            .returning(|_| Err(ChannelError::NoClients));

        let events = EventBus::new("s-1");
        let channel = ResponseChannel::new(Arc::new(sink), &channel_config(2), events.clone());

        let result = channel.deliver(Delivery::new(Some("r-2"), "text")).await;
        assert!(matches!(result, Err(ChannelError::NoClients)));

        let diagnostics = events.diagnostics();
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].kind, DiagnosticKind::ChannelFailure);
        assert!(diagnostics[0].message.contains("after 3 attempts"));
    }

    #[tokio::test]
    async fn test_socket_sink_without_clients() {
        let dir = TempDir::new().unwrap();
        let mut server = IpcServer::new(dir.path().join("s.sock"));
        server.start().await.unwrap();
        let sink = SocketSink::new(Arc::new(server));

        let result = sink.deliver(&Delivery::new(Some("r"), "text")).await;
        assert!(matches!(result, Err(ChannelError::NoClients)));
    }
}
