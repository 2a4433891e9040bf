// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Control socket client.
//!
//! Used by the CLI control commands and by supervisors integrating natively.
//! Requests are matched to their replies by message id; everything else the
//! session sends (events, responses) is forwarded to a stream receiver.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::super::types::MergeResolution;
use super::error::IpcError;
use super::protocol::{decode, encode, ClientMessage, ServerMessage};
use super::transport::{self, IpcStream};

const CONNECT_RETRY_ATTEMPTS: usize = 10;
const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(100);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

type Pending = Arc<Mutex<HashMap<String, oneshot::Sender<ServerMessage>>>>;

/// Control socket client.
pub struct IpcClient {
    socket_path: PathBuf,
    writer: Option<tokio::io::WriteHalf<IpcStream>>,
    /// Waiting requests by message id.
    pending: Pending,
    stream_tx: mpsc::UnboundedSender<ServerMessage>,
    stream_rx: Option<mpsc::UnboundedReceiver<ServerMessage>>,
    reader: Option<JoinHandle<()>>,
}

impl IpcClient {
    pub fn new(socket_path: impl AsRef<Path>) -> Self {
        let (stream_tx, stream_rx) = mpsc::unbounded_channel();
        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
            writer: None,
            pending: Arc::new(Mutex::new(HashMap::new())),
            stream_tx,
            stream_rx: Some(stream_rx),
            reader: None,
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Connect, retrying briefly while the server comes up.
    pub async fn connect(&mut self) -> Result<(), IpcError> {
        let mut last_error: Option<String> = None;
        let mut stream = None;

        for attempt in 0..CONNECT_RETRY_ATTEMPTS {
            match tokio::time::timeout(CONNECT_TIMEOUT, transport::connect(&self.socket_path)).await {
                Ok(Ok(conn)) => {
                    stream = Some(conn);
                    break;
                }
                Ok(Err(err)) => last_error = Some(err.to_string()),
                Err(_) => last_error = Some("connect timeout".to_string()),
            }

            if attempt + 1 < CONNECT_RETRY_ATTEMPTS {
                tokio::time::sleep(CONNECT_RETRY_DELAY).await;
            }
        }

        let stream = stream.ok_or_else(|| {
            IpcError::ConnectFailed(last_error.unwrap_or_else(|| "failed to connect".to_string()))
        })?;
        let (read_half, write_half) = tokio::io::split(stream);
        self.writer = Some(write_half);

        let pending = Arc::clone(&self.pending);
        let stream_tx = self.stream_tx.clone();
        self.reader = Some(tokio::spawn(async move {
            let mut reader = BufReader::new(read_half);
            let mut line = String::new();
            loop {
                line.clear();
                match reader.read_line(&mut line).await {
                    Ok(0) => {
                        debug!("control socket closed");
                        break;
                    }
                    Ok(_) if line.trim().is_empty() => {}
                    Ok(_) => match decode::<ServerMessage>(&line) {
                        Ok(msg) => Self::route(msg, &pending, &stream_tx).await,
                        Err(e) => warn!("invalid message from session: {}", e),
                    },
                    Err(e) => {
                        warn!("error reading control socket: {}", e);
                        break;
                    }
                }
            }
            // Wake every waiter with a closed channel.
            pending.lock().await.clear();
        }));

        debug!("connected to control socket at {:?}", self.socket_path);
        Ok(())
    }

    async fn route(
        msg: ServerMessage,
        pending: &Pending,
        stream_tx: &mpsc::UnboundedSender<ServerMessage>,
    ) {
        if msg.is_reply() {
            if let Some(reply_to) = msg.reply_to() {
                if let Some(waiter) = pending.lock().await.remove(reply_to) {
                    let _ = waiter.send(msg);
                    return;
                }
            }
        }
        let _ = stream_tx.send(msg);
    }

    /// Events, responses and unmatched replies. Only the first call gets it.
    pub fn take_stream(&mut self) -> Option<mpsc::UnboundedReceiver<ServerMessage>> {
        self.stream_rx.take()
    }

    /// Send without waiting for a reply.
    pub async fn send(&mut self, msg: &ClientMessage) -> Result<(), IpcError> {
        let writer = self.writer.as_mut().ok_or(IpcError::NotConnected)?;
        let encoded = encode(msg)?;
        writer
            .write_all(encoded.as_bytes())
            .await
            .map_err(|e| IpcError::from_io_error("sending message", e))?;
        writer
            .flush()
            .await
            .map_err(|e| IpcError::from_io_error("flushing writer", e))
    }

    /// Send and wait for the matching ack; returns its payload.
    pub async fn request(
        &mut self,
        msg: ClientMessage,
        timeout: Option<Duration>,
    ) -> Result<serde_json::Value, IpcError> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(msg.id().to_string(), tx);

        if let Err(e) = self.send(&msg).await {
            self.pending.lock().await.remove(msg.id());
            return Err(e);
        }

        let reply = match timeout {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(reply) => reply,
                Err(_) => {
                    self.pending.lock().await.remove(msg.id());
                    return Err(IpcError::Timeout);
                }
            },
            None => rx.await,
        };

        match reply.map_err(|_| IpcError::ConnectionClosed)? {
            ServerMessage::Ack { payload, .. } => Ok(payload),
            ServerMessage::Pong { .. } => Ok(serde_json::Value::Null),
            ServerMessage::Error { message, .. } => Err(IpcError::Rejected(message)),
            other => Err(IpcError::InvalidMessage(format!("unexpected reply: {:?}", other))),
        }
    }

    pub async fn ping(&mut self) -> Result<(), IpcError> {
        self.request(ClientMessage::ping(), Some(REQUEST_TIMEOUT)).await.map(|_| ())
    }

    pub async fn status(&mut self) -> Result<serde_json::Value, IpcError> {
        self.request(ClientMessage::status(), Some(REQUEST_TIMEOUT)).await
    }

    pub async fn pause_queue(&mut self) -> Result<serde_json::Value, IpcError> {
        self.request(ClientMessage::pause_queue(), Some(REQUEST_TIMEOUT)).await
    }

    pub async fn resume_queue(&mut self) -> Result<serde_json::Value, IpcError> {
        self.request(ClientMessage::resume_queue(), Some(REQUEST_TIMEOUT)).await
    }

    pub async fn cancel_worker(&mut self, worker_id: &str) -> Result<serde_json::Value, IpcError> {
        self.request(ClientMessage::cancel_worker(worker_id), Some(REQUEST_TIMEOUT))
            .await
    }

    /// Approve held workers. Merging can take a while; no timeout.
    pub async fn approve(
        &mut self,
        worker_ids: Vec<String>,
        resolution: MergeResolution,
    ) -> Result<serde_json::Value, IpcError> {
        self.request(ClientMessage::approve(worker_ids, resolution), None)
            .await
    }

    pub async fn cancel_session(&mut self) -> Result<serde_json::Value, IpcError> {
        self.request(ClientMessage::cancel_session(), None).await
    }

    /// Run a directive; the ack arrives once it has been handled.
    pub async fn dispatch(
        &mut self,
        directive: &str,
        payload: serde_json::Value,
        request_id: Option<String>,
    ) -> Result<serde_json::Value, IpcError> {
        self.request(ClientMessage::dispatch(directive, payload, request_id), None)
            .await
    }

    pub fn is_connected(&self) -> bool {
        self.writer.is_some()
    }

    pub async fn disconnect(&mut self) {
        if let Some(mut writer) = self.writer.take() {
            let _ = writer.shutdown().await;
        }
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

impl Drop for IpcClient {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrate::ipc::IpcServer;
    use tempfile::tempdir;

    async fn started_server(
        path: &Path,
    ) -> (Arc<IpcServer>, mpsc::Receiver<(String, ClientMessage)>) {
        let mut server = IpcServer::new(path);
        server.start().await.unwrap();
        let rx = server.take_receiver().unwrap();
        let server = Arc::new(server);
        server.spawn_accept_loop();
        (server, rx)
    }

    #[tokio::test]
    async fn test_send_before_connect() {
        let mut client = IpcClient::new("/tmp/codi-swarm-never.sock");
        assert!(!client.is_connected());
        assert!(matches!(
            client.send(&ClientMessage::ping()).await,
            Err(IpcError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_connect_failure() {
        let dir = tempdir().unwrap();
        let mut client = IpcClient::new(dir.path().join("absent.sock"));
        assert!(matches!(
            client.connect().await,
            Err(IpcError::ConnectFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_request_reply_and_stream() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ctl.sock");
        let (server, mut rx) = started_server(&path).await;

        let responder = {
            let server = Arc::clone(&server);
            tokio::spawn(async move {
                while let Some((client_id, msg)) = rx.recv().await {
                    let reply = match &msg {
                        ClientMessage::Ping { id, .. } => ServerMessage::pong(Some(id.clone())),
                        ClientMessage::CancelWorker { id, worker_id, .. } => {
                            ServerMessage::error(Some(id.clone()), format!("Unknown worker: {}", worker_id))
                        }
                        other => ServerMessage::ack(other.id(), serde_json::json!({"kind": other.kind()})),
                    };
                    server
                        .broadcast(&ServerMessage::response(None, "r-1", "streamed"))
                        .await
                        .unwrap();
                    server.send(&client_id, &reply).await.unwrap();
                }
            })
        };

        let mut client = IpcClient::new(&path);
        client.connect().await.unwrap();
        let mut stream = client.take_stream().unwrap();
        assert!(client.take_stream().is_none());

        client.ping().await.unwrap();
        assert_eq!(client.status().await.unwrap()["kind"], "status");
        let err = client.cancel_worker("w-9").await.unwrap_err();
        assert!(matches!(err, IpcError::Rejected(ref m) if m.contains("w-9")));

        let streamed = stream.recv().await.unwrap();
        assert!(matches!(streamed, ServerMessage::Response { ref marker, .. } if marker == "r-1"));

        client.disconnect().await;
        responder.abort();
    }

    #[tokio::test]
    async fn test_request_timeout() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("silent.sock");
        let (_server, _rx) = started_server(&path).await;

        let mut client = IpcClient::new(&path);
        client.connect().await.unwrap();
        let result = client
            .request(ClientMessage::status(), Some(Duration::from_millis(50)))
            .await;
        assert!(matches!(result, Err(IpcError::Timeout)));
    }
}
