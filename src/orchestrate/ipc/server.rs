// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Control socket server.
//!
//! The server listens on a Unix socket, assigns each connection a client id
//! and forwards decoded [`ClientMessage`]s to a single receiver. Replies go to
//! one client; events and responses are broadcast.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::error::IpcError;
use super::protocol::{decode, encode, ClientMessage, ServerMessage};
use super::transport::{self, IpcListener, IpcStream};

/// Buffered incoming messages before readers wait.
const INCOMING_CAPACITY: usize = 100;

type Clients = Arc<RwLock<HashMap<String, Arc<Mutex<ConnectedClient>>>>>;

/// A connected control client.
struct ConnectedClient {
    writer: tokio::io::WriteHalf<IpcStream>,
}

impl ConnectedClient {
    async fn write(&mut self, encoded: &str) -> Result<(), IpcError> {
        self.writer
            .write_all(encoded.as_bytes())
            .await
            .map_err(|e| IpcError::from_io_error("sending message", e))?;
        self.writer
            .flush()
            .await
            .map_err(|e| IpcError::from_io_error("flushing writer", e))
    }
}

/// Control socket server for one session.
pub struct IpcServer {
    socket_path: PathBuf,
    listener: Option<IpcListener>,
    clients: Clients,
    /// Incoming messages as (client_id, message).
    incoming_tx: mpsc::Sender<(String, ClientMessage)>,
    incoming_rx: Option<mpsc::Receiver<(String, ClientMessage)>>,
}

impl IpcServer {
    pub fn new(socket_path: impl AsRef<Path>) -> Self {
        let (tx, rx) = mpsc::channel(INCOMING_CAPACITY);
        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
            listener: None,
            clients: Arc::new(RwLock::new(HashMap::new())),
            incoming_tx: tx,
            incoming_rx: Some(rx),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Bind the socket.
    pub async fn start(&mut self) -> Result<(), IpcError> {
        let listener = transport::bind(&self.socket_path)
            .await
            .map_err(|e| IpcError::from_io_error("binding socket", e))?;
        info!("control socket listening on {:?}", self.socket_path);
        self.listener = Some(listener);
        Ok(())
    }

    /// Drop every client and remove the socket file.
    pub async fn stop(&self) -> Result<(), IpcError> {
        self.clients.write().await.clear();
        transport::cleanup(&self.socket_path)
            .map_err(|e| IpcError::from_io_error("cleaning up socket", e))?;
        info!("control socket stopped");
        Ok(())
    }

    /// Take the incoming message receiver. Only the first call gets it.
    pub fn take_receiver(&mut self) -> Option<mpsc::Receiver<(String, ClientMessage)>> {
        self.incoming_rx.take()
    }

    /// Accept one connection; returns the assigned client id.
    pub async fn accept(&self) -> Result<String, IpcError> {
        let listener = self.listener.as_ref().ok_or(IpcError::NotStarted)?;

        let stream = listener
            .accept()
            .await
            .map_err(|e| IpcError::from_io_error("accepting connection", e))?;
        let client_id = format!("client-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]);
        debug!(client = %client_id, "control client connected");

        let (read_half, write_half) = tokio::io::split(stream);
        self.clients.write().await.insert(
            client_id.clone(),
            Arc::new(Mutex::new(ConnectedClient { writer: write_half })),
        );

        let clients = Arc::clone(&self.clients);
        let tx = self.incoming_tx.clone();
        let id = client_id.clone();
        tokio::spawn(async move {
            Self::read_client_messages(BufReader::new(read_half), id, clients, tx).await;
        });

        Ok(client_id)
    }

    /// Accept connections until the listener fails.
    pub fn spawn_accept_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let server = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                if let Err(e) = server.accept().await {
                    warn!("control socket accept failed: {}", e);
                    break;
                }
            }
        })
    }

    async fn read_client_messages(
        mut reader: BufReader<tokio::io::ReadHalf<IpcStream>>,
        client_id: String,
        clients: Clients,
        tx: mpsc::Sender<(String, ClientMessage)>,
    ) {
        let mut line = String::new();

        loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) => {
                    debug!(client = %client_id, "control client disconnected");
                    break;
                }
                Ok(_) if line.trim().is_empty() => {}
                Ok(_) => match decode::<ClientMessage>(&line) {
                    Ok(msg) => {
                        if tx.send((client_id.clone(), msg)).await.is_err() {
                            warn!("control message receiver dropped");
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(client = %client_id, "invalid control message: {}", e);
                        let reply = ServerMessage::error(None, format!("Invalid message: {}", e));
                        if let Ok(encoded) = encode(&reply) {
                            let client = clients.read().await.get(&client_id).cloned();
                            if let Some(client) = client {
                                let _ = client.lock().await.write(&encoded).await;
                            }
                        }
                    }
                },
                Err(e) => {
                    warn!(client = %client_id, "error reading control client: {}", e);
                    break;
                }
            }
        }

        clients.write().await.remove(&client_id);
    }

    /// Send a message to one client.
    pub async fn send(&self, client_id: &str, msg: &ServerMessage) -> Result<(), IpcError> {
        let client = self
            .clients
            .read()
            .await
            .get(client_id)
            .cloned()
            .ok_or_else(|| IpcError::ClientNotConnected(client_id.to_string()))?;

        let encoded = encode(msg)?;
        let result = client.lock().await.write(&encoded).await;
        result
    }

    /// Send a message to every client; returns how many received it.
    ///
    /// Clients whose write fails are dropped.
    pub async fn broadcast(&self, msg: &ServerMessage) -> Result<usize, IpcError> {
        let encoded = encode(msg)?;
        let clients: Vec<(String, Arc<Mutex<ConnectedClient>>)> = self
            .clients
            .read()
            .await
            .iter()
            .map(|(id, c)| (id.clone(), Arc::clone(c)))
            .collect();

        let mut delivered = 0;
        let mut dead = Vec::new();
        for (client_id, client) in clients {
            match client.lock().await.write(&encoded).await {
                Ok(()) => delivered += 1,
                Err(e) => {
                    warn!(client = %client_id, "dropping control client: {}", e);
                    dead.push(client_id);
                }
            }
        }

        if !dead.is_empty() {
            let mut clients = self.clients.write().await;
            for client_id in dead {
                clients.remove(&client_id);
            }
        }
        Ok(delivered)
    }

    pub async fn is_connected(&self, client_id: &str) -> bool {
        self.clients.read().await.contains_key(client_id)
    }

    pub async fn connected_clients(&self) -> Vec<String> {
        self.clients.read().await.keys().cloned().collect()
    }

    pub async fn disconnect(&self, client_id: &str) {
        self.clients.write().await.remove(client_id);
    }
}

impl Drop for IpcServer {
    fn drop(&mut self) {
        let _ = transport::cleanup(&self.socket_path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_server_lifecycle() {
        let dir = tempdir().unwrap();
        let socket_path = dir.path().join("test.sock");

        let mut server = IpcServer::new(&socket_path);
        assert!(!socket_path.exists());

        server.start().await.unwrap();
        assert!(socket_path.exists());

        server.stop().await.unwrap();
        assert!(!socket_path.exists());
    }

    #[tokio::test]
    async fn test_server_not_started_error() {
        let dir = tempdir().unwrap();
        let server = IpcServer::new(dir.path().join("test.sock"));
        assert!(matches!(server.accept().await, Err(IpcError::NotStarted)));
    }

    #[tokio::test]
    async fn test_take_receiver_once() {
        let dir = tempdir().unwrap();
        let mut server = IpcServer::new(dir.path().join("test.sock"));
        assert!(server.take_receiver().is_some());
        assert!(server.take_receiver().is_none());
    }

    #[tokio::test]
    async fn test_send_to_unknown_client() {
        let dir = tempdir().unwrap();
        let mut server = IpcServer::new(dir.path().join("test.sock"));
        server.start().await.unwrap();

        let result = server.send("client-missing", &ServerMessage::pong(None)).await;
        assert!(matches!(result, Err(IpcError::ClientNotConnected(_))));
        assert_eq!(server.broadcast(&ServerMessage::pong(None)).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_messages_flow_both_ways() {
        let dir = tempdir().unwrap();
        let socket_path = dir.path().join("test.sock");
        let mut server = IpcServer::new(&socket_path);
        server.start().await.unwrap();
        let mut rx = server.take_receiver().unwrap();
        let server = Arc::new(server);
        let accept = server.spawn_accept_loop();

        let mut stream = transport::connect(&socket_path).await.unwrap();
        let ping = ClientMessage::ping();
        stream.write_all(encode(&ping).unwrap().as_bytes()).await.unwrap();
        stream.write_all(b"garbage\n").await.unwrap();

        let (client_id, received) = rx.recv().await.unwrap();
        assert_eq!(received, ping);
        assert!(server.is_connected(&client_id).await);

        server
            .send(&client_id, &ServerMessage::pong(Some(ping.id().to_string())))
            .await
            .unwrap();
        assert_eq!(server.broadcast(&ServerMessage::pong(None)).await.unwrap(), 1);

        let mut reader = BufReader::new(stream);
        let mut seen = Vec::new();
        for _ in 0..3 {
            let mut line = String::new();
            reader.read_line(&mut line).await.unwrap();
            seen.push(decode::<ServerMessage>(&line).unwrap());
        }
        assert!(seen.iter().any(|m| matches!(m, ServerMessage::Error { .. })));
        assert!(seen
            .iter()
            .any(|m| m.reply_to() == Some(ping.id()) && matches!(m, ServerMessage::Pong { .. })));

        accept.abort();
    }
}
