// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Unix domain socket transport for the control channel.

use std::io;
use std::path::Path;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{UnixListener, UnixStream};

pub trait IpcIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> IpcIo for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

pub type IpcStream = Box<dyn IpcIo>;

pub struct IpcListener {
    inner: UnixListener,
}

/// Bind a listener, replacing any stale socket file.
pub async fn bind(path: &Path) -> io::Result<IpcListener> {
    if path.exists() {
        let _ = std::fs::remove_file(path);
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let inner = UnixListener::bind(path)?;
    Ok(IpcListener { inner })
}

pub async fn connect(path: &Path) -> io::Result<IpcStream> {
    let stream = UnixStream::connect(path).await?;
    Ok(Box::new(stream))
}

impl IpcListener {
    pub async fn accept(&self) -> io::Result<IpcStream> {
        let (stream, _addr) = self.inner.accept().await?;
        Ok(Box::new(stream))
    }
}

pub fn cleanup(path: &Path) -> io::Result<()> {
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("roundtrip.sock");
        let listener = bind(&path).await.unwrap();

        let server_task = tokio::spawn(async move {
            let mut stream = listener.accept().await.unwrap();
            let mut buf = [0u8; 5];
            stream.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"hello");
            stream.write_all(b"world").await.unwrap();
            stream.flush().await.unwrap();
        });

        let mut client = connect(&path).await.unwrap();
        client.write_all(b"hello").await.unwrap();
        client.flush().await.unwrap();

        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"world");

        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_connection_refused() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.sock");

        let err = match connect(&missing).await {
            Ok(_) => panic!("connected to a missing socket"),
            Err(err) => err,
        };
        assert!(
            err.kind() == io::ErrorKind::NotFound || err.kind() == io::ErrorKind::ConnectionRefused,
            "unexpected error kind {:?}",
            err.kind()
        );
    }

    #[tokio::test]
    async fn test_bind_replaces_stale_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/stale.sock");

        drop(bind(&path).await.unwrap());
        assert!(path.exists());
        let _listener = bind(&path).await.unwrap();

        cleanup(&path).unwrap();
        assert!(!path.exists());
        cleanup(&path).unwrap();
    }

    #[tokio::test]
    async fn test_bind_to_invalid_path() {
        let result = bind(Path::new("/proc/nonexistent/test.sock")).await;
        assert!(result.is_err());
    }
}
