//! Socket plumbing.
//!
//! A connection is split into a write half, owned by [`Transport`] and shared
//! by every sender, and a read half handed to the [`reader::read_loop`] task.
//!
//! # Thread Safety
//!
//! The write half sits behind a tokio `Mutex`, so each `send` writes one whole
//! message even when callers race. Reading never takes that lock.

mod reader;
mod target;

pub use reader::{read_loop, ReaderExit, ResponseHandler};
pub use target::ConnectTarget;

use crate::config::ConnectionConfig;
use crate::error::{ReplError, Result};
use crate::protocol::Request;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::debug;

/// Read half of a connection.
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Write side of an open connection.
pub struct Transport {
    writer: Mutex<BoxedWriter>,
    target: ConnectTarget,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("target", &self.target)
            .finish_non_exhaustive()
    }
}

impl Transport {
    /// Open `target` with the default connect timeout.
    pub async fn open(target: &ConnectTarget) -> Result<(Self, BoxedReader)> {
        Self::open_with_timeout(target, ConnectionConfig::CONNECT_TIMEOUT).await
    }

    pub async fn open_with_timeout(
        target: &ConnectTarget,
        timeout: Duration,
    ) -> Result<(Self, BoxedReader)> {
        let connected = match target {
            ConnectTarget::Tcp { host, port } => {
                tokio::time::timeout(timeout, TcpStream::connect((host.as_str(), *port)))
                    .await
                    .map(|result| result.map(|stream| Self::from_stream(stream, target.clone())))
            }
            ConnectTarget::Unix(path) => {
                tokio::time::timeout(timeout, connect_unix(path, target.clone())).await
            }
        };

        let opened = connected
            .map_err(|_| ReplError::ConnectTimeout {
                target: target.to_string(),
                timeout,
            })?
            .map_err(|source| ReplError::Connect {
                target: target.to_string(),
                source,
            })?;

        debug!("Opened connection to {}", target);
        Ok(opened)
    }

    /// Wrap an already established stream.
    pub fn from_stream<S>(stream: S, target: ConnectTarget) -> (Self, BoxedReader)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let transport = Self {
            writer: Mutex::new(Box::new(writer)),
            target,
        };
        (transport, Box::new(reader))
    }

    pub fn target(&self) -> &ConnectTarget {
        &self.target
    }

    /// Encode and write one request.
    pub async fn send(&self, request: &Request) -> Result<()> {
        let bytes = request.encode();
        debug!("SND {}", request.to_value());

        let mut writer = self.writer.lock().await;
        writer.write_all(&bytes).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Shut down the write half. Errors are ignored; the peer may already be gone.
    pub async fn close(&self) {
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }
}

#[cfg(unix)]
async fn connect_unix(
    path: &std::path::Path,
    target: ConnectTarget,
) -> std::io::Result<(Transport, BoxedReader)> {
    let stream = tokio::net::UnixStream::connect(path).await?;
    Ok(Transport::from_stream(stream, target))
}

#[cfg(not(unix))]
async fn connect_unix(
    _path: &std::path::Path,
    _target: ConnectTarget,
) -> std::io::Result<(Transport, BoxedReader)> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "local domain sockets are not supported on this platform",
    ))
}
