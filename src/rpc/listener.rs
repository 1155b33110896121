//! Unix-socket listener used by proxy servers.
//!
//! Each proxy binds one socket (named for its device serial) under the
//! runtime directory; downstream consumers connect to it to reach the
//! device's transport surface. The socket file is created with mode 0600
//! and removed when the listener is dropped.

use std::path::{Path, PathBuf};

use tokio::net::{UnixListener, UnixStream};

use crate::error::Result;
use crate::rpc::protocol::{RpcFrame, RpcRequest, read_request, write_response};

/// Listener accepting consumer connections for one proxy server.
pub struct RpcListener {
    listener: UnixListener,
    socket_path: PathBuf,
    max_message_size: u32,
}

impl RpcListener {
    /// Bind to a Unix domain socket at the given path.
    ///
    /// Creates the parent directory if needed, removes any stale socket
    /// file from a previous run, and restricts the socket to the owning
    /// user.
    pub async fn bind(socket_path: impl AsRef<Path>, max_message_size: u32) -> Result<Self> {
        let socket_path = socket_path.as_ref().to_path_buf();

        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if socket_path.exists() {
            std::fs::remove_file(&socket_path)?;
        }

        let listener = UnixListener::bind(&socket_path)?;

        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&socket_path, std::fs::Permissions::from_mode(0o600))?;
        }

        Ok(Self {
            listener,
            socket_path,
            max_message_size,
        })
    }

    /// Accept a new consumer connection.
    pub async fn accept(&self) -> Result<RpcConnection> {
        let (stream, _addr) = self.listener.accept().await?;
        Ok(RpcConnection::new(stream, self.max_message_size))
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }
}

impl Drop for RpcListener {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.socket_path);
    }
}

/// One consumer connection to a proxy server.
pub struct RpcConnection {
    stream: UnixStream,
    max_message_size: u32,
}

impl RpcConnection {
    pub fn new(stream: UnixStream, max_message_size: u32) -> Self {
        Self {
            stream,
            max_message_size,
        }
    }

    /// Receive the next request, or `None` when the consumer hung up.
    pub async fn recv_request(&mut self) -> Result<Option<RpcRequest>> {
        match read_request(&mut self.stream, self.max_message_size).await {
            Ok(request) => Ok(Some(request)),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Send one response frame.
    pub async fn send_frame(&mut self, frame: &RpcFrame) -> Result<()> {
        write_response(&mut self.stream, frame, self.max_message_size).await?;
        Ok(())
    }
}
