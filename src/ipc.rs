//! IPC infrastructure for daemon communication
//!
//! Unix socket IPC between the CLI (`key`, `shutdown`, `--status`) and the
//! daemon. Messages are length-prefixed JSON.

use color_eyre::eyre::{self, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, error, warn};

use crate::error::HookInstallError;
use crate::keys::Direction;

const SOCKET_NAME: &str = "sonos-volume-sync.sock";

// ============================================================================
// Message Types
// ============================================================================

/// Requests sent from CLI to daemon
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Request {
    /// A volume key was pressed
    Key { direction: Direction },
    /// Query daemon status
    Status,
    /// Gracefully shutdown the daemon
    Shutdown,
}

/// Responses sent from daemon to CLI
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Response {
    /// The key was queued for the remote speaker
    Forwarded,
    /// The key was not consumed; the client applies it locally
    Passthrough { reason: String },
    /// Status information
    Status(StatusSnapshot),
    /// Generic success response
    Ok { message: String },
    /// Error response
    Error { message: String },
}

/// Daemon state as published to status queries
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub version: String,
    pub uptime_secs: u64,
    /// `active`, `passthrough`, or `closed`
    pub mode: String,
    pub target_active: bool,
    pub remote_connected: bool,
    pub remote_name: Option<String>,
    pub remote_volume: Option<u8>,
    /// Aggregator phase: `idle`, `accumulating`, or `flushing`
    pub phase: String,
    pub dropped_deltas: u64,
    pub last_error: Option<String>,
}

// ============================================================================
// Socket Path Management
// ============================================================================

/// Get the IPC socket path
///
/// Prefers `$XDG_RUNTIME_DIR/sonos-volume-sync.sock`, falls back to a
/// per-user name in `/tmp`.
#[must_use]
pub fn get_socket_path() -> PathBuf {
    match std::env::var_os("XDG_RUNTIME_DIR") {
        Some(runtime_dir) if !runtime_dir.is_empty() => PathBuf::from(runtime_dir).join(SOCKET_NAME),
        _ => PathBuf::from(format!(
            "/tmp/sonos-volume-sync-{}.sock",
            users::get_current_uid()
        )),
    }
}

/// Whether a daemon answers on `socket_path`
pub async fn is_socket_alive(socket_path: &Path) -> bool {
    matches!(
        tokio::time::timeout(Duration::from_millis(100), UnixStream::connect(socket_path)).await,
        Ok(Ok(_))
    )
}

/// Remove a socket file left behind by a daemon that is no longer running
///
/// # Errors
/// Returns [`HookInstallError::AlreadyRunning`] if a daemon still answers,
/// or [`HookInstallError::Stale`] if the file cannot be removed.
pub async fn cleanup_stale_socket(socket_path: &Path) -> Result<(), HookInstallError> {
    if !socket_path.exists() {
        return Ok(());
    }

    if is_socket_alive(socket_path).await {
        return Err(HookInstallError::AlreadyRunning(socket_path.to_path_buf()));
    }

    debug!("Removing stale socket: {:?}", socket_path);
    std::fs::remove_file(socket_path).map_err(|source| HookInstallError::Stale {
        path: socket_path.to_path_buf(),
        source,
    })
}

// ============================================================================
// Protocol Helpers
// ============================================================================

const MAX_MESSAGE_SIZE: usize = 1024 * 1024;
const READ_TIMEOUT: Duration = Duration::from_secs(10);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Read a length-prefixed JSON message from a stream
async fn read_message<T: for<'de> Deserialize<'de>>(stream: &mut UnixStream) -> Result<T> {
    let mut len_buf = [0u8; 4];
    tokio::time::timeout(READ_TIMEOUT, stream.read_exact(&mut len_buf))
        .await
        .context("Timeout reading message length")?
        .context("Failed to read message length")?;

    let msg_len = u32::from_be_bytes(len_buf) as usize;
    if msg_len > MAX_MESSAGE_SIZE {
        eyre::bail!("Message too large: {msg_len} bytes (max: {MAX_MESSAGE_SIZE})");
    }

    let mut msg_buf = vec![0u8; msg_len];
    tokio::time::timeout(READ_TIMEOUT, stream.read_exact(&mut msg_buf))
        .await
        .context("Timeout reading message payload")?
        .context("Failed to read message payload")?;

    serde_json::from_slice(&msg_buf).context("Failed to deserialize message")
}

/// Write a length-prefixed JSON message to a stream
async fn write_message<T: Serialize>(stream: &mut UnixStream, message: &T) -> Result<()> {
    let json = serde_json::to_vec(message).context("Failed to serialize message")?;
    if json.len() > MAX_MESSAGE_SIZE {
        eyre::bail!("Message too large: {} bytes (max: {MAX_MESSAGE_SIZE})", json.len());
    }

    let len = (json.len() as u32).to_be_bytes();
    stream
        .write_all(&len)
        .await
        .context("Failed to write message length")?;
    stream
        .write_all(&json)
        .await
        .context("Failed to write message payload")?;
    stream.flush().await.context("Failed to flush stream")?;

    Ok(())
}

// ============================================================================
// IPC Client (for CLI commands)
// ============================================================================

/// Send a request to the daemon at the default socket path
///
/// # Errors
/// Returns an error if no daemon is listening or the exchange fails.
pub async fn send_request(request: Request) -> Result<Response> {
    send_request_to(&get_socket_path(), request).await
}

/// Send a request to the daemon listening on `socket_path`
///
/// # Errors
/// Returns an error if no daemon is listening or the exchange fails.
pub async fn send_request_to(socket_path: &Path, request: Request) -> Result<Response> {
    let mut stream = tokio::time::timeout(CONNECT_TIMEOUT, UnixStream::connect(socket_path))
        .await
        .context("Timeout connecting to daemon")?
        .with_context(|| {
            format!("Failed to connect to daemon. Is the daemon running?\nSocket: {socket_path:?}")
        })?;

    debug!("Connected to daemon at {:?}", socket_path);
    write_message(&mut stream, &request).await?;
    read_message(&mut stream).await
}

// ============================================================================
// IPC Server (for daemon)
// ============================================================================

/// Listening socket of the daemon; removes the socket file on drop
pub struct IpcServer {
    listener: UnixListener,
    socket_path: PathBuf,
}

impl IpcServer {
    /// Bind the default socket path
    ///
    /// # Errors
    /// Returns an error if another daemon is running or the bind fails.
    pub async fn bind() -> Result<Self, HookInstallError> {
        Self::bind_at(get_socket_path()).await
    }

    /// Bind an explicit socket path
    ///
    /// # Errors
    /// Returns an error if another daemon is running or the bind fails.
    pub async fn bind_at(socket_path: PathBuf) -> Result<Self, HookInstallError> {
        cleanup_stale_socket(&socket_path).await?;

        let listener =
            UnixListener::bind(&socket_path).map_err(|source| HookInstallError::Bind {
                path: socket_path.clone(),
                source,
            })?;

        debug!("IPC server listening on {:?}", socket_path);
        Ok(Self {
            listener,
            socket_path,
        })
    }

    /// Accept the next incoming connection
    /// Returns None if accept fails (non-fatal)
    pub async fn accept(&self) -> Option<UnixStream> {
        match self.listener.accept().await {
            Ok((stream, _addr)) => Some(stream),
            Err(e) => {
                error!("Failed to accept IPC connection: {}", e);
                None
            }
        }
    }

    #[must_use]
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }
}

impl Drop for IpcServer {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.socket_path) {
            warn!("Failed to remove IPC socket on shutdown: {}", e);
        } else {
            debug!("Removed IPC socket: {:?}", self.socket_path);
        }
    }
}

/// Read a request from a client connection
///
/// # Errors
/// Returns an error on timeout, oversized or malformed messages.
pub async fn read_request(stream: &mut UnixStream) -> Result<Request> {
    read_message(stream).await
}

/// Write a response to a client connection
///
/// # Errors
/// Returns an error if the client hung up.
pub async fn write_response(stream: &mut UnixStream, response: &Response) -> Result<()> {
    write_message(stream, response).await
}
