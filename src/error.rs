//! Error taxonomy
//!
//! Each variant family maps to one recovery policy:
//! - [`ConfigError`]: fatal at startup, process exits non-zero
//! - [`DiscoveryError`] / [`RemoteError`]: recoverable, retried, then passthrough
//! - [`LocalDeviceError`]: target treated as inactive (passthrough)
//! - [`HookInstallError`]: key capture unavailable, fatal

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Configuration could not be loaded or is invalid
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Could not determine config directory")]
    NoConfigDir,

    #[error("Config file not found: {0:?}")]
    NotFound(PathBuf),

    #[error("Created default config at {0:?}. Review sonos_name and windows_device_name, then start again")]
    Created(PathBuf),

    #[error("Failed to read config {path:?}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to write config {path:?}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to parse config {path:?}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// The local device enumeration or volume API failed
#[derive(Debug, Error)]
pub enum LocalDeviceError {
    #[error("Audio tool '{tool}' not found or failed to start")]
    Spawn {
        tool: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("{tool} failed: {message}")]
    Command { tool: &'static str, message: String },

    #[error("Unexpected output from {tool}: {output}")]
    Parse { tool: &'static str, output: String },

    #[error("No default playback device")]
    NoDefaultDevice,
}

/// The remote speaker could not be located
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("No remote speaker name or address configured")]
    NoTarget,

    #[error("No speaker named '{name}' found (saw: {seen})")]
    NotFound { name: String, seen: String },

    #[error("Invalid speaker address '{0}'")]
    InvalidAddress(String),

    #[error("Discovery socket error")]
    Io(#[from] io::Error),
}

/// A call to the remote speaker failed
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("HTTP request failed")]
    Http(#[from] reqwest::Error),

    #[error("{action} failed with status {status}: {body}")]
    Status {
        action: String,
        status: u16,
        body: String,
    },

    #[error("Unexpected response to {action}: {detail}")]
    Parse { action: String, detail: String },

    #[error("Remote speaker not connected")]
    Discovery(#[from] DiscoveryError),
}

impl RemoteError {
    /// Whether retrying the same call may succeed
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            Self::Status { status, .. } => *status >= 500,
            Self::Parse { .. } | Self::Discovery(_) => false,
        }
    }
}

/// Key capture could not be installed
#[derive(Debug, Error)]
pub enum HookInstallError {
    #[error("Another daemon is already listening on {0:?}")]
    AlreadyRunning(PathBuf),

    #[error("Failed to bind key socket {path:?}")]
    Bind {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to remove stale key socket {path:?}")]
    Stale {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}
