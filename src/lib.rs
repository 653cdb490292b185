//! Sonos Volume Sync
//!
//! Forwards local volume intent to a Sonos speaker. While the default
//! playback device is the configured target, the local level stays pinned
//! and every key press or level change is merged into relative remote
//! volume changes.
//!
//! # Parts
//! - [`identity`]: is the default playback device the target?
//! - [`remote`]: Sonos discovery, connection handle, relative volume
//! - [`observer`]: local level drift against the pinned level
//! - [`keys`]: volume keys delivered over IPC, gated per event
//! - [`aggregator`]: burst merging, step sizing, ordered flushes
//! - [`daemon`] / [`commands`]: session lifecycle and one-shot commands

pub mod aggregator;
pub mod cli;
pub mod commands;
pub mod config;
pub mod daemon;
pub mod error;
pub mod identity;
pub mod ipc;
pub mod keys;
pub mod local;
pub mod logging;
pub mod notification;
pub mod observer;
pub mod pipewire;
pub mod remote;
pub mod style;

#[cfg(test)]
mod test_utils;

/// Build-time information (version, git commit)
pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

// Re-export commonly used types for convenience
pub use cli::Args;
pub use config::Config;

/// Package version, with the git commit when built from a checkout
#[must_use]
pub fn version() -> String {
    match built_info::GIT_COMMIT_HASH_SHORT {
        Some(hash) => format!("{} ({hash})", built_info::PKG_VERSION),
        None => built_info::PKG_VERSION.to_string(),
    }
}
