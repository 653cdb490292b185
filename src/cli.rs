//! Command-line interface definitions
//!
//! Uses clap for argument parsing with derive macros.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::keys::Direction;

/// Sonos Volume Sync
///
/// Forward local volume changes to a Sonos speaker.
#[derive(Parser)]
#[command(name = "sonos-volume-sync")]
#[command(version)]
#[command(about = "Sonos Volume Sync - Forward local volume keys and level changes to a Sonos speaker")]
#[command(after_help = "\
BEHAVIOR:
  - While the default playback device matches the configured target, the local
    level is pinned and every change (keys or sliders) is forwarded to the speaker
  - Bursts of key presses are merged into a single remote change
  - When the target is inactive or the speaker is unreachable, keys act locally
  - Local output is muted while the speaker plays a source other than Line-In

COMMANDS:
  sonos-volume-sync              Run the sync in the foreground
  sonos-volume-sync --status     One-shot device and speaker check
  sonos-volume-sync key up|down  Deliver a volume key (bind this to your volume keys)
  sonos-volume-sync validate     Validate config file
  sonos-volume-sync shutdown     Gracefully stop a running sync

CONFIG:
  $XDG_CONFIG_HOME/sonos-volume-sync/config.json (override with --config)

IPC SOCKET:
  $XDG_RUNTIME_DIR/sonos-volume-sync.sock (or /tmp/sonos-volume-sync-$UID.sock)")]
pub struct Args {
    /// Check the local device and the speaker once, then exit
    #[arg(long)]
    pub status: bool,

    /// Use an alternate config file
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand)]
pub enum Command {
    /// Deliver a volume key press to the running sync
    Key {
        #[arg(value_enum)]
        direction: Direction,
    },

    /// Validate config file (no daemon needed)
    Validate,

    /// Gracefully shutdown the running sync
    Shutdown,
}
