//! Logging setup
//!
//! CLI commands log to stderr at `warn` unless `RUST_LOG` says otherwise.
//! The daemon logs to stderr at the configured level and, with
//! `debug_logging`, also appends to a size-capped file in the state directory.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::Config;

/// Log file name inside the state directory
pub const LOG_FILE: &str = "daemon.log";

/// Rotate after 1 MB
pub const MAX_LOG_BYTES: u64 = 1024 * 1024;

/// Directory for the daemon log (`$XDG_STATE_HOME/sonos-volume-sync`)
#[must_use]
pub fn log_dir() -> PathBuf {
    dirs::state_dir()
        .or_else(dirs::cache_dir)
        .unwrap_or_else(std::env::temp_dir)
        .join("sonos-volume-sync")
}

/// Initialize logging for one-shot commands
pub fn init_cli() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
}

/// Initialize logging for the daemon
///
/// Returns the guard of the non-blocking file writer; dropping it flushes
/// and stops the writer thread, so the caller keeps it alive for the session.
pub fn init_daemon(config: &Config) -> Option<WorkerGuard> {
    let level = if config.settings.debug_logging {
        "debug"
    } else {
        config.settings.log_level.as_str()
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("sonos_volume_sync={level}")));

    let stderr_layer = tracing_subscriber::fmt::layer().with_writer(io::stderr);

    if !config.settings.debug_logging {
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(stderr_layer)
            .try_init();
        return None;
    }

    let appender = RotatingFileAppender::new(log_dir(), LOG_FILE, MAX_LOG_BYTES);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(writer);

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init();

    Some(guard)
}

/// An append-only log file capped by size.
///
/// When the current file reaches `max_bytes` it is renamed to `<name>.old`
/// (replacing any previous backup) and a fresh file is started. A file
/// deleted from under the writer is re-created on the next write.
/// Created files get 0o600 permissions on Unix.
pub struct RotatingFileAppender {
    path: PathBuf,
    backup_path: PathBuf,
    max_bytes: u64,
    state: AppenderState,
}

#[derive(Default)]
struct AppenderState {
    file: Option<File>,
    written: u64,
}

impl RotatingFileAppender {
    /// Create an appender writing `dir/filename`
    pub fn new(dir: impl Into<PathBuf>, filename: &str, max_bytes: u64) -> Self {
        let dir = dir.into();
        Self {
            path: dir.join(filename),
            backup_path: dir.join(format!("{filename}.old")),
            max_bytes,
            state: AppenderState::default(),
        }
    }

    /// Path of the active log file
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open(path: &Path, truncate: bool) -> io::Result<File> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut options = fs::OpenOptions::new();
        options.create(true).write(true);
        if truncate {
            options.truncate(true);
        } else {
            options.append(true);
        }

        #[cfg(unix)]
        options.mode(0o600);

        options.open(path)
    }

    fn ensure_open(&self, state: &mut AppenderState) -> io::Result<()> {
        if state.file.is_some() && self.path.exists() {
            return Ok(());
        }
        let file = Self::open(&self.path, false)?;
        state.written = file.metadata()?.len();
        state.file = Some(file);
        Ok(())
    }

    fn rotate(&self, state: &mut AppenderState) -> io::Result<()> {
        state.file = None;
        if self.path.exists() {
            fs::rename(&self.path, &self.backup_path)?;
        }
        state.file = Some(Self::open(&self.path, true)?);
        state.written = 0;
        Ok(())
    }

    fn write_with(&self, state: &mut AppenderState, buf: &[u8]) -> io::Result<()> {
        self.ensure_open(state)?;
        if state.written >= self.max_bytes
            && let Err(e) = self.rotate(state)
        {
            eprintln!("Failed to rotate log file: {e}");
            self.ensure_open(state)?;
        }

        let file = state
            .file
            .as_mut()
            .ok_or_else(|| io::Error::other("log file not open"))?;
        file.write_all(buf)?;
        state.written += buf.len() as u64;
        Ok(())
    }
}

impl Write for RotatingFileAppender {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = std::mem::take(&mut self.state);

        let result = self.write_with(&mut state, buf);
        self.state = state;
        result.map(|()| buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if let Some(file) = self.state.file.as_mut() {
            file.flush()?;
        }
        Ok(())
    }
}
