//! Test doubles for the local device and the remote speaker

use async_trait::async_trait;
use std::ffi::OsString;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::RemoteSettings;
use crate::error::{DiscoveryError, LocalDeviceError, RemoteError};
use crate::keys::Direction;
use crate::local::LocalVolumeSource;
use crate::remote::{Connector, Playback, Speaker};

/// RAII helper: set `XDG_CONFIG_HOME` to a tempdir for the lifetime of this guard.
pub(crate) struct XdgTemp {
    prev: Option<OsString>,
    dir: tempfile::TempDir,
}

impl XdgTemp {
    /// # Panics
    ///
    /// Panics if a temporary directory cannot be created.
    #[must_use]
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("failed to create tempdir for XDG_CONFIG_HOME");
        let prev = std::env::var_os("XDG_CONFIG_HOME");
        // SAFETY: only the default-config test touches XDG_CONFIG_HOME
        unsafe { std::env::set_var("XDG_CONFIG_HOME", dir.path()) };
        Self { prev, dir }
    }

    #[must_use]
    pub fn path(&self) -> &std::path::Path {
        self.dir.path()
    }
}

impl Drop for XdgTemp {
    fn drop(&mut self) {
        // SAFETY: see `new`
        unsafe {
            match self.prev.take() {
                Some(val) => std::env::set_var("XDG_CONFIG_HOME", val),
                None => std::env::remove_var("XDG_CONFIG_HOME"),
            }
        }
    }
}

// ============================================================================
// Local device
// ============================================================================

#[derive(Debug, Default)]
struct LocalState {
    device_name: String,
    level: u8,
    muted: bool,
    fail_device_name: bool,
    fail_writes: bool,
    device_name_reads: u32,
    steps: Vec<(Direction, u8)>,
}

/// In-memory local playback device
#[derive(Debug)]
pub(crate) struct FakeLocal(Mutex<LocalState>);

impl FakeLocal {
    pub fn new(device_name: &str, level: u8) -> Self {
        Self(Mutex::new(LocalState {
            device_name: device_name.to_string(),
            level,
            ..LocalState::default()
        }))
    }

    fn state(&self) -> std::sync::MutexGuard<'_, LocalState> {
        self.0.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub fn set_device_name(&self, name: &str) {
        self.state().device_name = name.to_string();
    }

    pub fn set_level(&self, level: u8) {
        self.state().level = level;
    }

    pub fn level(&self) -> u8 {
        self.state().level
    }

    pub fn muted(&self) -> bool {
        self.state().muted
    }

    pub fn fail_device_name(&self, fail: bool) {
        self.state().fail_device_name = fail;
    }

    pub fn fail_writes(&self, fail: bool) {
        self.state().fail_writes = fail;
    }

    pub fn device_name_reads(&self) -> u32 {
        self.state().device_name_reads
    }

    pub fn steps(&self) -> Vec<(Direction, u8)> {
        self.state().steps.clone()
    }
}

fn write_failure() -> LocalDeviceError {
    LocalDeviceError::Command {
        tool: "fake",
        message: "write refused".to_string(),
    }
}

impl LocalVolumeSource for FakeLocal {
    fn default_device_name(&self) -> Result<String, LocalDeviceError> {
        let mut state = self.state();
        state.device_name_reads += 1;
        if state.fail_device_name {
            return Err(LocalDeviceError::NoDefaultDevice);
        }
        Ok(state.device_name.clone())
    }

    fn volume(&self) -> Result<u8, LocalDeviceError> {
        Ok(self.state().level)
    }

    fn set_volume(&self, percent: u8) -> Result<(), LocalDeviceError> {
        let mut state = self.state();
        if state.fail_writes {
            return Err(write_failure());
        }
        state.level = percent;
        Ok(())
    }

    fn set_muted(&self, muted: bool) -> Result<(), LocalDeviceError> {
        let mut state = self.state();
        if state.fail_writes {
            return Err(write_failure());
        }
        state.muted = muted;
        Ok(())
    }

    fn step_volume(&self, direction: Direction, percent: u8) -> Result<(), LocalDeviceError> {
        let mut state = self.state();
        if state.fail_writes {
            return Err(write_failure());
        }
        state.level = crate::remote::clamp_level(state.level, direction.sign() * i32::from(percent));
        state.steps.push((direction, percent));
        Ok(())
    }
}

// ============================================================================
// Remote speaker
// ============================================================================

/// Shared state of a fake speaker, observed by tests
#[derive(Debug)]
pub(crate) struct FakeRemote {
    name: String,
    level: Mutex<u8>,
    playback: Mutex<Playback>,
    offline: AtomicBool,
    /// Number of upcoming calls that fail with a transient error
    fail_next: AtomicU32,
    writes: AtomicU32,
}

impl FakeRemote {
    pub fn new(name: &str, level: u8) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            level: Mutex::new(level),
            playback: Mutex::new(Playback::default()),
            offline: AtomicBool::new(false),
            fail_next: AtomicU32::new(0),
            writes: AtomicU32::new(0),
        })
    }

    pub fn level(&self) -> u8 {
        *self.level.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn fail_next(&self, calls: u32) {
        self.fail_next.store(calls, Ordering::SeqCst);
    }

    pub fn set_playback(&self, playback: Playback) {
        *self.playback.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = playback;
    }

    pub fn writes(&self) -> u32 {
        self.writes.load(Ordering::SeqCst)
    }

    fn check(&self, action: &str) -> Result<(), RemoteError> {
        let failing = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing || self.offline.load(Ordering::SeqCst) {
            return Err(RemoteError::Status {
                action: action.to_string(),
                status: 503,
                body: String::new(),
            });
        }
        Ok(())
    }
}

/// Handle returned by [`FakeConnector`]
#[derive(Debug)]
pub(crate) struct FakeSpeaker {
    remote: Arc<FakeRemote>,
    address: String,
}

#[async_trait]
impl Speaker for FakeSpeaker {
    fn name(&self) -> &str {
        &self.remote.name
    }

    fn address(&self) -> &str {
        &self.address
    }

    async fn volume(&self) -> Result<u8, RemoteError> {
        self.remote.check("GetVolume")?;
        Ok(self.remote.level())
    }

    async fn set_volume(&self, level: u8) -> Result<(), RemoteError> {
        self.remote.check("SetVolume")?;
        *self
            .remote
            .level
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = level;
        self.remote.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn playback(&self) -> Result<Playback, RemoteError> {
        self.remote.check("GetTransportInfo")?;
        Ok(*self
            .remote
            .playback
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner))
    }
}

/// Connector that hands out [`FakeSpeaker`]s for one [`FakeRemote`]
#[derive(Debug, Clone)]
pub(crate) struct FakeConnector {
    remote: Arc<FakeRemote>,
    discoverable: bool,
    connects: Arc<AtomicU32>,
}

impl FakeConnector {
    pub fn new(remote: &Arc<FakeRemote>) -> Self {
        Self {
            remote: Arc::clone(remote),
            discoverable: true,
            connects: Arc::new(AtomicU32::new(0)),
        }
    }

    #[must_use]
    pub fn undiscoverable(mut self) -> Self {
        self.discoverable = false;
        self
    }

    pub fn connects(&self) -> u32 {
        self.connects.load(Ordering::SeqCst)
    }

    fn speaker(&self, address: &str) -> FakeSpeaker {
        self.connects.fetch_add(1, Ordering::SeqCst);
        FakeSpeaker {
            remote: Arc::clone(&self.remote),
            address: address.to_string(),
        }
    }
}

#[async_trait]
impl Connector for FakeConnector {
    type Speaker = FakeSpeaker;

    async fn discover(&self, name: &str, _timeout: Duration) -> Result<FakeSpeaker, DiscoveryError> {
        if !self.discoverable
            || self.remote.offline.load(Ordering::SeqCst)
            || !name.eq_ignore_ascii_case(&self.remote.name)
        {
            return Err(DiscoveryError::NotFound {
                name: name.to_string(),
                seen: "no players".to_string(),
            });
        }
        Ok(self.speaker("198.51.100.7"))
    }

    async fn connect_address(&self, address: &str) -> Result<FakeSpeaker, RemoteError> {
        self.remote.check("Connect")?;
        Ok(self.speaker(address))
    }
}

/// Remote settings pointing at the fake speaker, with a fallback address
pub(crate) fn remote_settings() -> RemoteSettings {
    RemoteSettings {
        name: "Living Room".to_string(),
        address: Some("192.0.2.10".to_string()),
        attempts: 3,
        discovery_timeout: Duration::from_millis(100),
        reconnect_interval: Duration::from_millis(50),
    }
}
