//! Remote volume client
//!
//! Owns the connection handle to the remote speaker and hides discovery,
//! address fallback, liveness checks and transient-error retries behind
//! `connect` / `get_volume` / `set_relative_volume`.

pub mod sonos;
pub mod ssdp;

use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::RemoteSettings;
use crate::error::{DiscoveryError, RemoteError};

/// Transport state relevant to the playback mute guard
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Playback {
    pub playing: bool,
    /// Source is the speaker's own analog input
    pub line_in: bool,
}

impl Playback {
    /// Local output should be muted: the speaker plays something other than us
    #[must_use]
    pub fn should_mute_local(self) -> bool {
        self.playing && !self.line_in
    }
}

/// Level before and after a relative change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolumeChange {
    pub from: u8,
    pub to: u8,
}

/// A connected remote speaker
#[async_trait]
pub trait Speaker: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn address(&self) -> &str;

    async fn volume(&self) -> Result<u8, RemoteError>;

    async fn set_volume(&self, level: u8) -> Result<(), RemoteError>;

    async fn playback(&self) -> Result<Playback, RemoteError>;
}

/// Locates speakers by name or address
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Speaker: Speaker;

    async fn discover(&self, name: &str, timeout: Duration)
    -> Result<Self::Speaker, DiscoveryError>;

    async fn connect_address(&self, address: &str) -> Result<Self::Speaker, RemoteError>;
}

// ============================================================================
// Retry
// ============================================================================

/// Bounded retry with doubling backoff for transient errors
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub initial_backoff: Duration,
}

impl RetryPolicy {
    #[must_use]
    pub fn new(attempts: u32) -> Self {
        Self {
            attempts: attempts.max(1),
            initial_backoff: Duration::from_millis(100),
        }
    }

    /// Run `op` until it succeeds, fails permanently, or attempts run out
    ///
    /// # Errors
    /// Returns the last error from `op`.
    pub async fn run<T, F, Fut>(&self, action: &str, mut op: F) -> Result<T, RemoteError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RemoteError>>,
    {
        let mut backoff = self.initial_backoff;
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.attempts => {
                    debug!(
                        "{} failed (attempt {}/{}): {}; retrying in {:?}",
                        action, attempt, self.attempts, e, backoff
                    );
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// `current + delta`, clamped to 0..=100
#[must_use]
pub fn clamp_level(current: u8, delta: i32) -> u8 {
    (i32::from(current) + delta).clamp(0, 100) as u8
}

// ============================================================================
// Client
// ============================================================================

/// Session with the configured remote speaker
pub struct RemoteVolumeClient<C: Connector> {
    connector: C,
    settings: RemoteSettings,
    retry: RetryPolicy,
    session: Mutex<Option<Arc<C::Speaker>>>,
}

impl<C: Connector> RemoteVolumeClient<C> {
    #[must_use]
    pub fn new(connector: C, settings: RemoteSettings) -> Self {
        let retry = RetryPolicy::new(settings.attempts);
        Self {
            connector,
            settings,
            retry,
            session: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Connect, or revalidate and return the existing handle
    ///
    /// # Errors
    /// Returns an error if the speaker can be neither discovered nor reached
    /// at the configured address.
    pub async fn connect(&self) -> Result<Arc<C::Speaker>, RemoteError> {
        let mut session = self.session.lock().await;

        if let Some(handle) = session.as_ref() {
            match self.retry.run("GetVolume", || handle.volume()).await {
                Ok(_) => return Ok(Arc::clone(handle)),
                Err(e) => {
                    warn!("Remote speaker '{}' stopped answering: {}", handle.name(), e);
                    *session = None;
                }
            }
        }

        let handle = Arc::new(self.establish().await?);
        info!(
            "Connected to remote speaker '{}' at {}",
            handle.name(),
            handle.address()
        );
        *session = Some(Arc::clone(&handle));
        Ok(handle)
    }

    async fn establish(&self) -> Result<C::Speaker, RemoteError> {
        let name = self.settings.name.as_str();
        let address = self.settings.address.as_deref();

        if name.is_empty() {
            let address = address.ok_or(DiscoveryError::NoTarget)?;
            return self.connect_address(address).await;
        }

        match self
            .connector
            .discover(name, self.settings.discovery_timeout)
            .await
        {
            Ok(speaker) => Ok(speaker),
            Err(e) => match address {
                Some(address) => {
                    warn!("Discovery of '{}' failed: {}; trying {}", name, e, address);
                    self.connect_address(address).await
                }
                None => Err(e.into()),
            },
        }
    }

    async fn connect_address(&self, address: &str) -> Result<C::Speaker, RemoteError> {
        self.retry
            .run("Connect", || self.connector.connect_address(address))
            .await
    }

    /// # Errors
    /// Returns an error after exhausting retries.
    pub async fn get_volume(&self, handle: &C::Speaker) -> Result<u8, RemoteError> {
        self.retry.run("GetVolume", || handle.volume()).await
    }

    /// Move the remote level by `delta` percent points, clamped to 0..=100
    ///
    /// # Errors
    /// Returns an error after exhausting retries on the read or the write.
    pub async fn set_relative_volume(
        &self,
        handle: &C::Speaker,
        delta: i32,
    ) -> Result<VolumeChange, RemoteError> {
        let from = self.get_volume(handle).await?;
        let to = clamp_level(from, delta);
        if to != from {
            self.retry
                .run("SetVolume", || handle.set_volume(to))
                .await?;
        }
        debug!("Remote volume {} -> {} ({:+})", from, to, delta);
        Ok(VolumeChange { from, to })
    }

    /// # Errors
    /// Returns an error after exhausting retries.
    pub async fn playback(&self, handle: &C::Speaker) -> Result<Playback, RemoteError> {
        self.retry.run("GetTransportInfo", || handle.playback()).await
    }

    /// Cached handle, if connected
    pub async fn handle(&self) -> Option<Arc<C::Speaker>> {
        self.session.lock().await.clone()
    }

    pub async fn is_connected(&self) -> bool {
        self.session.lock().await.is_some()
    }

    /// Drop the handle after a failure; the next `connect` starts over
    pub async fn invalidate(&self) {
        if let Some(handle) = self.session.lock().await.take() {
            debug!("Dropped connection to '{}'", handle.name());
        }
    }

    /// Drop the handle at shutdown
    pub async fn release(&self) {
        if let Some(handle) = self.session.lock().await.take() {
            info!("Released remote speaker '{}'", handle.name());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{FakeConnector, FakeRemote, remote_settings};
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    fn client(connector: FakeConnector) -> RemoteVolumeClient<FakeConnector> {
        RemoteVolumeClient::new(connector, remote_settings()).with_retry(RetryPolicy {
            attempts: 3,
            initial_backoff: Duration::from_millis(1),
        })
    }

    #[test_case(99, 5, 100 ; "clamps at top")]
    #[test_case(2, -5, 0 ; "clamps at bottom")]
    #[test_case(40, -3, 37 ; "plain")]
    fn test_clamp_level(current: u8, delta: i32, expected: u8) {
        assert_eq!(clamp_level(current, delta), expected);
    }

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        let remote = FakeRemote::new("Living Room", 20);
        let connector = FakeConnector::new(&remote);
        let client = client(connector.clone());

        let first = client.connect().await.unwrap();
        let second = client.connect().await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(connector.connects(), 1);
    }

    #[tokio::test]
    async fn test_connect_falls_back_to_address() {
        let remote = FakeRemote::new("Living Room", 20);
        let connector = FakeConnector::new(&remote).undiscoverable();
        let client = client(connector.clone());

        let handle = client.connect().await.unwrap();
        assert_eq!(handle.address(), "192.0.2.10");
        assert_eq!(connector.connects(), 1);
    }

    #[tokio::test]
    async fn test_dead_handle_is_replaced() {
        let remote = FakeRemote::new("Living Room", 20);
        let connector = FakeConnector::new(&remote);
        let client = client(connector.clone());

        let first = client.connect().await.unwrap();
        remote.set_offline(true);
        assert!(client.connect().await.is_err());
        assert!(!client.is_connected().await);

        remote.set_offline(false);
        let second = client.connect().await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn test_relative_volume_clamps_at_100() {
        let remote = FakeRemote::new("Living Room", 99);
        let client = client(FakeConnector::new(&remote));
        let handle = client.connect().await.unwrap();

        let change = client.set_relative_volume(&handle, 5).await.unwrap();

        assert_eq!(change, VolumeChange { from: 99, to: 100 });
        assert_eq!(remote.level(), 100);
    }

    #[tokio::test]
    async fn test_unchanged_level_skips_write() {
        let remote = FakeRemote::new("Living Room", 0);
        let client = client(FakeConnector::new(&remote));
        let handle = client.connect().await.unwrap();

        client.set_relative_volume(&handle, -3).await.unwrap();
        assert_eq!(remote.writes(), 0);
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let remote = FakeRemote::new("Living Room", 30);
        let client = client(FakeConnector::new(&remote));
        let handle = client.connect().await.unwrap();

        remote.fail_next(2);
        let change = client.set_relative_volume(&handle, 2).await.unwrap();
        assert_eq!(change.to, 32);
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let remote = FakeRemote::new("Living Room", 30);
        let client = client(FakeConnector::new(&remote));
        let handle = client.connect().await.unwrap();

        remote.fail_next(3);
        assert!(client.get_volume(&handle).await.is_err());
        assert_eq!(remote.level(), 30);
    }

    #[tokio::test]
    async fn test_round_trip_restores_level() {
        let remote = FakeRemote::new("Living Room", 50);
        let client = client(FakeConnector::new(&remote));
        let handle = client.connect().await.unwrap();

        client.set_relative_volume(&handle, 2).await.unwrap();
        client.set_relative_volume(&handle, -2).await.unwrap();
        assert_eq!(remote.level(), 50);
    }

    #[test_case(true, false, true)]
    #[test_case(true, true, false ; "line in")]
    #[test_case(false, false, false ; "paused")]
    fn test_should_mute_local(playing: bool, line_in: bool, expected: bool) {
        assert_eq!(Playback { playing, line_in }.should_mute_local(), expected);
    }
}
