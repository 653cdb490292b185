//! Device identity resolver
//!
//! Answers "is the default local playback device the configured target?".
//! The default device name is cached briefly since every poll tick asks.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::local::LocalVolumeSource;

/// Matches the default local device against the configured target name
#[derive(Debug)]
pub struct DeviceIdentity {
    target: String,
    target_lower: String,
    cache_ttl: Duration,
    cache: Mutex<Option<(Instant, String)>>,
    /// Set while enumeration keeps failing, so the warning is logged once
    failing: AtomicBool,
}

impl DeviceIdentity {
    #[must_use]
    pub fn new(target: &str, cache_ttl: Duration) -> Self {
        Self {
            target: target.to_string(),
            target_lower: target.to_lowercase(),
            cache_ttl,
            cache: Mutex::new(None),
            failing: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Case-insensitive substring match of `device` against the target
    #[must_use]
    pub fn matches(&self, device: &str) -> bool {
        device.to_lowercase().contains(&self.target_lower)
    }

    /// Whether the default device is the target; enumeration failures are inactive
    pub fn is_target_active(&self, local: &impl LocalVolumeSource) -> bool {
        match self.device_name(local) {
            Some(name) => self.matches(&name),
            None => false,
        }
    }

    /// Name of the default device, `None` when it cannot be determined
    pub fn device_name(&self, local: &impl LocalVolumeSource) -> Option<String> {
        let now = Instant::now();
        if let Ok(cache) = self.cache.lock()
            && let Some((at, name)) = cache.as_ref()
            && now.duration_since(*at) < self.cache_ttl
        {
            return Some(name.clone());
        }

        match local.default_device_name() {
            Ok(name) => {
                self.failing.store(false, Ordering::Relaxed);
                if let Ok(mut cache) = self.cache.lock() {
                    if cache.as_ref().is_none_or(|(_, previous)| *previous != name) {
                        debug!("Default playback device: {}", name);
                    }
                    *cache = Some((now, name.clone()));
                }
                Some(name)
            }
            Err(e) => {
                if self.failing.swap(true, Ordering::Relaxed) {
                    debug!("Could not read default playback device: {}", e);
                } else {
                    warn!("Could not read default playback device: {}", e);
                }
                if let Ok(mut cache) = self.cache.lock() {
                    *cache = None;
                }
                None
            }
        }
    }
}
