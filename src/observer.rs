//! Local volume observer
//!
//! Polls the local output level and reports drift from the pinned level as a
//! signed step count. Runs on a dedicated thread since every read is a
//! blocking tool invocation.

use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::config::LocalSettings;
use crate::error::LocalDeviceError;
use crate::identity::DeviceIdentity;
use crate::keys::{GateMode, KeyGate};
use crate::local::LocalVolumeSource;

/// Signed local level change; one percent point is one step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelativeDelta {
    pub percent: i32,
}

impl RelativeDelta {
    #[must_use]
    pub fn steps(self) -> u32 {
        self.percent.unsigned_abs()
    }
}

/// Drift detection against a pinned reference
pub struct LocalVolumeObserver<L> {
    local: Arc<L>,
    pinned: u8,
    /// Level the next sample is compared against
    reference: u8,
    tolerance: u8,
}

impl<L: LocalVolumeSource> LocalVolumeObserver<L> {
    #[must_use]
    pub fn new(local: Arc<L>, pinned: u8, tolerance: u8) -> Self {
        Self {
            local,
            pinned,
            reference: pinned,
            tolerance,
        }
    }

    #[must_use]
    pub fn reference(&self) -> u8 {
        self.reference
    }

    /// Sample the local level and report drift beyond the tolerance
    ///
    /// The reference moves to the sampled level as soon as drift is reported,
    /// so the same change is never reported twice.
    ///
    /// # Errors
    /// Returns an error if the local level cannot be read.
    pub fn poll(&mut self) -> Result<Option<RelativeDelta>, LocalDeviceError> {
        let current = self.local.volume()?;
        let diff = i32::from(current) - i32::from(self.reference);
        if diff.unsigned_abs() <= u32::from(self.tolerance) {
            return Ok(None);
        }

        trace!("Local level {} (reference {})", current, self.reference);
        self.reference = current;
        Ok(Some(RelativeDelta { percent: diff }))
    }

    /// Write the pinned level back to the local device
    ///
    /// Also used when the target becomes active so that a level difference
    /// that predates activation is not forwarded.
    ///
    /// # Errors
    /// Returns an error if the write fails; the reference is left untouched.
    pub fn repin(&mut self) -> Result<(), LocalDeviceError> {
        self.local.set_volume(self.pinned)?;
        self.reference = self.pinned;
        Ok(())
    }
}

// ============================================================================
// Observer Thread
// ============================================================================

/// What the observer thread reports to the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalEvent {
    /// The default device started or stopped matching the target
    TargetChanged(bool),
    /// The local level moved away from the pinned level
    Drift(RelativeDelta),
}

/// Spawn the polling thread
///
/// Target activity is reported on every change. The level is only pinned and
/// polled while `gate` is active, so in passthrough the local device behaves
/// normally. The thread exits once the receiver is dropped.
///
/// # Errors
/// Returns an error if the thread cannot be spawned.
pub fn spawn_observer_thread<L: LocalVolumeSource>(
    local: Arc<L>,
    identity: DeviceIdentity,
    gate: KeyGate,
    settings: &LocalSettings,
) -> io::Result<mpsc::UnboundedReceiver<LocalEvent>> {
    let (tx, rx) = mpsc::unbounded_channel();
    let observer = LocalVolumeObserver::new(
        Arc::clone(&local),
        settings.pinned_volume,
        settings.tolerance,
    );
    let interval = settings.poll_interval;

    std::thread::Builder::new()
        .name("local-observer".to_string())
        .spawn(move || run_observer(&*local, &identity, &gate, observer, &tx, interval))?;

    Ok(rx)
}

fn run_observer<L: LocalVolumeSource>(
    local: &L,
    identity: &DeviceIdentity,
    gate: &KeyGate,
    mut observer: LocalVolumeObserver<L>,
    tx: &mpsc::UnboundedSender<LocalEvent>,
    interval: Duration,
) {
    let mut target_active = false;
    let mut engaged = false;
    let mut read_failed = false;

    while !tx.is_closed() {
        let now_active = identity.is_target_active(local);
        if now_active != target_active {
            target_active = now_active;
            info!(
                "Target device '{}' {}",
                identity.target(),
                if target_active { "active" } else { "inactive" }
            );
            if tx.send(LocalEvent::TargetChanged(target_active)).is_err() {
                break;
            }
        }

        let now_engaged = target_active && gate.mode() == GateMode::Active;
        if now_engaged && !engaged {
            debug!("Pinning local level at {}%", observer.pinned);
            if let Err(e) = observer.repin() {
                warn!("Failed to pin local level: {}", e);
            }
        }
        engaged = now_engaged;

        if engaged {
            match observer.poll() {
                Ok(Some(delta)) => {
                    debug!("Local drift {:+}", delta.percent);
                    if tx.send(LocalEvent::Drift(delta)).is_err() {
                        break;
                    }
                    if let Err(e) = observer.repin() {
                        warn!("Failed to re-pin local level: {}", e);
                    }
                    read_failed = false;
                }
                Ok(None) => read_failed = false,
                Err(e) => {
                    if !read_failed {
                        warn!("Failed to read local level: {}", e);
                    }
                    read_failed = true;
                }
            }
        }

        std::thread::sleep(interval);
    }

    debug!("Local observer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::FakeLocal;
    use pretty_assertions::assert_eq;

    fn observer(local: &Arc<FakeLocal>) -> LocalVolumeObserver<FakeLocal> {
        LocalVolumeObserver::new(Arc::clone(local), 33, 0)
    }

    #[test]
    fn test_drift_reported_as_signed_steps() {
        let local = Arc::new(FakeLocal::new("Sonos Five", 36));
        let mut observer = observer(&local);

        let delta = observer.poll().unwrap();
        assert_eq!(delta, Some(RelativeDelta { percent: 3 }));
        assert_eq!(delta.unwrap().steps(), 3);
    }

    #[test]
    fn test_same_drift_not_reported_twice() {
        let local = Arc::new(FakeLocal::new("Sonos Five", 30));
        let mut observer = observer(&local);

        assert_eq!(observer.poll().unwrap(), Some(RelativeDelta { percent: -3 }));
        assert_eq!(observer.poll().unwrap(), None);
    }

    #[test]
    fn test_repin_does_not_read_back_as_drift() {
        let local = Arc::new(FakeLocal::new("Sonos Five", 36));
        let mut observer = observer(&local);

        assert!(observer.poll().unwrap().is_some());
        observer.repin().unwrap();

        assert_eq!(local.level(), 33);
        assert_eq!(observer.poll().unwrap(), None);
    }

    #[test]
    fn test_tolerance_absorbs_rounding() {
        let local = Arc::new(FakeLocal::new("Sonos Five", 34));
        let mut observer = LocalVolumeObserver::new(Arc::clone(&local), 33, 1);

        assert_eq!(observer.poll().unwrap(), None);
        local.set_level(35);
        assert_eq!(observer.poll().unwrap(), Some(RelativeDelta { percent: 2 }));
    }

    #[test]
    fn test_failed_repin_keeps_reference() {
        let local = Arc::new(FakeLocal::new("Sonos Five", 40));
        let mut observer = observer(&local);

        assert!(observer.poll().unwrap().is_some());
        local.fail_writes(true);
        assert!(observer.repin().is_err());
        assert_eq!(observer.reference(), 40);
        assert_eq!(observer.poll().unwrap(), None);
    }

    #[tokio::test]
    async fn test_thread_reports_activation_then_drift() {
        let local = Arc::new(FakeLocal::new("Sonos Five", 50));
        let identity = DeviceIdentity::new("Sonos Five", Duration::ZERO);
        let gate = KeyGate::new(GateMode::Active);
        let settings = LocalSettings {
            device_name: "Sonos Five".to_string(),
            pinned_volume: 33,
            tolerance: 0,
            poll_interval: Duration::from_millis(10),
            device_cache: Duration::ZERO,
            key_step: 2,
        };
        let mut events =
            spawn_observer_thread(Arc::clone(&local), identity, gate.clone(), &settings).unwrap();

        assert_eq!(events.recv().await, Some(LocalEvent::TargetChanged(true)));
        // Activation pins without forwarding the pre-existing 50
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(local.level(), 33);

        local.set_level(36);
        assert_eq!(
            events.recv().await,
            Some(LocalEvent::Drift(RelativeDelta { percent: 3 }))
        );
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(local.level(), 33);

        // Passthrough: the local level is left alone
        gate.set(GateMode::Passthrough);
        tokio::time::sleep(Duration::from_millis(30)).await;
        local.set_level(45);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(local.level(), 45);
        assert!(events.try_recv().is_err());
    }
}
