//! Local playback device capability
//!
//! The reconciliation core only sees this trait; the concrete adapter
//! lives in [`crate::pipewire`]. All calls are blocking and are run off the
//! async event loop (observer thread or `spawn_blocking`).

use crate::error::LocalDeviceError;
use crate::keys::Direction;

/// Read and write the default local playback device
pub trait LocalVolumeSource: Send + Sync + 'static {
    /// Friendly name of the current default playback device
    ///
    /// # Errors
    /// Returns an error if the device enumeration API is unavailable.
    fn default_device_name(&self) -> Result<String, LocalDeviceError>;

    /// Current output level in percent (0-100)
    ///
    /// # Errors
    /// Returns an error if the level cannot be read.
    fn volume(&self) -> Result<u8, LocalDeviceError>;

    /// Set the output level in percent (0-100)
    ///
    /// # Errors
    /// Returns an error if the level cannot be written.
    fn set_volume(&self, percent: u8) -> Result<(), LocalDeviceError>;

    /// Mute or unmute the default device
    ///
    /// # Errors
    /// Returns an error if the mute state cannot be written.
    fn set_muted(&self, muted: bool) -> Result<(), LocalDeviceError>;

    /// Move the level by `percent` in `direction` (passthrough key handling)
    ///
    /// # Errors
    /// Returns an error if the level cannot be written.
    fn step_volume(&self, direction: Direction, percent: u8) -> Result<(), LocalDeviceError>;
}
