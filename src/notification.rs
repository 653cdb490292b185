//! Desktop notifications
//!
//! Sent via notify-rust when `notifications_enabled` is set. Icons use
//! `FreeDesktop` standard names picked from the remote volume level.

use color_eyre::eyre::{Context, Result};
use notify_rust::Notification;
use tracing::warn;

/// Send a desktop notification
///
/// # Errors
/// Returns an error if the notification cannot be sent (e.g., no notification daemon running).
pub fn send_notification(summary: &str, body: &str, icon: Option<&str>) -> Result<()> {
    let icon = icon.unwrap_or("audio-speakers");

    Notification::new()
        .summary(summary)
        .body(body)
        .appname("Sonos Volume Sync")
        .icon(icon)
        .timeout(2000)
        .show()
        .context("Failed to show notification")?;

    Ok(())
}

/// Send a notification if enabled, logging failures instead of returning them
pub fn notify_if(enabled: bool, summary: &str, body: &str, icon: Option<&str>) {
    if !enabled {
        return;
    }
    if let Err(e) = send_notification(summary, body, icon) {
        warn!("Notification failed: {:#}", e);
    }
}

/// Pick a `FreeDesktop` volume icon for a level in percent
#[must_use]
pub fn volume_icon(level: u8) -> &'static str {
    match level {
        0 => "audio-volume-muted",
        1..=33 => "audio-volume-low",
        34..=66 => "audio-volume-medium",
        _ => "audio-volume-high",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(0, "audio-volume-muted")]
    #[test_case(1, "audio-volume-low")]
    #[test_case(33, "audio-volume-low")]
    #[test_case(34, "audio-volume-medium")]
    #[test_case(66, "audio-volume-medium")]
    #[test_case(67, "audio-volume-high")]
    #[test_case(100, "audio-volume-high")]
    fn test_volume_icon(level: u8, expected: &str) {
        assert_eq!(volume_icon(level), expected);
    }

    #[test]
    fn test_disabled_notification_is_noop() {
        // Must not touch the notification bus at all
        notify_if(false, "Volume", "42%", None);
    }
}
