//! CLI commands
//!
//! `--status` is a one-shot local + remote check that needs no daemon;
//! `key` and `shutdown` talk to a running daemon over IPC.

use color_eyre::eyre::{self, Result};
use crossterm::style::Stylize;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::{Config, StepMode};
use crate::error::RemoteError;
use crate::identity::DeviceIdentity;
use crate::ipc::{self, Request, Response, StatusSnapshot};
use crate::keys::Direction;
use crate::local::LocalVolumeSource;
use crate::pipewire::PipeWire;
use crate::remote::sonos::SonosConnector;
use crate::remote::{Connector, Playback, RemoteVolumeClient, Speaker};
use crate::style::{SyncStyle, yes_no};

// ============================================================================
// Status Check
// ============================================================================

/// Result of the one-shot identity and connectivity check
#[derive(Debug)]
pub struct StatusReport {
    /// Default local playback device, `None` if it could not be read
    pub device: Option<String>,
    pub target_active: bool,
    pub local_volume: Option<u8>,
    pub remote: Result<RemoteReport, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteReport {
    pub name: String,
    pub address: String,
    pub volume: u8,
    pub playback: Option<Playback>,
}

/// Check the local device and the remote speaker once
pub async fn check<L, C>(config: &Config, local: &L, connector: C) -> StatusReport
where
    L: LocalVolumeSource,
    C: Connector,
{
    let identity = DeviceIdentity::new(&config.local.device_name, Duration::ZERO);
    let device = identity.device_name(local);
    let target_active = device.as_deref().is_some_and(|name| identity.matches(name));

    let local_volume = match local.volume() {
        Ok(level) => Some(level),
        Err(e) => {
            warn!("Could not read local level: {}", e);
            None
        }
    };

    let client = RemoteVolumeClient::new(connector, config.remote.clone());
    let remote = query_remote(&client).await.map_err(|e| e.to_string());
    client.release().await;

    StatusReport {
        device,
        target_active,
        local_volume,
        remote,
    }
}

async fn query_remote<C: Connector>(
    client: &RemoteVolumeClient<C>,
) -> Result<RemoteReport, RemoteError> {
    let handle = client.connect().await?;
    let volume = client.get_volume(&handle).await?;
    let playback = match client.playback(&handle).await {
        Ok(playback) => Some(playback),
        Err(e) => {
            debug!("Could not read transport state: {}", e);
            None
        }
    };

    Ok(RemoteReport {
        name: handle.name().to_string(),
        address: handle.address().to_string(),
        volume,
        playback,
    })
}

/// Format uptime in human-readable form
fn format_uptime(secs: u64) -> String {
    const SECS_PER_MINUTE: u64 = 60;
    const SECS_PER_HOUR: u64 = 3600;

    if secs < SECS_PER_MINUTE {
        return format!("{secs}s");
    }
    if secs < SECS_PER_HOUR {
        return format!("{mins}m", mins = secs / SECS_PER_MINUTE);
    }

    let hours = secs / SECS_PER_HOUR;
    let mins = (secs % SECS_PER_HOUR) / SECS_PER_MINUTE;
    if mins > 0 {
        format!("{hours}h {mins}m")
    } else {
        format!("{hours}h")
    }
}

fn section(title: &str) {
    println!("{}", title.header());
    println!("{}", "-".repeat(title.len()));
}

/// Identity and connectivity check (`--status`)
///
/// Exits successfully when the check completed, whether or not the target
/// device is active.
///
/// # Errors
/// Returns an error if the remote speaker cannot be reached.
pub async fn status(config: &Config, config_path: Option<&Path>) -> Result<()> {
    let connector = SonosConnector::new()?;
    let report = check(config, &PipeWire, connector).await;

    section("Configuration");
    println!("{} {}", "Version:".dim(), crate::version());
    let path = match config_path {
        Some(path) => path.display().to_string(),
        None => Config::get_config_path()
            .map_or_else(|_| "(unknown)".to_string(), |p| p.display().to_string()),
    };
    println!("{} {}", "Config:".dim(), path);
    println!(
        "{} {}",
        "Speaker:".dim(),
        config.remote.name.as_str().technical()
    );
    if let Some(address) = &config.remote.address {
        println!("{} {}", "Fallback address:".dim(), address.as_str().technical());
    }
    println!(
        "{} {}",
        "Target device:".dim(),
        config.local.device_name.as_str().technical()
    );
    println!("{} {}%", "Pinned level:".dim(), config.local.pinned_volume);
    let mode = match config.steps.mode {
        StepMode::Linear => format!("linear, {}% per step", config.steps.volume_step),
        StepMode::Exponential { factor } => format!(
            "exponential, {}% per step x{} (cap {}%)",
            config.steps.volume_step, factor, config.steps.max_burst_percent
        ),
    };
    println!("{} {}", "Steps:".dim(), mode);
    println!();

    section("Local Device");
    match &report.device {
        Some(name) => println!("{} {}", "Default:".dim(), name.as_str().bold()),
        None => println!("{} {}", "Default:".dim(), "unknown".warning()),
    }
    println!("{} {}", "Target active:".dim(), yes_no(report.target_active));
    match report.local_volume {
        Some(level) => println!("{} {}%", "Level:".dim(), level),
        None => println!("{} {}", "Level:".dim(), "unknown".warning()),
    }
    println!();

    section("Remote Speaker");
    match &report.remote {
        Ok(remote) => {
            println!("{} {}", "Status:".dim(), "Reachable".success());
            println!("{} {}", "Name:".dim(), remote.name.as_str().bold());
            println!("{} {}", "Address:".dim(), remote.address.as_str().technical());
            println!("{} {}%", "Volume:".dim(), remote.volume);
            if let Some(playback) = remote.playback {
                let state = match (playback.playing, playback.line_in) {
                    (true, true) => "playing (Line-In)",
                    (true, false) => "playing",
                    (false, _) => "idle",
                };
                println!("{} {}", "Playback:".dim(), state);
            }
        }
        Err(e) => println!("{} {}", "Status:".dim(), format!("Unreachable: {e}").error()),
    }
    println!();

    section("Daemon");
    match daemon_status().await {
        Some(daemon) => print_daemon(&daemon),
        None => {
            println!("{} {}", "Status:".dim(), "Not running".warning());
            println!("  Start with: {}", "sonos-volume-sync".technical());
        }
    }

    if let Err(e) = report.remote {
        eyre::bail!("Remote speaker unreachable: {e}");
    }
    Ok(())
}

async fn daemon_status() -> Option<StatusSnapshot> {
    let socket_path = ipc::get_socket_path();
    if !ipc::is_socket_alive(&socket_path).await {
        return None;
    }

    match ipc::send_request_to(&socket_path, Request::Status).await {
        Ok(Response::Status(status)) => Some(status),
        Ok(other) => {
            warn!("Unexpected status response: {:?}", other);
            None
        }
        Err(e) => {
            warn!("Could not query daemon: {:#}", e);
            None
        }
    }
}

fn print_daemon(daemon: &StatusSnapshot) {
    println!(
        "{} {}",
        "Status:".dim(),
        format!("Running (uptime: {})", format_uptime(daemon.uptime_secs)).success()
    );
    println!("{} {}", "Version:".dim(), daemon.version);
    let mode = match daemon.mode.as_str() {
        "active" => daemon.mode.as_str().success(),
        _ => daemon.mode.as_str().warning(),
    };
    println!("{} {}", "Keys:".dim(), mode);
    println!("{} {}", "Phase:".dim(), daemon.phase);
    if let Some(level) = daemon.remote_volume {
        println!("{} {}%", "Remote volume:".dim(), level);
    }
    if daemon.dropped_deltas > 0 {
        println!(
            "{} {}",
            "Dropped changes:".dim(),
            daemon.dropped_deltas.to_string().error()
        );
    }
    if let Some(error) = &daemon.last_error {
        println!("{} {}", "Last error:".dim(), error.as_str().error());
    }
}

// ============================================================================
// IPC-based Commands
// ============================================================================

/// What happened to a key press
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyOutcome {
    /// Queued by the daemon for the remote speaker
    Forwarded,
    /// Applied to the local device
    Local,
}

/// Deliver a volume key press to the daemon, or apply it locally
///
/// # Errors
/// Returns an error if the key falls back to the local device and the local
/// step fails.
pub async fn key(direction: Direction, local_step: u8) -> Result<()> {
    let outcome = key_at(&ipc::get_socket_path(), &PipeWire, direction, local_step).await?;
    debug!("Key {} handled: {:?}", direction, outcome);
    Ok(())
}

/// [`key`] against an explicit socket and local device
///
/// # Errors
/// Returns an error if the local step fails.
pub async fn key_at<L: LocalVolumeSource>(
    socket_path: &Path,
    local: &L,
    direction: Direction,
    local_step: u8,
) -> Result<KeyOutcome> {
    match ipc::send_request_to(socket_path, Request::Key { direction }).await {
        Ok(Response::Forwarded) => return Ok(KeyOutcome::Forwarded),
        Ok(Response::Passthrough { reason }) => debug!("Passthrough: {}", reason),
        Ok(other) => warn!("Unexpected key response: {:?}", other),
        Err(e) => debug!("No daemon took the key, applying locally: {:#}", e),
    }

    local.step_volume(direction, local_step)?;
    Ok(KeyOutcome::Local)
}

/// Gracefully shutdown the daemon
///
/// # Errors
/// Returns an error if no daemon is running or IPC communication fails.
pub async fn shutdown() -> Result<()> {
    if !ipc::is_socket_alive(&ipc::get_socket_path()).await {
        eyre::bail!("Daemon is not running");
    }

    match ipc::send_request(Request::Shutdown).await? {
        Response::Ok { message } => {
            println!("{}", message.success());
            Ok(())
        }
        Response::Error { message } => eyre::bail!("Error: {message}"),
        _ => eyre::bail!("Unexpected response from daemon"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::IpcServer;
    use crate::keys::{GateMode, KeyGate, spawn_key_listener};
    use crate::test_utils::{FakeConnector, FakeLocal, FakeRemote};
    use pretty_assertions::assert_eq;
    use test_case::test_case;
    use tokio::sync::watch;

    fn config() -> Config {
        Config::from_json(
            r#"{
                "sonos_name": "Living Room",
                "windows_device_name": "Sonos Five",
                "sonos_ip": "192.0.2.10",
                "remote_attempts": 1,
                "discovery_timeout_ms": 100
            }"#,
        )
        .unwrap()
    }

    #[test_case(42, "42s")]
    #[test_case(600, "10m")]
    #[test_case(7200, "2h")]
    #[test_case(7260, "2h 1m")]
    fn test_format_uptime(secs: u64, expected: &str) {
        assert_eq!(format_uptime(secs), expected);
    }

    #[tokio::test]
    async fn test_check_reports_match_and_remote() {
        let local = FakeLocal::new("Sonos Five (A2DP)", 33);
        let remote = FakeRemote::new("Living Room", 27);

        let report = check(&config(), &local, FakeConnector::new(&remote)).await;

        assert!(report.target_active);
        assert_eq!(report.device.as_deref(), Some("Sonos Five (A2DP)"));
        assert_eq!(report.local_volume, Some(33));
        let remote = report.remote.unwrap();
        assert_eq!(remote.name, "Living Room");
        assert_eq!(remote.volume, 27);
        assert_eq!(remote.playback, Some(Playback::default()));
    }

    #[tokio::test]
    async fn test_check_inactive_target_still_completes() {
        let local = FakeLocal::new("Headphones", 60);
        local.fail_device_name(true);
        let remote = FakeRemote::new("Living Room", 27);

        let report = check(&config(), &local, FakeConnector::new(&remote)).await;

        assert!(!report.target_active);
        assert_eq!(report.device, None);
        assert!(report.remote.is_ok());
    }

    #[tokio::test]
    async fn test_check_reports_unreachable_remote() {
        let local = FakeLocal::new("Sonos Five", 33);
        let remote = FakeRemote::new("Living Room", 27);
        remote.set_offline(true);

        let report = check(&config(), &local, FakeConnector::new(&remote)).await;

        assert!(report.target_active);
        assert!(report.remote.is_err());
    }

    #[tokio::test]
    async fn test_key_without_daemon_steps_locally() {
        let dir = tempfile::tempdir().unwrap();
        let local = FakeLocal::new("Sonos Five", 33);

        let outcome = key_at(&dir.path().join("none.sock"), &local, Direction::Up, 2)
            .await
            .unwrap();

        assert_eq!(outcome, KeyOutcome::Local);
        assert_eq!(local.steps(), vec![(Direction::Up, 2)]);
        assert_eq!(local.level(), 35);
    }

    #[test_case(GateMode::Active, KeyOutcome::Forwarded ; "active gate")]
    #[test_case(GateMode::Passthrough, KeyOutcome::Local ; "passthrough gate")]
    #[tokio::test]
    async fn test_key_follows_daemon_gate(mode: GateMode, expected: KeyOutcome) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemon.sock");
        let server = IpcServer::bind_at(path.clone()).await.unwrap();
        let (_status_tx, status_rx) = watch::channel(StatusSnapshot::default());
        let _listener = spawn_key_listener(server, KeyGate::new(mode), status_rx);
        let local = FakeLocal::new("Sonos Five", 33);

        let outcome = key_at(&path, &local, Direction::Down, 2).await.unwrap();

        assert_eq!(outcome, expected);
        let stepped = expected == KeyOutcome::Local;
        assert_eq!(local.steps().is_empty(), !stepped);
    }
}
