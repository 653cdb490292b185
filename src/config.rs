//! Configuration management
//!
//! Handles loading, parsing, and validating the JSON configuration file.
//! Keys mirror the original Sonos volume sync config; tunables for the
//! reconciliation engine are optional and default to conservative values.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

use crate::error::ConfigError;

const APP_DIR: &str = "sonos-volume-sync";
const CONFIG_FILE: &str = "config.json";
const DEFAULT_SONOS_NAME: &str = "Sonos Five";

/// Local step applied by `key` when no config can be loaded
pub const DEFAULT_KEY_STEP: u8 = 2;

// ============================================================================
// Public Configuration Types
// ============================================================================

/// Main configuration structure
#[derive(Debug, Clone)]
pub struct Config {
    pub remote: RemoteSettings,
    pub local: LocalSettings,
    pub steps: StepSettings,
    pub settings: Settings,
}

/// Where the remote speaker lives and how hard to try reaching it
#[derive(Debug, Clone)]
pub struct RemoteSettings {
    /// Room name of the Sonos player (matched case-insensitively)
    pub name: String,
    /// Optional static address, used when discovery fails
    pub address: Option<String>,
    pub attempts: u32,
    pub discovery_timeout: Duration,
    pub reconnect_interval: Duration,
}

/// Local playback device and pinning
#[derive(Debug, Clone)]
pub struct LocalSettings {
    /// Substring of the default device's name that marks the target as active
    pub device_name: String,
    pub pinned_volume: u8,
    /// Drift (percent points) ignored as rounding noise
    pub tolerance: u8,
    pub poll_interval: Duration,
    pub device_cache: Duration,
    /// Percent points one key press moves the local level in passthrough
    pub key_step: u8,
}

/// How intents become remote deltas
#[derive(Debug, Clone)]
pub struct StepSettings {
    pub volume_step: f64,
    pub mode: StepMode,
    pub aggregation_window: Duration,
    pub burst_reset: Duration,
    /// A burst still receiving events is closed once it is this old
    pub max_burst_age: Duration,
    pub max_burst_percent: u8,
    pub echo_window: Duration,
    /// Percent points a counted key press may echo on the local level
    pub key_echo: u8,
    pub flush_retries: u32,
    pub retry_delay: Duration,
}

/// Step growth for consecutive bursts
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StepMode {
    Linear,
    Exponential { factor: f64 },
}

/// Global toggles
#[derive(Debug, Clone)]
pub struct Settings {
    pub notifications_enabled: bool,
    pub debug_logging: bool,
    pub log_level: String,
    pub mute_during_remote_playback: bool,
    pub remote_poll: Duration,
    pub shutdown_timeout: Duration,
}

// ============================================================================
// Config File Deserialization (JSON)
// ============================================================================

#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
struct ConfigFile {
    sonos_name: Option<String>,
    #[serde(alias = "local_device_name")]
    windows_device_name: Option<String>,
    sonos_ip: Option<String>,
    pinned_volume: i64,
    volume_step: f64,
    use_exponential: bool,
    exponential_factor: f64,
    notifications_enabled: bool,
    debug_logging: bool,
    log_level: String,
    aggregation_window_ms: u64,
    burst_reset_ms: u64,
    max_burst_age_ms: u64,
    max_burst_percent: u8,
    poll_interval_ms: u64,
    device_cache_ms: u64,
    tolerance: u8,
    local_key_step: u8,
    key_echo_percent: u8,
    echo_window_ms: u64,
    remote_attempts: u32,
    flush_retries: u32,
    retry_delay_ms: u64,
    discovery_timeout_ms: u64,
    reconnect_interval_ms: u64,
    mute_during_remote_playback: bool,
    remote_poll_ms: u64,
    shutdown_timeout_ms: u64,
}

impl Default for ConfigFile {
    fn default() -> Self {
        Self {
            sonos_name: None,
            windows_device_name: None,
            sonos_ip: None,
            pinned_volume: 33,
            volume_step: 1.0,
            use_exponential: false,
            exponential_factor: 1.5,
            notifications_enabled: false,
            debug_logging: false,
            log_level: "info".to_string(),
            aggregation_window_ms: 200,
            burst_reset_ms: 600,
            max_burst_age_ms: 1000,
            max_burst_percent: 10,
            poll_interval_ms: 100,
            device_cache_ms: 200,
            tolerance: 0,
            local_key_step: DEFAULT_KEY_STEP,
            key_echo_percent: 0,
            echo_window_ms: 500,
            remote_attempts: 3,
            flush_retries: 2,
            retry_delay_ms: 500,
            discovery_timeout_ms: 3000,
            reconnect_interval_ms: 10_000,
            mute_during_remote_playback: true,
            remote_poll_ms: 500,
            shutdown_timeout_ms: 3000,
        }
    }
}

/// Read a non-empty environment variable
fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn nonempty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

// ============================================================================
// Config Implementation
// ============================================================================

impl Config {
    /// Load configuration from `path`, or from the default XDG path
    ///
    /// When the default file does not exist yet, a default config is written
    /// and [`ConfigError::Created`] is returned so the user can review it.
    ///
    /// # Errors
    /// Returns an error if the file is missing, unreadable, malformed, or invalid.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = path {
            return Self::load_from_path(path);
        }

        let config_path = Self::get_config_path()?;
        if !config_path.exists() {
            info!("Creating default config at {:?}", config_path);
            Self::create_default_config(&config_path)?;
            return Err(ConfigError::Created(config_path));
        }

        Self::load_from_path(&config_path)
    }

    /// Load and validate configuration from an explicit path
    ///
    /// # Errors
    /// Returns an error if the file is missing, unreadable, malformed, or invalid.
    pub fn load_from_path(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }

        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        Self::from_json(&contents).map_err(|e| match e {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            },
            other => other,
        })
    }

    /// Parse and validate configuration from a JSON string
    ///
    /// # Errors
    /// Returns an error if the JSON is malformed or a value is out of range.
    pub fn from_json(contents: &str) -> Result<Self, ConfigError> {
        let config_file: ConfigFile =
            serde_json::from_str(contents).map_err(|source| ConfigError::Parse {
                path: PathBuf::new(),
                source,
            })?;
        Self::from_config_file(config_file)
    }

    fn from_config_file(file: ConfigFile) -> Result<Self, ConfigError> {
        let name = nonempty(file.sonos_name)
            .or_else(|| env_nonempty("SONOS_NAME"))
            .unwrap_or_else(|| DEFAULT_SONOS_NAME.to_string());
        let address = nonempty(file.sonos_ip).or_else(|| env_nonempty("SONOS_IP"));
        let device_name = nonempty(file.windows_device_name).unwrap_or_else(|| name.clone());

        if !(0..=99).contains(&file.pinned_volume) {
            return Err(ConfigError::Invalid(format!(
                "pinned_volume must be between 0 and 99 (got {}); 100 leaves no headroom to detect volume up",
                file.pinned_volume
            )));
        }
        if file.pinned_volume == 0 {
            warn!("pinned_volume = 0 leaves no headroom to detect volume down");
        }
        if !file.volume_step.is_finite() || file.volume_step <= 0.0 {
            return Err(ConfigError::Invalid(format!(
                "volume_step must be greater than 0 (got {})",
                file.volume_step
            )));
        }
        if file.use_exponential
            && (!file.exponential_factor.is_finite() || file.exponential_factor <= 1.0)
        {
            return Err(ConfigError::Invalid(format!(
                "exponential_factor must be greater than 1 (got {})",
                file.exponential_factor
            )));
        }

        let mode = if file.use_exponential {
            StepMode::Exponential {
                factor: file.exponential_factor,
            }
        } else {
            StepMode::Linear
        };

        let config = Config {
            remote: RemoteSettings {
                name,
                address,
                attempts: file.remote_attempts,
                discovery_timeout: Duration::from_millis(file.discovery_timeout_ms),
                reconnect_interval: Duration::from_millis(file.reconnect_interval_ms),
            },
            local: LocalSettings {
                device_name,
                pinned_volume: file.pinned_volume as u8,
                tolerance: file.tolerance,
                poll_interval: Duration::from_millis(file.poll_interval_ms),
                device_cache: Duration::from_millis(file.device_cache_ms),
                key_step: file.local_key_step,
            },
            steps: StepSettings {
                volume_step: file.volume_step,
                mode,
                aggregation_window: Duration::from_millis(file.aggregation_window_ms),
                burst_reset: Duration::from_millis(file.burst_reset_ms),
                max_burst_age: Duration::from_millis(file.max_burst_age_ms),
                max_burst_percent: file.max_burst_percent,
                echo_window: Duration::from_millis(file.echo_window_ms),
                key_echo: file.key_echo_percent,
                flush_retries: file.flush_retries,
                retry_delay: Duration::from_millis(file.retry_delay_ms),
            },
            settings: Settings {
                notifications_enabled: file.notifications_enabled,
                debug_logging: file.debug_logging,
                log_level: file.log_level,
                mute_during_remote_playback: file.mute_during_remote_playback,
                remote_poll: Duration::from_millis(file.remote_poll_ms),
                shutdown_timeout: Duration::from_millis(file.shutdown_timeout_ms),
            },
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        match self.settings.log_level.as_str() {
            "error" | "warn" | "info" | "debug" | "trace" => {}
            level => {
                return Err(ConfigError::Invalid(format!(
                    "Invalid log_level '{level}'. Must be: error, warn, info, debug, or trace"
                )));
            }
        }

        if self.local.device_name.is_empty() {
            return Err(ConfigError::Invalid(
                "windows_device_name must not be empty".to_string(),
            ));
        }
        if !(1..=100).contains(&self.local.key_step) {
            return Err(ConfigError::Invalid(format!(
                "local_key_step must be between 1 and 100 (got {})",
                self.local.key_step
            )));
        }
        if self.steps.key_echo > 100 {
            return Err(ConfigError::Invalid(format!(
                "key_echo_percent must be between 0 and 100 (got {})",
                self.steps.key_echo
            )));
        }
        if !(1..=100).contains(&self.steps.max_burst_percent) {
            return Err(ConfigError::Invalid(format!(
                "max_burst_percent must be between 1 and 100 (got {})",
                self.steps.max_burst_percent
            )));
        }
        if self.steps.aggregation_window.is_zero() {
            return Err(ConfigError::Invalid(
                "aggregation_window_ms must be greater than 0".to_string(),
            ));
        }
        if self.steps.max_burst_age < self.steps.aggregation_window {
            return Err(ConfigError::Invalid(
                "max_burst_age_ms must not be shorter than aggregation_window_ms".to_string(),
            ));
        }
        if self.local.poll_interval < Duration::from_millis(10) {
            return Err(ConfigError::Invalid(
                "poll_interval_ms must be at least 10".to_string(),
            ));
        }
        if self.remote.attempts == 0 {
            return Err(ConfigError::Invalid(
                "remote_attempts must be at least 1".to_string(),
            ));
        }
        if self.remote.reconnect_interval.is_zero() || self.settings.remote_poll.is_zero() {
            return Err(ConfigError::Invalid(
                "reconnect_interval_ms and remote_poll_ms must be greater than 0".to_string(),
            ));
        }
        if self.remote.discovery_timeout < Duration::from_millis(100) {
            return Err(ConfigError::Invalid(
                "discovery_timeout_ms must be at least 100".to_string(),
            ));
        }
        if let Some(address) = &self.remote.address
            && address.contains(char::is_whitespace)
        {
            return Err(ConfigError::Invalid(format!(
                "sonos_ip '{address}' is not a valid address"
            )));
        }

        Ok(())
    }

    /// Get the XDG config path for sonos-volume-sync
    ///
    /// # Errors
    /// Returns an error if the config directory cannot be determined.
    pub fn get_config_path() -> Result<PathBuf, ConfigError> {
        let config_dir = dirs::config_dir()
            .ok_or(ConfigError::NoConfigDir)?
            .join(APP_DIR);
        Ok(config_dir.join(CONFIG_FILE))
    }

    fn create_default_config(path: &Path) -> Result<(), ConfigError> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).map_err(|source| ConfigError::Write {
                path: dir.to_path_buf(),
                source,
            })?;
        }

        let defaults = ConfigFile {
            sonos_name: Some(DEFAULT_SONOS_NAME.to_string()),
            windows_device_name: Some(DEFAULT_SONOS_NAME.to_string()),
            ..ConfigFile::default()
        };
        let json = serde_json::to_string_pretty(&defaults).map_err(|source| {
            ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            }
        })?;

        fs::write(path, json).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })?;

        eprintln!("Created default config at: {path:?}");
        eprintln!();
        eprintln!("Next steps:");
        eprintln!("  1. Set sonos_name to the room name of your speaker");
        eprintln!("  2. Set windows_device_name to (part of) your playback device name");
        eprintln!("  3. Run 'sonos-volume-sync --status' to check the setup");
        eprintln!("  4. Run 'sonos-volume-sync' to start");
        eprintln!();

        Ok(())
    }

    /// Print a human-readable summary of the configuration
    pub fn print_summary(&self) {
        println!("✓ Configuration valid\n");

        println!("Remote:");
        println!("  sonos_name: {}", self.remote.name);
        println!(
            "  sonos_ip: {}",
            self.remote.address.as_deref().unwrap_or("(discovery)")
        );
        println!("  discovery_timeout: {:?}", self.remote.discovery_timeout);

        println!("\nLocal:");
        println!("  windows_device_name: {}", self.local.device_name);
        println!("  pinned_volume: {}%", self.local.pinned_volume);
        println!("  poll_interval: {:?}", self.local.poll_interval);
        println!("  local_key_step: {}%", self.local.key_step);

        println!("\nSteps:");
        println!("  volume_step: {}", self.steps.volume_step);
        println!(
            "  key_echo_percent: {}% within {:?}",
            self.steps.key_echo, self.steps.echo_window
        );
        match self.steps.mode {
            StepMode::Linear => println!("  mode: linear"),
            StepMode::Exponential { factor } => {
                println!("  mode: exponential (factor {factor}, cap {}%)", self.steps.max_burst_percent);
            }
        }
        println!("  aggregation_window: {:?}", self.steps.aggregation_window);
        println!("  burst_reset: {:?}", self.steps.burst_reset);

        println!("\nSettings:");
        println!("  notifications_enabled: {}", self.settings.notifications_enabled);
        println!("  debug_logging: {}", self.settings.debug_logging);
        println!("  log_level: {}", self.settings.log_level);
        println!(
            "  mute_during_remote_playback: {}",
            self.settings.mute_during_remote_playback
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    #[test]
    fn test_empty_object_uses_defaults() {
        let config = Config::from_json(r#"{"sonos_name": "Kitchen"}"#).unwrap();
        assert_eq!(config.remote.name, "Kitchen");
        assert_eq!(config.local.device_name, "Kitchen");
        assert_eq!(config.local.pinned_volume, 33);
        assert_eq!(config.steps.mode, StepMode::Linear);
        assert_eq!(config.steps.aggregation_window, Duration::from_millis(200));
        assert_eq!(config.remote.attempts, 3);
    }

    #[test]
    fn test_device_name_alias() {
        let config =
            Config::from_json(r#"{"sonos_name": "Den", "local_device_name": "USB Audio"}"#)
                .unwrap();
        assert_eq!(config.local.device_name, "USB Audio");
    }

    #[test]
    fn test_exponential_mode() {
        let config = Config::from_json(
            r#"{"sonos_name": "Den", "use_exponential": true, "exponential_factor": 2.0}"#,
        )
        .unwrap();
        assert_eq!(config.steps.mode, StepMode::Exponential { factor: 2.0 });
    }

    #[test]
    fn test_key_echo_is_independent_of_key_step() {
        let config = Config::from_json(r#"{"sonos_name": "Den", "local_key_step": 5}"#).unwrap();
        assert_eq!(config.local.key_step, 5);
        assert_eq!(config.steps.key_echo, 0);

        let config = Config::from_json(
            r#"{"sonos_name": "Den", "local_key_step": 5, "key_echo_percent": 2}"#,
        )
        .unwrap();
        assert_eq!(config.steps.key_echo, 2);
    }

    #[test_case(r#"{"pinned_volume": 100}"# ; "pinned at 100")]
    #[test_case(r#"{"pinned_volume": -1}"# ; "pinned negative")]
    #[test_case(r#"{"volume_step": 0}"# ; "zero step")]
    #[test_case(r#"{"use_exponential": true, "exponential_factor": 1.0}"# ; "flat factor")]
    #[test_case(r#"{"log_level": "loud"}"# ; "bad log level")]
    #[test_case(r#"{"remote_attempts": 0}"# ; "no attempts")]
    #[test_case(r#"{"poll_interval_ms": 1}"# ; "poll too fast")]
    #[test_case(r#"{"local_key_step": 0}"# ; "zero key step")]
    #[test_case(r#"{"key_echo_percent": 101}"# ; "echo above 100")]
    #[test_case(r#"{"aggregation_window_ms": 0}"# ; "zero window")]
    #[test_case(r#"{"aggregation_window_ms": 500, "max_burst_age_ms": 100}"# ; "burst age below window")]
    #[test_case(r#"{"remote_poll_ms": 0}"# ; "zero remote poll")]
    fn test_invalid_values_rejected(json: &str) {
        let result = Config::from_json(json);
        assert!(matches!(result, Err(ConfigError::Invalid(_))), "{result:?}");
    }

    #[test]
    fn test_malformed_json_is_parse_error() {
        let result = Config::from_json("{ pinned_volume: 33 ");
        assert!(matches!(result, Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_unknown_keys_ignored() {
        let config = Config::from_json(r#"{"sonos_name": "Den", "tray_icon": true}"#).unwrap();
        assert_eq!(config.remote.name, "Den");
    }

    #[test]
    fn test_first_load_writes_default_config() {
        let xdg = crate::test_utils::XdgTemp::new();
        let expected = xdg.path().join(APP_DIR).join(CONFIG_FILE);

        let first = Config::load(None);
        assert!(matches!(&first, Err(ConfigError::Created(path)) if *path == expected));
        assert!(expected.exists());

        let config = Config::load(None).unwrap();
        assert_eq!(config.local.pinned_volume, 33);
        assert_eq!(config.local.key_step, DEFAULT_KEY_STEP);
    }

    #[test]
    fn test_blank_address_treated_as_missing() {
        let config = Config::from_json(r#"{"sonos_name": "Den", "sonos_ip": "  "}"#).unwrap();
        // SONOS_IP may be set in the environment running the tests
        assert_ne!(config.remote.address.as_deref(), Some("  "));
    }
}
