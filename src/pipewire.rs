//! `PipeWire` adapter for the local playback device
//!
//! Uses `PipeWire` native tools:
//! - `pw-dump`: JSON dump of nodes and the `default` metadata (device name)
//! - `wpctl`: reading and writing the default sink's volume and mute state
//!
//! All required tools must be present in `PATH`.

use serde::Deserialize;
use std::process::Command;
use tracing::{debug, trace};

use crate::error::LocalDeviceError;
use crate::keys::Direction;
use crate::local::LocalVolumeSource;

/// `wpctl` alias for the current default sink
const DEFAULT_SINK: &str = "@DEFAULT_AUDIO_SINK@";

// ============================================================================
// PipeWire JSON Structures (from pw-dump)
// ============================================================================

/// Top-level `PipeWire` object from `pw-dump` output
#[derive(Debug, Deserialize)]
pub struct PwObject {
    pub id: u32,
    #[serde(rename = "type")]
    pub obj_type: String,
    #[serde(default)]
    pub info: Option<PwInfo>,
    #[serde(default)]
    pub props: Option<PwProps>,
    #[serde(default)]
    pub metadata: Option<Vec<PwMetadataEntry>>,
}

impl PwObject {
    /// Get props from either info.props or top-level props (metadata objects use top-level)
    #[must_use]
    pub fn get_props(&self) -> Option<&PwProps> {
        self.info
            .as_ref()
            .and_then(|i| i.props.as_ref())
            .or(self.props.as_ref())
    }
}

#[derive(Debug, Deserialize)]
pub struct PwInfo {
    #[serde(default)]
    pub props: Option<PwProps>,
}

/// `PipeWire` object properties - uses permissive deserialization
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct PwProps {
    #[serde(rename = "node.name")]
    pub node_name: Option<String>,
    #[serde(rename = "node.description")]
    pub node_description: Option<String>,
    #[serde(rename = "node.nick")]
    pub node_nick: Option<String>,
    #[serde(rename = "media.class")]
    pub media_class: Option<String>,
    #[serde(rename = "metadata.name")]
    pub metadata_name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PwMetadataEntry {
    pub key: String,
    #[serde(default)]
    pub value: Option<serde_json::Value>,
}

impl PwMetadataEntry {
    /// Extract sink name from metadata value (object with `name` or plain string)
    #[must_use]
    pub fn get_name(&self) -> Option<String> {
        let value = self.value.as_ref()?;
        if let Some(obj) = value.as_object()
            && let Some(name_val) = obj.get("name")
        {
            return name_val.as_str().map(String::from);
        }
        value.as_str().map(String::from)
    }
}

/// Name of the default sink node, from the `default` metadata object
#[must_use]
pub fn default_sink_node(objects: &[PwObject]) -> Option<String> {
    objects
        .iter()
        .filter(|obj| obj.obj_type == "PipeWire:Interface:Metadata")
        .filter(|obj| {
            obj.get_props()
                .is_some_and(|p| p.metadata_name.as_deref() == Some("default"))
        })
        .filter_map(|obj| obj.metadata.as_ref())
        .flatten()
        .find(|entry| entry.key == "default.audio.sink")
        .and_then(PwMetadataEntry::get_name)
}

/// Human-readable name of the default sink (description, nick, or node name)
#[must_use]
pub fn default_sink_description(objects: &[PwObject]) -> Option<String> {
    let node_name = default_sink_node(objects)?;

    let description = objects
        .iter()
        .filter(|obj| obj.obj_type == "PipeWire:Interface:Node")
        .filter_map(PwObject::get_props)
        .filter(|props| props.media_class.as_deref() == Some("Audio/Sink"))
        .find(|props| props.node_name.as_deref() == Some(node_name.as_str()))
        .and_then(|props| {
            props
                .node_description
                .clone()
                .or_else(|| props.node_nick.clone())
        });

    Some(description.unwrap_or(node_name))
}

/// Parse `wpctl get-volume` output (`Volume: 0.33` or `Volume: 0.33 [MUTED]`)
#[must_use]
pub fn parse_wpctl_volume(output: &str) -> Option<u8> {
    let value = output
        .trim()
        .strip_prefix("Volume:")?
        .split_whitespace()
        .next()?
        .parse::<f64>()
        .ok()?;
    if !value.is_finite() || value < 0.0 {
        return None;
    }
    Some((value * 100.0).round().min(100.0) as u8)
}

// ============================================================================
// Adapter
// ============================================================================

/// `PipeWire` implementation of [`LocalVolumeSource`]
#[derive(Debug, Default, Clone, Copy)]
pub struct PipeWire;

impl PipeWire {
    /// Check that the required tools are installed
    ///
    /// # Errors
    /// Returns an error naming the first missing tool.
    pub fn validate_tools() -> Result<(), LocalDeviceError> {
        for tool in ["pw-dump", "wpctl"] {
            let status = Command::new(tool)
                .arg("--version")
                .output()
                .map_err(|source| LocalDeviceError::Spawn { tool, source })?;
            if !status.status.success() {
                return Err(LocalDeviceError::Command {
                    tool,
                    message: "--version failed".to_string(),
                });
            }
        }
        Ok(())
    }

    /// Get all `PipeWire` objects via `pw-dump`
    ///
    /// # Errors
    /// Returns an error if `pw-dump` fails to execute or returns invalid JSON.
    pub fn dump() -> Result<Vec<PwObject>, LocalDeviceError> {
        let stdout = run("pw-dump", &[])?;
        let objects: Vec<PwObject> =
            serde_json::from_slice(&stdout).map_err(|e| LocalDeviceError::Parse {
                tool: "pw-dump",
                output: e.to_string(),
            })?;
        trace!("pw-dump returned {} objects", objects.len());
        Ok(objects)
    }
}

/// Run a tool and return stdout, mapping failures to [`LocalDeviceError`]
fn run(tool: &'static str, args: &[&str]) -> Result<Vec<u8>, LocalDeviceError> {
    let output = Command::new(tool)
        .args(args)
        .output()
        .map_err(|source| LocalDeviceError::Spawn { tool, source })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(LocalDeviceError::Command {
            tool,
            message: stderr.trim().to_string(),
        });
    }
    Ok(output.stdout)
}

impl LocalVolumeSource for PipeWire {
    fn default_device_name(&self) -> Result<String, LocalDeviceError> {
        let objects = Self::dump()?;
        default_sink_description(&objects).ok_or(LocalDeviceError::NoDefaultDevice)
    }

    fn volume(&self) -> Result<u8, LocalDeviceError> {
        let stdout = run("wpctl", &["get-volume", DEFAULT_SINK])?;
        let text = String::from_utf8_lossy(&stdout);
        parse_wpctl_volume(&text).ok_or_else(|| LocalDeviceError::Parse {
            tool: "wpctl",
            output: text.trim().to_string(),
        })
    }

    fn set_volume(&self, percent: u8) -> Result<(), LocalDeviceError> {
        let level = format!("{:.2}", f64::from(percent.min(100)) / 100.0);
        run("wpctl", &["set-volume", DEFAULT_SINK, &level])?;
        debug!("Local volume set to {}%", percent);
        Ok(())
    }

    fn set_muted(&self, muted: bool) -> Result<(), LocalDeviceError> {
        run("wpctl", &["set-mute", DEFAULT_SINK, if muted { "1" } else { "0" }])?;
        debug!("Local mute set to {}", muted);
        Ok(())
    }

    fn step_volume(&self, direction: Direction, percent: u8) -> Result<(), LocalDeviceError> {
        let sign = match direction {
            Direction::Up => '+',
            Direction::Down => '-',
        };
        let step = format!("{percent}%{sign}");
        run("wpctl", &["set-volume", "-l", "1.0", DEFAULT_SINK, &step])?;
        debug!("Local volume stepped {}", step);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    const DUMP_JSON: &str = r#"[
        {
            "id": 0,
            "type": "PipeWire:Interface:Metadata",
            "props": {
                "metadata.name": "default"
            },
            "metadata": [
                {
                    "key": "default.audio.sink",
                    "value": {"name": "alsa_output.usb-Sonos_Five.analog-stereo"}
                }
            ]
        },
        {
            "id": 41,
            "type": "PipeWire:Interface:Node",
            "info": {
                "props": {
                    "node.name": "alsa_output.pci.hdmi-stereo",
                    "node.description": "HDMI Output",
                    "media.class": "Audio/Sink"
                }
            }
        },
        {
            "id": 42,
            "type": "PipeWire:Interface:Node",
            "info": {
                "props": {
                    "node.name": "alsa_output.usb-Sonos_Five.analog-stereo",
                    "node.description": "Sonos Five Analog Stereo",
                    "media.class": "Audio/Sink"
                }
            }
        }
    ]"#;

    const STRING_METADATA_JSON: &str = r#"[
        {
            "id": 0,
            "type": "PipeWire:Interface:Metadata",
            "props": {
                "metadata.name": "default"
            },
            "metadata": [
                {
                    "key": "default.audio.sink",
                    "value": "alsa_output.missing"
                }
            ]
        }
    ]"#;

    #[test]
    fn test_default_sink_node_object_format() {
        let objects: Vec<PwObject> = serde_json::from_str(DUMP_JSON).unwrap();
        assert_eq!(
            default_sink_node(&objects).as_deref(),
            Some("alsa_output.usb-Sonos_Five.analog-stereo")
        );
    }

    #[test]
    fn test_default_sink_description_prefers_description() {
        let objects: Vec<PwObject> = serde_json::from_str(DUMP_JSON).unwrap();
        assert_eq!(
            default_sink_description(&objects).as_deref(),
            Some("Sonos Five Analog Stereo")
        );
    }

    #[test]
    fn test_default_sink_description_falls_back_to_node_name() {
        let objects: Vec<PwObject> = serde_json::from_str(STRING_METADATA_JSON).unwrap();
        assert_eq!(
            default_sink_description(&objects).as_deref(),
            Some("alsa_output.missing")
        );
    }

    #[test]
    fn test_no_metadata_means_no_default() {
        let objects: Vec<PwObject> = serde_json::from_str("[]").unwrap();
        assert_eq!(default_sink_description(&objects), None);
    }

    #[test_case("Volume: 0.33", Some(33))]
    #[test_case("Volume: 0.33 [MUTED]\n", Some(33))]
    #[test_case("Volume: 1.00", Some(100))]
    #[test_case("Volume: 1.50", Some(100) ; "boosted above unity")]
    #[test_case("Volume: 0.355", Some(36) ; "rounds to nearest")]
    #[test_case("Volume: abc", None)]
    #[test_case("", None)]
    fn test_parse_wpctl_volume(output: &str, expected: Option<u8>) {
        assert_eq!(parse_wpctl_volume(output), expected);
    }
}
