//! Sonos speaker over UPnP SOAP
//!
//! Volume through `RenderingControl` (channel `Master`), transport state and
//! source through `AVTransport`, room name from the device description.
//! Discovery resolves the group coordinator through `ZoneGroupTopology`, since
//! both players of a stereo pair report the same room name.

use async_trait::async_trait;
use roxmltree::Document;
use std::time::Duration;
use tracing::debug;
use url::Url;

use super::ssdp::{self, SsdpDevice};
use super::{Connector, Playback, Speaker};
use crate::error::{DiscoveryError, RemoteError};

const PORT: u16 = 1400;
const HTTP_TIMEOUT: Duration = Duration::from_secs(2);

const RENDERING_CONTROL: &str = "urn:schemas-upnp-org:service:RenderingControl:1";
const RENDERING_CONTROL_PATH: &str = "MediaRenderer/RenderingControl/Control";
const AV_TRANSPORT: &str = "urn:schemas-upnp-org:service:AVTransport:1";
const AV_TRANSPORT_PATH: &str = "MediaRenderer/AVTransport/Control";
const ZONE_GROUP_TOPOLOGY: &str = "urn:schemas-upnp-org:service:ZoneGroupTopology:1";
const ZONE_GROUP_TOPOLOGY_PATH: &str = "ZoneGroupTopology/Control";
const DESCRIPTION_PATH: &str = "xml/device_description.xml";

/// URI scheme of the analog Line-In source
const LINE_IN_PREFIX: &str = "x-rincon-stream:";

// ============================================================================
// Speaker
// ============================================================================

/// A Sonos player reachable over HTTP
#[derive(Debug, Clone)]
pub struct SonosSpeaker {
    name: String,
    address: String,
    base: Url,
    client: reqwest::Client,
}

impl SonosSpeaker {
    async fn soap(
        &self,
        path: &str,
        service: &str,
        action: &str,
        args: &str,
    ) -> Result<String, RemoteError> {
        let url = self
            .base
            .join(path)
            .map_err(|e| RemoteError::Parse {
                action: action.to_string(),
                detail: e.to_string(),
            })?;
        soap_call(&self.client, url.as_str(), service, action, args).await
    }
}

#[async_trait]
impl Speaker for SonosSpeaker {
    fn name(&self) -> &str {
        &self.name
    }

    fn address(&self) -> &str {
        &self.address
    }

    async fn volume(&self) -> Result<u8, RemoteError> {
        let xml = self
            .soap(
                RENDERING_CONTROL_PATH,
                RENDERING_CONTROL,
                "GetVolume",
                "<InstanceID>0</InstanceID><Channel>Master</Channel>",
            )
            .await?;
        parse_u8_from_soap(&xml, "CurrentVolume").ok_or_else(|| RemoteError::Parse {
            action: "GetVolume".to_string(),
            detail: "missing CurrentVolume".to_string(),
        })
    }

    async fn set_volume(&self, level: u8) -> Result<(), RemoteError> {
        let args = format!(
            "<InstanceID>0</InstanceID><Channel>Master</Channel><DesiredVolume>{}</DesiredVolume>",
            level.min(100)
        );
        self.soap(
            RENDERING_CONTROL_PATH,
            RENDERING_CONTROL,
            "SetVolume",
            &args,
        )
        .await?;
        Ok(())
    }

    async fn playback(&self) -> Result<Playback, RemoteError> {
        let transport = self
            .soap(
                AV_TRANSPORT_PATH,
                AV_TRANSPORT,
                "GetTransportInfo",
                "<InstanceID>0</InstanceID>",
            )
            .await?;
        let state = soap_get_text(&transport, "CurrentTransportState").unwrap_or_default();

        let media = self
            .soap(
                AV_TRANSPORT_PATH,
                AV_TRANSPORT,
                "GetMediaInfo",
                "<InstanceID>0</InstanceID>",
            )
            .await?;
        let uri = soap_get_text(&media, "CurrentURI").unwrap_or_default();

        Ok(Playback {
            playing: state == "PLAYING",
            line_in: uri.starts_with(LINE_IN_PREFIX),
        })
    }
}

// ============================================================================
// Connector
// ============================================================================

/// Finds Sonos players by room name (SSDP) or address
#[derive(Debug, Clone)]
pub struct SonosConnector {
    client: reqwest::Client,
}

impl SonosConnector {
    /// # Errors
    /// Returns an error if the HTTP client cannot be built.
    pub fn new() -> Result<Self, RemoteError> {
        let client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .connect_timeout(HTTP_TIMEOUT)
            .build()?;
        Ok(Self { client })
    }

    fn speaker(&self, name: String, base: Url) -> SonosSpeaker {
        let address = base.host_str().unwrap_or_default().to_string();
        SonosSpeaker {
            name,
            address,
            base,
            client: self.client.clone(),
        }
    }

    /// Room name from the device description at `location`
    async fn room_name(&self, location: &Url) -> Result<String, RemoteError> {
        let response = self.client.get(location.clone()).send().await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(RemoteError::Status {
                action: "DeviceDescription".to_string(),
                status: status.as_u16(),
                body: truncate(&body, 200),
            });
        }
        soap_get_text(&body, "roomName").ok_or_else(|| RemoteError::Parse {
            action: "DeviceDescription".to_string(),
            detail: "missing roomName".to_string(),
        })
    }

    /// Raw `ZoneGroupState` document as seen by the player at `base`
    async fn zone_group_state(&self, base: &Url) -> Result<String, RemoteError> {
        let action = "GetZoneGroupState";
        let url = base
            .join(ZONE_GROUP_TOPOLOGY_PATH)
            .map_err(|e| RemoteError::Parse {
                action: action.to_string(),
                detail: e.to_string(),
            })?;
        let xml = soap_call(&self.client, url.as_str(), ZONE_GROUP_TOPOLOGY, action, "").await?;
        soap_get_text(&xml, "ZoneGroupState").ok_or_else(|| RemoteError::Parse {
            action: action.to_string(),
            detail: "missing ZoneGroupState".to_string(),
        })
    }

    async fn describe(&self, device: &SsdpDevice) -> Option<(String, Url)> {
        let location = Url::parse(&device.location).ok()?;
        match self.room_name(&location).await {
            Ok(name) => Some((name, location.join("/").ok()?)),
            Err(e) => {
                debug!("Could not describe {}: {}", device.location, e);
                None
            }
        }
    }
}

#[async_trait]
impl Connector for SonosConnector {
    type Speaker = SonosSpeaker;

    async fn discover(&self, name: &str, timeout: Duration) -> Result<SonosSpeaker, DiscoveryError> {
        let devices = ssdp::search(ssdp::ZONE_PLAYER, timeout).await?;

        let mut seen = Vec::new();
        let mut matched = None;
        for device in &devices {
            let Some((room, base)) = self.describe(device).await else {
                continue;
            };
            if room.eq_ignore_ascii_case(name) {
                matched = Some((room, base));
                break;
            }
            seen.push(room);
        }

        if let Some((room, base)) = matched {
            debug!("Discovered '{}' at {}", room, base);
            match self.zone_group_state(&base).await {
                Ok(state) => {
                    if let Some((leader, leader_base)) = group_coordinator(&state, &room) {
                        if leader_base != base {
                            debug!("Using group coordinator '{}' at {}", leader, leader_base);
                        }
                        return Ok(self.speaker(leader, leader_base));
                    }
                    debug!("'{}' not found in zone group state", room);
                }
                Err(e) => debug!("Could not read zone groups from {}: {}", base, e),
            }
            return Ok(self.speaker(room, base));
        }

        seen.sort();
        seen.dedup();
        Err(DiscoveryError::NotFound {
            name: name.to_string(),
            seen: if seen.is_empty() {
                "no players".to_string()
            } else {
                seen.join(", ")
            },
        })
    }

    async fn connect_address(&self, address: &str) -> Result<SonosSpeaker, RemoteError> {
        let base = base_url(address)?;
        let location = base
            .join(DESCRIPTION_PATH)
            .map_err(|_| DiscoveryError::InvalidAddress(address.to_string()))?;
        let name = self.room_name(&location).await?;

        let speaker = self.speaker(name, base);
        // Description alone does not prove the control endpoint answers
        speaker.volume().await?;
        Ok(speaker)
    }
}

/// Room name and base URL of the coordinator of the group containing `room`
///
/// Accepts both the `<ZoneGroupState><ZoneGroups>` and the bare
/// `<ZoneGroups>` layouts.
fn group_coordinator(state: &str, room: &str) -> Option<(String, Url)> {
    let doc = Document::parse(state).ok()?;
    doc.descendants()
        .filter(|n| n.has_tag_name("ZoneGroup"))
        .find_map(|group| {
            let coordinator = group.attribute("Coordinator")?;
            let members = || {
                group
                    .children()
                    .filter(|n| n.has_tag_name("ZoneGroupMember"))
            };
            let contains_room = members().any(|m| {
                m.attribute("ZoneName")
                    .is_some_and(|zone| zone.eq_ignore_ascii_case(room))
            });
            if !contains_room {
                return None;
            }

            let leader = members().find(|m| m.attribute("UUID") == Some(coordinator))?;
            let location = Url::parse(leader.attribute("Location")?).ok()?;
            let name = leader.attribute("ZoneName").unwrap_or(room).to_string();
            Some((name, location.join("/").ok()?))
        })
}

/// `http://host:1400/` for a bare host, or `http://host:port/` if a port is given
fn base_url(address: &str) -> Result<Url, DiscoveryError> {
    let address = address.trim();
    let invalid = || DiscoveryError::InvalidAddress(address.to_string());
    if address.is_empty() || address.contains('/') {
        return Err(invalid());
    }

    let mut url = Url::parse(&format!("http://{address}/")).map_err(|_| invalid())?;
    if url.port().is_none() {
        url.set_port(Some(PORT)).map_err(|()| invalid())?;
    }
    Ok(url)
}

// ============================================================================
// SOAP
// ============================================================================

async fn soap_call(
    client: &reqwest::Client,
    control_url: &str,
    service: &str,
    action: &str,
    args: &str,
) -> Result<String, RemoteError> {
    let envelope = format!(
        "<?xml version=\"1.0\" encoding=\"utf-8\"?>\
<s:Envelope xmlns:s=\"http://schemas.xmlsoap.org/soap/envelope/\" s:encodingStyle=\"http://schemas.xmlsoap.org/soap/encoding/\">\
<s:Body>\
<u:{action} xmlns:u=\"{service}\">{args}</u:{action}>\
</s:Body>\
</s:Envelope>"
    );

    let response = client
        .post(control_url)
        .header("SOAPACTION", format!("\"{service}#{action}\""))
        .header("CONTENT-TYPE", "text/xml; charset=\"utf-8\"")
        .body(envelope)
        .send()
        .await?;

    let status = response.status();
    let text = response.text().await?;
    if !status.is_success() {
        return Err(RemoteError::Status {
            action: action.to_string(),
            status: status.as_u16(),
            body: truncate(&text, 300),
        });
    }
    Ok(text)
}

fn soap_get_text(xml: &str, tag_local_name: &str) -> Option<String> {
    let doc = Document::parse(xml).ok()?;
    let node = doc
        .descendants()
        .find(|n| n.is_element() && n.tag_name().name() == tag_local_name)?;
    Some(node.text()?.trim().to_string())
}

fn parse_u8_from_soap(xml: &str, tag_local_name: &str) -> Option<u8> {
    soap_get_text(xml, tag_local_name)?.parse::<u8>().ok()
}

fn truncate(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((end, _)) => format!("{}...", &s[..end]),
        None => s.to_string(),
    }
}
