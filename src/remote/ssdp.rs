//! SSDP discovery (UPnP M-SEARCH over UDP multicast)

use std::collections::HashSet;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::error::DiscoveryError;

pub const SSDP_ADDR_V4: &str = "239.255.255.250:1900";

/// Search target answered by Sonos players
pub const ZONE_PLAYER: &str = "urn:schemas-upnp-org:device:ZonePlayer:1";

/// One device that answered the search
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SsdpDevice {
    pub usn: String,
    pub st: String,
    /// URL of the device description
    pub location: String,
}

/// Multicast an M-SEARCH for `st` and collect answers until `timeout`
///
/// # Errors
/// Returns an error if the UDP socket cannot be bound or used.
pub async fn search(st: &str, timeout: Duration) -> Result<Vec<SsdpDevice>, DiscoveryError> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    // Some platforms reject a multicast TTL; the default still works on a flat LAN
    let _ = socket.set_multicast_ttl_v4(2);

    let mx = timeout.as_secs().clamp(1, 5);
    let request = format!(
        "M-SEARCH * HTTP/1.1\r\n\
HOST: {SSDP_ADDR_V4}\r\n\
MAN: \"ssdp:discover\"\r\n\
MX: {mx}\r\n\
ST: {st}\r\n\
\r\n"
    );
    debug!("SSDP M-SEARCH st={} timeout={:?}", st, timeout);
    socket.send_to(request.as_bytes(), SSDP_ADDR_V4).await?;

    let deadline = Instant::now() + timeout;
    let mut buf = [0u8; 8192];
    let mut devices = Vec::new();
    let mut seen_usn = HashSet::new();

    loop {
        let now = Instant::now();
        if now >= deadline {
            break;
        }

        match tokio::time::timeout(deadline - now, socket.recv_from(&mut buf)).await {
            Ok(Ok((len, from))) => {
                let Some(device) = parse_response(&buf[..len]) else {
                    continue;
                };
                if !device.st.eq_ignore_ascii_case(st) {
                    continue;
                }
                if seen_usn.insert(device.usn.clone()) {
                    trace!("SSDP response from {} location={}", from, device.location);
                    devices.push(device);
                }
            }
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => break,
        }
    }

    debug!("SSDP search found {} device(s)", devices.len());
    Ok(devices)
}

/// Parse an M-SEARCH answer; `None` unless it is a 200 with USN, ST and LOCATION
#[must_use]
pub fn parse_response(bytes: &[u8]) -> Option<SsdpDevice> {
    let text = String::from_utf8_lossy(bytes);
    let mut lines = text.split("\r\n");
    if !lines.next()?.trim().starts_with("HTTP/1.1 200") {
        return None;
    }

    let mut usn = None;
    let mut st = None;
    let mut location = None;

    for line in lines {
        let line = line.trim();
        if line.is_empty() {
            break;
        }
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim().to_string();
        match key.trim().to_ascii_lowercase().as_str() {
            "usn" => usn = Some(value),
            "st" => st = Some(value),
            "location" => location = Some(value),
            _ => {}
        }
    }

    Some(SsdpDevice {
        usn: usn?,
        st: st?,
        location: location?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const SONOS_RESPONSE: &str = "HTTP/1.1 200 OK\r\n\
CACHE-CONTROL: max-age = 1800\r\n\
EXT:\r\n\
LOCATION: http://192.168.1.31:1400/xml/device_description.xml\r\n\
SERVER: Linux UPnP/1.0 Sonos/80.1-55240 (ZPS27)\r\n\
ST: urn:schemas-upnp-org:device:ZonePlayer:1\r\n\
USN: uuid:RINCON_48A6B8E1234501400::urn:schemas-upnp-org:device:ZonePlayer:1\r\n\
X-RINCON-HOUSEHOLD: Sonos_abc\r\n\
\r\n";

    #[test]
    fn test_parse_sonos_response() {
        let device = parse_response(SONOS_RESPONSE.as_bytes()).unwrap();
        assert_eq!(
            device.location,
            "http://192.168.1.31:1400/xml/device_description.xml"
        );
        assert_eq!(device.st, ZONE_PLAYER);
        assert!(device.usn.starts_with("uuid:RINCON_"));
    }

    #[test]
    fn test_notify_is_not_a_response() {
        let notify = "NOTIFY * HTTP/1.1\r\nHOST: 239.255.255.250:1900\r\n\r\n";
        assert_eq!(parse_response(notify.as_bytes()), None);
    }

    #[test]
    fn test_missing_location_rejected() {
        let partial = "HTTP/1.1 200 OK\r\nST: upnp:rootdevice\r\nUSN: uuid:x\r\n\r\n";
        assert_eq!(parse_response(partial.as_bytes()), None);
    }
}
