pub mod chromecast;
pub mod dlna;

use std::collections::HashSet;
use std::fmt;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use mdns_sd::{ServiceDaemon, ServiceEvent};
use serde::Deserialize;
use tokio::net::UdpSocket;
use tracing::{debug, warn};
use url::Url;

use crate::media::ContentType;

pub use chromecast::ChromecastDevice;
pub use dlna::DlnaDevice;

const SSDP_MULTICAST: (&str, u16) = ("239.255.255.250", 1900);
const MEDIA_RENDERER_ST: &str = "urn:schemas-upnp-org:device:MediaRenderer:1";
const GOOGLECAST_SERVICE: &str = "_googlecast._tcp.local.";

/// The kind of casting device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Dlna,
    Chromecast,
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceKind::Dlna => f.write_str("dlna"),
            DeviceKind::Chromecast => f.write_str("chromecast"),
        }
    }
}

/// Discovery result for a device on the local network.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub name: String,
    pub kind: DeviceKind,
    /// DLNA: description (LOCATION) URL. Chromecast: IP address.
    pub address: String,
}

/**
    A connected casting device. Dispatch is a tagged variant built at
    discovery time; adding a device type is a new variant plus its driver.
*/
pub enum Device {
    Dlna(DlnaDevice),
    Chromecast(ChromecastDevice),
}

impl Device {
    pub fn new(info: DeviceInfo) -> Self {
        match info.kind {
            DeviceKind::Dlna => Device::Dlna(DlnaDevice::new(info)),
            DeviceKind::Chromecast => Device::Chromecast(ChromecastDevice::new(info)),
        }
    }

    pub async fn connect(&mut self) -> Result<()> {
        match self {
            Device::Dlna(d) => d.connect().await,
            Device::Chromecast(d) => d.connect(),
        }
    }

    pub async fn play(&mut self, stream_url: &Url, content_type: ContentType) -> Result<()> {
        match self {
            Device::Dlna(d) => d.play(stream_url, content_type).await,
            Device::Chromecast(d) => d.play(stream_url, content_type),
        }
    }

    pub fn supported_content_types(&self) -> &'static [ContentType] {
        match self {
            Device::Dlna(_) => dlna::SUPPORTED_CONTENT_TYPES,
            Device::Chromecast(_) => chromecast::SUPPORTED_CONTENT_TYPES,
        }
    }

    pub fn close(&mut self) {
        match self {
            Device::Dlna(d) => d.close(),
            Device::Chromecast(d) => d.close(),
        }
    }
}

/// Discover a specific device by kind and name (case-insensitive).
pub async fn find_info(
    local_ip: IpAddr,
    timeout: Duration,
    kind: DeviceKind,
    name: &str,
) -> Result<DeviceInfo> {
    let devices = discover(local_ip, timeout).await?;

    devices
        .into_iter()
        .find(|d| d.kind == kind && d.name.eq_ignore_ascii_case(name))
        .ok_or_else(|| anyhow!("device {name:?} (type {kind}) not found"))
}

/// Scan the local network for DLNA renderers and Chromecasts.
pub async fn discover(local_ip: IpAddr, timeout: Duration) -> Result<Vec<DeviceInfo>> {
    let (dlna, cast) = tokio::join!(
        discover_dlna(local_ip, timeout),
        discover_chromecast(timeout),
    );

    let mut devices = Vec::new();
    match dlna {
        Ok(found) => devices.extend(found),
        Err(err) => warn!(error = %err, "dlna discovery failed"),
    }
    match cast {
        Ok(found) => devices.extend(found),
        Err(err) => warn!(error = %err, "chromecast discovery failed"),
    }

    Ok(devices)
}

/**
    SSDP M-SEARCH for MediaRenderer devices: multicast the search from the
    configured interface, collect LOCATION URLs until the window closes,
    then fetch each description for its friendly name.
*/
async fn discover_dlna(local_ip: IpAddr, timeout: Duration) -> Result<Vec<DeviceInfo>> {
    let socket = UdpSocket::bind((local_ip, 0))
        .await
        .context("binding SSDP socket")?;

    let msearch = format!(
        "M-SEARCH * HTTP/1.1\r\n\
         HOST: {}:{}\r\n\
         MAN: \"ssdp:discover\"\r\n\
         MX: 2\r\n\
         ST: {MEDIA_RENDERER_ST}\r\n\r\n",
        SSDP_MULTICAST.0, SSDP_MULTICAST.1
    );
    socket
        .send_to(msearch.as_bytes(), SSDP_MULTICAST)
        .await
        .context("sending M-SEARCH")?;

    let mut locations: HashSet<String> = HashSet::new();
    let deadline = Instant::now() + timeout;
    let mut buf = [0u8; 2048];

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        let received = tokio::time::timeout(remaining, socket.recv_from(&mut buf)).await;
        let Ok(Ok((n, _))) = received else { break };

        let response = String::from_utf8_lossy(&buf[..n]);
        if let Some(location) = ssdp_location(&response) {
            locations.insert(location);
        }
    }

    let mut devices = Vec::new();
    for location in locations {
        match dlna::fetch_description(&location).await {
            Ok(description) => devices.push(DeviceInfo {
                name: description.friendly_name,
                kind: DeviceKind::Dlna,
                address: location,
            }),
            Err(err) => debug!(location, error = %err, "skipping renderer"),
        }
    }

    Ok(devices)
}

fn ssdp_location(response: &str) -> Option<String> {
    response.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        if key.trim().eq_ignore_ascii_case("location") {
            let value = value.trim();
            (!value.is_empty()).then(|| value.to_string())
        } else {
            None
        }
    })
}

/// mDNS browse for `_googlecast._tcp`; the `fn` TXT property carries the
/// user-visible device name.
async fn discover_chromecast(timeout: Duration) -> Result<Vec<DeviceInfo>> {
    tokio::task::spawn_blocking(move || {
        let daemon = ServiceDaemon::new().context("starting mdns daemon")?;
        let receiver = daemon
            .browse(GOOGLECAST_SERVICE)
            .context("browsing for chromecasts")?;

        let mut devices = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        let deadline = Instant::now() + timeout;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            let Ok(event) = receiver.recv_timeout(remaining) else {
                break;
            };

            if let ServiceEvent::ServiceResolved(info) = event {
                let Some(address) = info.get_addresses().iter().next().map(|a| a.to_string())
                else {
                    continue;
                };
                if !seen.insert(address.clone()) {
                    continue;
                }
                let name = info
                    .get_property_val_str("fn")
                    .unwrap_or_else(|| info.get_fullname())
                    .to_string();
                devices.push(DeviceInfo {
                    name,
                    kind: DeviceKind::Chromecast,
                    address,
                });
            }
        }

        let _ = daemon.shutdown();
        Ok(devices)
    })
    .await
    .context("chromecast discovery task")?
}

/// First non-loopback IPv4 address of the named interface.
pub fn local_ip(interface: &str) -> Result<IpAddr> {
    let addrs = if_addrs::get_if_addrs().context("listing network interfaces")?;

    addrs
        .into_iter()
        .filter(|a| a.name == interface)
        .map(|a| a.ip())
        .find(|ip| ip.is_ipv4() && !ip.is_loopback())
        .ok_or_else(|| anyhow!("no IPv4 address on interface {interface:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ssdp_location_is_case_insensitive() {
        let response = "HTTP/1.1 200 OK\r\n\
                        CACHE-CONTROL: max-age=1800\r\n\
                        Location: http://192.168.1.20:8200/rootDesc.xml\r\n\
                        ST: urn:schemas-upnp-org:device:MediaRenderer:1\r\n\r\n";
        assert_eq!(
            ssdp_location(response).as_deref(),
            Some("http://192.168.1.20:8200/rootDesc.xml")
        );
    }

    #[test]
    fn ssdp_location_missing() {
        assert_eq!(ssdp_location("HTTP/1.1 200 OK\r\nST: x\r\n\r\n"), None);
    }

    #[test]
    fn device_kind_parses_from_config() {
        #[derive(Deserialize)]
        struct Wrapper {
            kind: DeviceKind,
        }
        let w: Wrapper = serde_yaml::from_str("kind: chromecast").unwrap();
        assert_eq!(w.kind, DeviceKind::Chromecast);
        assert_eq!(w.kind.to_string(), "chromecast");
    }
}
