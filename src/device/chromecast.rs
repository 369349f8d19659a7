use anyhow::{Context, Result, anyhow};
use rust_cast::CastDevice;
use rust_cast::channels::media::{Media, StreamType};
use rust_cast::channels::receiver::CastDeviceApp;
use tracing::debug;
use url::Url;

use super::DeviceInfo;
use crate::media::ContentType;

/// Content types the default media receiver plays without transcoding.
pub const SUPPORTED_CONTENT_TYPES: &[ContentType] = &[
    ContentType::Hls,
    ContentType::Mp4,
    ContentType::Mkv,
    ContentType::Webm,
];

const CAST_PORT: u16 = 8009;
const RECEIVER_DESTINATION: &str = "receiver-0";

/**
    A Google Cast device driven through the default media receiver app. The
    cast protocol client is synchronous (protobuf over TLS), so calls run
    under `block_in_place`.
*/
pub struct ChromecastDevice {
    info: DeviceInfo,
    device: Option<CastDevice<'static>>,
}

impl ChromecastDevice {
    pub fn new(info: DeviceInfo) -> Self {
        Self { info, device: None }
    }

    pub fn connect(&mut self) -> Result<()> {
        let host = self.info.address.clone();
        let device = tokio::task::block_in_place(|| {
            let device = CastDevice::connect_without_host_verification(host, CAST_PORT)
                .map_err(|e| anyhow!("connecting to chromecast: {e}"))?;
            device
                .connection
                .connect(RECEIVER_DESTINATION.to_string())
                .map_err(|e| anyhow!("opening receiver channel: {e}"))?;
            device
                .heartbeat
                .ping()
                .map_err(|e| anyhow!("pinging chromecast: {e}"))?;
            Ok::<_, anyhow::Error>(device)
        })?;

        self.device = Some(device);
        Ok(())
    }

    pub fn play(&mut self, stream_url: &Url, content_type: ContentType) -> Result<()> {
        let device = self
            .device
            .as_ref()
            .ok_or_else(|| anyhow!("device not connected"))?;

        tokio::task::block_in_place(|| {
            let app = device
                .receiver
                .launch_app(&CastDeviceApp::DefaultMediaReceiver)
                .map_err(|e| anyhow!("launching media receiver: {e}"))?;

            device
                .connection
                .connect(app.transport_id.to_string())
                .map_err(|e| anyhow!("opening media channel: {e}"))?;

            debug!(app_id = %app.app_id, "media receiver launched");

            device
                .media
                .load(
                    app.transport_id.as_str(),
                    app.session_id.as_str(),
                    &Media {
                        content_id: stream_url.to_string(),
                        stream_type: StreamType::Live,
                        content_type: content_type.mime().to_string(),
                        metadata: None,
                        duration: None,
                    },
                )
                .map_err(|e| anyhow!("loading media: {e}"))?;

            Ok::<_, anyhow::Error>(())
        })
        .context("starting chromecast playback")
    }

    pub fn close(&mut self) {
        self.device = None;
    }
}
