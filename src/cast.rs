use std::net::IpAddr;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::broker::RingBroker;
use crate::broker::server::StreamServer;
use crate::config::Config;
use crate::device::{self, Device, dlna};
use crate::media::{self, Stream};
use crate::resolve;
use crate::transcode::Transcoder;

/**
    Resolve a stream and cast it to the configured device. Streams the
    device can consume natively are played directly; everything else goes
    through ffmpeg → ring broker → stream server, and the cast holds until
    cancellation or a server failure.
*/
pub async fn cast_stream(cancel: &CancellationToken, cfg: &Config, stream: Stream) -> Result<()> {
    let resolved = resolve::resolve(&cfg.resolver, stream)
        .await
        .context("resolving stream")?;
    let content_type = resolved
        .content_type
        .ok_or_else(|| anyhow!("stream has no recognized content type"))?;

    info!(url = %resolved.url, content_type = %content_type, "stream resolved");

    let local_ip = device::local_ip(&cfg.network.interface)
        .with_context(|| format!("resolving local IP on {:?}", cfg.network.interface))?;

    let device_info = device::find_info(
        local_ip,
        cfg.network.timeout(),
        cfg.device.kind,
        &cfg.device.name,
    )
    .await
    .context("finding device")?;

    info!(
        name = device_info.name,
        kind = %device_info.kind,
        address = device_info.address,
        "device found on network"
    );

    let mut device = Device::new(device_info);
    device.connect().await.context("connecting to device")?;
    info!("connected to device");

    let result = if device.supported_content_types().contains(&content_type) {
        info!(url = %resolved.url, content_type = %content_type, "starting direct playback");
        device
            .play(&resolved.url, content_type)
            .await
            .context("starting playback")
    } else {
        cast_transcoded(cancel, cfg, &mut device, local_ip, &resolved).await
    };

    device.close();
    result
}

/// Transcode into a ring broker, expose it over HTTP, and point the device
/// at the local stream URL.
async fn cast_transcoded(
    cancel: &CancellationToken,
    cfg: &Config,
    device: &mut Device,
    local_ip: IpAddr,
    resolved: &Stream,
) -> Result<()> {
    let format = media::lookup_output_format(&cfg.transcode.output_format)
        .ok_or_else(|| anyhow!("unsupported output format {:?}", cfg.transcode.output_format))?;

    info!(
        content_type = %resolved.content_type.map(|ct| ct.mime()).unwrap_or("unknown"),
        output_format = cfg.transcode.output_format,
        "device does not support content type, transcoding"
    );

    let broker = Arc::new(RingBroker::new(cfg.transcode.buffer_capacity));
    let transcoder = Transcoder::spawn(
        &cfg.transcode,
        &resolved.url,
        &resolved.headers,
        Arc::clone(&broker),
    )
    .context("starting transcode")?;

    // Gate on the first chunk of real output so the renderer never connects
    // to an empty stream.
    broker
        .wait_for_data(cancel, cfg.transcode.initial_data_threshold as u64)
        .await
        .map_err(|_| anyhow!("cancelled while waiting for transcode data"))?;

    if broker.total_written() == 0 {
        let _ = transcoder.wait().await;
        return Err(anyhow!("transcoder produced no data"));
    }

    let extra_headers = match device {
        Device::Dlna(_) => dlna::stream_headers(format.content_type),
        Device::Chromecast(_) => Vec::new(),
    };

    let mut server = StreamServer::start(
        local_ip,
        Arc::clone(&broker),
        format.content_type.mime(),
        format.extension,
        &extra_headers,
        cancel,
    )
    .await
    .context("starting stream server")?;

    info!(
        stream_url = %server.url(),
        content_type = %format.content_type,
        "starting playback on device"
    );

    let played = device
        .play(server.url(), format.content_type)
        .await
        .context("starting playback");

    if let Err(err) = played {
        server.stop().await;
        transcoder.kill().await;
        return Err(err);
    }

    tokio::select! {
        _ = cancel.cancelled() => {
            info!("cast cancelled, shutting down");
        }
        err = server.listen_error() => {
            warn!(error = %err, "stream server failed");
        }
    }

    server.stop().await;
    transcoder.kill().await;
    Ok(())
}
