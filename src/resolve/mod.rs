pub mod hls;
pub mod probe;

use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::config::ResolverConfig;
use crate::media::{ContentType, Stream};

pub use probe::StreamInfo;

/**
    Determine the final URL and content type for a stream.

    A stream with no known content type is probed first. HLS streams are
    expanded to their best variant; a failed expansion falls back to the
    original URL, since many media playlists are served under master names.
*/
pub async fn resolve(cfg: &ResolverConfig, stream: Stream) -> Result<Stream> {
    let mut resolved = stream;

    let content_type = match resolved.content_type {
        Some(ct) => ct,
        None => {
            let info = probe::probe_stream(cfg, &resolved.url, &resolved.headers)
                .await
                .context("probing stream")?;
            resolved.content_type = Some(info.content_type);
            info.content_type
        }
    };

    if content_type == ContentType::Hls {
        match hls::fetch_variants(cfg.hls_timeout(), &resolved.url, &resolved.headers).await {
            Ok(variants) => {
                if let Some(best) = hls::best_variant(&variants) {
                    debug!(bandwidth = best.bandwidth, url = %best.url, "selected hls variant");
                    resolved.bandwidth = best.bandwidth;
                    resolved.url = best.url.clone();
                }
            }
            Err(err) => {
                warn!(error = %err, "hls variant resolution failed, using original url");
            }
        }
    }

    Ok(resolved)
}

/**
    Probe all streams in parallel (bounded by `probe_max_concurrency`) and
    return the one with the highest bandwidth. Failed probes are logged and
    skipped; only a full wipeout is an error. Probed-but-unknown bandwidth is
    floored to 1 so it still outranks a stream that was never probed.
*/
pub async fn rank(cfg: &ResolverConfig, streams: Vec<Stream>) -> Result<Stream> {
    let total = streams.len();
    if total == 0 {
        return Err(anyhow!("no streams to rank"));
    }

    let semaphore = Arc::new(Semaphore::new(cfg.probe_max_concurrency));
    let mut tasks = JoinSet::new();

    for stream in streams {
        let cfg = cfg.clone();
        let semaphore = Arc::clone(&semaphore);
        tasks.spawn(async move {
            let _permit = semaphore.acquire_owned().await.expect("semaphore closed");
            match probe::probe_stream(&cfg, &stream.url, &stream.headers).await {
                Ok(info) => {
                    let mut probed = stream;
                    probed.bandwidth = info.bit_rate.max(1);
                    if probed.content_type.is_none() {
                        probed.content_type = Some(info.content_type);
                    }
                    Some(probed)
                }
                Err(err) => {
                    warn!(url = %stream.url, error = %err, "probe failed");
                    None
                }
            }
        });
    }

    let mut best: Option<Stream> = None;
    while let Some(joined) = tasks.join_next().await {
        let Ok(Some(probed)) = joined else { continue };
        match &best {
            Some(current) if current.bandwidth >= probed.bandwidth => {}
            _ => best = Some(probed),
        }
    }

    best.ok_or_else(|| anyhow!("all {total} streams failed probing"))
}

/// A probed stream row for `--dry-run` output.
#[derive(Debug)]
pub struct StreamDetail {
    pub url: String,
    pub bit_rate: u64,
}

/**
    Expand HLS masters into variants and probe everything, in input order.
    Failures are logged and skipped so one dead variant does not hide the
    rest of the listing.
*/
pub async fn list(cfg: &ResolverConfig, streams: &[Stream]) -> Vec<StreamDetail> {
    let mut details = Vec::new();

    for stream in streams {
        let targets = if stream.content_type == Some(ContentType::Hls) {
            match hls::fetch_variants(cfg.hls_timeout(), &stream.url, &stream.headers).await {
                Ok(variants) => variants.into_iter().map(|v| v.url).collect(),
                Err(err) => {
                    warn!(url = %stream.url, error = %err, "hls variant listing failed");
                    continue;
                }
            }
        } else {
            vec![stream.url.clone()]
        };

        for url in targets {
            match probe::probe_stream(cfg, &url, &stream.headers).await {
                Ok(info) => details.push(StreamDetail {
                    url: url.to_string(),
                    bit_rate: info.bit_rate,
                }),
                Err(err) => warn!(url = %url, error = %err, "probe failed"),
            }
        }
    }

    details
}
