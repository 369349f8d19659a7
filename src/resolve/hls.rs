use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use regex::Regex;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use url::Url;

/// One entry of an HLS master playlist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Variant {
    pub url: Url,
    /// Declared `BANDWIDTH=` in bits per second.
    pub bandwidth: u64,
}

fn bandwidth_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"BANDWIDTH=(\d+)").expect("bandwidth regex should compile"))
}

/**
    Fetch an HLS playlist and return its variants.

    The scanner has two states: scanning, and expecting a URI after an
    `#EXT-X-STREAM-INF:` line that declared a bandwidth. The URI on the next
    non-empty, non-comment line is resolved against the master URL. A
    playlist that yields no variants was already a media playlist; it comes
    back as a single entry for the master URL with bandwidth 0.
*/
pub async fn fetch_variants(
    timeout: Duration,
    master: &Url,
    headers: &HashMap<String, String>,
) -> Result<Vec<Variant>> {
    let client = reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .context("building HLS client")?;

    let response = client
        .get(master.clone())
        .headers(request_headers(headers))
        .send()
        .await
        .with_context(|| format!("fetching playlist {master}"))?;

    let status = response.status();
    if !status.is_success() {
        return Err(anyhow!("playlist {master} returned status {status}"));
    }

    let body = response.text().await.context("reading playlist body")?;
    parse_variants(master, &body)
}

/// Parse the playlist text; see [`fetch_variants`] for the state machine.
pub fn parse_variants(master: &Url, body: &str) -> Result<Vec<Variant>> {
    let mut variants = Vec::new();
    let mut pending_bandwidth: Option<u64> = None;

    for line in body.lines() {
        let line = line.trim();

        if let Some(bandwidth) = pending_bandwidth {
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            pending_bandwidth = None;

            let url = master
                .join(line)
                .with_context(|| format!("resolving variant URI {line:?}"))?;
            variants.push(Variant { url, bandwidth });
            continue;
        }

        if let Some(attrs) = line.strip_prefix("#EXT-X-STREAM-INF:")
            && let Some(m) = bandwidth_re().captures(attrs)
            && let Ok(bandwidth) = m[1].parse::<u64>()
        {
            pending_bandwidth = Some(bandwidth);
        }
    }

    if variants.is_empty() {
        variants.push(Variant {
            url: master.clone(),
            bandwidth: 0,
        });
    }

    Ok(variants)
}

/// Pick the highest-bandwidth variant; ties go to the first encountered.
pub fn best_variant(variants: &[Variant]) -> Option<&Variant> {
    variants.iter().reduce(|best, candidate| {
        if candidate.bandwidth > best.bandwidth {
            candidate
        } else {
            best
        }
    })
}

fn request_headers(headers: &HashMap<String, String>) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (k, v) in headers {
        if k.starts_with(':') {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(k.as_bytes()),
            HeaderValue::from_str(v),
        ) {
            map.insert(name, value);
        }
    }
    map
}
