pub mod actions;
pub mod collector;
pub mod profile;
pub mod session;
pub mod snapshot;
pub mod stealth;

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use regex::Regex;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use crate::config::{ActionConfig, BrowserConfig, CaptureConfig};
use crate::media::{ContentType, Stream};

use collector::Collector;
use session::Session;

/**
    Captures stream URLs from player pages with a headless browser. Holds
    only the browser, capture and action slices of the configuration.
*/
pub struct Extractor {
    browser: BrowserConfig,
    capture: CaptureConfig,
    actions: ActionConfig,
    patterns: Vec<Regex>,
}

impl Extractor {
    pub fn new(
        browser: BrowserConfig,
        capture: CaptureConfig,
        actions: ActionConfig,
    ) -> Result<Self> {
        let mut patterns = Vec::with_capacity(capture.patterns.len());
        for (i, pattern) in capture.patterns.iter().enumerate() {
            patterns.push(Regex::new(pattern).with_context(|| format!("pattern #{i}"))?);
        }

        Ok(Self {
            browser,
            capture,
            actions,
            patterns,
        })
    }

    /// Run one session + action pipeline attempt against a page URL.
    pub async fn extract(
        &self,
        cancel: &CancellationToken,
        target_url: &str,
    ) -> Result<Vec<Stream>> {
        let collector = Arc::new(Collector::new(
            self.patterns.clone(),
            self.capture.max_candidates,
        ));

        let session = Session::open(&self.browser, Arc::clone(&collector), target_url)
            .await
            .with_context(|| format!("creating session for {target_url}"))?;

        session.run_actions(&self.actions).await;

        let waited = collector
            .wait(
                cancel,
                self.capture.grace_after_actions(),
                self.capture.collection_window(),
            )
            .await;
        session.close().await;

        let entries = waited.with_context(|| format!("waiting for streams on {target_url}"))?;

        let mut streams = Vec::new();
        for entry in entries {
            let Ok(url) = Url::parse(&entry.raw_url) else {
                debug!(raw_url = entry.raw_url, "skipping entry: invalid url");
                continue;
            };

            let content_type = ContentType::from_extension(&url)
                .or_else(|| ContentType::from_mime(&entry.mime_type));
            if content_type.is_none() {
                debug!(url = %url, "skipping entry: unknown content type");
                continue;
            }

            streams.push(Stream {
                url,
                headers: entry.headers,
                content_type,
                bandwidth: 0,
            });
        }

        if streams.is_empty() {
            return Err(anyhow!(
                "no usable streams found on {target_url} (no capture had a recognized type)"
            ));
        }

        Ok(streams)
    }
}

/**
    Extract from all page URLs concurrently, bounded by the capture
    concurrency cap. Per-URL failures are logged; the result is the
    URL-deduplicated union, and only an empty union is an error.
*/
pub async fn extract_all(
    cancel: &CancellationToken,
    extractor: Arc<Extractor>,
    urls: &[String],
) -> Result<Vec<Stream>> {
    let semaphore = Arc::new(Semaphore::new(extractor.capture.max_concurrency));
    let mut tasks = JoinSet::new();

    for url in urls {
        let extractor = Arc::clone(&extractor);
        let semaphore = Arc::clone(&semaphore);
        let cancel = cancel.clone();
        let url = url.clone();
        tasks.spawn(async move {
            let _permit = semaphore.acquire_owned().await.expect("semaphore closed");
            (url.clone(), extractor.extract(&cancel, &url).await)
        });
    }

    let mut streams: Vec<Stream> = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();
    let mut failures = 0usize;

    while let Some(joined) = tasks.join_next().await {
        let Ok((url, result)) = joined else { continue };
        match result {
            Ok(found) => {
                for stream in found {
                    if seen.insert(stream.url.to_string()) {
                        streams.push(stream);
                    }
                }
            }
            Err(err) => {
                failures += 1;
                warn!(url, error = %err, "extraction failed");
            }
        }
    }

    if streams.is_empty() {
        return Err(anyhow!("extraction failed on all {} page urls", urls.len()));
    }
    if failures > 0 {
        debug!(failures, "some page urls failed extraction");
    }

    Ok(streams)
}
