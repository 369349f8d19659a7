use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

/// MIME types that mark a response as a stream regardless of its URL shape.
const STREAM_MIME_TYPES: &[&str] = &[
    "audio/mpegurl",
    "audio/x-mpegurl",
    "application/x-mpegurl",
    "application/vnd.apple.mpegurl",
    "video/mp4",
    "video/webm",
    "video/x-matroska",
];

/// Path substrings that mark a URL as a variant/segment, not a master.
const VARIANT_MARKERS: &[&str] = &[
    "/720p/", "/1080p/", "/480p/", "/360p/", "/240p/", "/chunklist", "/media-", "/segment",
];

fn hls_console_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"https?://[^\s"'<>]+\.m3u8[^\s"'<>]*"#)
            .expect("console m3u8 regex should compile")
    })
}

/// A captured stream URL with the headers of the request that fetched it.
#[derive(Debug, Clone)]
pub struct Captured {
    pub raw_url: String,
    pub headers: HashMap<String, String>,
    /// Server-confirmed MIME; empty when only the URL pattern matched.
    pub mime_type: String,
}

#[derive(Debug)]
struct Candidate {
    raw_url: String,
    headers: HashMap<String, String>,
    mime_type: String,
    score: i32,
}

#[derive(Debug, Error)]
#[error("no stream URL captured within grace period")]
pub struct NoStreamCaptured;

/**
    Concurrent-safe store of candidate stream URLs discovered from browser
    events. Deduplicates by exact URL, scores at insert, bounds memory, and
    wakes a single waiter on the first hit.
*/
pub struct Collector {
    patterns: Vec<Regex>,
    max_candidates: usize,
    candidates: Mutex<Vec<Candidate>>,
    /// Flipped to true exactly once, on the first successful insert.
    notify: watch::Sender<bool>,
}

impl Collector {
    pub fn new(patterns: Vec<Regex>, max_candidates: usize) -> Self {
        let (notify, _) = watch::channel(false);
        Self {
            patterns,
            max_candidates,
            candidates: Mutex::new(Vec::new()),
            notify,
        }
    }

    /// Record a URL if it matches the capture patterns.
    pub fn add(&self, url: &str, headers: HashMap<String, String>) {
        if !self.matches_pattern(url) {
            debug!(url, "collector: url did not match patterns");
            return;
        }
        self.insert(url, headers, String::new());
    }

    /**
        Record a URL whose response MIME the server confirmed as a stream
        type. Pattern matching is skipped; the confirmed MIME is trusted.
    */
    pub fn add_by_mime(&self, url: &str, mime: &str, headers: HashMap<String, String>) {
        let mime = mime.to_ascii_lowercase();
        if !STREAM_MIME_TYPES.contains(&mime.as_str()) {
            debug!(url, mime, "collector: mime type not a stream type");
            return;
        }
        self.insert(url, headers, mime);
    }

    /// Scan console output for m3u8 URLs and feed them through the pattern gate.
    pub fn add_from_console(&self, text: &str) {
        for m in hls_console_re().find_iter(text) {
            self.add(m.as_str(), HashMap::new());
        }
    }

    fn insert(&self, url: &str, headers: HashMap<String, String>, mime_type: String) {
        let mut candidates = self.candidates.lock().expect("collector lock poisoned");

        if candidates.len() >= self.max_candidates {
            debug!(url, "collector: max candidates reached, dropping");
            return;
        }
        // First insert wins; duplicates are dropped whether or not they
        // carry a confirmed MIME, so entries never mutate after insert.
        if candidates.iter().any(|c| c.raw_url == url) {
            debug!(url, "collector: duplicate url, dropping");
            return;
        }

        candidates.push(Candidate {
            raw_url: url.to_string(),
            headers,
            mime_type,
            score: score_url(url),
        });
        drop(candidates);

        self.notify.send_if_modified(|notified| {
            if *notified {
                false
            } else {
                *notified = true;
                true
            }
        });
    }

    /// True once at least one candidate has been captured.
    pub fn has_hits(&self) -> bool {
        !self
            .candidates
            .lock()
            .expect("collector lock poisoned")
            .is_empty()
    }

    /// Captured entries sorted by score, descending and stable.
    pub fn entries(&self) -> Vec<Captured> {
        let candidates = self.candidates.lock().expect("collector lock poisoned");
        let mut sorted: Vec<&Candidate> = candidates.iter().collect();
        sorted.sort_by_key(|c| std::cmp::Reverse(c.score));
        sorted
            .into_iter()
            .map(|c| Captured {
                raw_url: c.raw_url.clone(),
                headers: c.headers.clone(),
                mime_type: c.mime_type.clone(),
            })
            .collect()
    }

    /**
        Wait for captures. With hits already present, collect for `window`
        more and return the snapshot. Otherwise wait up to `grace` for the
        first hit; if it arrives, collect for `window`; if it never does,
        fail with [`NoStreamCaptured`].
    */
    pub async fn wait(
        &self,
        cancel: &CancellationToken,
        grace: Duration,
        window: Duration,
    ) -> Result<Vec<Captured>, NoStreamCaptured> {
        if !self.has_hits() {
            let mut rx = self.notify.subscribe();
            let first_hit = rx.wait_for(|notified| *notified);

            tokio::select! {
                result = tokio::time::timeout(grace, first_hit) => {
                    if result.is_err() && !self.has_hits() {
                        return Err(NoStreamCaptured);
                    }
                }
                _ = cancel.cancelled() => {
                    if !self.has_hits() {
                        return Err(NoStreamCaptured);
                    }
                }
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(window) => {}
            _ = cancel.cancelled() => {}
        }

        Ok(self.entries())
    }

    /// Pattern match against the URL with its query string stripped, so
    /// encoded URLs inside tracking parameters don't count.
    fn matches_pattern(&self, url: &str) -> bool {
        let stripped = url.split('?').next().unwrap_or(url);
        self.patterns.iter().any(|re| re.is_match(stripped))
    }
}

/**
    Score a captured URL for ranking: master playlists above named variant
    playlists above segment-shaped paths.
*/
fn score_url(raw_url: &str) -> i32 {
    let Ok(parsed) = Url::parse(raw_url) else {
        return 0;
    };
    let path = parsed.path().to_ascii_lowercase();

    let mut score = 0;
    if path.contains("master") {
        score += 100;
    }
    if path.contains("playlist") {
        score += 50;
    }
    if VARIANT_MARKERS.iter().any(|m| path.contains(m)) {
        score -= 50;
    }
    score
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collector() -> Collector {
        Collector::new(vec![Regex::new(r"\.m3u8").unwrap()], 8)
    }

    #[test]
    fn scoring_prefers_master_over_variants() {
        let c = collector();
        c.add("http://h/hls/720p/index.m3u8", HashMap::new());
        c.add("http://h/hls/playlist/chunklist.m3u8", HashMap::new());
        c.add("http://h/hls/master.m3u8", HashMap::new());

        let urls: Vec<String> = c.entries().into_iter().map(|e| e.raw_url).collect();
        assert_eq!(
            urls,
            vec![
                "http://h/hls/master.m3u8",
                "http://h/hls/playlist/chunklist.m3u8",
                "http://h/hls/720p/index.m3u8",
            ]
        );
    }

    #[test]
    fn duplicates_do_not_grow_the_store() {
        let c = collector();
        c.add("http://h/a.m3u8", HashMap::new());
        c.add("http://h/a.m3u8", HashMap::new());
        c.add_by_mime("http://h/a.m3u8", "application/x-mpegURL", HashMap::new());

        let entries = c.entries();
        assert_eq!(entries.len(), 1);
        // First insert won; the later MIME-confirmed duplicate was dropped.
        assert_eq!(entries[0].mime_type, "");
    }

    #[test]
    fn pattern_gate_strips_query_string() {
        let c = collector();
        c.add("http://h/pixel.gif?u=http%3A%2F%2Fx%2Fv.m3u8", HashMap::new());
        assert!(!c.has_hits());

        c.add("http://h/v.m3u8?token=abc", HashMap::new());
        assert!(c.has_hits());
    }

    #[test]
    fn mime_confirmed_bypasses_patterns() {
        let c = collector();
        c.add_by_mime("http://h/watch/stream", "video/MP4", HashMap::new());
        let entries = c.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].mime_type, "video/mp4");

        c.add_by_mime("http://h/page", "text/html", HashMap::new());
        assert_eq!(c.entries().len(), 1);
    }

    #[test]
    fn console_extraction_finds_embedded_urls() {
        let c = collector();
        c.add_from_console(
            r#"player init: loading "https://cdn.host/live/master.m3u8?sig=1" now"#,
        );
        let entries = c.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(
            entries[0].raw_url,
            "https://cdn.host/live/master.m3u8?sig=1"
        );
    }

    #[test]
    fn store_is_bounded() {
        let c = Collector::new(vec![Regex::new(r"\.m3u8").unwrap()], 3);
        for i in 0..10 {
            c.add(&format!("http://h/{i}.m3u8"), HashMap::new());
        }
        assert_eq!(c.entries().len(), 3);
    }

    #[tokio::test]
    async fn wait_fails_when_nothing_arrives() {
        let c = collector();
        let cancel = CancellationToken::new();
        let result = c
            .wait(
                &cancel,
                Duration::from_millis(30),
                Duration::from_millis(10),
            )
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn wait_returns_after_collection_window() {
        let c = std::sync::Arc::new(collector());
        let cancel = CancellationToken::new();

        let waiter = {
            let c = std::sync::Arc::clone(&c);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                c.wait(
                    &cancel,
                    Duration::from_secs(5),
                    Duration::from_millis(50),
                )
                .await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        c.add("http://h/early.m3u8", HashMap::new());
        tokio::time::sleep(Duration::from_millis(30)).await;
        c.add("http://h/late.m3u8", HashMap::new());

        let entries = tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .expect("waiter never returned")
            .unwrap()
            .unwrap();
        // Both the waking hit and the one inside the window are present.
        assert_eq!(entries.len(), 2);
    }

    #[tokio::test]
    async fn wait_with_existing_hits_skips_grace() {
        let c = collector();
        c.add("http://h/a.m3u8", HashMap::new());

        let cancel = CancellationToken::new();
        let start = std::time::Instant::now();
        let entries = c
            .wait(&cancel, Duration::from_secs(30), Duration::from_millis(20))
            .await
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}
