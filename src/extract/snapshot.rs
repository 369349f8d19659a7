use std::path::{Path, PathBuf};

use chromiumoxide::Page;
use chromiumoxide::cdp::browser_protocol::page::CaptureScreenshotFormat;
use chromiumoxide::page::ScreenshotParams;
use tracing::{Level, debug};
use url::Url;

/**
    Write a best-effort debug snapshot (screenshot + outer HTML) of the
    current page under `dir`. Only active when debug logging is enabled;
    failures are logged and never affect the extraction itself.
*/
pub async fn snapshot(page: &Page, dir: &Path, label: &str) {
    if !tracing::enabled!(Level::DEBUG) {
        return;
    }

    if let Err(err) = tokio::fs::create_dir_all(dir).await {
        debug!(error = %err, "snapshot: mkdir failed");
        return;
    }

    let ts = chrono::Utc::now().timestamp_millis();
    let prefix: PathBuf = dir.join(format!("{label}_{ts}"));

    let params = ScreenshotParams::builder()
        .format(CaptureScreenshotFormat::Png)
        .full_page(true)
        .build();
    match page.screenshot(params).await {
        Ok(png) => {
            if let Err(err) = tokio::fs::write(prefix.with_extension("png"), png).await {
                debug!(error = %err, "snapshot: write png failed");
            }
        }
        Err(err) => debug!(label, error = %err, "snapshot: screenshot failed"),
    }

    match page.content().await {
        Ok(html) => {
            if let Err(err) = tokio::fs::write(prefix.with_extension("html"), html).await {
                debug!(error = %err, "snapshot: write html failed");
            }
        }
        Err(err) => debug!(label, error = %err, "snapshot: html failed"),
    }

    debug!(label, path = %prefix.display(), "snapshot saved");
}

/// Turn a page URL into a safe directory name under `.debug/`.
pub fn sanitize(raw_url: &str) -> String {
    let Ok(url) = Url::parse(raw_url) else {
        return "unknown".to_string();
    };

    let mut name = format!("{}{}", url.host_str().unwrap_or("unknown"), url.path());
    name = name.replace(['/', ':'], "_");
    name.truncate(80);
    name
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_replaces_separators() {
        assert_eq!(
            sanitize("https://host.example:8080/watch/abc"),
            "host.example_watch_abc"
        );
    }

    #[test]
    fn sanitize_handles_garbage() {
        assert_eq!(sanitize("not a url"), "unknown");
    }

    #[test]
    fn sanitize_truncates_long_paths() {
        let long = format!("http://h/{}", "x".repeat(200));
        assert_eq!(sanitize(&long).len(), 80);
    }
}
