use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use chromiumoxide::browser::{Browser, BrowserConfig, HeadlessMode};
use chromiumoxide::cdp::browser_protocol::browser::{
    SetDownloadBehaviorBehavior, SetDownloadBehaviorParams,
};
use chromiumoxide::cdp::browser_protocol::network::{
    EnableParams as NetworkEnableParams, EventRequestWillBeSent, EventResponseReceived, Headers,
};
use chromiumoxide::cdp::js_protocol::runtime::{
    EnableParams as RuntimeEnableParams, EventConsoleApiCalled,
};
use chromiumoxide::handler::viewport::Viewport;
use chromiumoxide::page::Page;
use futures::StreamExt;
use tokio::task::JoinHandle;
use tracing::debug;

use super::actions;
use super::collector::Collector;
use super::profile::Profile;
use super::snapshot::{sanitize, snapshot};
use crate::config::{ActionConfig, BrowserConfig as BrowserSettings};

/**
    One browser lifetime for one candidate page URL: allocator, stealth,
    event listeners feeding the collector, bounded navigation, and the
    short-circuiting action pipeline.
*/
pub struct Session {
    browser: Browser,
    handler_task: JoinHandle<()>,
    event_tasks: Vec<JoinHandle<()>>,
    page: Page,
    pub collector: Arc<Collector>,
    center_x: f64,
    center_y: f64,
    snapshot_dir: PathBuf,
}

impl Session {
    /**
        Launch a browser with a fresh fingerprint and navigate to
        `target_url`. A navigation failure is fatal only when the collector
        has not captured anything yet; pages that time out after the player
        already requested its stream are kept alive.
    */
    pub async fn open(
        settings: &BrowserSettings,
        collector: Arc<Collector>,
        target_url: &str,
    ) -> Result<Self> {
        let profile = Profile::generate();

        let config = browser_config(settings, &profile)?;
        let (mut browser, mut handler) =
            Browser::launch(config).await.context("launching browser")?;

        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    break;
                }
            }
        });

        let prepared = prepare(&browser, settings, &profile, &collector, target_url).await;

        match prepared {
            Ok((page, event_tasks)) => {
                let session = Self {
                    browser,
                    handler_task,
                    event_tasks,
                    page,
                    collector,
                    center_x: profile.center_x,
                    center_y: profile.center_y,
                    snapshot_dir: PathBuf::from(".debug").join(sanitize(target_url)),
                };
                snapshot(&session.page, &session.snapshot_dir, "after_nav").await;
                Ok(session)
            }
            Err(err) => {
                let _ = browser.close().await;
                let _ = browser.wait().await;
                handler_task.abort();
                Err(err)
            }
        }
    }

    /**
        Run the action pipeline. Each step runs only while the collector is
        still empty; a step that fails is logged and the pipeline moves on.
        Snapshots bracket every step and never block progress.
    */
    pub async fn run_actions(&self, actions_cfg: &ActionConfig) {
        snapshot(&self.page, &self.snapshot_dir, "pipeline_start").await;

        if !self.collector.has_hits() {
            if let Err(err) = actions::click(&self.page, self.center_x, self.center_y).await {
                debug!(error = %err, "pipeline: center click failed");
            }
            snapshot(&self.page, &self.snapshot_dir, "step_0").await;
        }

        if !self.collector.has_hits() {
            if let Err(err) = actions::navigate_iframe(
                &self.page,
                actions_cfg.navigate_iframe_timeout(),
                actions_cfg.navigate_iframe_max_depth,
            )
            .await
            {
                debug!(error = %err, "pipeline: iframe dive failed");
            }
            snapshot(&self.page, &self.snapshot_dir, "step_1").await;
        }

        if !self.collector.has_hits() {
            if let Err(err) = actions::bypass_turnstile(
                &self.page,
                actions_cfg.bypass_turnstile_timeout(),
                actions_cfg.turnstile_retry_timeout(),
            )
            .await
            {
                debug!(error = %err, "pipeline: turnstile bypass failed");
            }
            snapshot(&self.page, &self.snapshot_dir, "step_2").await;
        }

        if !self.collector.has_hits() {
            if let Err(err) = actions::click(&self.page, self.center_x, self.center_y).await {
                debug!(error = %err, "pipeline: center click failed");
            }
            snapshot(&self.page, &self.snapshot_dir, "step_3").await;
        }
    }

    /// Tear down listeners and the browser process.
    pub async fn close(mut self) {
        for task in &self.event_tasks {
            task.abort();
        }
        let _ = self.browser.close().await;
        let _ = self.browser.wait().await;
        self.handler_task.abort();
    }
}

/// Create the page, wire events, inject stealth and navigate.
async fn prepare(
    browser: &Browser,
    settings: &BrowserSettings,
    profile: &Profile,
    collector: &Arc<Collector>,
    target_url: &str,
) -> Result<(Page, Vec<JoinHandle<()>>)> {
    let page = browser
        .new_page("about:blank")
        .await
        .context("creating page")?;

    let event_tasks = attach_listeners(&page, collector).await?;

    page.execute(RuntimeEnableParams::default())
        .await
        .context("enabling runtime events")?;
    page.execute(NetworkEnableParams::default())
        .await
        .context("enabling network events")?;
    page.execute(
        SetDownloadBehaviorParams::builder()
            .behavior(SetDownloadBehaviorBehavior::Deny)
            .build()
            .map_err(|e| anyhow!(e))?,
    )
    .await
    .context("denying downloads")?;

    super::stealth::inject_script(&page, profile).await?;
    super::stealth::apply_overrides(&page, profile).await?;

    let navigation = tokio::time::timeout(settings.timeout(), page.goto(target_url)).await;
    let nav_error = match navigation {
        Ok(Ok(_)) => None,
        Ok(Err(err)) => Some(anyhow!(err).context(format!("navigating to {target_url}"))),
        Err(_) => Some(anyhow!(
            "navigation to {target_url} timed out after {}s",
            settings.timeout_secs
        )),
    };

    if let Some(err) = nav_error {
        // A capture that already happened outranks a dead navigation.
        if !collector.has_hits() {
            return Err(err);
        }
        debug!(error = %err, "navigation failed but streams were captured, continuing");
    }

    Ok((page, event_tasks))
}

async fn attach_listeners(
    page: &Page,
    collector: &Arc<Collector>,
) -> Result<Vec<JoinHandle<()>>> {
    let mut tasks = Vec::with_capacity(3);

    let mut requests = page
        .event_listener::<EventRequestWillBeSent>()
        .await
        .context("listening for requests")?;
    let by_request = Arc::clone(collector);
    tasks.push(tokio::spawn(async move {
        while let Some(event) = requests.next().await {
            by_request.add(
                &event.request.url,
                headers_to_map(Some(&event.request.headers)),
            );
        }
    }));

    let mut responses = page
        .event_listener::<EventResponseReceived>()
        .await
        .context("listening for responses")?;
    let by_mime = Arc::clone(collector);
    tasks.push(tokio::spawn(async move {
        while let Some(event) = responses.next().await {
            // Chrome does not always populate requestHeaders; the response
            // headers are the closest substitute.
            let headers = event
                .response
                .request_headers
                .as_ref()
                .or(Some(&event.response.headers));
            by_mime.add_by_mime(
                &event.response.url,
                &event.response.mime_type,
                headers_to_map(headers),
            );
        }
    }));

    let mut console = page
        .event_listener::<EventConsoleApiCalled>()
        .await
        .context("listening for console output")?;
    let by_console = Arc::clone(collector);
    tasks.push(tokio::spawn(async move {
        while let Some(event) = console.next().await {
            for arg in &event.args {
                if let Some(value) = &arg.value {
                    let text = match value {
                        serde_json::Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    by_console.add_from_console(&text);
                }
            }
        }
    }));

    Ok(tasks)
}

fn browser_config(settings: &BrowserSettings, profile: &Profile) -> Result<BrowserConfig> {
    let flags = [
        "--no-first-run".to_string(),
        "--no-default-browser-check".to_string(),
        "--disable-blink-features=AutomationControlled".to_string(),
        "--disable-infobars".to_string(),
        "--enable-features=NetworkService,NetworkServiceInProcess".to_string(),
        "--disable-background-timer-throttling".to_string(),
        "--disable-backgrounding-occluded-windows".to_string(),
        "--disable-renderer-backgrounding".to_string(),
        "--webrtc-ip-handling-policy=disable_non_proxied_udp".to_string(),
        "--autoplay-policy=no-user-gesture-required".to_string(),
        format!("--user-agent={}", profile.user_agent),
    ];

    let mut builder = BrowserConfig::builder()
        .window_size(profile.screen_width, profile.screen_height)
        .viewport(Viewport {
            width: profile.screen_width,
            height: profile.screen_height,
            ..Viewport::default()
        })
        .args(flags);

    builder = if settings.headless {
        builder.headless_mode(HeadlessMode::New)
    } else {
        builder.with_head()
    };

    if settings.no_sandbox {
        builder = builder.no_sandbox();
    }
    if let Some(path) = &settings.chrome_path {
        builder = builder.chrome_executable(path);
    }

    builder.build().map_err(|e| anyhow!(e))
}

fn headers_to_map(headers: Option<&Headers>) -> HashMap<String, String> {
    let Some(headers) = headers else {
        return HashMap::new();
    };
    let Ok(serde_json::Value::Object(object)) = serde_json::to_value(headers) else {
        return HashMap::new();
    };
    object
        .into_iter()
        .filter_map(|(k, v)| match v {
            serde_json::Value::String(s) => Some((k, s)),
            _ => None,
        })
        .collect()
}
