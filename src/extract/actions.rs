use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use chromiumoxide::Page;
use chromiumoxide::cdp::js_protocol::runtime::EvaluateParams;
use chromiumoxide::layout::Point;
use tracing::debug;

const IFRAME_SRC_JS: &str = include_str!("js/iframe_src.js");
const TURNSTILE_IFRAME_POS_JS: &str = include_str!("js/turnstile_iframe_pos.js");
const TURNSTILE_GONE_JS: &str = include_str!("js/turnstile_gone.js");

const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Evaluate an expression and return its JSON value (null when undefined).
pub async fn eval_json(page: &Page, expression: &str) -> Result<serde_json::Value> {
    let params = EvaluateParams::builder()
        .expression(expression)
        .return_by_value(true)
        .await_promise(true)
        .build()
        .map_err(|e| anyhow!(e))?;

    let result = page.evaluate(params).await.context("evaluating script")?;
    Ok(result.value().cloned().unwrap_or(serde_json::Value::Null))
}

/// Re-evaluate until the expression yields a non-null, non-false value.
async fn poll_json(page: &Page, expression: &str) -> Result<serde_json::Value> {
    loop {
        let value = eval_json(page, expression).await?;
        match value {
            serde_json::Value::Null | serde_json::Value::Bool(false) => {}
            other => return Ok(other),
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// Wait for the document to leave the "loading" state.
async fn wait_ready(page: &Page) -> Result<()> {
    poll_json(page, "document.readyState !== 'loading'").await?;
    Ok(())
}

/// Click at the given viewport coordinates with a trusted mouse event.
pub async fn click(page: &Page, x: f64, y: f64) -> Result<()> {
    page.click(Point { x, y })
        .await
        .context("dispatching click")?;
    Ok(())
}

/**
    Dive through nested player iframes: poll for the largest visible iframe
    (both dimensions over 100px, src neither empty nor `about:`) and
    navigate the top frame to its src, up to `max_depth` levels. The whole
    dive is bounded by `timeout`.

    A failure at depth 0 means no iframe ever appeared, which is the real
    error; a failure deeper down means the leaf was reached.
*/
pub async fn navigate_iframe(page: &Page, timeout: Duration, max_depth: usize) -> Result<()> {
    let deadline = tokio::time::Instant::now() + timeout;

    for depth in 0..max_depth {
        let step = async {
            let src = poll_json(page, IFRAME_SRC_JS).await?;
            let src = src
                .as_str()
                .ok_or_else(|| anyhow!("iframe src is not a string"))?
                .to_string();

            debug!(src, depth = depth + 1, "navigating into iframe");
            page.goto(src).await.context("navigating to iframe src")?;
            wait_ready(page).await
        };

        // The deadline spans the whole dive, but which depth it fires at
        // decides the meaning: at depth 0 no iframe ever appeared.
        let result = match tokio::time::timeout_at(deadline, step).await {
            Ok(result) => result,
            Err(_) => Err(anyhow!("no iframe found within {timeout:?}")),
        };

        if let Err(err) = result {
            if depth == 0 {
                return Err(err);
            }
            return Ok(()); // reached the leaf, no more iframes
        }
    }

    Ok(())
}

/// True when a `.cf-turnstile` element is present in the DOM.
pub async fn detect_turnstile(page: &Page) -> bool {
    matches!(
        eval_json(page, "document.querySelector('.cf-turnstile') !== null").await,
        Ok(serde_json::Value::Bool(true))
    )
}

/**
    Try to get past a Cloudflare Turnstile challenge. Two paths race under
    `solve_timeout`:

    1. interactive: poll for the challenge iframe, click its center, wait
       for `.cf-turnstile` to leave the DOM;
    2. passive: just wait for `.cf-turnstile` to leave the DOM, which covers
       auto-solve and the callback-triggered reload.

    The first path to finish cancels the other.
*/
async fn solve_turnstile(page: &Page, solve_timeout: Duration) -> bool {
    let interactive = async {
        let pos = poll_json(page, TURNSTILE_IFRAME_POS_JS).await?;
        let x = pos.get("x").and_then(|v| v.as_f64()).unwrap_or(0.0);
        let y = pos.get("y").and_then(|v| v.as_f64()).unwrap_or(0.0);

        click(page, x, y).await?;
        poll_json(page, TURNSTILE_GONE_JS).await?;
        wait_ready(page).await
    };

    let passive = async {
        poll_json(page, TURNSTILE_GONE_JS).await?;
        wait_ready(page).await
    };

    let solved = async {
        tokio::select! {
            result = interactive => result.is_ok(),
            result = passive => result.is_ok(),
        }
    };

    matches!(tokio::time::timeout(solve_timeout, solved).await, Ok(true))
}

/**
    Bypass a Turnstile challenge when one is present. A failed first solve
    reloads the page (bounded by `retry_timeout`) and tries once more;
    failure of the retry is an error.
*/
pub async fn bypass_turnstile(
    page: &Page,
    solve_timeout: Duration,
    retry_timeout: Duration,
) -> Result<()> {
    if !detect_turnstile(page).await {
        return Ok(());
    }

    if solve_turnstile(page, solve_timeout).await {
        return Ok(());
    }
    debug!("turnstile solve attempt failed, retrying after reload");

    let reload = async {
        page.reload().await.context("reloading page")?;
        wait_ready(page).await
    };
    tokio::time::timeout(retry_timeout, reload)
        .await
        .map_err(|_| anyhow!("turnstile reload timed out"))?
        .context("turnstile reload failed")?;

    if detect_turnstile(page).await {
        if !solve_turnstile(page, solve_timeout).await {
            return Err(anyhow!("turnstile solve failed after retry"));
        }
        debug!("turnstile solved after retry");
    }

    Ok(())
}
