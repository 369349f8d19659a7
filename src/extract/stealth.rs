use anyhow::{Context, Result, anyhow};
use chromiumoxide::Page;
use chromiumoxide::cdp::browser_protocol::emulation::{
    SetAutomationOverrideParams, SetFocusEmulationEnabledParams,
    SetHardwareConcurrencyOverrideParams, SetLocaleOverrideParams, SetTimezoneOverrideParams,
    SetUserAgentOverrideParams, UserAgentBrandVersion, UserAgentMetadata,
};
use chromiumoxide::cdp::browser_protocol::page::AddScriptToEvaluateOnNewDocumentParams;

use super::profile::Profile;

/**
    Stealth snippets, injected before any page script runs.

    Order is significant: the `toString` interceptor comes first so every
    later override can register itself with `__cloak`, and the stack-trace
    filter comes last so it hides all of them.
*/
const STEALTH_SNIPPETS: &[&str] = &[
    include_str!("js/stealth_tostring.js"),
    include_str!("js/stealth_plugins.js"),
    include_str!("js/stealth_chrome.js"),
    include_str!("js/stealth_permissions.js"),
    include_str!("js/stealth_webgl.js"),
    include_str!("js/stealth_device_memory.js"),
    include_str!("js/stealth_notification.js"),
    include_str!("js/stealth_screen.js"),
    include_str!("js/stealth_webrtc.js"),
    include_str!("js/stealth_canvas.js"),
    include_str!("js/stealth_audio.js"),
    include_str!("js/stealth_client_rects.js"),
    include_str!("js/stealth_font_metric.js"),
    include_str!("js/stealth_stack_trace.js"),
];

/// Join the stealth snippets and fill their placeholders from a profile.
pub fn build_stealth_js(profile: &Profile) -> String {
    STEALTH_SNIPPETS
        .join("\n")
        .replace("__DEVICE_MEMORY__", &profile.device_memory.to_string())
        .replace("__COLOR_DEPTH__", &profile.color_depth.to_string())
        .replace("__WEBGL_VENDOR__", &profile.webgl_vendor)
        .replace("__WEBGL_RENDERER__", &profile.webgl_renderer)
        .replace("__NOISE_SEED__", &profile.noise_seed.to_string())
        .replace("__FONT_NOISE_PX__", &format!("{:.6}", profile.font_noise_px))
        .replace("__RECT_NOISE_PX__", &format!("{:.6}", profile.rect_noise_px))
        .replace(
            "__AUDIO_NOISE_MAG__",
            &format!("{:.10}", profile.audio_noise_mag),
        )
}

/// Register the stealth script to run before any document script.
pub async fn inject_script(page: &Page, profile: &Profile) -> Result<()> {
    let params = AddScriptToEvaluateOnNewDocumentParams::builder()
        .source(build_stealth_js(profile))
        .build()
        .map_err(|e| anyhow!(e))?;
    page.execute(params)
        .await
        .context("injecting stealth script")?;
    Ok(())
}

/**
    Apply the browser-protocol-level overrides JS injection cannot cover:
    the automation indicator, window focus, hardware concurrency, timezone,
    locale, and the User-Agent with its Client Hints metadata.
*/
pub async fn apply_overrides(page: &Page, profile: &Profile) -> Result<()> {
    page.execute(
        SetAutomationOverrideParams::builder()
            .enabled(false)
            .build()
            .map_err(|e| anyhow!(e))?,
    )
    .await
    .context("disabling automation override")?;

    page.execute(
        SetFocusEmulationEnabledParams::builder()
            .enabled(true)
            .build()
            .map_err(|e| anyhow!(e))?,
    )
    .await
    .context("enabling focus emulation")?;

    page.execute(
        SetHardwareConcurrencyOverrideParams::builder()
            .hardware_concurrency(profile.hardware_concurrency)
            .build()
            .map_err(|e| anyhow!(e))?,
    )
    .await
    .context("overriding hardware concurrency")?;

    page.execute(
        SetTimezoneOverrideParams::builder()
            .timezone_id(profile.timezone_id.clone())
            .build()
            .map_err(|e| anyhow!(e))?,
    )
    .await
    .context("overriding timezone")?;

    page.execute(SetLocaleOverrideParams {
        locale: profile.languages.first().cloned(),
    })
    .await
    .context("overriding locale")?;

    page.execute(
        SetUserAgentOverrideParams::builder()
            .user_agent(profile.user_agent.clone())
            .accept_language(profile.accept_language.clone())
            .platform(profile.navigator_platform.clone())
            .user_agent_metadata(user_agent_metadata(profile)?)
            .build()
            .map_err(|e| anyhow!(e))?,
    )
    .await
    .context("overriding user agent")?;

    Ok(())
}

fn user_agent_metadata(profile: &Profile) -> Result<UserAgentMetadata> {
    let brand_list = |pairs: &[(String, String)]| -> Vec<UserAgentBrandVersion> {
        pairs
            .iter()
            .map(|(brand, version)| UserAgentBrandVersion {
                brand: brand.clone(),
                version: version.clone(),
            })
            .collect()
    };

    // Built through serde so optional metadata fields the protocol grows
    // over time keep deserializing to their defaults.
    serde_json::from_value(serde_json::json!({
        "brands": brand_list(&profile.brands),
        "fullVersionList": brand_list(&profile.full_version_list),
        "platform": profile.platform,
        "platformVersion": profile.platform_version,
        "architecture": profile.architecture,
        "model": "",
        "mobile": false,
        "bitness": profile.bitness,
    }))
    .context("building user agent metadata")
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    use super::*;

    fn profile() -> Profile {
        Profile::generate_with(&mut StdRng::seed_from_u64(11))
    }

    #[test]
    fn all_placeholders_are_substituted() {
        let js = build_stealth_js(&profile());
        assert!(!js.contains("__DEVICE_MEMORY__"));
        assert!(!js.contains("__COLOR_DEPTH__"));
        assert!(!js.contains("__WEBGL_VENDOR__"));
        assert!(!js.contains("__WEBGL_RENDERER__"));
        assert!(!js.contains("__NOISE_SEED__"));
        assert!(!js.contains("__FONT_NOISE_PX__"));
        assert!(!js.contains("__RECT_NOISE_PX__"));
        assert!(!js.contains("__AUDIO_NOISE_MAG__"));
    }

    #[test]
    fn tostring_cloak_comes_first_and_stack_filter_last() {
        let js = build_stealth_js(&profile());
        let cloak = js.find("__cloak = function").unwrap();
        let webgl = js.find("UNMASKED_VENDOR_WEBGL").unwrap();
        let stack = js.find("prepareStackTrace").unwrap();
        assert!(cloak < webgl);
        assert!(webgl < stack);
    }

    #[test]
    fn profile_values_appear_in_script() {
        let p = profile();
        let js = build_stealth_js(&p);
        assert!(js.contains(&p.webgl_renderer));
        assert!(js.contains(&p.noise_seed.to_string()));
    }

    #[test]
    fn metadata_carries_brand_lists() {
        let p = profile();
        let metadata = user_agent_metadata(&p).unwrap();
        assert_eq!(metadata.platform, p.platform);
        assert!(!metadata.mobile);
        let brands = metadata.brands.unwrap();
        assert_eq!(brands.len(), 3);
        assert_eq!(brands[1].brand, "Chromium");
    }
}
