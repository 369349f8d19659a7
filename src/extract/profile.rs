use rand::Rng;

/**
    A coherent browser fingerprint for one extraction session. Every field is
    drawn so the whole identity agrees with itself: the UA's OS fragment, the
    navigator platform, the Client Hints platform and the WebGL adapter all
    come from the same platform preset.
*/
#[derive(Debug, Clone)]
pub struct Profile {
    pub user_agent: String,
    /// (brand, major version) pairs for the Client Hints brand list.
    pub brands: Vec<(String, String)>,
    /// (brand, full version) pairs for the full-version list.
    pub full_version_list: Vec<(String, String)>,
    /// Client Hints platform, e.g. "Windows".
    pub platform: String,
    pub platform_version: String,
    pub architecture: String,
    pub bitness: String,
    /// navigator.platform value.
    pub navigator_platform: String,
    pub accept_language: String,
    pub languages: Vec<String>,
    pub hardware_concurrency: i64,
    pub device_memory: u32,
    pub screen_width: u32,
    pub screen_height: u32,
    pub center_x: f64,
    pub center_y: f64,
    pub color_depth: u32,
    pub webgl_vendor: String,
    pub webgl_renderer: String,
    pub timezone_id: String,
    /// Seed for the in-page xorshift32 noise generators.
    pub noise_seed: u32,
    /// Sub-pixel offset for measureText, in [0.001, 0.099] px.
    pub font_noise_px: f64,
    /// Sub-pixel offset for client rects, in [0.001, 0.099] px.
    pub rect_noise_px: f64,
    /// Amplitude noise for audio buffers, in [0.00001, 0.0001].
    pub audio_noise_mag: f64,
}

struct PlatformPreset {
    /// OS fragment inside the UA string.
    ua_os: &'static str,
    navigator_platform: &'static str,
    ch_platform: &'static str,
    ch_platform_version: &'static str,
    architecture: &'static str,
    bitness: &'static str,
    webgl: &'static [(&'static str, &'static str)],
}

const PLATFORM_PRESETS: &[PlatformPreset] = &[
    PlatformPreset {
        ua_os: "Windows NT 10.0; Win64; x64",
        navigator_platform: "Win32",
        ch_platform: "Windows",
        ch_platform_version: "10.0.0",
        architecture: "x86",
        bitness: "64",
        webgl: &[
            (
                "Google Inc. (Intel)",
                "ANGLE (Intel, Intel(R) UHD Graphics 630 Direct3D11 vs_5_0 ps_5_0, D3D11)",
            ),
            (
                "Google Inc. (Intel)",
                "ANGLE (Intel, Intel(R) UHD Graphics 770 Direct3D11 vs_5_0 ps_5_0, D3D11)",
            ),
            (
                "Google Inc. (NVIDIA)",
                "ANGLE (NVIDIA, NVIDIA GeForce GTX 1650 Direct3D11 vs_5_0 ps_5_0, D3D11)",
            ),
            (
                "Google Inc. (NVIDIA)",
                "ANGLE (NVIDIA, NVIDIA GeForce RTX 3060 Direct3D11 vs_5_0 ps_5_0, D3D11)",
            ),
        ],
    },
    PlatformPreset {
        ua_os: "Windows NT 10.0; Win64; x64",
        navigator_platform: "Win32",
        ch_platform: "Windows",
        // Client Hints 13+ means Windows 11 regardless of the UA string.
        ch_platform_version: "15.0.0",
        architecture: "x86",
        bitness: "64",
        webgl: &[
            (
                "Google Inc. (Intel)",
                "ANGLE (Intel, Intel(R) UHD Graphics 770 Direct3D11 vs_5_0 ps_5_0, D3D11)",
            ),
            (
                "Google Inc. (NVIDIA)",
                "ANGLE (NVIDIA, NVIDIA GeForce RTX 3060 Direct3D11 vs_5_0 ps_5_0, D3D11)",
            ),
            (
                "Google Inc. (AMD)",
                "ANGLE (AMD, AMD Radeon RX 6600 Direct3D11 vs_5_0 ps_5_0, D3D11)",
            ),
        ],
    },
    PlatformPreset {
        ua_os: "Macintosh; Intel Mac OS X 10_15_7",
        navigator_platform: "MacIntel",
        ch_platform: "macOS",
        ch_platform_version: "14.5.0",
        architecture: "arm",
        bitness: "64",
        webgl: &[
            ("Google Inc. (Apple)", "ANGLE (Apple, Apple M1, OpenGL 4.1)"),
            ("Google Inc. (Apple)", "ANGLE (Apple, Apple M2, OpenGL 4.1)"),
            (
                "Google Inc. (Intel Inc.)",
                "ANGLE (Intel Inc., Intel Iris Plus Graphics, OpenGL 4.1)",
            ),
        ],
    },
];

const SCREEN_PRESETS: &[(u32, u32)] = &[
    (1920, 1080),
    (2560, 1440),
    (1366, 768),
    (1536, 864),
    (1680, 1050),
];

struct LocalePreset {
    timezone_id: &'static str,
    accept_language: &'static str,
    languages: &'static [&'static str],
}

const LOCALE_PRESETS: &[LocalePreset] = &[
    LocalePreset {
        timezone_id: "America/New_York",
        accept_language: "en-US,en;q=0.9",
        languages: &["en-US", "en"],
    },
    LocalePreset {
        timezone_id: "America/Chicago",
        accept_language: "en-US,en;q=0.9",
        languages: &["en-US", "en"],
    },
    LocalePreset {
        timezone_id: "America/Los_Angeles",
        accept_language: "en-US,en;q=0.9",
        languages: &["en-US", "en"],
    },
    LocalePreset {
        timezone_id: "Europe/London",
        accept_language: "en-GB,en;q=0.9,en-US;q=0.8",
        languages: &["en-GB", "en", "en-US"],
    },
];

const CHROME_VERSIONS: &[(&str, &str)] = &[
    ("131", "131.0.0.0"),
    ("132", "132.0.0.0"),
    ("133", "133.0.0.0"),
];

const GREASE_BRANDS: &[&str] = &["Not A(Brand", "Not/A)Brand", "Not_A Brand"];
const HARDWARE_CONCURRENCIES: &[i64] = &[4, 8, 12, 16];
const DEVICE_MEMORIES: &[u32] = &[4, 8, 16];

impl Profile {
    /// Build a fresh randomized profile.
    pub fn generate() -> Self {
        Self::generate_with(&mut rand::thread_rng())
    }

    /// Build a profile from the given RNG; deterministic under a seeded one.
    pub fn generate_with<R: Rng + ?Sized>(rng: &mut R) -> Self {
        let plat = &PLATFORM_PRESETS[rng.gen_range(0..PLATFORM_PRESETS.len())];
        let (webgl_vendor, webgl_renderer) = plat.webgl[rng.gen_range(0..plat.webgl.len())];
        let (screen_width, screen_height) = SCREEN_PRESETS[rng.gen_range(0..SCREEN_PRESETS.len())];
        let locale = &LOCALE_PRESETS[rng.gen_range(0..LOCALE_PRESETS.len())];
        let (major, full) = CHROME_VERSIONS[rng.gen_range(0..CHROME_VERSIONS.len())];
        let grease = GREASE_BRANDS[rng.gen_range(0..GREASE_BRANDS.len())];
        let hardware_concurrency =
            HARDWARE_CONCURRENCIES[rng.gen_range(0..HARDWARE_CONCURRENCIES.len())];
        let device_memory = DEVICE_MEMORIES[rng.gen_range(0..DEVICE_MEMORIES.len())];

        Self {
            user_agent: format!(
                "Mozilla/5.0 ({}) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/{} Safari/537.36",
                plat.ua_os, full
            ),
            brands: vec![
                (grease.to_string(), "8".to_string()),
                ("Chromium".to_string(), major.to_string()),
                ("Google Chrome".to_string(), major.to_string()),
            ],
            full_version_list: vec![
                (grease.to_string(), "8.0.0.0".to_string()),
                ("Chromium".to_string(), full.to_string()),
                ("Google Chrome".to_string(), full.to_string()),
            ],
            platform: plat.ch_platform.to_string(),
            platform_version: plat.ch_platform_version.to_string(),
            architecture: plat.architecture.to_string(),
            bitness: plat.bitness.to_string(),
            navigator_platform: plat.navigator_platform.to_string(),
            accept_language: locale.accept_language.to_string(),
            languages: locale.languages.iter().map(|s| s.to_string()).collect(),
            hardware_concurrency,
            device_memory,
            screen_width,
            screen_height,
            center_x: f64::from(screen_width) / 2.0,
            center_y: f64::from(screen_height) / 2.0,
            color_depth: 24,
            webgl_vendor: webgl_vendor.to_string(),
            webgl_renderer: webgl_renderer.to_string(),
            timezone_id: locale.timezone_id.to_string(),
            noise_seed: rng.r#gen::<u32>(),
            font_noise_px: rng.gen_range(0.001..=0.099),
            rect_noise_px: rng.gen_range(0.001..=0.099),
            audio_noise_mag: rng.gen_range(0.00001..=0.0001),
        }
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    use super::*;

    #[test]
    fn os_fields_agree_across_the_identity() {
        for seed in 0..200u64 {
            let profile = Profile::generate_with(&mut StdRng::seed_from_u64(seed));

            match profile.navigator_platform.as_str() {
                "Win32" => {
                    assert!(profile.user_agent.contains("Windows NT"));
                    assert_eq!(profile.platform, "Windows");
                    assert!(
                        profile.webgl_renderer.contains("Direct3D11"),
                        "windows profile should use a D3D adapter: {}",
                        profile.webgl_renderer
                    );
                }
                "MacIntel" => {
                    assert!(profile.user_agent.contains("Macintosh"));
                    assert_eq!(profile.platform, "macOS");
                    assert!(profile.webgl_renderer.contains("OpenGL 4.1"));
                }
                other => panic!("unexpected navigator platform {other:?}"),
            }
        }
    }

    #[test]
    fn screen_center_is_precomputed() {
        let profile = Profile::generate_with(&mut StdRng::seed_from_u64(7));
        assert_eq!(profile.center_x, f64::from(profile.screen_width) / 2.0);
        assert_eq!(profile.center_y, f64::from(profile.screen_height) / 2.0);
    }

    #[test]
    fn noise_magnitudes_stay_in_range() {
        for seed in 0..200u64 {
            let profile = Profile::generate_with(&mut StdRng::seed_from_u64(seed));
            assert!((0.001..=0.099).contains(&profile.font_noise_px));
            assert!((0.001..=0.099).contains(&profile.rect_noise_px));
            assert!((0.00001..=0.0001).contains(&profile.audio_noise_mag));
        }
    }

    #[test]
    fn same_seed_reproduces_the_profile() {
        let a = Profile::generate_with(&mut StdRng::seed_from_u64(42));
        let b = Profile::generate_with(&mut StdRng::seed_from_u64(42));
        assert_eq!(a.user_agent, b.user_agent);
        assert_eq!(a.noise_seed, b.noise_seed);
        assert_eq!(a.font_noise_px, b.font_noise_px);
        assert_eq!(a.webgl_renderer, b.webgl_renderer);
    }

    #[test]
    fn brand_lists_share_the_grease_spelling() {
        let profile = Profile::generate_with(&mut StdRng::seed_from_u64(3));
        assert_eq!(profile.brands.len(), 3);
        assert_eq!(profile.brands[0].0, profile.full_version_list[0].0);
        assert_eq!(profile.brands[1].0, "Chromium");
        // Major version prefixes the full version.
        assert!(profile.full_version_list[1].1.starts_with(&profile.brands[1].1));
    }
}
