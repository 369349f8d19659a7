use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use regex::Regex;
use serde::Deserialize;
use thiserror::Error;

use crate::device::DeviceKind;

/// Errors raised while loading or validating the configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("parsing {path}: {source}")]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },
    #[error("{field} must not be empty")]
    Empty { field: &'static str },
    #[error("{field} must be at least 1")]
    Zero { field: &'static str },
    #[error("capture pattern #{index} is invalid: {source}")]
    Pattern { index: usize, source: regex::Error },
    #[error("source {name:?}: {reason}")]
    Source { name: String, reason: String },
    #[error("transcode.output_format {0:?} is not a known container format")]
    OutputFormat(String),
}

/// Top-level application configuration, loaded once at startup.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub device: DeviceConfig,
    pub network: NetworkConfig,
    pub browser: BrowserConfig,
    pub resolver: ResolverConfig,
    pub capture: CaptureConfig,
    pub actions: ActionConfig,
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
    pub transcode: TranscodeConfig,
}

/// Which device to cast to.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: DeviceKind,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfig {
    /// Device discovery window in seconds.
    pub timeout_secs: u64,
    /// Interface whose IPv4 address the stream server binds to.
    pub interface: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BrowserConfig {
    /// Navigation watchdog in seconds.
    pub timeout_secs: u64,
    #[serde(default = "default_true")]
    pub headless: bool,
    #[serde(default)]
    pub no_sandbox: bool,
    #[serde(default)]
    pub chrome_path: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResolverConfig {
    pub ffprobe_path: String,
    pub probe_timeout_secs: u64,
    pub hls_timeout_secs: u64,
    pub probe_max_concurrency: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CaptureConfig {
    /// Regexes a captured URL must match (query string stripped first).
    pub patterns: Vec<String>,
    /// How long to keep collecting after the first hit, in milliseconds.
    pub collection_window_ms: u64,
    /// How long to wait for a first hit after the action pipeline, in milliseconds.
    pub grace_after_actions_ms: u64,
    /// Concurrent extraction sessions across candidate page URLs.
    pub max_concurrency: usize,
    /// Upper bound on stored candidates per session.
    pub max_candidates: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ActionConfig {
    pub navigate_iframe_timeout_secs: u64,
    pub navigate_iframe_max_depth: usize,
    pub bypass_turnstile_timeout_secs: u64,
    pub turnstile_retry_timeout_secs: u64,
}

/// A configured page source: proxies plus URL templates.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub name: String,
    pub proxies: Vec<String>,
    pub templates: TemplateConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TemplateConfig {
    pub movie: String,
    pub episode: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TranscodeConfig {
    pub ffmpeg_path: String,
    /// Input read rate multiplier (1 = real time).
    pub read_rate: u32,
    /// Seconds of input allowed before rate-limiting kicks in.
    pub read_rate_burst: u32,
    pub video_codec: String,
    pub audio_codec: String,
    pub audio_sample_rate: u32,
    pub audio_bitrate: String,
    pub output_format: String,
    /// Bytes buffered before the device is pointed at the stream server.
    pub initial_data_threshold: usize,
    /// Ring broker capacity in bytes.
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,
}

fn default_true() -> bool {
    true
}

fn default_buffer_capacity() -> usize {
    // 32 MiB holds roughly a minute of a typical transcoded TS stream.
    32 * 1024 * 1024
}

impl Config {
    /// Load and validate configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;

        let config: Config = serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        fn non_empty(value: &str, field: &'static str) -> Result<(), ConfigError> {
            if value.trim().is_empty() {
                return Err(ConfigError::Empty { field });
            }
            Ok(())
        }
        fn non_zero(value: usize, field: &'static str) -> Result<(), ConfigError> {
            if value == 0 {
                return Err(ConfigError::Zero { field });
            }
            Ok(())
        }

        non_empty(&self.device.name, "device.name")?;
        non_empty(&self.network.interface, "network.interface")?;
        non_zero(self.network.timeout_secs as usize, "network.timeout_secs")?;
        non_zero(self.browser.timeout_secs as usize, "browser.timeout_secs")?;

        non_empty(&self.resolver.ffprobe_path, "resolver.ffprobe_path")?;
        non_zero(
            self.resolver.probe_timeout_secs as usize,
            "resolver.probe_timeout_secs",
        )?;
        non_zero(
            self.resolver.hls_timeout_secs as usize,
            "resolver.hls_timeout_secs",
        )?;
        non_zero(
            self.resolver.probe_max_concurrency,
            "resolver.probe_max_concurrency",
        )?;

        if self.capture.patterns.is_empty() {
            return Err(ConfigError::Empty {
                field: "capture.patterns",
            });
        }
        for (index, pattern) in self.capture.patterns.iter().enumerate() {
            Regex::new(pattern).map_err(|source| ConfigError::Pattern { index, source })?;
        }
        non_zero(
            self.capture.collection_window_ms as usize,
            "capture.collection_window_ms",
        )?;
        non_zero(
            self.capture.grace_after_actions_ms as usize,
            "capture.grace_after_actions_ms",
        )?;
        non_zero(self.capture.max_concurrency, "capture.max_concurrency")?;
        non_zero(self.capture.max_candidates, "capture.max_candidates")?;

        non_zero(
            self.actions.navigate_iframe_timeout_secs as usize,
            "actions.navigate_iframe_timeout_secs",
        )?;
        non_zero(
            self.actions.navigate_iframe_max_depth,
            "actions.navigate_iframe_max_depth",
        )?;
        non_zero(
            self.actions.bypass_turnstile_timeout_secs as usize,
            "actions.bypass_turnstile_timeout_secs",
        )?;
        non_zero(
            self.actions.turnstile_retry_timeout_secs as usize,
            "actions.turnstile_retry_timeout_secs",
        )?;

        for source in &self.sources {
            if source.name.trim().is_empty() {
                return Err(ConfigError::Empty { field: "sources[].name" });
            }
            if source.proxies.is_empty() {
                return Err(ConfigError::Source {
                    name: source.name.clone(),
                    reason: "needs at least one proxy".to_string(),
                });
            }
            if source.templates.movie.trim().is_empty()
                || source.templates.episode.trim().is_empty()
            {
                return Err(ConfigError::Source {
                    name: source.name.clone(),
                    reason: "movie and episode templates are required".to_string(),
                });
            }
        }

        non_empty(&self.transcode.ffmpeg_path, "transcode.ffmpeg_path")?;
        non_zero(self.transcode.read_rate as usize, "transcode.read_rate")?;
        non_empty(&self.transcode.video_codec, "transcode.video_codec")?;
        non_empty(&self.transcode.audio_codec, "transcode.audio_codec")?;
        non_zero(
            self.transcode.audio_sample_rate as usize,
            "transcode.audio_sample_rate",
        )?;
        non_empty(&self.transcode.audio_bitrate, "transcode.audio_bitrate")?;
        non_zero(
            self.transcode.initial_data_threshold,
            "transcode.initial_data_threshold",
        )?;
        non_zero(self.transcode.buffer_capacity, "transcode.buffer_capacity")?;
        if crate::media::lookup_output_format(&self.transcode.output_format).is_none() {
            return Err(ConfigError::OutputFormat(
                self.transcode.output_format.clone(),
            ));
        }

        Ok(())
    }

    /// Find a configured source by name.
    pub fn source(&self, name: &str) -> Option<&SourceConfig> {
        self.sources.iter().find(|s| s.name == name)
    }
}

impl NetworkConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl BrowserConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl ResolverConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn hls_timeout(&self) -> Duration {
        Duration::from_secs(self.hls_timeout_secs)
    }
}

impl CaptureConfig {
    pub fn collection_window(&self) -> Duration {
        Duration::from_millis(self.collection_window_ms)
    }

    pub fn grace_after_actions(&self) -> Duration {
        Duration::from_millis(self.grace_after_actions_ms)
    }
}

impl ActionConfig {
    pub fn navigate_iframe_timeout(&self) -> Duration {
        Duration::from_secs(self.navigate_iframe_timeout_secs)
    }

    pub fn bypass_turnstile_timeout(&self) -> Duration {
        Duration::from_secs(self.bypass_turnstile_timeout_secs)
    }

    pub fn turnstile_retry_timeout(&self) -> Duration {
        Duration::from_secs(self.turnstile_retry_timeout_secs)
    }
}

impl SourceConfig {
    /// Expand the movie template across all proxies.
    pub fn movie_urls(&self, item_id: &str) -> Vec<String> {
        self.expand(&self.templates.movie, &[("{itemID}", item_id.to_string())])
    }

    /// Expand the episode template across all proxies.
    pub fn episode_urls(&self, item_id: &str, season: u32, episode: u32) -> Vec<String> {
        self.expand(
            &self.templates.episode,
            &[
                ("{itemID}", item_id.to_string()),
                ("{season}", season.to_string()),
                ("{episode}", episode.to_string()),
            ],
        )
    }

    fn expand(&self, template: &str, replacements: &[(&str, String)]) -> Vec<String> {
        let mut route = template.to_string();
        for (placeholder, value) in replacements {
            route = route.replace(placeholder, value);
        }
        self.proxies
            .iter()
            .map(|proxy| format!("{proxy}{route}"))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
device:
  name: Living Room TV
  type: dlna
network:
  timeout_secs: 5
  interface: eth0
browser:
  timeout_secs: 30
  headless: true
  no_sandbox: false
resolver:
  ffprobe_path: ffprobe
  probe_timeout_secs: 15
  hls_timeout_secs: 10
  probe_max_concurrency: 4
capture:
  patterns:
    - '\.m3u8'
    - '\.mp4'
  collection_window_ms: 1500
  grace_after_actions_ms: 8000
  max_concurrency: 2
  max_candidates: 32
actions:
  navigate_iframe_timeout_secs: 10
  navigate_iframe_max_depth: 3
  bypass_turnstile_timeout_secs: 20
  turnstile_retry_timeout_secs: 10
sources:
  - name: src1
    proxies:
      - "http://p1/"
      - "http://p2/"
    templates:
      movie: "watch/{itemID}"
      episode: "watch/{itemID}/s{season}e{episode}"
transcode:
  ffmpeg_path: ffmpeg
  read_rate: 1
  read_rate_burst: 30
  video_codec: copy
  audio_codec: aac
  audio_sample_rate: 48000
  audio_bitrate: 128k
  output_format: mpegts
  initial_data_threshold: 262144
"#;

    fn sample() -> Config {
        let config: Config = serde_yaml::from_str(SAMPLE).unwrap();
        config.validate().unwrap();
        config
    }

    #[test]
    fn parses_and_validates() {
        let config = sample();
        assert_eq!(config.device.name, "Living Room TV");
        assert_eq!(config.capture.patterns.len(), 2);
        assert_eq!(config.transcode.buffer_capacity, 32 * 1024 * 1024);
    }

    #[test]
    fn rejects_bad_pattern() {
        let mut config = sample();
        config.capture.patterns.push("(".to_string());
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Pattern { index: 2, .. })
        ));
    }

    #[test]
    fn rejects_unknown_output_format() {
        let mut config = sample();
        config.transcode.output_format = "ogg".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::OutputFormat(_))
        ));
    }

    #[test]
    fn rejects_source_without_proxies() {
        let mut config = sample();
        config.sources[0].proxies.clear();
        assert!(matches!(config.validate(), Err(ConfigError::Source { .. })));
    }

    #[test]
    fn expands_episode_template_across_proxies() {
        let config = sample();
        let source = config.source("src1").unwrap();
        assert_eq!(
            source.episode_urls("abc", 2, 5),
            vec![
                "http://p1/watch/abc/s2e5".to_string(),
                "http://p2/watch/abc/s2e5".to_string(),
            ]
        );
    }

    #[test]
    fn expands_movie_template() {
        let config = sample();
        let source = config.source("src1").unwrap();
        assert_eq!(
            source.movie_urls("abc123"),
            vec![
                "http://p1/watch/abc123".to_string(),
                "http://p2/watch/abc123".to_string(),
            ]
        );
    }

    #[test]
    fn source_lookup_misses() {
        let config = sample();
        assert!(config.source("nope").is_none());
    }
}
