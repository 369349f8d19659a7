use std::collections::HashMap;
use std::process::Stdio;

use serde::Deserialize;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;
use url::Url;

use crate::config::ResolverConfig;
use crate::media::{self, ContentType, HLS_INPUT_ARGS};

/// Metadata ffprobe reports for a stream.
#[derive(Debug, Clone, Copy)]
pub struct StreamInfo {
    pub content_type: ContentType,
    /// Bits per second; 0 when ffprobe does not report one.
    pub bit_rate: u64,
}

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("starting ffprobe: {0}")]
    Spawn(std::io::Error),
    #[error("ffprobe timed out after {0}s")]
    Timeout(u64),
    #[error("ffprobe failed ({status}): {stderr}")]
    Failed { status: String, stderr: String },
    #[error("parsing ffprobe output: {0}")]
    Parse(serde_json::Error),
    #[error("ffprobe returned no format name")]
    NoFormat,
    #[error("unknown format {0:?}")]
    UnknownFormat(String),
}

#[derive(Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    format: ProbeFormat,
}

#[derive(Deserialize, Default)]
struct ProbeFormat {
    #[serde(default)]
    format_name: String,
    #[serde(default)]
    bit_rate: String,
}

/**
    Run ffprobe against a stream URL and map the result into the closed
    content-type set. Headers are forwarded so origin-locked streams probe
    the same way they will play.
*/
pub async fn probe_stream(
    cfg: &ResolverConfig,
    url: &Url,
    headers: &HashMap<String, String>,
) -> Result<StreamInfo, ProbeError> {
    let mut args: Vec<String> = vec![
        // "error" instead of "quiet" so stderr still carries failure details.
        "-v".into(),
        "error".into(),
        "-print_format".into(),
        "json".into(),
        // Only the format block is needed; keeps the probe cheap.
        "-show_entries".into(),
        "format=format_name,bit_rate".into(),
        "-show_format".into(),
    ];

    let header_block = media::format_http_headers(headers);
    if !header_block.is_empty() {
        args.push("-headers".into());
        args.push(header_block);
    }

    args.extend(HLS_INPUT_ARGS.iter().map(|s| s.to_string()));
    args.push(url.to_string());

    debug!(url = %url, header_count = headers.len(), "ffprobe starting");

    let output = Command::new(&cfg.ffprobe_path)
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output();

    let output = tokio::time::timeout(cfg.probe_timeout(), output)
        .await
        .map_err(|_| ProbeError::Timeout(cfg.probe_timeout_secs))?
        .map_err(ProbeError::Spawn)?;

    if !output.status.success() {
        return Err(ProbeError::Failed {
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    parse_probe_output(&output.stdout)
}

fn parse_probe_output(stdout: &[u8]) -> Result<StreamInfo, ProbeError> {
    let parsed: ProbeOutput = serde_json::from_slice(stdout).map_err(ProbeError::Parse)?;

    if parsed.format.format_name.is_empty() {
        return Err(ProbeError::NoFormat);
    }

    let content_type = ContentType::from_probe_format(&parsed.format.format_name)
        .ok_or_else(|| ProbeError::UnknownFormat(parsed.format.format_name.clone()))?;

    // ffprobe reports bit_rate as a string, and omits it for some inputs.
    let bit_rate = parsed.format.bit_rate.parse::<u64>().unwrap_or(0);

    Ok(StreamInfo {
        content_type,
        bit_rate,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_format_and_bit_rate() {
        let json = br#"{"format":{"format_name":"hls","bit_rate":"2500000"}}"#;
        let info = parse_probe_output(json).unwrap();
        assert_eq!(info.content_type, ContentType::Hls);
        assert_eq!(info.bit_rate, 2500000);
    }

    #[test]
    fn missing_bit_rate_defaults_to_zero() {
        let json = br#"{"format":{"format_name":"matroska,webm"}}"#;
        let info = parse_probe_output(json).unwrap();
        assert_eq!(info.content_type, ContentType::Mkv);
        assert_eq!(info.bit_rate, 0);
    }

    #[test]
    fn unknown_format_is_an_error() {
        let json = br#"{"format":{"format_name":"gif","bit_rate":"1"}}"#;
        assert!(matches!(
            parse_probe_output(json),
            Err(ProbeError::UnknownFormat(f)) if f == "gif"
        ));
    }

    #[test]
    fn empty_format_is_an_error() {
        let json = br#"{"format":{}}"#;
        assert!(matches!(parse_probe_output(json), Err(ProbeError::NoFormat)));
    }

    #[test]
    fn garbage_output_is_a_parse_error() {
        assert!(matches!(
            parse_probe_output(b"not json"),
            Err(ProbeError::Parse(_))
        ));
    }
}
