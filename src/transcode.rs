use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use crate::broker::RingBroker;
use crate::config::TranscodeConfig;
use crate::media::{self, HLS_INPUT_ARGS};

/**
    A running ffmpeg transcode whose stdout is pumped into a ring broker.

    The process is throttled to roughly real-time input reading so the ring
    stays a bounded window around the playhead instead of racing ahead of the
    renderer. Stderr is drained line-by-line into the debug log.
*/
pub struct Transcoder {
    child: Child,
    pump: JoinHandle<()>,
}

/// Build the full ffmpeg argument list for a source URL and output settings.
fn build_args(cfg: &TranscodeConfig, source: &Url, headers: &HashMap<String, String>) -> Vec<String> {
    let mut args: Vec<String> = vec![
        // Throttle input reading to roughly real-time playback speed.
        "-readrate".into(),
        cfg.read_rate.to_string(),
        // Allow an initial burst of data before rate-limiting kicks in.
        "-readrate_initial_burst".into(),
        cfg.read_rate_burst.to_string(),
        // Generate missing PTS and discard corrupt frames.
        "-fflags".into(),
        "+genpts+discardcorrupt".into(),
    ];

    let header_block = media::format_http_headers(headers);
    if !header_block.is_empty() {
        args.push("-headers".into());
        args.push(header_block);
    }

    args.extend(HLS_INPUT_ARGS.iter().map(|s| s.to_string()));

    args.extend([
        "-i".into(),
        source.to_string(),
        "-c:v".into(),
        cfg.video_codec.clone(),
        "-c:a".into(),
        cfg.audio_codec.clone(),
        "-ar".into(),
        cfg.audio_sample_rate.to_string(),
        "-b:a".into(),
        cfg.audio_bitrate.clone(),
        "-f".into(),
        cfg.output_format.clone(),
        "pipe:1".into(),
    ]);

    args
}

impl Transcoder {
    /**
        Spawn ffmpeg reading from `source` and start pumping its stdout into
        `broker`. The broker is closed (with the read error as terminal
        error, if any) when the pipe ends. Cancelling `cancel` kills the
        process.
    */
    pub fn spawn(
        cfg: &TranscodeConfig,
        source: &Url,
        headers: &HashMap<String, String>,
        broker: Arc<RingBroker>,
    ) -> Result<Self> {
        let args = build_args(cfg, source, headers);

        let mut child = Command::new(&cfg.ffmpeg_path)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("starting ffmpeg at {:?}", cfg.ffmpeg_path))?;

        info!(
            source = %source,
            video_codec = %cfg.video_codec,
            audio_codec = %cfg.audio_codec,
            output_format = %cfg.output_format,
            "ffmpeg started"
        );

        let stdout = child.stdout.take().context("taking ffmpeg stdout")?;
        let stderr = child.stderr.take().context("taking ffmpeg stderr")?;

        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(target: "ffmpeg", "{line}");
            }
        });

        let pump = tokio::spawn(async move {
            let mut reader = stdout;
            let mut buf = vec![0u8; 64 * 1024];
            let close_err = loop {
                match reader.read(&mut buf).await {
                    Ok(0) => break None,
                    Ok(n) => broker.write(&buf[..n]),
                    Err(err) => break Some(err.to_string()),
                }
            };
            broker.close(close_err);
        });

        Ok(Self { child, pump })
    }

    /**
        Wait for the process to exit and the stdout pump to drain. A nonzero
        exit after a successful start is a warning, not a failure.
    */
    pub async fn wait(mut self) -> Result<()> {
        let status = self.child.wait().await.context("waiting for ffmpeg")?;
        let _ = self.pump.await;

        if !status.success() {
            warn!(%status, "ffmpeg exited with error");
        }
        Ok(())
    }

    /**
        Kill the process; the closed pipe propagates EOF through the broker.
        Used on cancellation (kill_on_drop also covers abnormal teardown).
    */
    pub async fn kill(mut self) {
        let _ = self.child.kill().await;
        let _ = self.pump.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_cfg() -> TranscodeConfig {
        TranscodeConfig {
            ffmpeg_path: "ffmpeg".to_string(),
            read_rate: 1,
            read_rate_burst: 30,
            video_codec: "copy".to_string(),
            audio_codec: "aac".to_string(),
            audio_sample_rate: 48000,
            audio_bitrate: "128k".to_string(),
            output_format: "mpegts".to_string(),
            initial_data_threshold: 1024,
            buffer_capacity: 4096,
        }
    }

    #[test]
    fn args_include_throttle_and_output() {
        let cfg = sample_cfg();
        let url = Url::parse("http://host/master.m3u8").unwrap();
        let args = build_args(&cfg, &url, &HashMap::new());

        assert_eq!(args[0], "-readrate");
        assert_eq!(args[1], "1");
        assert!(args.contains(&"+genpts+discardcorrupt".to_string()));
        assert!(args.contains(&"-allowed_extensions".to_string()));

        let i = args.iter().position(|a| a == "-i").unwrap();
        assert_eq!(args[i + 1], "http://host/master.m3u8");
        assert_eq!(args.last().unwrap(), "pipe:1");

        let f = args.iter().position(|a| a == "-f").unwrap();
        assert_eq!(args[f + 1], "mpegts");
    }

    #[test]
    fn args_forward_headers_before_input() {
        let cfg = sample_cfg();
        let url = Url::parse("http://host/v.mp4").unwrap();
        let mut headers = HashMap::new();
        headers.insert("Referer".to_string(), "http://origin/".to_string());

        let args = build_args(&cfg, &url, &headers);
        let h = args.iter().position(|a| a == "-headers").unwrap();
        assert_eq!(args[h + 1], "Referer: http://origin/\r\n");
        assert!(h < args.iter().position(|a| a == "-i").unwrap());
    }

    #[test]
    fn args_omit_empty_header_block() {
        let cfg = sample_cfg();
        let url = Url::parse("http://host/v.mp4").unwrap();
        let args = build_args(&cfg, &url, &HashMap::new());
        assert!(!args.contains(&"-headers".to_string()));
    }
}
