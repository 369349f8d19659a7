use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use clap::Subcommand;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::cast::cast_stream;
use crate::config::Config;
use crate::extract::{Extractor, extract_all};
use crate::media::Stream;
use crate::resolve;

#[derive(clap::Args, Debug)]
pub struct CastCommand {
    /// Print found streaming URLs instead of casting
    #[arg(short = 'd', long, global = true)]
    pub dry_run: bool,

    #[command(subcommand)]
    pub target: CastTarget,
}

#[derive(Subcommand, Debug)]
pub enum CastTarget {
    /// Cast a direct video URL
    Url {
        /// Stream URL to cast
        url: String,
    },
    /// Cast a movie by item ID via a configured source
    Movie {
        /// Source to expand templates from
        #[arg(long)]
        source: String,
        /// Item identifier within the source
        item_id: String,
    },
    /// Cast a series episode by item ID via a configured source
    Episode {
        #[arg(long)]
        source: String,
        /// Season number
        #[arg(long)]
        season: u32,
        /// Episode number
        #[arg(long)]
        episode: u32,
        item_id: String,
    },
    /// Cast a video extracted from a player page URL
    Player {
        /// Player page URL
        url: String,
    },
}

impl CastCommand {
    pub async fn run(self, cancel: &CancellationToken, config: &Config) -> Result<()> {
        let CastCommand { dry_run, target } = self;

        match target {
            CastTarget::Url { url } => {
                let url = Url::parse(&url).with_context(|| format!("invalid URL {url:?}"))?;
                let stream = Stream::new(url);

                if dry_run {
                    let rows = resolve::list(&config.resolver, std::slice::from_ref(&stream)).await;
                    if rows.is_empty() {
                        // Probing is best-effort for a direct URL; still list it.
                        println!("0\t{}", stream.url);
                    } else {
                        for row in rows {
                            println!("{}\t{}", row.bit_rate, row.url);
                        }
                    }
                    return Ok(());
                }

                cast_stream(cancel, config, stream).await
            }
            CastTarget::Movie { source, item_id } => {
                let source = config
                    .source(&source)
                    .ok_or_else(|| anyhow!("source {source:?} not found"))?;
                let urls = source.movie_urls(&item_id);
                extract_and_handle(dry_run, cancel, config, &urls).await
            }
            CastTarget::Episode {
                source,
                season,
                episode,
                item_id,
            } => {
                let source = config
                    .source(&source)
                    .ok_or_else(|| anyhow!("source {source:?} not found"))?;
                let urls = source.episode_urls(&item_id, season, episode);
                extract_and_handle(dry_run, cancel, config, &urls).await
            }
            CastTarget::Player { url } => {
                extract_and_handle(dry_run, cancel, config, &[url]).await
            }
        }
    }
}

/// Extract streams from page URLs, then list (--dry-run) or cast the best.
async fn extract_and_handle(
    dry_run: bool,
    cancel: &CancellationToken,
    config: &Config,
    urls: &[String],
) -> Result<()> {
    let extractor = Arc::new(
        Extractor::new(
            config.browser.clone(),
            config.capture.clone(),
            config.actions.clone(),
        )
        .context("creating extractor")?,
    );

    let streams = extract_all(cancel, extractor, urls)
        .await
        .context("extracting streams")?;

    if dry_run {
        for row in resolve::list(&config.resolver, &streams).await {
            println!("{}\t{}", row.bit_rate, row.url);
        }
        return Ok(());
    }

    let best = resolve::rank(&config.resolver, streams)
        .await
        .context("ranking streams")?;

    cast_stream(cancel, config, best).await
}
