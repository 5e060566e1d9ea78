#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![warn(clippy::cargo)]
#![warn(clippy::perf)]
#![warn(clippy::complexity)]
#![warn(clippy::style)]
#![allow(clippy::multiple_crate_versions)]

use std::{path::PathBuf, process::ExitCode, sync::Arc};

use anyhow::{Context, Result, bail, ensure};
use clap::Parser;
use config::{DownloadConfig, default_user_agent};
use lifecycle::{Controller, DownloadOutcome};
use progress::Progress;
use reqwest::Url;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use transport::HttpTransport;
use util::{spawn_ct_watcher, warn_ulimit};

pub mod checkpoint;
pub mod config;
pub mod dedup;
pub mod fetch;
pub mod lifecycle;
pub mod manifest;
pub mod merge;
pub mod progress;
pub mod transport;
pub mod util;

const USER_AGENT_ENV: &str = "HLS_SQUIRREL_USER_AGENT";

/// Downloads an HLS (m3u8) stream into a single file, resuming where a previous run stopped
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// m3u8 URL to download, e.g. `https://example.com/vod/index.m3u8`
    #[arg(short, long)]
    url: String,

    /// Directory segments are downloaded into. The merged file is written next to it as `<out>.<extension>`
    #[arg(short, long)]
    out: PathBuf,

    /// The amount of parallel downloads
    #[arg(short, long, default_value_t = config::DEFAULT_CONCURRENCY)]
    num: usize,

    /// User-Agent header sent with every request [env: HLS_SQUIRREL_USER_AGENT]
    #[arg(long)]
    user_agent: Option<String>,

    /// Extension of the merged file
    #[arg(long, default_value = config::DEFAULT_EXTENSION)]
    extension: String,

    /// Only download segments, do not merge them
    #[arg(long)]
    no_merge: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    match run(args).await {
        Ok(DownloadOutcome::Interrupted) => {
            info!("Download interrupted, run the same command again to resume");
            ExitCode::from(130)
        }
        Ok(_) => {
            info!("All done successfully!");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<DownloadOutcome> {
    let config = build_config(args)?;
    warn_ulimit(config.concurrency);

    info!("m3u8 url: {}", config.manifest_url);
    info!(
        "Downloading into {:?} with {} parallelism",
        config.output_dir, config.concurrency
    );

    let transport = HttpTransport::new(&config.user_agent).context("Building HTTP client")?;
    let ct = CancellationToken::new();
    spawn_ct_watcher(ct.clone());

    let mut controller = Controller::new(config, Arc::new(transport), Progress::visible(), ct)
        .await
        .context("Loading download checkpoint")?;

    controller.run().await.context("Downloading stream")
}

fn build_config(args: Args) -> Result<DownloadConfig> {
    let manifest_url = parse_manifest_url(&args.url)?;
    ensure!(
        !args.out.as_os_str().is_empty(),
        "Output directory must not be empty"
    );
    ensure!(args.num > 0, "Parallel downloads must be at least 1");
    ensure!(
        !args.extension.is_empty() && !args.extension.contains(['/', '\\']),
        "Invalid extension `{}`",
        args.extension
    );

    let mut config = DownloadConfig::new(manifest_url, args.out);
    config.concurrency = args.num;
    config.user_agent = args
        .user_agent
        .or_else(|| std::env::var(USER_AGENT_ENV).ok())
        .unwrap_or_else(default_user_agent);
    config.extension = args.extension;
    config.merge = !args.no_merge;

    Ok(config)
}

/// Accepts `http(s)` URLs whose path ends in `.m3u8`
fn parse_manifest_url(input: &str) -> Result<Url> {
    let url = Url::parse(input).with_context(|| format!("`{input}` is not a valid URL"))?;

    if !url.scheme().starts_with("http") {
        bail!("m3u8 url must use http(s), for example: https://example.com/vod/index.m3u8");
    }
    if !url.path().ends_with(".m3u8") {
        bail!("m3u8 url must point to a .m3u8 file, for example: https://example.com/vod/index.m3u8");
    }

    Ok(url)
}
