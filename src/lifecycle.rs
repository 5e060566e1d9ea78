use std::{fmt, path::PathBuf, sync::Arc};

use tokio::{select, sync::mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    checkpoint::{Checkpoint, CheckpointError},
    config::DownloadConfig,
    dedup::DedupCache,
    fetch::{FetchError, FetchPool, prepare_output_dir},
    manifest::{ManifestError, Resolver},
    merge::{MergeError, merge_segments},
    progress::Progress,
    transport::Transport,
};

#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Merge(#[from] MergeError),

    #[error("{pending} of {total} segments could not be downloaded, re-run to resume")]
    Incomplete { pending: usize, total: usize },

    #[error("manifest resolver task died: {0}")]
    Resolver(#[from] tokio::task::JoinError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Init,
    Resolving,
    Fetching,
    Merging,
    Done,
    Interrupted,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Init => "init",
            Self::Resolving => "resolving",
            Self::Fetching => "fetching",
            Self::Merging => "merging",
            Self::Done => "done",
            Self::Interrupted => "interrupted",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadOutcome {
    Completed { artifact: PathBuf, bytes: u64 },
    /// Every segment is on disk, merging was turned off
    FetchedOnly,
    /// Stopped by a termination signal, checkpoint flushed
    Interrupted,
}

/// Shared state of one download, handed to every stage
#[derive(Clone)]
pub struct DownloadContext {
    pub config: Arc<DownloadConfig>,
    pub transport: Arc<dyn Transport>,
    pub checkpoint: Arc<Checkpoint>,
    pub progress: Progress,
    pub ct: CancellationToken,
}

/// Drives one download from checkpoint lookup to merged artifact
pub struct Controller {
    ctx: DownloadContext,
    stage: Stage,
}

impl Controller {
    /// Loads the checkpoint of `config.output_dir`, if any
    ///
    /// # Errors
    /// Errors when an existing checkpoint cannot be read. A damaged one is replaced.
    pub async fn new(
        config: DownloadConfig,
        transport: Arc<dyn Transport>,
        progress: Progress,
        ct: CancellationToken,
    ) -> Result<Self, DownloadError> {
        let checkpoint = Checkpoint::open(config.checkpoint_path()).await?;

        Ok(Self {
            ctx: DownloadContext {
                config: Arc::new(config),
                transport,
                checkpoint: Arc::new(checkpoint),
                progress,
                ct,
            },
            stage: Stage::Init,
        })
    }

    #[must_use]
    pub const fn stage(&self) -> Stage {
        self.stage
    }

    fn enter(&mut self, stage: Stage) {
        info!("Download stage: {} -> {stage}", self.stage);
        self.stage = stage;
    }

    /// Runs the download to completion, or until the cancellation token fires.
    ///
    /// The checkpoint is flushed before returning on every path past directory creation.
    ///
    /// # Errors
    /// Errors on any fatal condition: uncreatable output directory, undecodable manifest,
    /// segments left incomplete, or a failed merge
    pub async fn run(&mut self) -> Result<DownloadOutcome, DownloadError> {
        let config = self.ctx.config.clone();
        prepare_output_dir(&config.output_dir).await?;

        let resume = !self.ctx.checkpoint.is_empty();
        if resume {
            info!(
                "Found checkpoint at {:?}, resuming",
                self.ctx.checkpoint.file()
            );
        } else {
            info!("Starting a fresh download of {}", config.manifest_url);
        }

        let fetching_done = CancellationToken::new();
        let flusher = self.spawn_signal_flusher(fetching_done.clone());
        let fetched = self.fetch(resume).await;
        fetching_done.cancel();
        if let Err(e) = flusher.await {
            warn!("Checkpoint flusher task died: {e}");
        }

        let persisted = self.ctx.checkpoint.persist().await;

        if self.ctx.ct.is_cancelled() {
            self.enter(Stage::Interrupted);
            self.ctx.progress.finish();
            persisted?;
            info!("Progress saved to {:?}", self.ctx.checkpoint.file());
            return Ok(DownloadOutcome::Interrupted);
        }
        self.ctx.progress.finish();
        fetched?;
        persisted?;

        let order = self.ctx.checkpoint.segment_order();
        let pending = self.ctx.checkpoint.pending().len();
        if pending > 0 {
            return Err(DownloadError::Incomplete {
                pending,
                total: order.len(),
            });
        }
        info!("Done downloading all {} segments!", order.len());

        if !config.merge {
            self.enter(Stage::Done);
            return Ok(DownloadOutcome::FetchedOnly);
        }

        self.enter(Stage::Merging);
        let artifact = config.artifact_path();
        let bytes = merge_segments(&config.output_dir, &order, &artifact).await?;

        self.enter(Stage::Done);
        info!("Final file path: {artifact:?}");
        Ok(DownloadOutcome::Completed { artifact, bytes })
    }

    /// Resolving and fetching run side by side, connected by a bounded queue
    async fn fetch(&mut self, resume: bool) -> Result<(), DownloadError> {
        let config = self.ctx.config.clone();
        let (tx, rx) = mpsc::channel(config.queue_capacity);

        self.enter(Stage::Resolving);
        let resolver = Resolver::new(
            self.ctx.transport.clone(),
            self.ctx.checkpoint.clone(),
            self.ctx.progress.clone(),
            DedupCache::new(config.dedup_capacity),
            self.ctx.ct.clone(),
        )
        .with_retry_delay(config.manifest_retry_delay)
        .with_max_depth(config.max_selector_depth);

        let manifest_url = config.manifest_url.clone();
        let resolving = tokio::spawn(async move {
            if resume {
                resolver.resume(tx).await
            } else {
                resolver.run(manifest_url, tx).await
            }
        });

        self.enter(Stage::Fetching);
        let pool = FetchPool::new(
            self.ctx.transport.clone(),
            self.ctx.checkpoint.clone(),
            self.ctx.progress.clone(),
            config.output_dir.clone(),
            config.concurrency,
            self.ctx.ct.clone(),
        );
        let summary = pool.run(rx).await;
        info!(
            "Fetched {} segments, {} already complete, {} failed",
            summary.fetched, summary.skipped, summary.failed
        );

        match resolving.await? {
            Ok(()) => Ok(()),
            Err(e) => {
                error!("Resolving the manifest failed: {e}");
                Err(e.into())
            }
        }
    }

    /// Flushes the checkpoint as soon as shutdown is requested, before in-flight transfers end
    fn spawn_signal_flusher(&self, done: CancellationToken) -> tokio::task::JoinHandle<()> {
        let checkpoint = self.ctx.checkpoint.clone();
        let ct = self.ctx.ct.clone();
        tokio::spawn(async move {
            select! {
                () = ct.cancelled() => {}
                () = done.cancelled() => return,
            }
            info!("Shutdown requested, saving progress");
            if let Err(e) = checkpoint.persist().await {
                warn!("Unable to save progress: {e}");
            }
        })
    }
}
