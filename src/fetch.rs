use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
};

use tokio::{
    fs::File,
    io::AsyncWriteExt,
    select,
    sync::{Semaphore, mpsc},
    task::JoinSet,
};
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    checkpoint::Checkpoint,
    manifest::SegmentDescriptor,
    progress::Progress,
    transport::{Transport, TransportError},
};

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("writing segment {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("unable to create output directory {}: {source}", .path.display())]
    OutputDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl FetchError {
    /// Whether the whole run has to stop, as opposed to leaving one segment for a later resume
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::OutputDir { .. })
    }
}

/// Creates the output directory unless it already exists
///
/// # Errors
/// Errors when the directory cannot be created
pub async fn prepare_output_dir(dir: &Path) -> Result<(), FetchError> {
    match tokio::fs::create_dir_all(dir).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::AlreadyExists && dir.is_dir() => Ok(()),
        Err(source) => Err(FetchError::OutputDir {
            path: dir.to_path_buf(),
            source,
        }),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentOutcome {
    /// Already complete according to the checkpoint
    Skipped,
    Fetched,
    Failed,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FetchSummary {
    pub fetched: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl FetchSummary {
    fn record(&mut self, outcome: SegmentOutcome) {
        match outcome {
            SegmentOutcome::Skipped => self.skipped += 1,
            SegmentOutcome::Fetched => self.fetched += 1,
            SegmentOutcome::Failed => self.failed += 1,
        }
    }
}

/// Downloads queued segments with at most `concurrency` transfers at once
#[derive(Clone)]
pub struct FetchPool {
    transport: Arc<dyn Transport>,
    checkpoint: Arc<Checkpoint>,
    progress: Progress,
    output_dir: PathBuf,
    concurrency: usize,
    ct: CancellationToken,
}

impl FetchPool {
    #[must_use]
    pub fn new(
        transport: Arc<dyn Transport>,
        checkpoint: Arc<Checkpoint>,
        progress: Progress,
        output_dir: PathBuf,
        concurrency: usize,
        ct: CancellationToken,
    ) -> Self {
        Self {
            transport,
            checkpoint,
            progress,
            output_dir,
            concurrency: concurrency.max(1),
            ct,
        }
    }

    /// Drains `rx` until it closes or the pool is cancelled, then waits for every started
    /// transfer. In-flight transfers are not interrupted by cancellation.
    pub async fn run(&self, mut rx: mpsc::Receiver<SegmentDescriptor>) -> FetchSummary {
        let permits = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = JoinSet::new();
        let mut summary = FetchSummary::default();

        loop {
            let segment = select! {
                biased;
                () = self.ct.cancelled() => break,
                s = rx.recv() => match s {
                    Some(s) => s,
                    None => break,
                },
            };

            let permit = select! {
                biased;
                () = self.ct.cancelled() => break,
                p = permits.clone().acquire_owned() => match p {
                    Ok(p) => p,
                    Err(_) => break,
                },
            };

            let pool = self.clone();
            tasks.spawn(async move {
                let _permit = permit;
                pool.fetch_segment(&segment).await
            });

            while let Some(res) = tasks.try_join_next() {
                Self::tally(&mut summary, res);
            }
        }

        if self.ct.is_cancelled() {
            info!(
                "Stopped scheduling downloads, waiting for {} in-flight segments",
                tasks.len()
            );
        }
        while let Some(res) = tasks.join_next().await {
            Self::tally(&mut summary, res);
        }

        summary
    }

    fn tally(summary: &mut FetchSummary, res: Result<SegmentOutcome, tokio::task::JoinError>) {
        match res {
            Ok(outcome) => summary.record(outcome),
            Err(e) => {
                error!("Segment download task died: {e}");
                summary.record(SegmentOutcome::Failed);
            }
        }
    }

    /// Fetches one segment into `<output_dir>/<file name>` and records the result in the checkpoint
    pub async fn fetch_segment(&self, segment: &SegmentDescriptor) -> SegmentOutcome {
        if self.checkpoint.is_complete(&segment.name) {
            return SegmentOutcome::Skipped;
        }

        match self.download(segment).await {
            Ok(bytes) => {
                self.checkpoint.set_status(&segment.name, true);
                self.progress.advance();
                debug!("Done downloading {} ({bytes} bytes)", segment.name);
                SegmentOutcome::Fetched
            }
            Err(e) => {
                warn!("Segment {} failed: {e}", segment.name);
                self.checkpoint.set_status(&segment.name, false);
                SegmentOutcome::Failed
            }
        }
    }

    async fn download(&self, segment: &SegmentDescriptor) -> Result<u64, FetchError> {
        let res = self.transport.get(&segment.uri).await?;
        if res.status != 200 {
            return Err(TransportError::Status {
                url: segment.uri.to_string(),
                status: res.status,
            }
            .into());
        }

        let path = self.output_dir.join(segment.file_name());
        let write_err = |source: std::io::Error| FetchError::Write {
            path: path.clone(),
            source,
        };

        let mut file = File::create(&path).await.map_err(write_err)?;
        let mut body = res.body;
        let mut written = 0;
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await.map_err(write_err)?;
            written += chunk.len() as u64;
        }
        file.flush().await.map_err(write_err)?;

        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use reqwest::Url;

    use super::*;
    use crate::transport::fake::{FakeTransport, Reply};

    fn segment(name: &str) -> SegmentDescriptor {
        SegmentDescriptor::new(Url::parse(&format!("https://cdn.example.com/vod/{name}")).unwrap())
            .unwrap()
    }

    fn pool(
        transport: Arc<FakeTransport>,
        checkpoint: Arc<Checkpoint>,
        dir: &Path,
        concurrency: usize,
    ) -> FetchPool {
        FetchPool::new(
            transport,
            checkpoint,
            Progress::hidden(),
            dir.to_path_buf(),
            concurrency,
            CancellationToken::new(),
        )
    }

    async fn feed(segments: Vec<SegmentDescriptor>) -> mpsc::Receiver<SegmentDescriptor> {
        let (tx, rx) = mpsc::channel(segments.len().max(1));
        for s in segments {
            tx.send(s).await.unwrap();
        }
        rx
    }

    #[tokio::test]
    async fn fetched_segments_are_written_and_marked_complete() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(FakeTransport::new());
        transport.serve("https://cdn.example.com/vod/a.ts", "AAA");
        transport.serve("https://cdn.example.com/vod/b.ts", "BBBB");
        let checkpoint = Arc::new(Checkpoint::new(dir.path().join(".index")));
        checkpoint.register(["a.ts", "b.ts"]);

        let summary = pool(transport, checkpoint.clone(), dir.path(), 4)
            .run(feed(vec![segment("a.ts"), segment("b.ts")]).await)
            .await;

        assert_eq!(summary.fetched, 2);
        assert_eq!(std::fs::read(dir.path().join("a.ts")).unwrap(), b"AAA");
        assert_eq!(std::fs::read(dir.path().join("b.ts")).unwrap(), b"BBBB");
        assert!(checkpoint.is_complete("a.ts"));
        assert!(checkpoint.is_complete("b.ts"));
    }

    #[tokio::test]
    async fn completed_segments_are_skipped_without_network() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(FakeTransport::new());
        let checkpoint = Arc::new(Checkpoint::new(dir.path().join(".index")));
        checkpoint.register(["a.ts"]);
        checkpoint.set_status("a.ts", true);

        let outcome = pool(transport.clone(), checkpoint, dir.path(), 1)
            .fetch_segment(&segment("a.ts"))
            .await;

        assert_eq!(outcome, SegmentOutcome::Skipped);
        assert_eq!(transport.total_requests(), 0);
    }

    #[tokio::test]
    async fn failures_are_left_incomplete_and_do_not_stop_the_pool() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(FakeTransport::new());
        transport.push(
            "https://cdn.example.com/vod/a.ts",
            Reply::Ok {
                status: 404,
                body: b"not found".to_vec(),
            },
        );
        transport.push("https://cdn.example.com/vod/b.ts", Reply::ConnectionError);
        transport.serve("https://cdn.example.com/vod/c.ts", "CC");
        let checkpoint = Arc::new(Checkpoint::new(dir.path().join(".index")));
        checkpoint.register(["a.ts", "b.ts", "c.ts"]);

        let summary = pool(transport.clone(), checkpoint.clone(), dir.path(), 2)
            .run(feed(vec![segment("a.ts"), segment("b.ts"), segment("c.ts")]).await)
            .await;

        assert_eq!(
            summary,
            FetchSummary {
                fetched: 1,
                skipped: 0,
                failed: 2
            }
        );
        assert_eq!(checkpoint.pending(), vec!["a.ts", "b.ts"]);
        assert!(!dir.path().join("a.ts").exists());
        // Not retried within the same run
        assert_eq!(transport.request_count("https://cdn.example.com/vod/a.ts"), 1);
    }

    #[tokio::test]
    async fn concurrency_never_exceeds_the_limit() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(FakeTransport::with_delay(Duration::from_millis(30)));
        let checkpoint = Arc::new(Checkpoint::new(dir.path().join(".index")));
        let names = (0..12).map(|i| format!("{i}.ts")).collect::<Vec<_>>();
        for name in &names {
            transport.serve(&format!("https://cdn.example.com/vod/{name}"), name.as_bytes());
        }
        checkpoint.register(names.clone());

        let summary = pool(transport.clone(), checkpoint.clone(), dir.path(), 3)
            .run(feed(names.iter().map(|n| segment(n)).collect()).await)
            .await;

        assert_eq!(summary.fetched, 12);
        assert!(transport.peak_concurrency() <= 3);
        assert_eq!(transport.peak_concurrency(), 3);
        assert!(checkpoint.pending().is_empty());
    }

    #[tokio::test]
    async fn cancellation_stops_scheduling_but_finishes_in_flight() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(FakeTransport::with_delay(Duration::from_millis(100)));
        let checkpoint = Arc::new(Checkpoint::new(dir.path().join(".index")));
        let names = (0..6).map(|i| format!("{i}.ts")).collect::<Vec<_>>();
        for name in &names {
            transport.serve(&format!("https://cdn.example.com/vod/{name}"), "x");
        }
        checkpoint.register(names.clone());
        let ct = CancellationToken::new();

        let pool = FetchPool::new(
            transport.clone(),
            checkpoint.clone(),
            Progress::hidden(),
            dir.path().to_path_buf(),
            2,
            ct.clone(),
        );
        let rx = feed(names.iter().map(|n| segment(n)).collect()).await;
        let task = tokio::spawn(async move { pool.run(rx).await });

        tokio::time::sleep(Duration::from_millis(30)).await;
        ct.cancel();
        let summary = task.await.unwrap();

        assert_eq!(summary.fetched, 2);
        assert_eq!(transport.total_requests(), 2);
        assert_eq!(checkpoint.pending().len(), 4);
    }

    #[tokio::test]
    async fn output_directory_is_created_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a").join("b");

        prepare_output_dir(&nested).await.unwrap();
        assert!(nested.is_dir());
        prepare_output_dir(&nested).await.unwrap();
    }

    #[tokio::test]
    async fn output_directory_under_a_file_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("file");
        std::fs::write(&file, b"").unwrap();

        let err = prepare_output_dir(&file.join("out")).await.unwrap_err();
        assert!(err.is_fatal());
    }
}
