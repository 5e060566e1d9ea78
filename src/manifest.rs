use std::{sync::Arc, time::Duration};

use m3u8_rs::Playlist;
use reqwest::Url;
use tokio::{select, sync::mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::{
    checkpoint::{Checkpoint, CheckpointError},
    config::segment_file_name,
    dedup::DedupCache,
    progress::Progress,
    transport::{Transport, TransportError},
};

#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("unable to fetch manifest: {0}")]
    Fetch(#[from] TransportError),

    #[error("{url} is not a valid m3u8 manifest")]
    Decode { url: String },

    #[error("unable to resolve `{uri}` into an absolute URL: {reason}")]
    InvalidUri { uri: String, reason: String },

    #[error("gave up after following {depth} nested master playlists")]
    TooDeep { depth: usize },

    #[error("master playlist {url} lists no renditions")]
    EmptySelector { url: String },

    #[error("segment queue closed before the manifest was fully enqueued")]
    QueueClosed,

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
}

/// A segment to fetch. `name` is everything after the last `/` of `uri`, query included, so
/// `base path + name` rebuilds the request URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentDescriptor {
    pub uri: Url,
    pub name: String,
}

impl SegmentDescriptor {
    /// # Errors
    /// Errors when the URI has no final path component to name the segment after
    pub fn new(uri: Url) -> Result<Self, ManifestError> {
        let last = uri
            .path_segments()
            .and_then(Iterator::last)
            .filter(|n| !n.is_empty())
            .ok_or_else(|| ManifestError::InvalidUri {
                uri: uri.to_string(),
                reason: "URI has no file name".to_string(),
            })?;

        let name = match uri.query() {
            Some(query) => format!("{last}?{query}"),
            None => last.to_string(),
        };

        Ok(Self { uri, name })
    }

    /// Where the segment is stored inside the output directory
    #[must_use]
    pub fn file_name(&self) -> String {
        segment_file_name(&self.name)
    }
}

/// Rendition of a master playlist
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rendition {
    pub bandwidth: u64,
    pub uri: String,
}

/// Segment list of a media playlist
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentList {
    pub uris: Vec<String>,
    /// `#EXT-X-ENDLIST` present, no more segments will be appended
    pub is_closed: bool,
    pub target_duration: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Manifest {
    Selector(Vec<Rendition>),
    Segments(SegmentList),
}

impl Manifest {
    /// # Errors
    /// Errors when `body` is not an m3u8 playlist
    pub fn decode(body: &[u8], url: &Url) -> Result<Self, ManifestError> {
        let playlist =
            m3u8_rs::parse_playlist_res(body).map_err(|_| ManifestError::Decode {
                url: url.to_string(),
            })?;

        Ok(match playlist {
            Playlist::MasterPlaylist(master) => Self::Selector(
                master
                    .variants
                    .into_iter()
                    .filter(|v| !v.is_i_frame)
                    .map(|v| Rendition {
                        bandwidth: v.bandwidth,
                        uri: v.uri,
                    })
                    .collect(),
            ),
            Playlist::MediaPlaylist(media) => Self::Segments(SegmentList {
                uris: media
                    .segments
                    .into_iter()
                    .map(|s| s.uri)
                    .filter(|uri| !uri.is_empty())
                    .collect(),
                is_closed: media.end_list,
                target_duration: media.target_duration,
            }),
        })
    }
}

/// Picks the rendition with the highest bandwidth. Ties go to the first listed.
#[must_use]
pub fn select_rendition(renditions: &[Rendition]) -> Option<&Rendition> {
    renditions.iter().fold(None, |best: Option<&Rendition>, r| match best {
        Some(b) if b.bandwidth >= r.bandwidth => Some(b),
        _ => Some(r),
    })
}

/// Resolves `uri` against the manifest it was listed in, then percent-decodes the result once
///
/// # Errors
/// Errors when the URI cannot be joined or does not parse back into a URL
pub fn absolute_uri(uri: &str, manifest_url: &Url) -> Result<Url, ManifestError> {
    let invalid = |reason: String| ManifestError::InvalidUri {
        uri: uri.to_string(),
        reason,
    };

    let joined = if uri.starts_with("http") {
        Url::parse(uri)
    } else {
        manifest_url.join(uri)
    }
    .map_err(|e| invalid(e.to_string()))?;

    let decoded = urlencoding::decode(joined.as_str()).map_err(|e| invalid(e.to_string()))?;
    Url::parse(&decoded).map_err(|e| invalid(e.to_string()))
}

/// Everything up to and including the last `/` of `uri`
#[must_use]
pub fn base_path_of(uri: &Url) -> String {
    let s = uri.as_str();
    let s = s.split(['?', '#']).next().unwrap_or(s);
    s.rfind('/').map_or_else(|| s.to_string(), |i| s[..=i].to_string())
}

/// Turns a manifest URL into a stream of [`SegmentDescriptor`]s on a bounded queue
pub struct Resolver {
    transport: Arc<dyn Transport>,
    checkpoint: Arc<Checkpoint>,
    progress: Progress,
    dedup: DedupCache,
    retry_delay: Duration,
    max_depth: usize,
    ct: CancellationToken,
}

impl Resolver {
    #[must_use]
    pub fn new(
        transport: Arc<dyn Transport>,
        checkpoint: Arc<Checkpoint>,
        progress: Progress,
        dedup: DedupCache,
        ct: CancellationToken,
    ) -> Self {
        Self {
            transport,
            checkpoint,
            progress,
            dedup,
            retry_delay: Duration::from_secs(3),
            max_depth: 5,
            ct,
        }
    }

    #[must_use]
    pub const fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    #[must_use]
    pub const fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    /// Resolves `manifest_url` and enqueues every segment not enqueued before.
    ///
    /// Closed playlists are resolved once. Open (live) playlists are polled every target
    /// duration until cancelled. Dropping `tx` on return closes the queue.
    ///
    /// # Errors
    /// Errors on decode failures, unresolvable URIs or when the checkpoint cannot be saved
    #[instrument(skip_all, fields(url = %manifest_url))]
    pub async fn run(
        &self,
        manifest_url: Url,
        tx: mpsc::Sender<SegmentDescriptor>,
    ) -> Result<(), ManifestError> {
        let (media_url, mut list) = self.resolve_media(manifest_url).await?;

        loop {
            let enqueued = self.enqueue(&media_url, &list, &tx).await?;
            debug!("Enqueued {enqueued} new segments");

            if list.is_closed {
                info!("Playlist is closed, all segments are enqueued");
                return Ok(());
            }

            let wait = Duration::from_secs(list.target_duration.max(1));
            debug!("Live playlist, polling again in {wait:?}");
            select! {
                () = self.ct.cancelled() => return Ok(()),
                () = tokio::time::sleep(wait) => {}
            }

            list = match self.fetch_manifest(&media_url).await? {
                Some(Manifest::Segments(list)) => list,
                Some(Manifest::Selector(_)) => {
                    return Err(ManifestError::Decode {
                        url: media_url.to_string(),
                    });
                }
                None => return Ok(()),
            };
        }
    }

    /// Enqueues segments recorded in the checkpoint that are not complete yet, then closes the
    /// queue. No manifest is fetched.
    ///
    /// # Errors
    /// Errors when a recorded segment does not form a valid URL with the recorded base path
    pub async fn resume(&self, tx: mpsc::Sender<SegmentDescriptor>) -> Result<(), ManifestError> {
        let base_path = self.checkpoint.base_path();
        let order = self.checkpoint.segment_order();
        let pending = self.checkpoint.pending();

        self.progress.add_total(order.len());
        self.progress.advance_by(order.len() - pending.len());
        info!(
            "Resuming download: {} of {} segments left",
            pending.len(),
            order.len()
        );

        for name in pending {
            let uri = Url::parse(&format!("{base_path}{name}")).map_err(|e| {
                ManifestError::InvalidUri {
                    uri: format!("{base_path}{name}"),
                    reason: e.to_string(),
                }
            })?;
            if !self.send(SegmentDescriptor { uri, name }, &tx).await? {
                break;
            }
        }

        Ok(())
    }

    /// Follows master playlists down to a media playlist
    async fn resolve_media(&self, manifest_url: Url) -> Result<(Url, SegmentList), ManifestError> {
        let mut url = manifest_url;

        for depth in 0..=self.max_depth {
            let Some(manifest) = self.fetch_manifest(&url).await? else {
                // Cancelled while waiting for the retry, nothing to enqueue
                return Ok((
                    url,
                    SegmentList {
                        uris: Vec::new(),
                        is_closed: true,
                        target_duration: 0,
                    },
                ));
            };

            match manifest {
                Manifest::Segments(list) => return Ok((url, list)),
                Manifest::Selector(renditions) => {
                    let rendition = select_rendition(&renditions).ok_or_else(|| {
                        ManifestError::EmptySelector {
                            url: url.to_string(),
                        }
                    })?;
                    info!(
                        "Selected rendition with bandwidth {} (depth {depth}): {}",
                        rendition.bandwidth, rendition.uri
                    );
                    url = absolute_uri(&rendition.uri, &url)?;
                }
            }
        }

        Err(ManifestError::TooDeep {
            depth: self.max_depth,
        })
    }

    /// Fetches and decodes a manifest, retrying once after `retry_delay`.
    ///
    /// When the retry fails as well, an empty body is decoded (and fails to decode).
    /// Returns `None` when cancelled while waiting.
    async fn fetch_manifest(&self, url: &Url) -> Result<Option<Manifest>, ManifestError> {
        let body = match self.fetch_body(url).await {
            Ok(body) => body,
            Err(e) => {
                warn!("{e}, retrying in {:?}", self.retry_delay);
                select! {
                    () = self.ct.cancelled() => return Ok(None),
                    () = tokio::time::sleep(self.retry_delay) => {}
                }
                self.fetch_body(url).await.unwrap_or_else(|e| {
                    warn!("{e}, giving up on the manifest");
                    Vec::new()
                })
            }
        };

        Manifest::decode(&body, url).map(Some)
    }

    async fn fetch_body(&self, url: &Url) -> Result<Vec<u8>, ManifestError> {
        let res = self.transport.get(url).await?;
        if !res.is_success() {
            return Err(TransportError::Status {
                url: url.to_string(),
                status: res.status,
            }
            .into());
        }
        Ok(res.bytes().await?)
    }

    /// Records `list` in the checkpoint and enqueues segments not seen before
    async fn enqueue(
        &self,
        media_url: &Url,
        list: &SegmentList,
        tx: &mpsc::Sender<SegmentDescriptor>,
    ) -> Result<usize, ManifestError> {
        let segments = list
            .uris
            .iter()
            .map(|uri| absolute_uri(uri, media_url).and_then(SegmentDescriptor::new))
            .collect::<Result<Vec<_>, _>>()?;

        if let Some(first) = segments.first() {
            self.checkpoint.init_base_path(&base_path_of(&first.uri));
        }
        let added = self
            .checkpoint
            .register(segments.iter().map(|s| s.name.clone()));
        self.progress.add_total(added);
        self.checkpoint.persist().await?;

        let mut enqueued = 0;
        for segment in segments {
            if !self.dedup.mark_new(segment.uri.as_str()) {
                continue;
            }
            if !self.send(segment, tx).await? {
                break;
            }
            enqueued += 1;
        }

        Ok(enqueued)
    }

    /// Waits for room on the queue. Returns `false` when cancelled.
    async fn send(
        &self,
        segment: SegmentDescriptor,
        tx: &mpsc::Sender<SegmentDescriptor>,
    ) -> Result<bool, ManifestError> {
        select! {
            () = self.ct.cancelled() => Ok(false),
            res = tx.send(segment) => res.map(|()| true).map_err(|_| ManifestError::QueueClosed),
        }
    }
}
