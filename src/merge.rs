use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
};

use tokio::{
    fs::{File, OpenOptions},
    io::AsyncWriteExt,
};
use tracing::{debug, info, instrument, warn};

use crate::config::segment_file_name;

#[derive(Debug, thiserror::Error)]
pub enum MergeError {
    #[error("segment `{name}` is missing from {}, re-run to fetch it", .dir.display())]
    MissingSegment { name: String, dir: PathBuf },

    #[error("merge I/O on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Concatenates the file of every segment name in `order` into `artifact`.
///
/// An existing artifact is replaced. Every segment file is checked up front so a missing
/// segment never leaves a truncated artifact behind. Segment files are kept.
///
/// Returns the amount of bytes written
///
/// # Errors
/// Errors when a segment file is missing or on I/O failure
#[instrument(skip(order), fields(segments = order.len()))]
pub async fn merge_segments(
    dir: &Path,
    order: &[String],
    artifact: &Path,
) -> Result<u64, MergeError> {
    for name in order {
        let path = dir.join(segment_file_name(name));
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Err(MergeError::MissingSegment {
                name: name.clone(),
                dir: dir.to_path_buf(),
            });
        }
    }

    match tokio::fs::remove_file(artifact).await {
        Ok(()) => debug!("Removed previous artifact"),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(source) => {
            return Err(MergeError::Io {
                path: artifact.to_path_buf(),
                source,
            });
        }
    }

    let result = append_all(dir, order, artifact).await;
    if result.is_err() {
        if let Err(e) = tokio::fs::remove_file(artifact).await {
            warn!("Unable to remove partial artifact {artifact:?}: {e}");
        }
    }

    let written = result?;
    info!("Merged {} segments ({written} bytes)", order.len());
    Ok(written)
}

async fn append_all(dir: &Path, order: &[String], artifact: &Path) -> Result<u64, MergeError> {
    let mut out = OpenOptions::new()
        .create(true)
        .append(true)
        .open(artifact)
        .await
        .map_err(|source| MergeError::Io {
            path: artifact.to_path_buf(),
            source,
        })?;

    let mut written = 0;
    for name in order {
        let path = dir.join(segment_file_name(name));
        let mut segment = match File::open(&path).await {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(MergeError::MissingSegment {
                    name: name.clone(),
                    dir: dir.to_path_buf(),
                });
            }
            Err(source) => return Err(MergeError::Io { path, source }),
        };

        written += tokio::io::copy(&mut segment, &mut out)
            .await
            .map_err(|source| MergeError::Io {
                path: path.clone(),
                source,
            })?;
    }

    out.flush().await.map_err(|source| MergeError::Io {
        path: artifact.to_path_buf(),
        source,
    })?;

    Ok(written)
}
