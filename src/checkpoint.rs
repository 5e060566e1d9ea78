use std::{
    collections::{BTreeMap, HashSet},
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Mutex,
};

use dashmap::DashMap;
use serde::{Deserialize, Deserializer, Serialize};
use tracing::{debug, instrument, warn};

#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("checkpoint I/O on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("checkpoint {} is not valid JSON: {source}", .path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// On-disk shape of the checkpoint file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadState {
    /// Directory prefix shared by segment URIs, e.g. `https://cdn.example.com/vod/`
    #[serde(rename = "Path", default)]
    pub base_path: String,

    /// Segment name -> whether it was fetched completely
    #[serde(rename = "MediaStatus", default, deserialize_with = "null_as_default")]
    pub segment_status: BTreeMap<String, bool>,

    /// Segment names in playlist order
    #[serde(rename = "MediaList", default, deserialize_with = "null_as_default")]
    pub segment_order: Vec<String>,
}

// Older checkpoints may carry `null` instead of an empty map / list
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

impl DownloadState {
    /// # Errors
    /// Errors when the file cannot be read or does not hold a checkpoint.
    /// A missing file is `Ok(None)`.
    pub async fn load(path: &Path) -> Result<Option<Self>, CheckpointError> {
        let data = match tokio::fs::read(path).await {
            Ok(d) => d,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(CheckpointError::Io {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };

        serde_json::from_slice(&data)
            .map(Some)
            .map_err(|source| CheckpointError::Json {
                path: path.to_path_buf(),
                source,
            })
    }
}

/// Live, concurrently updated checkpoint.
///
/// Segment status is updated per key by fetch tasks; writing the whole thing to disk is
/// serialized by `persist_lock` so two flushes never interleave.
#[derive(Debug)]
pub struct Checkpoint {
    file: PathBuf,
    base_path: Mutex<String>,
    order: Mutex<Vec<String>>,
    status: DashMap<String, bool>,
    persist_lock: tokio::sync::Mutex<()>,
}

impl Checkpoint {
    #[must_use]
    pub fn new(file: PathBuf) -> Self {
        Self::from_state(file, DownloadState::default())
    }

    /// Builds a checkpoint out of a persisted state, repairing duplicate names in the order
    /// and names missing a status entry
    #[must_use]
    pub fn from_state(file: PathBuf, state: DownloadState) -> Self {
        let status: DashMap<String, bool> = state.segment_status.into_iter().collect();

        let mut known = HashSet::new();
        let mut order = Vec::with_capacity(state.segment_order.len());
        for name in state.segment_order {
            if !known.insert(name.clone()) {
                continue;
            }
            status.entry(name.clone()).or_insert(false);
            order.push(name);
        }

        Self {
            file,
            base_path: Mutex::new(state.base_path),
            order: Mutex::new(order),
            status,
            persist_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Loads the checkpoint at `file`, or starts an empty one when there is none.
    ///
    /// A damaged checkpoint is ignored and the download starts over.
    ///
    /// # Errors
    /// Errors when an existing checkpoint cannot be read
    pub async fn open(file: PathBuf) -> Result<Self, CheckpointError> {
        let state = match DownloadState::load(&file).await {
            Ok(state) => state.unwrap_or_default(),
            Err(e @ CheckpointError::Json { .. }) => {
                warn!("{e}, starting over");
                DownloadState::default()
            }
            Err(e) => return Err(e),
        };
        Ok(Self::from_state(file, state))
    }

    #[must_use]
    pub fn file(&self) -> &Path {
        &self.file
    }

    /// Whether no segment was ever recorded
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock_order().is_empty()
    }

    #[must_use]
    pub fn base_path(&self) -> String {
        match self.base_path.lock() {
            Ok(p) => p.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Sets the base path unless one is already known
    pub fn init_base_path(&self, base_path: &str) {
        let mut current = match self.base_path.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        };
        if current.is_empty() {
            *current = base_path.to_string();
        }
    }

    /// Appends segment names not seen before to the playlist order, marking them incomplete.
    ///
    /// Returns the amount of names added
    pub fn register<I, S>(&self, names: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut order = self.lock_order();
        let mut known: HashSet<String> = order.iter().cloned().collect();
        let mut added = 0;
        for name in names {
            let name = name.into();
            if !known.insert(name.clone()) {
                continue;
            }
            self.status.entry(name.clone()).or_insert(false);
            order.push(name);
            added += 1;
        }
        added
    }

    #[must_use]
    pub fn is_complete(&self, name: &str) -> bool {
        self.status.get(name).is_some_and(|s| *s)
    }

    pub fn set_status(&self, name: &str, complete: bool) {
        self.status.insert(name.to_string(), complete);
    }

    #[must_use]
    pub fn segment_order(&self) -> Vec<String> {
        self.lock_order().clone()
    }

    /// Names in playlist order that are not complete yet
    #[must_use]
    pub fn pending(&self) -> Vec<String> {
        self.lock_order()
            .iter()
            .filter(|name| !self.is_complete(name))
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn completed_count(&self) -> usize {
        self.lock_order()
            .iter()
            .filter(|name| self.is_complete(name))
            .count()
    }

    #[must_use]
    pub fn snapshot(&self) -> DownloadState {
        DownloadState {
            base_path: self.base_path(),
            segment_status: self
                .status
                .iter()
                .map(|e| (e.key().clone(), *e.value()))
                .collect(),
            segment_order: self.segment_order(),
        }
    }

    /// Writes the checkpoint to disk. The file is replaced atomically.
    ///
    /// # Errors
    /// Errors when the checkpoint file cannot be written
    #[instrument(skip(self), fields(file = ?self.file))]
    pub async fn persist(&self) -> Result<(), CheckpointError> {
        let _guard = self.persist_lock.lock().await;

        let state = self.snapshot();
        let json = serde_json::to_vec_pretty(&state).map_err(|source| CheckpointError::Json {
            path: self.file.clone(),
            source,
        })?;

        let mut tmp = self.file.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        tokio::fs::write(&tmp, json)
            .await
            .map_err(|source| CheckpointError::Io {
                path: tmp.clone(),
                source,
            })?;
        tokio::fs::rename(&tmp, &self.file)
            .await
            .map_err(|source| CheckpointError::Io {
                path: self.file.clone(),
                source,
            })?;

        debug!(
            "Checkpoint saved ({}/{} segments complete)",
            state.segment_status.values().filter(|s| **s).count(),
            state.segment_order.len()
        );
        Ok(())
    }

    fn lock_order(&self) -> std::sync::MutexGuard<'_, Vec<String>> {
        match self.order.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
