use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use reqwest::Url;

/// Name of the checkpoint file kept inside the output directory
pub const CHECKPOINT_FILE_NAME: &str = ".index";

pub const DEFAULT_CONCURRENCY: usize = 10;
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;
pub const DEFAULT_DEDUP_CAPACITY: u64 = 1024;
pub const DEFAULT_EXTENSION: &str = "ts";

/// `<name>/<version> (+<repository>)`
#[must_use]
pub fn default_user_agent() -> String {
    format!(
        "{}/{} (+{})",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        env!("CARGO_PKG_REPOSITORY")
    )
}

/// File name a segment is stored under. Characters that are not allowed in file names on
/// common filesystems become `_`.
#[must_use]
pub fn segment_file_name(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '/' | '\\' | '?' | '*' | ':' | '|' | '"' | '<' | '>' => '_',
            c => c,
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct DownloadConfig {
    pub manifest_url: Url,
    pub output_dir: PathBuf,
    /// Maximum amount of segments being fetched at once
    pub concurrency: usize,
    pub user_agent: String,
    /// Capacity of the resolver -> fetch pool queue
    pub queue_capacity: usize,
    /// Capacity of the already-enqueued URI cache
    pub dedup_capacity: u64,
    /// Delay before the single manifest re-fetch attempt
    pub manifest_retry_delay: Duration,
    /// Maximum chained selector (master) manifests followed before giving up
    pub max_selector_depth: usize,
    /// Extension of the merged artifact
    pub extension: String,
    /// Whether segments are concatenated once fetched
    pub merge: bool,
}

impl DownloadConfig {
    #[must_use]
    pub fn new(manifest_url: Url, output_dir: PathBuf) -> Self {
        Self {
            manifest_url,
            output_dir,
            concurrency: DEFAULT_CONCURRENCY,
            user_agent: default_user_agent(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            dedup_capacity: DEFAULT_DEDUP_CAPACITY,
            manifest_retry_delay: Duration::from_secs(3),
            max_selector_depth: 5,
            extension: DEFAULT_EXTENSION.to_string(),
            merge: true,
        }
    }

    #[must_use]
    pub fn checkpoint_path(&self) -> PathBuf {
        self.output_dir.join(CHECKPOINT_FILE_NAME)
    }

    /// The merged artifact lives next to the output directory: `<output_dir>.<extension>`
    #[must_use]
    pub fn artifact_path(&self) -> PathBuf {
        artifact_path_for(&self.output_dir, &self.extension)
    }
}

#[must_use]
pub fn artifact_path_for(output_dir: &Path, extension: &str) -> PathBuf {
    // Trailing separators would otherwise turn `out/` into `out/.ts`
    let trimmed = output_dir
        .components()
        .collect::<PathBuf>()
        .into_os_string();
    let mut name = trimmed;
    name.push(".");
    name.push(extension);
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn artifact_is_a_sibling_of_the_output_directory() {
        let config = DownloadConfig::new(
            Url::parse("https://example.com/live/index.m3u8").unwrap(),
            PathBuf::from("downloads/charles/"),
        );

        assert_eq!(config.artifact_path(), PathBuf::from("downloads/charles.ts"));
        assert_eq!(
            config.checkpoint_path(),
            PathBuf::from("downloads/charles/.index")
        );
    }

    #[test]
    fn segment_file_names_are_filesystem_safe() {
        assert_eq!(segment_file_name("00042.ts"), "00042.ts");
        assert_eq!(segment_file_name("a.ts?tok=1:2"), "a.ts_tok=1_2");
    }

    #[test]
    fn defaults_follow_the_documented_values() {
        let config = DownloadConfig::new(
            Url::parse("https://example.com/index.m3u8").unwrap(),
            PathBuf::from("out"),
        );

        assert_eq!(config.concurrency, 10);
        assert_eq!(config.queue_capacity, 1024);
        assert_eq!(config.dedup_capacity, 1024);
        assert_eq!(config.manifest_retry_delay, Duration::from_secs(3));
        assert!(config.user_agent.starts_with("hls-squirrel/"));
    }
}
