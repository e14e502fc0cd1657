//! Last-good copies of upstream payloads, used to seed the snapshot store on
//! a cold start.

use anyhow::{Context, Result};
use bytes::Bytes;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::parser::{parse_realtime, parse_static};
use crate::snapshot::SnapshotStore;

const STATIC_DIR: &str = "static";
const REALTIME_FILE: &str = "realtime.pb";

/// On-disk store of the most recent successfully parsed dataset files and
/// realtime feed.
///
/// ```text
/// <root>/static/stops.txt
/// <root>/static/routes.txt
/// <root>/realtime.pb
/// ```
#[derive(Debug, Clone)]
pub struct DatasetArchive {
    root: PathBuf,
}

/// What [`DatasetArchive::restore`] managed to load.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct RestoreReport {
    pub datasets: Vec<String>,
    pub skipped: Vec<String>,
    pub feed: bool,
    pub version: u64,
}

impl DatasetArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn save_dataset(&self, file_name: &str, bytes: &[u8]) -> Result<()> {
        let dir = self.root.join(STATIC_DIR);
        fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;
        write_atomic(&dir.join(file_name), bytes)
    }

    pub fn save_realtime(&self, bytes: &[u8]) -> Result<()> {
        fs::create_dir_all(&self.root)
            .with_context(|| format!("creating {}", self.root.display()))?;
        write_atomic(&self.root.join(REALTIME_FILE), bytes)
    }

    /// Persisted dataset files, sorted by file name.
    pub fn load_datasets(&self) -> Result<Vec<(String, Bytes)>> {
        let dir = self.root.join(STATIC_DIR);
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut files = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !entry.file_type()?.is_file() || name.starts_with('.') {
                continue;
            }
            let bytes = fs::read(&path).with_context(|| format!("reading {}", path.display()))?;
            files.push((name.to_string(), Bytes::from(bytes)));
        }
        files.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(files)
    }

    pub fn load_realtime(&self) -> Result<Option<Bytes>> {
        let path = self.root.join(REALTIME_FILE);
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(Bytes::from(fs::read(&path)?)))
    }

    /// Parses every persisted file and publishes them into `store`. Files that
    /// no longer parse are skipped with a warning.
    pub fn restore(&self, store: &SnapshotStore) -> Result<RestoreReport> {
        let mut report = RestoreReport::default();

        let mut datasets = Vec::new();
        for (file_name, bytes) in self.load_datasets()? {
            match parse_static(&file_name, &bytes, None) {
                Ok(dataset) => {
                    report.datasets.push(dataset.name().to_string());
                    datasets.push(dataset);
                }
                Err(e) => {
                    warn!(file = %file_name, error = %e, "Skipping unreadable persisted dataset");
                    report.skipped.push(file_name);
                }
            }
        }
        if !datasets.is_empty() {
            let publication = store.publish_datasets(datasets);
            report.version = publication.version;
            report.datasets.retain(|name| publication.accepted.contains(name));
        }

        if let Some(bytes) = self.load_realtime()? {
            match parse_realtime(&bytes) {
                Ok(feed) => {
                    report.version = store.publish_feed(feed);
                    report.feed = true;
                }
                Err(e) => warn!(error = %e, "Skipping unreadable persisted realtime feed"),
            }
        }

        info!(
            datasets = report.datasets.len(),
            skipped = report.skipped.len(),
            feed = report.feed,
            version = report.version,
            root = %self.root.display(),
            "Restored persisted data"
        );
        Ok(report)
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("data");
    let tmp = path.with_file_name(format!(".{file_name}.tmp"));
    fs::write(&tmp, bytes).with_context(|| format!("writing {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| format!("replacing {}", path.display()))?;
    Ok(())
}
