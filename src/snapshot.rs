//! Versioned, immutable snapshots of every dataset and the realtime feed.
//!
//! Readers take an `Arc<Snapshot>` once per request and keep using it; the
//! store only ever swaps the pointer. Unchanged datasets are shared between
//! consecutive snapshots, so their indices survive a partial refresh. A
//! snapshot (and everything only it references) is freed when the last
//! reader drops it.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::feed::Feed;
use crate::index::{FieldIndex, IndexCache};
use crate::model::{Dataset, dataset_name};

/// A dataset as published at a given snapshot version.
#[derive(Debug)]
pub struct DatasetVersion {
    dataset: Dataset,
    revision: u64,
    published_at: DateTime<Utc>,
    indexes: IndexCache,
}

impl DatasetVersion {
    fn new(dataset: Dataset, revision: u64, published_at: DateTime<Utc>) -> Self {
        Self {
            dataset,
            revision,
            published_at,
            indexes: IndexCache::new(),
        }
    }

    pub fn dataset(&self) -> &Dataset {
        &self.dataset
    }

    /// Snapshot version in which these records were published.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn published_at(&self) -> DateTime<Utc> {
        self.published_at
    }

    /// Index on the field at `position`, built on first use.
    pub fn index(&self, position: usize) -> Arc<FieldIndex> {
        self.indexes.get_or_build(&self.dataset, position, self.revision)
    }

    pub fn cached_indexes(&self) -> usize {
        self.indexes.len()
    }
}

/// The realtime feed as published at a given snapshot version.
#[derive(Debug)]
pub struct FeedVersion {
    feed: Feed,
    revision: u64,
    published_at: DateTime<Utc>,
}

impl FeedVersion {
    pub fn feed(&self) -> &Feed {
        &self.feed
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn published_at(&self) -> DateTime<Utc> {
        self.published_at
    }
}

#[derive(Debug)]
pub struct Snapshot {
    version: u64,
    created_at: DateTime<Utc>,
    datasets: BTreeMap<String, Arc<DatasetVersion>>,
    feed: Option<Arc<FeedVersion>>,
}

impl Snapshot {
    fn empty() -> Self {
        Self {
            version: 0,
            created_at: Utc::now(),
            datasets: BTreeMap::new(),
            feed: None,
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Looks a dataset up by name or by file name (`stops` or `stops.txt`).
    pub fn dataset(&self, name: &str) -> Option<&Arc<DatasetVersion>> {
        self.datasets
            .get(name)
            .or_else(|| self.datasets.get(&dataset_name(name)))
    }

    pub fn datasets(&self) -> impl Iterator<Item = (&str, &Arc<DatasetVersion>)> {
        self.datasets.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn dataset_count(&self) -> usize {
        self.datasets.len()
    }

    pub fn feed(&self) -> Option<&Arc<FeedVersion>> {
        self.feed.as_ref()
    }

    pub fn has_static_data(&self) -> bool {
        !self.datasets.is_empty()
    }
}

/// What [`SnapshotStore::publish_datasets`] actually did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publication {
    pub version: u64,
    pub accepted: Vec<String>,
    /// Datasets left at their previous version because their layout changed.
    pub rejected: Vec<String>,
}

/// Holder of the current snapshot pointer.
///
/// Publishing is serialised by a writer mutex, so versions are strictly
/// increasing in publication order. Readers never touch that mutex; they
/// only clone the current `Arc` under a read lock that writers hold for the
/// duration of a pointer store.
#[derive(Debug)]
pub struct SnapshotStore {
    current: RwLock<Arc<Snapshot>>,
    writer: Mutex<()>,
}

impl Default for SnapshotStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SnapshotStore {
    pub fn new() -> Self {
        Self {
            current: RwLock::new(Arc::new(Snapshot::empty())),
            writer: Mutex::new(()),
        }
    }

    /// The live snapshot. Never blocks on a fetch or a parse.
    pub fn current(&self) -> Arc<Snapshot> {
        self.current.read().clone()
    }

    /// Publishes a new realtime feed; datasets are carried over untouched.
    pub fn publish_feed(&self, feed: Feed) -> u64 {
        self.publish_with(|prev, version, now| Snapshot {
            version,
            created_at: now,
            datasets: prev.datasets.clone(),
            feed: Some(Arc::new(FeedVersion {
                feed,
                revision: version,
                published_at: now,
            })),
        })
    }

    /// Publishes the given datasets in one swap. Every other dataset, and
    /// the feed, keep their previous version.
    ///
    /// A dataset whose field layout differs from the published one is not
    /// accepted and keeps its previous version.
    pub fn publish_datasets(&self, datasets: Vec<Dataset>) -> Publication {
        let mut accepted = Vec::new();
        let mut rejected = Vec::new();
        let version = self.publish_with(|prev, version, now| {
            let mut next = prev.datasets.clone();
            for dataset in datasets {
                let name = dataset.name().to_string();
                if let Some(existing) = next.get(&name) {
                    if !existing.dataset().schema().same_layout(dataset.schema()) {
                        warn!(dataset = %name, "Schema changed, keeping previous version");
                        rejected.push(name);
                        continue;
                    }
                }
                next.insert(name.clone(), Arc::new(DatasetVersion::new(dataset, version, now)));
                accepted.push(name);
            }
            Snapshot {
                version,
                created_at: now,
                datasets: next,
                feed: prev.feed.clone(),
            }
        });
        Publication {
            version,
            accepted,
            rejected,
        }
    }

    fn publish_with<F>(&self, build: F) -> u64
    where
        F: FnOnce(&Snapshot, u64, DateTime<Utc>) -> Snapshot,
    {
        let _writer = self.writer.lock();
        let prev = self.current();
        let version = prev.version + 1;
        let next = Arc::new(build(&prev, version, Utc::now()));

        *self.current.write() = next;
        debug!(version, "Published snapshot");
        version
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::{parse_realtime, parse_static};

    #[test]
    fn test_new_store_is_empty_version_zero() {
        let store = SnapshotStore::new();
        let snap = store.current();
        assert_eq!(snap.version(), 0);
        assert!(!snap.has_static_data());
        assert!(snap.feed().is_none());
    }

    #[test]
    fn test_publish_is_monotonic_and_keeps_old_snapshot_alive() {
        let store = SnapshotStore::new();
        store.publish_datasets(vec![stops("1,Brussel-Zuid\n")]);
        let held = store.current();

        store.publish_datasets(vec![stops("1,Brussel-Zuid\n2,Leuven\n")]);
        let now = store.current();

        assert_eq!(held.version(), 1);
        assert_eq!(now.version(), 2);
        // The reader holding version 1 still sees version 1's rows.
        assert_eq!(held.dataset("stops").unwrap().dataset().len(), 1);
        assert_eq!(now.dataset("stops.txt").unwrap().dataset().len(), 2);
    }

    #[test]
    fn test_partial_publish_shares_untouched_datasets() {
        let store = SnapshotStore::new();
        store.publish_datasets(vec![stops("1,A\n"), routes("R1\n")]);
        let before = store.current();

        store.publish_datasets(vec![stops("1,A\n2,B\n")]);
        let after = store.current();

        let routes_before = before.dataset("routes").unwrap();
        let routes_after = after.dataset("routes").unwrap();
        assert!(Arc::ptr_eq(routes_before, routes_after));
        assert_eq!(routes_after.revision(), 1);
        assert_eq!(after.dataset("stops").unwrap().revision(), 2);
    }

    #[test]
    fn test_feed_publish_carries_datasets() {
        let store = SnapshotStore::new();
        store.publish_datasets(vec![stops("1,A\n")]);
        let feed = parse_realtime(&[]).unwrap();
        let version = store.publish_feed(feed);

        let snap = store.current();
        assert_eq!(version, 2);
        assert_eq!(snap.feed().unwrap().revision(), 2);
        assert_eq!(snap.dataset("stops").unwrap().revision(), 1);
    }

    #[test]
    fn test_schema_change_is_rejected() {
        let store = SnapshotStore::new();
        store.publish_datasets(vec![stops("1,A\n")]);
        let other = parse_static("stops.txt", b"stop_id\n9\n", None).unwrap();
        let publication = store.publish_datasets(vec![other, routes("R1\n")]);

        assert_eq!(publication.accepted, vec!["routes"]);
        assert_eq!(publication.rejected, vec!["stops"]);

        let snap = store.current();
        assert_eq!(snap.dataset("stops").unwrap().dataset().schema().fields().len(), 2);
        assert_eq!(snap.dataset("stops").unwrap().revision(), 1);
    }

    fn stops(rows: &str) -> Dataset {
        let csv = format!("stop_id,stop_name\n{rows}");
        parse_static("stops.txt", csv.as_bytes(), None).unwrap()
    }

    fn routes(rows: &str) -> Dataset {
        let csv = format!("route_id\n{rows}");
        parse_static("routes.txt", csv.as_bytes(), None).unwrap()
    }
}
