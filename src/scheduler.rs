//! Periodic acquisition: a fast cycle for the realtime feed, a slow cycle for
//! the static archive, and forced runs of the slow cycle on request.
//!
//! Each cycle is `Idle -> Running -> Idle`. A tick or forced update that
//! finds its cycle running is skipped, never queued. Failures keep whatever
//! was last published and are retried at the next tick only.

use anyhow::Context;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::error::FetchError;
use crate::feed::FeedSummary;
use crate::fetch::{Resource, ResourceSource};
use crate::model::{Dataset, Schema, dataset_name, references};
use crate::parser::{ArchiveEntry, parse_realtime, parse_static, unpack_archive};
use crate::persist::DatasetArchive;
use crate::snapshot::SnapshotStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Cycle {
    Fast,
    Slow,
}

impl Cycle {
    pub fn as_str(&self) -> &'static str {
        match self {
            Cycle::Fast => "fast",
            Cycle::Slow => "slow",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileFailure {
    pub file: String,
    pub kind: String,
    pub error: String,
}

/// What one cycle run did, file by file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub cycle: Cycle,
    /// Snapshot version current when the cycle finished.
    pub version: u64,
    pub published: Vec<String>,
    pub unchanged: Vec<String>,
    pub failed: Vec<FileFailure>,
    pub elapsed_ms: u64,
}

impl CycleReport {
    fn new(cycle: Cycle) -> Self {
        Self {
            cycle,
            version: 0,
            published: Vec::new(),
            unchanged: Vec::new(),
            failed: Vec::new(),
            elapsed_ms: 0,
        }
    }

    fn fail(&mut self, file: &str, kind: &str, error: impl ToString) {
        self.failed.push(FileFailure {
            file: file.to_string(),
            kind: kind.to_string(),
            error: error.to_string(),
        });
    }

    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    Updated(CycleReport),
    Failed(CycleReport),
    AlreadyRunning,
    Cancelled,
}

impl UpdateOutcome {
    fn from_report(report: CycleReport) -> Self {
        if report.is_success() {
            UpdateOutcome::Updated(report)
        } else {
            UpdateOutcome::Failed(report)
        }
    }

    pub fn report(&self) -> Option<&CycleReport> {
        match self {
            UpdateOutcome::Updated(r) | UpdateOutcome::Failed(r) => Some(r),
            _ => None,
        }
    }
}

/// Outcome history of one cycle, as shown by the health endpoint.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleHealth {
    pub running: bool,
    pub last_attempt: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
    pub last_error_kind: Option<String>,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
}

impl CycleHealth {
    fn record(&mut self, report: &CycleReport, at: DateTime<Utc>) {
        self.last_attempt = Some(at);
        match report.failed.first() {
            None => {
                self.last_success = Some(at);
                self.consecutive_failures = 0;
            }
            Some(first) => {
                self.last_failure = Some(at);
                self.last_error_kind = Some(first.kind.clone());
                self.last_error = Some(format!("{}: {}", first.file, first.error));
                self.consecutive_failures += 1;
            }
        }
    }

    /// Never succeeded, or the latest run was turned away by the challenge.
    pub fn is_degraded(&self) -> bool {
        self.last_success.is_none()
            || (self.consecutive_failures > 0 && self.last_error_kind.as_deref() == Some("blocked"))
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: &'static str,
    pub version: u64,
    pub datasets: usize,
    pub realtime: CycleHealth,
    pub planning: CycleHealth,
    pub feed: Option<FeedSummary>,
}

#[derive(Debug, Default)]
struct CycleState {
    busy: AtomicBool,
    health: Mutex<CycleHealth>,
}

/// Clears the busy flag when the run ends, however it ends.
struct BusyGuard<'a>(&'a AtomicBool);

impl<'a> BusyGuard<'a> {
    fn try_acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Parsed static files ready for publication.
struct StaticBatch {
    datasets: Vec<Dataset>,
    entries: Vec<(ArchiveEntry, u64)>,
    unchanged: Vec<String>,
    failed: Vec<FileFailure>,
}

pub struct Scheduler {
    source: Arc<dyn ResourceSource>,
    store: Arc<SnapshotStore>,
    archive: Option<DatasetArchive>,
    fast_interval: Duration,
    slow_interval: Duration,
    fast: CycleState,
    slow: CycleState,
    digests: Mutex<HashMap<String, u64>>,
    shutdown: CancellationToken,
}

impl Scheduler {
    pub fn new(
        source: Arc<dyn ResourceSource>,
        store: Arc<SnapshotStore>,
        fast_interval: Duration,
        slow_interval: Duration,
    ) -> Self {
        Self {
            source,
            store,
            archive: None,
            fast_interval,
            slow_interval,
            fast: CycleState::default(),
            slow: CycleState::default(),
            digests: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Persists every successfully parsed payload to `archive`.
    pub fn with_archive(mut self, archive: DatasetArchive) -> Self {
        self.archive = Some(archive);
        self
    }

    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    pub fn store(&self) -> &Arc<SnapshotStore> {
        &self.store
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Runs both periodic cycles until the shutdown token is cancelled.
    ///
    /// The slow cycle runs immediately only when no static data has been
    /// published yet; otherwise its first run waits one full interval.
    pub async fn run(&self) {
        info!(
            fast_secs = self.fast_interval.as_secs(),
            slow_secs = self.slow_interval.as_secs(),
            "Scheduler started"
        );
        tokio::join!(self.fast_loop(), self.slow_loop());
        info!("Scheduler stopped");
    }

    async fn fast_loop(&self) {
        let mut ticker = tokio::time::interval(self.fast_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            self.fast_cycle().await;
        }
    }

    async fn slow_loop(&self) {
        let start = if self.store.current().has_static_data() {
            tokio::time::Instant::now() + self.slow_interval
        } else {
            tokio::time::Instant::now()
        };
        let mut ticker = tokio::time::interval_at(start, self.slow_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            self.slow_cycle().await;
        }
    }

    /// Out-of-schedule run of the slow cycle. Rejected, not queued, while a
    /// slow cycle is already running.
    pub async fn force_update(&self) -> UpdateOutcome {
        info!("Forced update requested");
        let outcome = self.slow_cycle().await;
        if outcome == UpdateOutcome::AlreadyRunning {
            info!("Forced update rejected, slow cycle already in progress");
        }
        outcome
    }

    #[instrument(skip_all, fields(cycle = "fast"))]
    pub async fn fast_cycle(&self) -> UpdateOutcome {
        let Some(_busy) = BusyGuard::try_acquire(&self.fast.busy) else {
            debug!("Fast cycle still running, tick skipped");
            return UpdateOutcome::AlreadyRunning;
        };
        if self.shutdown.is_cancelled() {
            return UpdateOutcome::Cancelled;
        }

        let started = Instant::now();
        let mut report = CycleReport::new(Cycle::Fast);

        let fetched = tokio::select! {
            _ = self.shutdown.cancelled() => return UpdateOutcome::Cancelled,
            r = self.source.fetch(Resource::Realtime) => r,
        };

        match fetched {
            Ok(bytes) => {
                let archive = self.archive.clone();
                let parsed = blocking(move || {
                    let feed = parse_realtime(&bytes)?;
                    if let Some(archive) = archive {
                        if let Err(e) = archive.save_realtime(&bytes) {
                            warn!(error = %e, "Failed to persist realtime feed");
                        }
                    }
                    Ok::<_, crate::error::ParseError>(feed)
                })
                .await;

                match parsed {
                    Ok(Ok(feed)) => {
                        if self.shutdown.is_cancelled() {
                            return UpdateOutcome::Cancelled;
                        }
                        let entities = feed.len();
                        let version = self.store.publish_feed(feed);
                        self.source.confirm(Resource::Realtime);
                        debug!(version, entities, "Realtime feed published");
                        report.published.push(Resource::Realtime.to_string());
                    }
                    Ok(Err(e)) => {
                        warn!(error = %e, "Realtime feed failed to decode");
                        report.fail(Resource::Realtime.as_str(), "parse_error", e);
                    }
                    Err(e) => {
                        error!(error = %e, "Realtime decode task failed");
                        report.fail(Resource::Realtime.as_str(), "internal", e);
                    }
                }
            }
            Err(FetchError::NotModified) => report.unchanged.push(Resource::Realtime.to_string()),
            Err(e) => {
                warn!(error = %e, kind = e.kind(), "Realtime fetch failed");
                report.fail(Resource::Realtime.as_str(), e.kind(), e);
            }
        }

        self.finish(&self.fast, report, started)
    }

    #[instrument(skip_all, fields(cycle = "slow"))]
    pub async fn slow_cycle(&self) -> UpdateOutcome {
        let Some(_busy) = BusyGuard::try_acquire(&self.slow.busy) else {
            debug!("Slow cycle still running, run skipped");
            return UpdateOutcome::AlreadyRunning;
        };
        if self.shutdown.is_cancelled() {
            return UpdateOutcome::Cancelled;
        }

        let started = Instant::now();
        let mut report = CycleReport::new(Cycle::Slow);
        info!("Slow cycle started");

        let fetched = tokio::select! {
            _ = self.shutdown.cancelled() => return UpdateOutcome::Cancelled,
            r = self.source.fetch(Resource::Static) => r,
        };

        let bytes = match fetched {
            Ok(bytes) => bytes,
            Err(FetchError::NotModified) => {
                info!("Static archive not modified");
                report.unchanged.push(Resource::Static.to_string());
                return self.finish(&self.slow, report, started);
            }
            Err(e) => {
                warn!(error = %e, kind = e.kind(), "Static fetch failed");
                report.fail(Resource::Static.as_str(), e.kind(), e);
                return self.finish(&self.slow, report, started);
            }
        };

        let snapshot = self.store.current();
        let expected: HashMap<String, Arc<Schema>> = snapshot
            .datasets()
            .map(|(name, v)| (name.to_string(), v.dataset().schema().clone()))
            .collect();
        let known: HashMap<String, u64> = self
            .digests
            .lock()
            .iter()
            .filter(|(name, _)| expected.contains_key(name.as_str()))
            .map(|(k, v)| (k.clone(), *v))
            .collect();
        drop(snapshot);

        let batch = match blocking(move || parse_archive(&bytes, &expected, &known)).await {
            Ok(Ok(batch)) => batch,
            Ok(Err(e)) => {
                warn!(error = %e, "Static archive could not be unpacked");
                report.fail(Resource::Static.as_str(), "parse_error", e);
                return self.finish(&self.slow, report, started);
            }
            Err(e) => {
                error!(error = %e, "Static parse task failed");
                report.fail(Resource::Static.as_str(), "internal", e);
                return self.finish(&self.slow, report, started);
            }
        };
        if self.shutdown.is_cancelled() {
            return UpdateOutcome::Cancelled;
        }

        let StaticBatch {
            datasets,
            mut entries,
            unchanged,
            failed,
        } = batch;
        report.unchanged = unchanged;
        report.failed = failed;

        if !datasets.is_empty() {
            let publication = self.store.publish_datasets(datasets);
            info!(
                version = publication.version,
                files = publication.accepted.len(),
                "Static datasets published"
            );
            for (entry, _) in &entries {
                if publication.rejected.contains(&dataset_name(&entry.file_name)) {
                    report.fail(&entry.file_name, "schema_changed", "field layout changed");
                }
            }
            entries.retain(|(entry, _)| {
                publication
                    .accepted
                    .contains(&dataset_name(&entry.file_name))
            });

            let mut digests = self.digests.lock();
            for (entry, digest) in &entries {
                digests.insert(dataset_name(&entry.file_name), *digest);
            }
            report.published = publication.accepted;
        }

        warn_dangling(&report);

        if let Some(archive) = self.archive.clone() {
            let persisted = blocking(move || {
                for (entry, _) in &entries {
                    if let Err(e) = archive.save_dataset(&entry.file_name, &entry.bytes) {
                        warn!(file = %entry.file_name, error = %e, "Failed to persist dataset");
                    }
                }
            })
            .await;
            if let Err(e) = persisted {
                error!(error = %e, "Persist task failed");
            }
        }

        if report.is_success() {
            self.source.confirm(Resource::Static);
        }
        self.finish(&self.slow, report, started)
    }

    fn finish(&self, state: &CycleState, mut report: CycleReport, started: Instant) -> UpdateOutcome {
        report.version = self.store.current().version();
        report.elapsed_ms = started.elapsed().as_millis() as u64;
        state.health.lock().record(&report, Utc::now());

        if report.is_success() {
            debug!(
                cycle = report.cycle.as_str(),
                version = report.version,
                published = report.published.len(),
                unchanged = report.unchanged.len(),
                elapsed_ms = report.elapsed_ms,
                "Cycle finished"
            );
        } else {
            warn!(
                cycle = report.cycle.as_str(),
                version = report.version,
                published = report.published.len(),
                failed = report.failed.len(),
                elapsed_ms = report.elapsed_ms,
                "Cycle finished with failures"
            );
        }
        UpdateOutcome::from_report(report)
    }

    pub fn health(&self) -> HealthReport {
        let snapshot = self.store.current();
        let mut realtime = self.fast.health.lock().clone();
        realtime.running = self.fast.busy.load(Ordering::Acquire);
        let mut planning = self.slow.health.lock().clone();
        planning.running = self.slow.busy.load(Ordering::Acquire);

        let degraded = realtime.is_degraded() || planning.is_degraded();
        HealthReport {
            status: if degraded { "degraded" } else { "ok" },
            version: snapshot.version(),
            datasets: snapshot.dataset_count(),
            realtime,
            planning,
            feed: snapshot.feed().map(|f| f.feed().summary().clone()),
        }
    }
}

async fn blocking<T, F>(f: F) -> anyhow::Result<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .context("blocking task did not complete")
}

fn digest(bytes: &Bytes) -> u64 {
    let mut hasher = DefaultHasher::new();
    bytes.hash(&mut hasher);
    hasher.finish()
}

/// Unpacks the archive and parses each file independently. A file that fails
/// to parse is reported and left out; its siblings are unaffected.
fn parse_archive(
    bytes: &[u8],
    expected: &HashMap<String, Arc<Schema>>,
    known: &HashMap<String, u64>,
) -> Result<StaticBatch, crate::error::ParseError> {
    let mut batch = StaticBatch {
        datasets: Vec::new(),
        entries: Vec::new(),
        unchanged: Vec::new(),
        failed: Vec::new(),
    };

    for entry in unpack_archive(bytes)? {
        let name = dataset_name(&entry.file_name);
        let digest = digest(&entry.bytes);
        if known.get(&name) == Some(&digest) {
            batch.unchanged.push(name);
            continue;
        }

        match parse_static(&entry.file_name, &entry.bytes, expected.get(&name)) {
            Ok(dataset) => {
                debug!(dataset = %name, records = dataset.len(), "Parsed static file");
                batch.datasets.push(dataset);
                batch.entries.push((entry, digest));
            }
            Err(e) => {
                warn!(file = %entry.file_name, error = %e, "Static file failed to parse, keeping previous version");
                batch.failed.push(FileFailure {
                    file: entry.file_name,
                    kind: "parse_error".to_string(),
                    error: e.to_string(),
                });
            }
        }
    }

    Ok(batch)
}

/// Published files may now point at rows of a file that kept its previous
/// version. They are published anyway; the mismatch is logged.
fn warn_dangling(report: &CycleReport) {
    let failed: HashSet<String> = report.failed.iter().map(|f| dataset_name(&f.file)).collect();
    if failed.is_empty() {
        return;
    }
    for name in &report.published {
        for referenced in references(name) {
            if failed.contains(*referenced) {
                warn!(
                    dataset = %name,
                    referenced = %referenced,
                    "Published while a referenced file kept its previous version"
                );
            }
        }
    }
}
