use async_trait::async_trait;
use bytes::Bytes;
use gtfs_mirror::error::FetchError;
use gtfs_mirror::fetch::{
    ChallengeBypass, Endpoints, Fetcher, HttpClient, Resource, ResourceSource, RetryPolicy,
};
use gtfs_mirror::gtfs_rt::{
    FeedEntity, FeedHeader, FeedMessage, TripDescriptor, TripUpdate, VehicleDescriptor,
    VehiclePosition,
};
use gtfs_mirror::persist::DatasetArchive;
use gtfs_mirror::query::{MatchMode, QueryEngine, QueryParams, QuerySpec, SortDirection};
use gtfs_mirror::scheduler::{Scheduler, UpdateOutcome};
use gtfs_mirror::snapshot::SnapshotStore;
use parking_lot::Mutex;
use prost::Message;
use std::collections::HashSet;
use std::io::{Cursor, Write};
use std::sync::Arc;
use std::time::Duration;

/// Upstream stand-in serving whatever payloads the test installed.
#[derive(Default)]
struct MemorySource {
    realtime: Mutex<Option<Bytes>>,
    archive: Mutex<Option<Bytes>>,
}

#[async_trait]
impl ResourceSource for MemorySource {
    async fn fetch(&self, resource: Resource) -> Result<Bytes, FetchError> {
        let slot = match resource {
            Resource::Realtime => &self.realtime,
            Resource::Static => &self.archive,
        };
        slot.lock()
            .clone()
            .ok_or_else(|| FetchError::Network("offline".into()))
    }
}

/// Upstream that honours `If-None-Match` against its current ETag and
/// records the validator each request carried.
#[derive(Clone)]
struct ConditionalUpstream {
    current: Arc<Mutex<(Bytes, &'static str)>>,
    sent: Arc<Mutex<Vec<Option<String>>>>,
}

impl ConditionalUpstream {
    fn new(body: Bytes, etag: &'static str) -> Self {
        Self {
            current: Arc::new(Mutex::new((body, etag))),
            sent: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

#[async_trait]
impl HttpClient for ConditionalUpstream {
    async fn execute(&self, req: reqwest::Request) -> reqwest::Result<reqwest::Response> {
        let sent = req
            .headers()
            .get(reqwest::header::IF_NONE_MATCH)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        self.sent.lock().push(sent.clone());

        let (body, etag) = self.current.lock().clone();
        let resp = if sent.as_deref() == Some(etag) {
            http::Response::builder().status(304).body(Vec::new())
        } else {
            http::Response::builder()
                .status(200)
                .header("etag", etag)
                .body(body.to_vec())
        };
        Ok(resp.unwrap().into())
    }
}

fn zip_archive(files: &[(&str, String)]) -> Bytes {
    let mut zip = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options = zip::write::SimpleFileOptions::default();
    for (name, body) in files {
        zip.start_file(*name, options).unwrap();
        zip.write_all(body.as_bytes()).unwrap();
    }
    Bytes::from(zip.finish().unwrap().into_inner())
}

/// `n` stops with a generation marker, so every row tells which publish it
/// came from.
fn stops_csv(n: usize, generation: u32) -> String {
    let mut csv = String::from("stop_id,stop_name,stop_lat,generation\n");
    for i in 0..n {
        csv.push_str(&format!(
            "{},Stop {},{}.{},{}\n",
            8_800_000 + i,
            i % 7,
            50 + (i % 3),
            i % 10,
            generation
        ));
    }
    csv
}

fn realtime_feed() -> Bytes {
    let trip = |id: &str| TripDescriptor {
        trip_id: Some(id.to_string()),
        route_id: Some("IC".to_string()),
        ..Default::default()
    };
    let message = FeedMessage {
        header: FeedHeader {
            gtfs_realtime_version: "2.0".into(),
            timestamp: Some(1_700_000_000),
            ..Default::default()
        },
        entity: vec![
            FeedEntity {
                id: "tu-1".into(),
                trip_update: Some(TripUpdate {
                    trip: trip("IC-101"),
                    delay: Some(120),
                    ..Default::default()
                }),
                ..Default::default()
            },
            FeedEntity {
                id: "tu-2".into(),
                trip_update: Some(TripUpdate {
                    trip: trip("IC-202"),
                    ..Default::default()
                }),
                ..Default::default()
            },
            FeedEntity {
                id: "vp-1".into(),
                vehicle: Some(VehiclePosition {
                    trip: Some(trip("IC-101")),
                    vehicle: Some(VehicleDescriptor {
                        id: Some("set-42".into()),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            },
        ],
    };
    Bytes::from(message.encode_to_vec())
}

fn scheduler(source: Arc<MemorySource>, store: Arc<SnapshotStore>) -> Scheduler {
    Scheduler::new(source, store, Duration::from_secs(30), Duration::from_secs(3600))
}

#[tokio::test]
async fn test_full_pipeline() {
    let source = Arc::new(MemorySource::default());
    *source.archive.lock() = Some(zip_archive(&[
        ("stops.txt", stops_csv(2_500, 1)),
        ("routes.txt", "route_id,route_short_name,route_type\nIC,IC,2\nL,L,2\n".into()),
    ]));
    *source.realtime.lock() = Some(realtime_feed());

    let store = Arc::new(SnapshotStore::new());
    let s = scheduler(source, store.clone());
    assert!(matches!(s.slow_cycle().await, UpdateOutcome::Updated(_)));
    assert!(matches!(s.fast_cycle().await, UpdateOutcome::Updated(_)));

    let engine = QueryEngine::new(store);

    let page = engine
        .query(
            "routes.txt",
            &QueryParams::from_pairs([("route_id", "IC"), ("exact", "true")]),
        )
        .unwrap();
    assert_eq!(page.pagination.total_records, 1);

    let rt = engine
        .query_realtime(&QueryParams::from_pairs([("trip_id", "IC-101"), ("limit", "1")]))
        .unwrap();
    assert_eq!(rt.total_records, 2);
    assert_eq!(rt.entity.len(), 1);
    assert_eq!(rt.header.unwrap().gtfs_realtime_version, "2.0");

    let health = s.health();
    assert_eq!(health.status, "ok");
    assert_eq!(health.datasets, 2);
}

#[tokio::test]
async fn test_pagination_walks_filtered_set_exactly_once() {
    let source = Arc::new(MemorySource::default());
    *source.archive.lock() = Some(zip_archive(&[("stops.txt", stops_csv(2_500, 1))]));
    let store = Arc::new(SnapshotStore::new());
    scheduler(source, store.clone()).slow_cycle().await;
    let engine = QueryEngine::new(store);

    let base = QuerySpec::new("stops")
        .filter("stop_name", "Stop 3", MatchMode::Exact)
        .sort_by("stop_lat", SortDirection::Desc)
        .limit(40);
    let first = engine.execute(&base.clone().page(0)).unwrap();
    let expected = first.pagination.total_records;
    assert!(expected > 40);

    let mut seen = HashSet::new();
    let mut previous: Option<f64> = None;
    for page in 0..first.pagination.total_pages {
        let result = engine.execute(&base.clone().page(page as i64)).unwrap();
        assert_eq!(
            result.pagination.has_next_page,
            page + 1 < first.pagination.total_pages
        );
        for record in &result.data {
            assert_eq!(record.get("stop_name"), Some("Stop 3"));
            assert!(seen.insert(record.get("stop_id").unwrap().to_string()));
            let lat: f64 = record.get("stop_lat").unwrap().parse().unwrap();
            if let Some(prev) = previous {
                assert!(lat <= prev);
            }
            previous = Some(lat);
        }
    }
    assert_eq!(seen.len(), expected);

    let beyond = engine.execute(&base.page(10_000)).unwrap();
    assert!(beyond.data.is_empty());
    assert_eq!(beyond.pagination.total_records, expected);
}

#[tokio::test]
async fn test_queries_never_mix_versions_during_publish() {
    let source = Arc::new(MemorySource::default());
    let store = Arc::new(SnapshotStore::new());
    let s = Arc::new(scheduler(source.clone(), store.clone()));
    *source.archive.lock() = Some(zip_archive(&[("stops.txt", stops_csv(3_000, 0))]));
    s.slow_cycle().await;

    let engine = QueryEngine::new(store);
    let reader = std::thread::spawn(move || {
        for _ in 0..200 {
            let page = engine
                .execute(&QuerySpec::new("stops").sort_by("stop_lat", SortDirection::Asc).limit(5000))
                .unwrap();
            let generations: HashSet<_> = page
                .data
                .iter()
                .map(|r| r.get("generation").unwrap().to_string())
                .collect();
            assert_eq!(generations.len(), 1, "page mixed rows from two versions");
            assert_eq!(page.data.len(), 3_000);
        }
    });

    for generation in 1..=20 {
        *source.archive.lock() = Some(zip_archive(&[("stops.txt", stops_csv(3_000, generation))]));
        assert!(matches!(s.slow_cycle().await, UpdateOutcome::Updated(_)));
    }
    reader.join().unwrap();
}

#[tokio::test]
async fn test_restart_serves_persisted_data_while_upstream_is_down() {
    let dir = tempfile::tempdir().unwrap();
    let source = Arc::new(MemorySource::default());
    *source.archive.lock() = Some(zip_archive(&[("stops.txt", stops_csv(10, 1))]));
    *source.realtime.lock() = Some(realtime_feed());

    let first = scheduler(source, Arc::new(SnapshotStore::new()))
        .with_archive(DatasetArchive::new(dir.path()));
    first.slow_cycle().await;
    first.fast_cycle().await;

    // New process, upstream unreachable.
    let store = Arc::new(SnapshotStore::new());
    let report = DatasetArchive::new(dir.path()).restore(&store).unwrap();
    assert_eq!(report.datasets, vec!["stops"]);
    assert!(report.feed);

    let offline = scheduler(Arc::new(MemorySource::default()), store.clone());
    assert!(matches!(offline.slow_cycle().await, UpdateOutcome::Failed(_)));

    let engine = QueryEngine::new(store);
    let page = engine.execute(&QuerySpec::new("stops")).unwrap();
    assert_eq!(page.pagination.total_records, 10);
    assert_eq!(engine.execute_realtime(&QuerySpec::new("realtime")).unwrap().total_records, 3);
}

#[tokio::test]
async fn test_failed_static_file_is_refetched_until_published() {
    let broken = zip_archive(&[
        ("stops.txt", stops_csv(5, 1)),
        ("routes.txt", "route_id,route_type\nIC,2\nL\n".into()),
    ]);
    let upstream = ConditionalUpstream::new(broken, "\"v1\"");
    let fetcher = Fetcher::new(
        upstream.clone(),
        ChallengeBypass::new(upstream.clone(), "https://example.org/", Duration::from_secs(1)),
        Endpoints {
            realtime: "https://example.org/rt".into(),
            static_archive: "https://example.org/static.zip".into(),
        },
        RetryPolicy {
            timeout: Duration::from_secs(1),
            max_attempts: 1,
            backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(1),
        },
    );
    let store = Arc::new(SnapshotStore::new());
    let s = Scheduler::new(
        Arc::new(fetcher),
        store.clone(),
        Duration::from_secs(30),
        Duration::from_secs(3600),
    );

    let UpdateOutcome::Failed(first) = s.slow_cycle().await else {
        panic!("a ragged routes.txt must fail the cycle");
    };
    assert_eq!(first.failed[0].file, "routes.txt");

    // Same upstream bytes: the archive is downloaded and parsed again, and
    // the failure is still reported.
    let UpdateOutcome::Failed(second) = s.slow_cycle().await else {
        panic!("the still-broken archive must not be treated as unchanged");
    };
    assert_eq!(second.failed[0].file, "routes.txt");
    assert_eq!(s.health().planning.consecutive_failures, 2);
    assert!(store.current().dataset("routes").is_none());

    *upstream.current.lock() = (
        zip_archive(&[
            ("stops.txt", stops_csv(5, 1)),
            ("routes.txt", "route_id,route_type\nIC,2\nL,2\n".into()),
        ]),
        "\"v2\"",
    );
    assert!(matches!(s.slow_cycle().await, UpdateOutcome::Updated(_)));
    assert_eq!(store.current().dataset("routes").unwrap().dataset().len(), 2);

    // Only a fully published payload is revalidated.
    let outcome = s.slow_cycle().await;
    assert_eq!(outcome.report().unwrap().unchanged, vec!["static"]);
    assert_eq!(
        *upstream.sent.lock(),
        vec![None, None, None, Some("\"v2\"".to_string())]
    );
}
