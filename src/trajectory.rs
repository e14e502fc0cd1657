//! Realtime trip updates joined with the static tables they reference.
//!
//! Every join runs on one snapshot. Static lookups go through the cached
//! field indices of the dataset versions in that snapshot.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

use crate::error::QueryError;
use crate::feed::{EntityKind, FeedEntity, StopEvent, StopUpdate};
use crate::index::FieldIndex;
use crate::model::Record;
use crate::query::{Page, Pagination};
use crate::snapshot::{DatasetVersion, Snapshot};

pub const DEFAULT_LIMIT: usize = 20;
pub const MAX_LIMIT: usize = 100;

#[derive(Debug, Clone, Serialize)]
pub struct Trajectory {
    pub entity_id: String,
    pub trip_id: String,
    pub route: RouteInfo,
    pub trip: TripInfo,
    pub stops: Vec<StopCall>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RouteInfo {
    pub route_id: Option<String>,
    pub route_short_name: Option<String>,
    pub route_long_name: Option<String>,
    pub agency_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TripInfo {
    pub trip_short_name: Option<String>,
    pub trip_headsign: Option<String>,
    pub service_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StopCall {
    /// As sent upstream, platform suffix included.
    pub stop_id: String,
    pub station: Station,
    pub arrival: Option<Passage>,
    pub departure: Option<Passage>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Station {
    pub name: Option<String>,
    pub latitude: Option<String>,
    pub longitude: Option<String>,
    /// Stop name by language code.
    pub translations: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Passage {
    pub timestamp: i64,
    pub datetime: Option<DateTime<Utc>>,
    pub delay_seconds: i32,
    pub delay_minutes: i32,
    pub status: String,
}

impl Passage {
    /// `None` when upstream sent no predicted time.
    fn from_event(event: &StopEvent) -> Option<Self> {
        let timestamp = event.time.filter(|t| *t > 0)?;
        let delay_seconds = event.delay.unwrap_or(0);
        let delay_minutes = delay_seconds.div_euclid(60);
        let status = match delay_minutes {
            0 => "on time".to_string(),
            m if m > 0 => format!("delayed by {m} min"),
            m => format!("early by {} min", m.unsigned_abs()),
        };
        Some(Self {
            timestamp,
            datetime: DateTime::from_timestamp(timestamp, 0),
            delay_seconds,
            delay_minutes,
            status,
        })
    }
}

/// Exact-match lookup on one field of a published dataset.
struct Lookup<'s> {
    version: &'s DatasetVersion,
    index: Arc<FieldIndex>,
    position: usize,
}

impl<'s> Lookup<'s> {
    fn new(snapshot: &'s Snapshot, dataset: &str, field: &str) -> Option<Self> {
        let version = snapshot.dataset(dataset)?;
        let position = version.dataset().schema().position(field)?;
        Some(Self {
            version,
            index: version.index(position),
            position,
        })
    }

    fn all<'a>(&'a self, value: &'a str) -> impl Iterator<Item = &'s Record> + 'a {
        let version: &'s DatasetVersion = self.version;
        let records = version.dataset().records();
        self.index
            .equal_range(version.dataset(), value)
            .iter()
            .map(move |&row| &records[row as usize])
            .filter(move |record| record.value(self.position) == value)
    }

    fn first(&self, value: &str) -> Option<&'s Record> {
        self.all(value).next()
    }
}

struct Tables<'s> {
    stops: Lookup<'s>,
    trips: Lookup<'s>,
    routes: Lookup<'s>,
    translations: Option<Lookup<'s>>,
}

impl<'s> Tables<'s> {
    fn new(snapshot: &'s Snapshot) -> Result<Self, QueryError> {
        let required = |dataset: &str, field: &str| {
            Lookup::new(snapshot, dataset, field)
                .ok_or_else(|| QueryError::Unavailable(format!("{dataset}.txt")))
        };
        Ok(Self {
            stops: required("stops", "stop_id")?,
            trips: required("trips", "trip_id")?,
            routes: required("routes", "route_id")?,
            translations: Lookup::new(snapshot, "translations", "field_value"),
        })
    }

    fn join(&self, entity: &FeedEntity) -> Trajectory {
        let trip_id = entity.fields.get("trip_id").unwrap_or_default();
        let trip = self.trips.first(trip_id);
        let route_id = field(trip, "route_id").or_else(|| field(Some(&entity.fields), "route_id"));
        let route = route_id.as_deref().and_then(|id| self.routes.first(id));

        Trajectory {
            entity_id: entity.key.id.clone(),
            trip_id: trip_id.to_string(),
            route: RouteInfo {
                route_short_name: field(route, "route_short_name"),
                route_long_name: field(route, "route_long_name"),
                agency_id: field(route, "agency_id"),
                route_id,
            },
            trip: TripInfo {
                trip_short_name: field(trip, "trip_short_name"),
                trip_headsign: field(trip, "trip_headsign"),
                service_id: field(trip, "service_id"),
            },
            stops: entity.stops.iter().map(|s| self.stop_call(s)).collect(),
        }
    }

    fn stop_call(&self, update: &StopUpdate) -> StopCall {
        StopCall {
            stop_id: update.stop_id.clone(),
            station: self.station(&update.stop_id),
            arrival: update.arrival.as_ref().and_then(Passage::from_event),
            departure: update.departure.as_ref().and_then(Passage::from_event),
        }
    }

    /// Realtime stop ids may carry a `_<platform>` suffix the stop table
    /// does not have.
    fn station(&self, stop_id: &str) -> Station {
        let stop = self.stops.first(stop_id).or_else(|| {
            let (base, _platform) = stop_id.split_once('_')?;
            self.stops.first(base)
        });
        let name = field(stop, "stop_name");
        let translations = match (&self.translations, name.as_deref()) {
            (Some(lookup), Some(name)) => lookup
                .all(name)
                .filter(|r| r.get("table_name") == Some("stops"))
                .filter(|r| r.get("field_name") == Some("stop_name"))
                .filter_map(|r| {
                    let language = r.get("language").filter(|v| !v.is_empty())?;
                    let translation = r.get("translation").filter(|v| !v.is_empty())?;
                    Some((language.to_string(), translation.to_string()))
                })
                .collect(),
            _ => BTreeMap::new(),
        };

        Station {
            latitude: field(stop, "stop_lat"),
            longitude: field(stop, "stop_lon"),
            name,
            translations,
        }
    }
}

fn field(record: Option<&Record>, name: &str) -> Option<String> {
    record
        .and_then(|r| r.get(name))
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Trip updates that name a trip and at least one stop.
fn is_trajectory(entity: &FeedEntity) -> bool {
    entity.key.kind == EntityKind::TripUpdate
        && entity.fields.get("trip_id").is_some_and(|t| !t.is_empty())
        && !entity.stops.is_empty()
}

/// Joins the page `page` of size `limit` against `snapshot`. Only the
/// entities on the requested page are joined.
pub fn trajectories_on(
    snapshot: &Snapshot,
    page: usize,
    limit: usize,
) -> Result<Page<Trajectory>, QueryError> {
    let feed = snapshot
        .feed()
        .ok_or_else(|| QueryError::Unavailable("realtime feed".to_string()))?;
    let tables = Tables::new(snapshot)?;

    let candidates: Vec<&FeedEntity> = feed
        .feed()
        .entities()
        .iter()
        .filter(|e| is_trajectory(e))
        .collect();
    let pagination = Pagination::new(page, limit, candidates.len());
    let data: Vec<Trajectory> = candidates
        .iter()
        .skip(page.saturating_mul(limit))
        .take(limit)
        .map(|e| tables.join(e))
        .collect();

    debug!(
        version = snapshot.version(),
        total = pagination.total_records,
        returned = data.len(),
        "Trajectories joined"
    );
    Ok(Page { data, pagination })
}
