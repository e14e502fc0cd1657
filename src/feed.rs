//! Realtime feed representation published in snapshots.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

use crate::gtfs_rt::trip_update::StopTimeEvent;
use crate::gtfs_rt::{FeedEntity as RtEntity, FeedMessage, TripDescriptor, VehicleDescriptor};
use crate::model::{Record, Schema};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    TripUpdate,
    Vehicle,
    Alert,
    Empty,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::TripUpdate => "trip_update",
            EntityKind::Vehicle => "vehicle",
            EntityKind::Alert => "alert",
            EntityKind::Empty => "empty",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Composite identity of a realtime entity. Upstream ids are only unique per
/// entity kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityKey {
    pub kind: EntityKind,
    pub id: String,
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

/// Predicted passage at a stop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StopEvent {
    pub time: Option<i64>,
    pub delay: Option<i32>,
}

/// One stop of a trip update that names its stop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopUpdate {
    pub stop_id: String,
    pub arrival: Option<StopEvent>,
    pub departure: Option<StopEvent>,
}

/// One realtime entity: filterable flat fields plus the full JSON payload.
#[derive(Debug, Clone)]
pub struct FeedEntity {
    pub key: EntityKey,
    pub fields: Record,
    pub payload: serde_json::Value,
    /// Stop updates of a trip update, in feed order. Empty for other kinds.
    pub stops: Vec<StopUpdate>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct FeedHeader {
    pub gtfs_realtime_version: String,
    pub incrementality: String,
    pub timestamp: Option<u64>,
    pub feed_version: Option<String>,
}

/// Decoded realtime feed. Immutable once built.
#[derive(Debug)]
pub struct Feed {
    header: FeedHeader,
    entities: Vec<FeedEntity>,
    schema: Arc<Schema>,
    summary: FeedSummary,
}

impl Feed {
    pub fn from_message(message: &FeedMessage) -> Self {
        let schema = Arc::new(Schema::realtime());
        let header = FeedHeader {
            gtfs_realtime_version: message.header.gtfs_realtime_version.clone(),
            incrementality: message.header.incrementality().as_str_name().to_string(),
            timestamp: message.header.timestamp,
            feed_version: message.header.feed_version.clone(),
        };
        let entities = message
            .entity
            .iter()
            .map(|e| flatten_entity(&schema, e))
            .collect();

        Self {
            header,
            entities,
            schema,
            summary: FeedSummary::from_message(message),
        }
    }

    pub fn header(&self) -> &FeedHeader {
        &self.header
    }

    pub fn entities(&self) -> &[FeedEntity] {
        &self.entities
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn summary(&self) -> &FeedSummary {
        &self.summary
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

fn flatten_entity(schema: &Arc<Schema>, entity: &RtEntity) -> FeedEntity {
    let mut row = FlatRow::default();
    row.id = entity.id.clone();
    let mut stops = Vec::new();

    let kind = if let Some(tu) = &entity.trip_update {
        row.trip(&tu.trip);
        if let Some(v) = &tu.vehicle {
            row.vehicle(v);
        }
        let first = tu.stop_time_update.first();
        row.stop_id = first.and_then(|s| s.stop_id.clone()).unwrap_or_default();
        let delay = tu.delay.or_else(|| {
            first.and_then(|s| {
                s.departure
                    .as_ref()
                    .and_then(|d| d.delay)
                    .or_else(|| s.arrival.as_ref().and_then(|a| a.delay))
            })
        });
        row.delay = opt(delay);
        row.timestamp = opt(tu.timestamp);
        stops = tu
            .stop_time_update
            .iter()
            .filter_map(|s| {
                Some(StopUpdate {
                    stop_id: s.stop_id.clone().filter(|id| !id.is_empty())?,
                    arrival: s.arrival.as_ref().map(stop_event),
                    departure: s.departure.as_ref().map(stop_event),
                })
            })
            .collect();
        EntityKind::TripUpdate
    } else if let Some(vp) = &entity.vehicle {
        if let Some(trip) = &vp.trip {
            row.trip(trip);
        }
        if let Some(v) = &vp.vehicle {
            row.vehicle(v);
        }
        row.stop_id = vp.stop_id.clone().unwrap_or_default();
        row.current_stop_sequence = opt(vp.current_stop_sequence);
        row.timestamp = opt(vp.timestamp);
        EntityKind::Vehicle
    } else if let Some(alert) = &entity.alert {
        if let Some(sel) = alert.informed_entity.first() {
            if let Some(trip) = &sel.trip {
                row.trip(trip);
            }
            if row.route_id.is_empty() {
                row.route_id = sel.route_id.clone().unwrap_or_default();
            }
            row.stop_id = sel.stop_id.clone().unwrap_or_default();
        }
        EntityKind::Alert
    } else {
        EntityKind::Empty
    };

    row.entity_type = kind.as_str().to_string();
    let payload = serde_json::to_value(entity).unwrap_or(serde_json::Value::Null);

    FeedEntity {
        key: EntityKey {
            kind,
            id: entity.id.clone(),
        },
        fields: Record::new(schema.clone(), row.into_values()),
        payload,
        stops,
    }
}

fn stop_event(event: &StopTimeEvent) -> StopEvent {
    StopEvent {
        time: event.time,
        delay: event.delay,
    }
}

fn opt<T: ToString>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

#[derive(Default)]
struct FlatRow {
    id: String,
    entity_type: String,
    trip_id: String,
    route_id: String,
    direction_id: String,
    start_date: String,
    start_time: String,
    schedule_relationship: String,
    vehicle_id: String,
    vehicle_label: String,
    stop_id: String,
    current_stop_sequence: String,
    delay: String,
    timestamp: String,
}

impl FlatRow {
    fn trip(&mut self, trip: &TripDescriptor) {
        self.trip_id = trip.trip_id.clone().unwrap_or_default();
        self.route_id = trip.route_id.clone().unwrap_or_default();
        self.direction_id = opt(trip.direction_id);
        self.start_date = trip.start_date.clone().unwrap_or_default();
        self.start_time = trip.start_time.clone().unwrap_or_default();
        if trip.schedule_relationship.is_some() {
            self.schedule_relationship = trip.schedule_relationship().as_str_name().to_string();
        }
    }

    fn vehicle(&mut self, vehicle: &VehicleDescriptor) {
        self.vehicle_id = vehicle.id.clone().unwrap_or_default();
        self.vehicle_label = vehicle.label.clone().unwrap_or_default();
    }

    // Order must follow `model::REALTIME_FIELDS`.
    fn into_values(self) -> Vec<String> {
        vec![
            self.id,
            self.entity_type,
            self.trip_id,
            self.route_id,
            self.direction_id,
            self.start_date,
            self.start_time,
            self.schedule_relationship,
            self.vehicle_id,
            self.vehicle_label,
            self.stop_id,
            self.current_stop_sequence,
            self.delay,
            self.timestamp,
        ]
    }
}

/// Entity counts for a decoded feed, reported on the health endpoint.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FeedSummary {
    pub generated_at: Option<DateTime<Utc>>,
    pub total_entities: usize,
    pub trip_updates: usize,
    pub vehicles: usize,
    pub alerts: usize,
    pub deleted: usize,
    pub with_delay: usize,
    pub with_position: usize,
    pub stop_time_updates: usize,
}

impl FeedSummary {
    pub fn from_message(feed: &FeedMessage) -> Self {
        let mut s = FeedSummary {
            generated_at: feed
                .header
                .timestamp
                .and_then(|t| i64::try_from(t).ok())
                .and_then(|t| DateTime::<Utc>::from_timestamp(t, 0)),
            total_entities: feed.entity.len(),
            ..Default::default()
        };

        for e in &feed.entity {
            if e.is_deleted() {
                s.deleted += 1;
            }

            if let Some(tu) = &e.trip_update {
                s.trip_updates += 1;
                s.stop_time_updates += tu.stop_time_update.len();

                let has_delay = tu.delay.is_some()
                    || tu.stop_time_update.iter().any(|u| {
                        u.arrival.as_ref().is_some_and(|a| a.delay.is_some())
                            || u.departure.as_ref().is_some_and(|d| d.delay.is_some())
                    });
                if has_delay {
                    s.with_delay += 1;
                }
            }

            if let Some(v) = &e.vehicle {
                s.vehicles += 1;
                if v.position.is_some() {
                    s.with_position += 1;
                }
            }

            if e.alert.is_some() {
                s.alerts += 1;
            }
        }

        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gtfs_rt::trip_update::{StopTimeEvent, StopTimeUpdate};
    use crate::gtfs_rt::{
        Alert, EntitySelector, FeedEntity as RtEntity, Position, TripUpdate, VehiclePosition,
    };

    #[test]
    fn test_summary_empty_feed() {
        let summary = FeedSummary::from_message(&message(vec![]));
        assert_eq!(summary.total_entities, 0);
        assert_eq!(summary.trip_updates, 0);
        assert!(summary.generated_at.is_some());
    }

    #[test]
    fn test_trip_update_is_flattened() {
        let feed = Feed::from_message(&message(vec![trip_update("88____:007::8841004", "IC1832")]));

        assert_eq!(feed.len(), 1);
        let entity = &feed.entities()[0];
        assert_eq!(entity.key.kind, EntityKind::TripUpdate);
        assert_eq!(entity.key.to_string(), "trip_update:88____:007::8841004");
        assert_eq!(entity.fields.get("trip_id"), Some("IC1832"));
        assert_eq!(entity.fields.get("stop_id"), Some("8841004"));
        assert_eq!(entity.fields.get("delay"), Some("120"));
        assert_eq!(entity.fields.get("entity_type"), Some("trip_update"));
        assert_eq!(entity.payload["id"], "88____:007::8841004");
        assert_eq!(
            entity.stops,
            vec![StopUpdate {
                stop_id: "8841004".into(),
                arrival: None,
                departure: Some(StopEvent {
                    time: None,
                    delay: Some(120),
                }),
            }]
        );

        let summary = feed.summary();
        assert_eq!(summary.trip_updates, 1);
        assert_eq!(summary.with_delay, 1);
        assert_eq!(summary.stop_time_updates, 1);
    }

    #[test]
    fn test_vehicle_and_alert_kinds() {
        let vehicle = RtEntity {
            id: "v1".into(),
            vehicle: Some(VehiclePosition {
                position: Some(Position {
                    latitude: 50.83,
                    longitude: 4.33,
                    bearing: None,
                    odometer: None,
                    speed: None,
                }),
                stop_id: Some("8814001".into()),
                current_stop_sequence: Some(4),
                ..Default::default()
            }),
            ..Default::default()
        };
        let alert = RtEntity {
            id: "a1".into(),
            alert: Some(Alert {
                informed_entity: vec![EntitySelector {
                    route_id: Some("R1".into()),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            ..Default::default()
        };

        let feed = Feed::from_message(&message(vec![vehicle, alert]));
        assert_eq!(feed.entities()[0].key.kind, EntityKind::Vehicle);
        assert_eq!(feed.entities()[0].fields.get("current_stop_sequence"), Some("4"));
        assert_eq!(feed.entities()[1].key.kind, EntityKind::Alert);
        assert_eq!(feed.entities()[1].fields.get("route_id"), Some("R1"));
        assert_eq!(feed.summary().with_position, 1);
        assert_eq!(feed.summary().alerts, 1);
    }

    fn trip_update(id: &str, trip_id: &str) -> RtEntity {
        RtEntity {
            id: id.into(),
            trip_update: Some(TripUpdate {
                trip: TripDescriptor {
                    trip_id: Some(trip_id.into()),
                    ..Default::default()
                },
                stop_time_update: vec![StopTimeUpdate {
                    stop_id: Some("8841004".into()),
                    departure: Some(StopTimeEvent {
                        delay: Some(120),
                        ..Default::default()
                    }),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn message(entity: Vec<RtEntity>) -> FeedMessage {
        FeedMessage {
            header: crate::gtfs_rt::FeedHeader {
                gtfs_realtime_version: "2.0".to_string(),
                timestamp: Some(1234567890),
                incrementality: None,
                feed_version: None,
            },
            entity,
        }
    }
}
