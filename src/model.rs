//! Typed tabular model: schemas, records and datasets.
//!
//! Values are kept exactly as sourced (strings). Numeric interpretation is a
//! property of the [`Schema`] and only applied when comparing values.

use serde::ser::{Serialize, SerializeMap, Serializer};
use std::collections::HashMap;
use std::sync::Arc;

/// Field layout of one dataset.
#[derive(Debug, PartialEq, Eq)]
pub struct Schema {
    name: String,
    file_name: String,
    fields: Vec<String>,
    numeric: Vec<bool>,
    positions: HashMap<String, usize>,
}

impl Schema {
    /// Builds a schema for `file_name`, marking the fields the GTFS catalog
    /// declares numeric for that file.
    pub fn new(file_name: &str, fields: Vec<String>) -> Self {
        let name = dataset_name(file_name);
        let declared = numeric_fields(&name);
        let numeric = fields.iter().map(|f| declared.contains(&f.as_str())).collect();
        Self::with_numeric(name, file_name.to_string(), fields, numeric)
    }

    fn with_numeric(name: String, file_name: String, fields: Vec<String>, numeric: Vec<bool>) -> Self {
        let positions = fields
            .iter()
            .enumerate()
            .map(|(i, f)| (f.clone(), i))
            .collect();
        Self {
            name,
            file_name,
            fields,
            numeric,
            positions,
        }
    }

    /// Fixed layout used to filter realtime feed entities.
    pub fn realtime() -> Self {
        let fields: Vec<String> = REALTIME_FIELDS.iter().map(|f| f.to_string()).collect();
        let numeric = REALTIME_FIELDS
            .iter()
            .map(|f| REALTIME_NUMERIC.contains(f))
            .collect();
        Self::with_numeric("realtime".into(), "realtime".into(), fields, numeric)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    pub fn position(&self, field: &str) -> Option<usize> {
        self.positions.get(field).copied()
    }

    pub fn contains(&self, field: &str) -> bool {
        self.positions.contains_key(field)
    }

    pub fn is_numeric(&self, position: usize) -> bool {
        self.numeric.get(position).copied().unwrap_or(false)
    }

    /// Two schemas describe the same dataset identity when their field lists
    /// match exactly, in order.
    pub fn same_layout(&self, other: &Schema) -> bool {
        self.fields == other.fields
    }
}

/// One row: an ordered field → value mapping bound to its schema.
#[derive(Debug, Clone)]
pub struct Record {
    schema: Arc<Schema>,
    values: Box<[String]>,
}

impl Record {
    /// `values` must be in schema field order; missing trailing values are
    /// padded with empty strings.
    pub fn new(schema: Arc<Schema>, mut values: Vec<String>) -> Self {
        values.resize(schema.fields().len(), String::new());
        Self {
            schema,
            values: values.into_boxed_slice(),
        }
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn get(&self, field: &str) -> Option<&str> {
        self.schema.position(field).map(|i| self.values[i].as_str())
    }

    /// Value at a position already resolved against this record's schema.
    pub fn value(&self, position: usize) -> &str {
        self.values.get(position).map(String::as_str).unwrap_or("")
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.schema
            .fields()
            .iter()
            .map(String::as_str)
            .zip(self.values.iter().map(String::as_str))
    }
}

impl PartialEq for Record {
    fn eq(&self, other: &Self) -> bool {
        self.schema.same_layout(&other.schema) && self.values == other.values
    }
}

impl Serialize for Record {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.values.len()))?;
        for (field, value) in self.iter() {
            map.serialize_entry(field, value)?;
        }
        map.end()
    }
}

/// Named, ordered, immutable sequence of records sharing one schema.
#[derive(Debug)]
pub struct Dataset {
    schema: Arc<Schema>,
    records: Vec<Record>,
}

impl Dataset {
    pub fn new(schema: Arc<Schema>, records: Vec<Record>) -> Self {
        Self { schema, records }
    }

    pub fn name(&self) -> &str {
        self.schema.name()
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Dataset name for a file: the file stem (`stops.txt` → `stops`).
pub fn dataset_name(file_name: &str) -> String {
    let base = file_name.rsplit('/').next().unwrap_or(file_name);
    match base.rsplit_once('.') {
        Some((stem, ext)) if matches!(ext, "txt" | "csv") => stem.to_string(),
        _ => base.to_string(),
    }
}

pub const REALTIME_FIELDS: &[&str] = &[
    "id",
    "entity_type",
    "trip_id",
    "route_id",
    "direction_id",
    "start_date",
    "start_time",
    "schedule_relationship",
    "vehicle_id",
    "vehicle_label",
    "stop_id",
    "current_stop_sequence",
    "delay",
    "timestamp",
];

const REALTIME_NUMERIC: &[&str] = &["direction_id", "current_stop_sequence", "delay", "timestamp"];

/// Fields of well-known GTFS files compared numerically.
pub fn numeric_fields(dataset: &str) -> &'static [&'static str] {
    match dataset {
        "stops" => &["stop_lat", "stop_lon", "location_type", "wheelchair_boarding"],
        "routes" => &["route_type", "route_sort_order"],
        "trips" => &["direction_id", "wheelchair_accessible", "bikes_allowed"],
        "stop_times" => &[
            "stop_sequence",
            "pickup_type",
            "drop_off_type",
            "shape_dist_traveled",
            "timepoint",
        ],
        "calendar" => &[
            "monday",
            "tuesday",
            "wednesday",
            "thursday",
            "friday",
            "saturday",
            "sunday",
            "start_date",
            "end_date",
        ],
        "calendar_dates" => &["date", "exception_type"],
        "transfers" => &["transfer_type", "min_transfer_time"],
        "shapes" => &["shape_pt_lat", "shape_pt_lon", "shape_pt_sequence", "shape_dist_traveled"],
        "frequencies" => &["headway_secs", "exact_times"],
        _ => &[],
    }
}

/// Datasets a GTFS file holds foreign keys into.
pub fn references(dataset: &str) -> &'static [&'static str] {
    match dataset {
        "routes" => &["agency"],
        "trips" => &["routes", "calendar"],
        "stop_times" => &["trips", "stops"],
        "transfers" => &["stops"],
        "frequencies" => &["trips"],
        _ => &[],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dataset_name_strips_known_extensions() {
        assert_eq!(dataset_name("stops.txt"), "stops");
        assert_eq!(dataset_name("gtfs/stop_times.txt"), "stop_times");
        assert_eq!(dataset_name("agency.csv"), "agency");
        assert_eq!(dataset_name("feed_info"), "feed_info");
        assert_eq!(dataset_name("config.cfg"), "config.cfg");
    }

    #[test]
    fn test_schema_marks_catalog_numeric_fields() {
        let schema = Schema::new("stops.txt", fields(&["stop_id", "stop_name", "stop_lat"]));
        assert_eq!(schema.name(), "stops");
        assert!(!schema.is_numeric(0));
        assert!(!schema.is_numeric(1));
        assert!(schema.is_numeric(2));
    }

    #[test]
    fn test_unknown_file_has_no_numeric_fields() {
        let schema = Schema::new("mystery.txt", fields(&["stop_lat"]));
        assert!(!schema.is_numeric(0));
    }

    #[test]
    fn test_record_pads_missing_values_and_keeps_order() {
        let schema = Arc::new(Schema::new("stops.txt", fields(&["stop_id", "stop_name"])));
        let record = Record::new(schema, vec!["8814001".into()]);

        assert_eq!(record.get("stop_id"), Some("8814001"));
        assert_eq!(record.get("stop_name"), Some(""));
        assert_eq!(record.get("missing"), None);

        let json = serde_json::to_string(&record).unwrap();
        assert_eq!(json, r#"{"stop_id":"8814001","stop_name":""}"#);
    }

    #[test]
    fn test_realtime_schema_layout() {
        let schema = Schema::realtime();
        assert_eq!(schema.fields().len(), REALTIME_FIELDS.len());
        let delay = schema.position("delay").unwrap();
        assert!(schema.is_numeric(delay));
        assert!(!schema.is_numeric(schema.position("trip_id").unwrap()));
    }

    fn fields(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }
}
