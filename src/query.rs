//! Filter / sort / paginate evaluation over the current snapshot.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::error::QueryError;
use crate::feed::FeedHeader;
use crate::index::SortKey;
use crate::model::{Record, Schema};
use crate::snapshot::{DatasetVersion, Snapshot, SnapshotStore};
use crate::trajectory::{self, Trajectory};

pub const DEFAULT_LIMIT: usize = 1000;
pub const MAX_LIMIT: usize = 5000;

/// Name under which the realtime feed is queried.
pub const REALTIME: &str = "realtime";

// Below this share of the dataset, matches are sorted directly instead of
// walking the full field index.
const DIRECT_SORT_RATIO: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MatchMode {
    /// Case-sensitive equality.
    Exact,
    /// Case-sensitive substring containment.
    #[default]
    Partial,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldFilter {
    pub field: String,
    pub value: String,
    pub mode: MatchMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

impl SortDirection {
    /// `desc` (any case) is descending; anything else is ascending.
    pub fn parse(value: &str) -> Self {
        if value.eq_ignore_ascii_case("desc") {
            SortDirection::Desc
        } else {
            SortDirection::Asc
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortSpec {
    pub field: String,
    pub direction: SortDirection,
}

/// A single query against one dataset or the realtime feed.
///
/// `page` is clamped to `>= 0` and `limit` to `[1, 5000]` on construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuerySpec {
    dataset: String,
    filters: Vec<FieldFilter>,
    sort: Option<SortSpec>,
    page: usize,
    limit: usize,
}

impl QuerySpec {
    pub fn new(dataset: impl Into<String>) -> Self {
        Self {
            dataset: dataset.into(),
            filters: Vec::new(),
            sort: None,
            page: 0,
            limit: DEFAULT_LIMIT,
        }
    }

    pub fn filter(mut self, field: impl Into<String>, value: impl Into<String>, mode: MatchMode) -> Self {
        self.filters.push(FieldFilter {
            field: field.into(),
            value: value.into(),
            mode,
        });
        self
    }

    pub fn sort_by(mut self, field: impl Into<String>, direction: SortDirection) -> Self {
        self.sort = Some(SortSpec {
            field: field.into(),
            direction,
        });
        self
    }

    pub fn page(mut self, page: i64) -> Self {
        self.page = page.max(0) as usize;
        self
    }

    pub fn limit(mut self, limit: i64) -> Self {
        self.limit = limit.clamp(1, MAX_LIMIT as i64) as usize;
        self
    }

    pub fn dataset(&self) -> &str {
        &self.dataset
    }

    pub fn filters(&self) -> &[FieldFilter] {
        &self.filters
    }

    pub fn sort(&self) -> Option<&SortSpec> {
        self.sort.as_ref()
    }

    pub fn page_number(&self) -> usize {
        self.page
    }

    pub fn page_size(&self) -> usize {
        self.limit
    }
}

/// Raw request parameters as received by the serving layer.
///
/// Recognised keys: `search`, `field`, `exact`, `limit`, `page`, `sort_by`,
/// `sort_direction`, plus any field of the target schema used as a direct
/// filter. Unknown keys are ignored.
#[derive(Debug, Clone, Default)]
pub struct QueryParams {
    raw: HashMap<String, String>,
}

const RESERVED: &[&str] = &[
    "search",
    "field",
    "exact",
    "limit",
    "page",
    "sort_by",
    "sort_direction",
];

impl QueryParams {
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            raw: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.raw.get(key).map(String::as_str)
    }

    /// The raw `page` value, unclamped.
    pub fn page(&self) -> Result<Option<i64>, QueryError> {
        self.get("page")
            .map(|raw| {
                raw.trim()
                    .parse::<i64>()
                    .map_err(|_| QueryError::InvalidPage(raw.to_string()))
            })
            .transpose()
    }

    /// The raw `limit` value, unclamped.
    pub fn limit(&self) -> Result<Option<i64>, QueryError> {
        self.get("limit")
            .map(|raw| {
                raw.trim()
                    .parse::<i64>()
                    .map_err(|_| QueryError::LimitExceeded(raw.to_string()))
            })
            .transpose()
    }

    /// Resolves the parameters against `schema` into a [`QuerySpec`].
    ///
    /// `search=<field>&<field>=<value>` and `search=<value>&field=<field>` are
    /// both accepted. A search naming a field with no value is a no-op.
    /// `exact` applies to every filter of the request.
    pub fn to_spec(&self, dataset: &str, schema: &Schema) -> Result<QuerySpec, QueryError> {
        let unknown = |field: &str| QueryError::UnknownField {
            dataset: dataset.to_string(),
            field: field.to_string(),
        };

        let mut spec = QuerySpec::new(dataset);

        if let Some(page) = self.page()? {
            spec = spec.page(page);
        }
        if let Some(limit) = self.limit()? {
            spec = spec.limit(limit);
        }

        let mode = match self.get("exact") {
            Some(v) if matches!(v.to_ascii_lowercase().as_str(), "true" | "1" | "yes") => {
                MatchMode::Exact
            }
            _ => MatchMode::Partial,
        };

        let mut consumed: Option<&str> = None;
        match (self.get("search"), self.get("field")) {
            (Some(value), Some(field)) if !field.is_empty() => {
                if !schema.contains(field) {
                    return Err(unknown(field));
                }
                spec = spec.filter(field, value, mode);
            }
            (Some(field), _) if !field.is_empty() => {
                if !schema.contains(field) {
                    return Err(unknown(field));
                }
                consumed = Some(field);
                if let Some(value) = self.get(field) {
                    spec = spec.filter(field, value, mode);
                }
            }
            _ => {}
        }

        // Direct filters, in schema order.
        for field in schema.fields() {
            if RESERVED.contains(&field.as_str()) || consumed == Some(field.as_str()) {
                continue;
            }
            if let Some(value) = self.get(field) {
                spec = spec.filter(field.as_str(), value, mode);
            }
        }

        if let Some(field) = self.get("sort_by").filter(|f| !f.is_empty()) {
            if !schema.contains(field) {
                return Err(unknown(field));
            }
            let direction = self
                .get("sort_direction")
                .map(SortDirection::parse)
                .unwrap_or_default();
            spec = spec.sort_by(field, direction);
        }

        Ok(spec)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Pagination {
    pub page: usize,
    pub page_size: usize,
    pub total_records: usize,
    pub total_pages: usize,
    pub has_next_page: bool,
    pub has_prev_page: bool,
}

impl Pagination {
    pub fn new(page: usize, page_size: usize, total_records: usize) -> Self {
        let total_pages = total_records.div_ceil(page_size.max(1));
        Self {
            page,
            page_size,
            total_records,
            total_pages,
            has_next_page: page + 1 < total_pages,
            has_prev_page: page > 0,
        }
    }
}

/// One page of a dataset query, or of a join built from one.
#[derive(Debug, Clone, Serialize)]
pub struct Page<T = Record> {
    pub data: Vec<T>,
    pub pagination: Pagination,
}

/// Realtime query result: bounded by `limit`, never paged.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedPage {
    pub header: Option<FeedHeader>,
    pub entity: Vec<serde_json::Value>,
    pub total_records: usize,
    pub published_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DatasetInfo {
    pub name: String,
    pub file_name: String,
    pub records: usize,
    pub revision: u64,
    pub published_at: DateTime<Utc>,
    pub fields: Vec<String>,
}

/// Evaluates queries against whatever snapshot is current when the request
/// starts; the same snapshot is used for the whole request.
#[derive(Debug, Clone)]
pub struct QueryEngine {
    store: Arc<SnapshotStore>,
}

impl QueryEngine {
    pub fn new(store: Arc<SnapshotStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<SnapshotStore> {
        &self.store
    }

    pub fn execute(&self, spec: &QuerySpec) -> Result<Page, QueryError> {
        let snapshot = self.store.current();
        execute_on(&snapshot, spec)
    }

    pub fn execute_realtime(&self, spec: &QuerySpec) -> Result<FeedPage, QueryError> {
        let snapshot = self.store.current();
        realtime_on(&snapshot, spec)
    }

    /// Resolves request parameters and executes them on one snapshot.
    pub fn query(&self, dataset: &str, params: &QueryParams) -> Result<Page, QueryError> {
        let snapshot = self.store.current();
        let version = snapshot
            .dataset(dataset)
            .ok_or_else(|| QueryError::UnknownDataset(dataset.to_string()))?;
        let spec = params.to_spec(version.dataset().name(), version.dataset().schema())?;
        execute_on(&snapshot, &spec)
    }

    pub fn query_realtime(&self, params: &QueryParams) -> Result<FeedPage, QueryError> {
        let snapshot = self.store.current();
        let schema = match snapshot.feed() {
            Some(fv) => fv.feed().schema().clone(),
            None => Arc::new(Schema::realtime()),
        };
        let spec = params.to_spec(REALTIME, &schema)?;
        realtime_on(&snapshot, &spec)
    }

    /// Trip updates joined with their trip, route and stops, paged.
    pub fn trajectories(&self, params: &QueryParams) -> Result<Page<Trajectory>, QueryError> {
        let page = params.page()?.unwrap_or(0).max(0) as usize;
        let limit = params
            .limit()?
            .unwrap_or(trajectory::DEFAULT_LIMIT as i64)
            .clamp(1, trajectory::MAX_LIMIT as i64) as usize;
        let snapshot = self.store.current();
        trajectory::trajectories_on(&snapshot, page, limit)
    }

    /// Published datasets with their record counts.
    pub fn datasets(&self) -> Vec<DatasetInfo> {
        self.store
            .current()
            .datasets()
            .map(|(name, v)| DatasetInfo {
                name: name.to_string(),
                file_name: v.dataset().schema().file_name().to_string(),
                records: v.dataset().len(),
                revision: v.revision(),
                published_at: v.published_at(),
                fields: v.dataset().schema().fields().to_vec(),
            })
            .collect()
    }
}

/// A filter whose field has been resolved against the schema.
struct Resolved<'a> {
    position: usize,
    value: &'a str,
    mode: MatchMode,
}

fn resolve<'a>(schema: &Schema, spec: &'a QuerySpec) -> Result<Vec<Resolved<'a>>, QueryError> {
    spec.filters
        .iter()
        .map(|f| {
            schema
                .position(&f.field)
                .map(|position| Resolved {
                    position,
                    value: f.value.as_str(),
                    mode: f.mode,
                })
                .ok_or_else(|| QueryError::UnknownField {
                    dataset: spec.dataset.clone(),
                    field: f.field.clone(),
                })
        })
        .collect()
}

fn matches(record: &Record, filter: &Resolved<'_>) -> bool {
    let value = record.value(filter.position);
    match filter.mode {
        MatchMode::Exact => value == filter.value,
        MatchMode::Partial => value.contains(filter.value),
    }
}

/// Rows matching every filter, in insertion order. Exact filters are served
/// from the dataset's field indices.
fn matching_rows(version: &DatasetVersion, filters: &[Resolved<'_>]) -> Vec<u32> {
    let records = version.dataset().records();
    let mut candidates: Option<Vec<u32>> = None;
    let mut remaining: Vec<&Resolved<'_>> = Vec::new();

    for filter in filters {
        match filter.mode {
            MatchMode::Exact => {
                let rows = version
                    .index(filter.position)
                    .lookup_exact(version.dataset(), filter.value);
                candidates = Some(match candidates {
                    None => rows,
                    Some(current) => intersect(&current, &rows),
                });
            }
            MatchMode::Partial => remaining.push(filter),
        }
    }

    match candidates {
        Some(rows) => rows
            .into_iter()
            .filter(|&r| remaining.iter().all(|f| matches(&records[r as usize], f)))
            .collect(),
        None => (0..records.len() as u32)
            .filter(|&r| remaining.iter().all(|f| matches(&records[r as usize], f)))
            .collect(),
    }
}

/// Intersection of two ascending row lists.
fn intersect(a: &[u32], b: &[u32]) -> Vec<u32> {
    let (small, large) = if a.len() <= b.len() { (a, b) } else { (b, a) };
    small
        .iter()
        .copied()
        .filter(|r| large.binary_search(r).is_ok())
        .collect()
}

fn execute_on(snapshot: &Snapshot, spec: &QuerySpec) -> Result<Page, QueryError> {
    let version = snapshot
        .dataset(&spec.dataset)
        .ok_or_else(|| QueryError::UnknownDataset(spec.dataset.clone()))?;
    let dataset = version.dataset();
    let schema = dataset.schema();
    let records = dataset.records();

    let filters = resolve(schema, spec)?;
    let sort = match &spec.sort {
        Some(s) => Some((
            schema.position(&s.field).ok_or_else(|| QueryError::UnknownField {
                dataset: spec.dataset.clone(),
                field: s.field.clone(),
            })?,
            s.direction,
        )),
        None => None,
    };

    let start = spec.page.saturating_mul(spec.limit);
    let filtered = !filters.is_empty();
    let rows = matching_rows(version, &filters);
    let total = rows.len();

    let ordered: Vec<u32> = match sort {
        None => rows,
        Some((position, direction)) => {
            let index = version.index(position);
            debug_assert_eq!(index.revision(), version.revision());

            if !filtered {
                // Every row matches: the index order is the answer.
                let order = match direction {
                    SortDirection::Asc => index.ascending(),
                    SortDirection::Desc => index.descending(dataset),
                };
                order.iter().skip(start).take(spec.limit).copied().collect()
            } else if rows.len().saturating_mul(DIRECT_SORT_RATIO) < records.len() {
                let numeric = schema.is_numeric(position);
                let key = |r: u32| SortKey::new(records[r as usize].value(position), numeric);
                let mut rows = rows;
                // `rows` is in insertion order and sort_by is stable.
                match direction {
                    SortDirection::Asc => rows.sort_by(|&a, &b| key(a).cmp(&key(b))),
                    SortDirection::Desc => rows.sort_by(|&a, &b| key(b).cmp(&key(a))),
                }
                rows
            } else {
                let mut member = vec![false; records.len()];
                for &r in &rows {
                    member[r as usize] = true;
                }
                let order = match direction {
                    SortDirection::Asc => index.ascending(),
                    SortDirection::Desc => index.descending(dataset),
                };
                order.iter().copied().filter(|&r| member[r as usize]).collect()
            }
        }
    };

    // The unfiltered sorted path already sliced its page.
    let page_rows: &[u32] = if sort.is_some() && !filtered {
        &ordered
    } else {
        ordered.get(start..).unwrap_or(&[])
    };

    let data = page_rows
        .iter()
        .take(spec.limit)
        .map(|&r| records[r as usize].clone())
        .collect();

    debug!(
        dataset = %spec.dataset,
        version = snapshot.version(),
        total,
        page = spec.page,
        "Query evaluated"
    );

    Ok(Page {
        data,
        pagination: Pagination::new(spec.page, spec.limit, total),
    })
}

fn realtime_on(snapshot: &Snapshot, spec: &QuerySpec) -> Result<FeedPage, QueryError> {
    let Some(fv) = snapshot.feed() else {
        let schema = Schema::realtime();
        resolve(&schema, spec)?;
        return Ok(FeedPage {
            header: None,
            entity: Vec::new(),
            total_records: 0,
            published_at: None,
        });
    };

    let feed = fv.feed();
    let filters = resolve(feed.schema(), spec)?;
    let matched: Vec<_> = feed
        .entities()
        .iter()
        .filter(|e| filters.iter().all(|f| matches(&e.fields, f)))
        .collect();

    Ok(FeedPage {
        header: Some(feed.header().clone()),
        total_records: matched.len(),
        entity: matched
            .into_iter()
            .take(spec.limit)
            .map(|e| e.payload.clone())
            .collect(),
        published_at: Some(fv.published_at()),
    })
}
