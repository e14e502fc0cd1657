//! Lazily built per-field lookup structures over one published dataset.
//!
//! A [`FieldIndex`] stores the dataset's row numbers ordered by field value,
//! ties broken by row number. That single ordering serves exact lookups
//! (binary search on the key range) and stable sorting in both directions.

use parking_lot::RwLock;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Instant;
use tracing::debug;

use crate::model::Dataset;

/// Comparison key for a field value.
///
/// Numeric fields compare as numbers; values that do not parse as a finite
/// number fall back to string order and sort after every number.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SortKey<'a> {
    Number(f64),
    Text(&'a str),
}

impl<'a> SortKey<'a> {
    pub fn new(value: &'a str, numeric: bool) -> Self {
        if numeric {
            if let Ok(n) = value.trim().parse::<f64>() {
                if n.is_finite() {
                    return SortKey::Number(n);
                }
            }
        }
        SortKey::Text(value)
    }
}

impl Eq for SortKey<'_> {}

impl PartialOrd for SortKey<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SortKey<'_> {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (SortKey::Number(a), SortKey::Number(b)) => a.total_cmp(b),
            (SortKey::Number(_), SortKey::Text(_)) => Ordering::Less,
            (SortKey::Text(_), SortKey::Number(_)) => Ordering::Greater,
            (SortKey::Text(a), SortKey::Text(b)) => a.cmp(b),
        }
    }
}

/// Ordered row numbers of one dataset for one field.
#[derive(Debug)]
pub struct FieldIndex {
    position: usize,
    numeric: bool,
    revision: u64,
    ascending: Vec<u32>,
    descending: OnceLock<Vec<u32>>,
}

impl FieldIndex {
    pub fn build(dataset: &Dataset, position: usize, revision: u64) -> Self {
        let numeric = dataset.schema().is_numeric(position);
        let records = dataset.records();
        let keys: Vec<SortKey<'_>> = records
            .iter()
            .map(|r| SortKey::new(r.value(position), numeric))
            .collect();

        let mut ascending: Vec<u32> = (0..records.len() as u32).collect();
        ascending.sort_unstable_by(|&a, &b| {
            keys[a as usize]
                .cmp(&keys[b as usize])
                .then(a.cmp(&b))
        });

        Self {
            position,
            numeric,
            revision,
            ascending,
            descending: OnceLock::new(),
        }
    }

    pub fn position(&self) -> usize {
        self.position
    }

    /// Revision of the dataset this index was built from.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn len(&self) -> usize {
        self.ascending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ascending.is_empty()
    }

    fn key<'d>(&self, dataset: &'d Dataset, row: u32) -> SortKey<'d> {
        SortKey::new(dataset.records()[row as usize].value(self.position), self.numeric)
    }

    /// Rows whose value compares equal to `value` under this field's policy.
    pub fn equal_range(&self, dataset: &Dataset, value: &str) -> &[u32] {
        let probe = SortKey::new(value, self.numeric);
        let start = self
            .ascending
            .partition_point(|&r| self.key(dataset, r) < probe);
        let end = self
            .ascending
            .partition_point(|&r| self.key(dataset, r) <= probe);
        &self.ascending[start..end]
    }

    /// Rows whose value is byte-for-byte equal to `value`, in insertion order.
    pub fn lookup_exact(&self, dataset: &Dataset, value: &str) -> Vec<u32> {
        // Within one key range rows are already ordered by row number.
        self.equal_range(dataset, value)
            .iter()
            .copied()
            .filter(|&r| dataset.records()[r as usize].value(self.position) == value)
            .collect()
    }

    /// All rows in ascending value order, ties in insertion order.
    pub fn ascending(&self) -> &[u32] {
        &self.ascending
    }

    /// All rows in descending value order, ties still in insertion order.
    pub fn descending(&self, dataset: &Dataset) -> &[u32] {
        self.descending.get_or_init(|| {
            let order = &self.ascending;
            let mut out = Vec::with_capacity(order.len());
            let mut end = order.len();
            while end > 0 {
                let key = self.key(dataset, order[end - 1]);
                let start = order[..end].partition_point(|&r| self.key(dataset, r) < key);
                out.extend_from_slice(&order[start..end]);
                end = start;
            }
            out
        })
    }
}

/// Indices built so far for one dataset version, keyed by field position.
/// Dropped together with the dataset version that owns it.
#[derive(Debug, Default)]
pub struct IndexCache {
    indexes: RwLock<HashMap<usize, Arc<FieldIndex>>>,
}

impl IndexCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, position: usize) -> Option<Arc<FieldIndex>> {
        self.indexes.read().get(&position).cloned()
    }

    /// Returns the cached index for `position`, building it on first use.
    /// Construction runs without holding the lock; if two readers race, the
    /// first stored index wins.
    pub fn get_or_build(&self, dataset: &Dataset, position: usize, revision: u64) -> Arc<FieldIndex> {
        if let Some(index) = self.get(position) {
            return index;
        }

        let started = Instant::now();
        let built = Arc::new(FieldIndex::build(dataset, position, revision));
        debug!(
            dataset = dataset.name(),
            field = %dataset.schema().fields()[position],
            revision,
            rows = built.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Built field index"
        );

        self.indexes
            .write()
            .entry(position)
            .or_insert(built)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.indexes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.indexes.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_static;

    #[test]
    fn test_sort_key_numeric_fallback() {
        assert!(SortKey::new("2", true) < SortKey::new("10", true));
        assert!(SortKey::new("10", false) < SortKey::new("2", false));
        assert!(SortKey::new("999", true) < SortKey::new("abc", true));
        assert_eq!(SortKey::new("NaN", true), SortKey::Text("NaN"));
        assert_eq!(SortKey::new(" 4.5 ", true), SortKey::Number(4.5));
    }

    #[test]
    fn test_ascending_is_stable_on_ties() {
        let dataset = stop_times();
        let pos = dataset.schema().position("stop_sequence").unwrap();
        let index = FieldIndex::build(&dataset, pos, 1);

        // stop_sequence values: 10, 2, 2, x, 1
        assert_eq!(index.ascending(), &[4, 1, 2, 0, 3]);
        assert_eq!(index.revision(), 1);
    }

    #[test]
    fn test_descending_keeps_insertion_order_within_ties() {
        let dataset = stop_times();
        let pos = dataset.schema().position("stop_sequence").unwrap();
        let index = FieldIndex::build(&dataset, pos, 1);

        assert_eq!(index.descending(&dataset), &[3, 0, 1, 2, 4]);
    }

    #[test]
    fn test_lookup_exact_is_string_equality() {
        let dataset = stop_times();
        let pos = dataset.schema().position("stop_sequence").unwrap();
        let index = FieldIndex::build(&dataset, pos, 1);

        assert_eq!(index.lookup_exact(&dataset, "2"), vec![1, 2]);
        // 2.0 is numerically equal but not the same string.
        assert_eq!(index.equal_range(&dataset, "2.0").len(), 2);
        assert!(index.lookup_exact(&dataset, "2.0").is_empty());
        assert!(index.lookup_exact(&dataset, "7").is_empty());
    }

    #[test]
    fn test_cache_builds_once() {
        let dataset = stop_times();
        let cache = IndexCache::new();
        let first = cache.get_or_build(&dataset, 0, 3);
        let second = cache.get_or_build(&dataset, 0, 3);

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.len(), 1);
    }

    fn stop_times() -> Dataset {
        let csv = "trip_id,stop_sequence\nt1,10\nt1,2\nt2,2\nt2,x\nt3,1\n";
        parse_static("stop_times.txt", csv.as_bytes(), None).unwrap()
    }
}
