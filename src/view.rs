//! The dataset view abstraction: the opaque, hierarchical object the planner reads from.
//!
//! A real deployment would get this from an out-of-scope reader collaborator backed by
//! whatever storage holds the source dataset. Here [`MemoryView`] provides an in-memory
//! implementation sufficient for constructing the literal scenarios the metadata engine is
//! tested against (filtering, concatenation, nesting), and [`ArchiveView`] reads our own
//! zip-based archive container.

use std::collections::HashMap;

use serde_json::Value as Manifest;

use crate::{
    constants::{METADATA_CURRENT_ID, METADATA_PARENT_ID, METADATA_SOURCE_FILE, METADATA_SOURCE_PATH, PIT_SCHEMA_KEY},
    error::{plan_error, BridgeResult},
    table::Table,
};

/// The reader API the planner consumes (§6): a hierarchical schema, per-level tabular
/// fetches (optionally with a filtered variant), a collection manifest, a root count, and
/// a join-at-depth flag.
pub trait DatasetView {
    /// Highest level index `D`; levels run `0..=max_depth()`.
    fn max_depth(&self) -> usize;

    /// The full (unfiltered) table for `level`.
    fn level(&self, level: usize) -> &Table;

    /// A filtered variant of `level`, if this view advertises one. Consulted by the
    /// reindexing algorithm in preference to `level()`.
    fn filtered_level(&self, level: usize) -> Option<&Table> {
        let _ = level;
        None
    }

    /// The collection manifest, as a deep-copyable JSON document.
    fn collection(&self) -> &Manifest;

    /// Root row count (`taco:pit_schema.root.n` at load time).
    fn root_count(&self) -> usize;

    /// The source path or URL this view was loaded from.
    fn source_path(&self) -> &str;

    /// Whether the view carries joins at levels ≥ 1, which the planner must reject for
    /// export (§4.2).
    fn has_level1_joins(&self) -> bool {
        false
    }

    /// The table used as the reindexing anchor for `level`: the filtered variant if
    /// advertised, else the full table.
    fn table_for_reindex(&self, level: usize) -> &Table {
        self.filtered_level(level).unwrap_or_else(|| self.level(level))
    }

    /// Takes the level-0 snapshot exactly once. The planner must call this a single time
    /// per operation and reuse the result for both task collection and reindexing — see
    /// the "lazy re-evaluation pitfall" design note.
    fn level0_snapshot(&self) -> Table {
        self.table_for_reindex(0).clone()
    }
}

/// An in-memory [`DatasetView`] built from already-materialized level tables.
#[derive(Debug, Clone)]
pub struct MemoryView {
    levels: Vec<Table>,
    filtered_levels: HashMap<usize, Table>,
    collection: Manifest,
    source_path: String,
    has_level1_joins: bool,
}

impl MemoryView {
    /// Builds a view from `levels[0..=max_depth]`, a collection manifest, and the path it
    /// is notionally loaded from.
    #[must_use]
    pub fn new(levels: Vec<Table>, collection: Manifest, source_path: impl Into<String>) -> Self {
        assert!(!levels.is_empty(), "a view must have at least a level 0");
        Self {
            levels,
            filtered_levels: HashMap::new(),
            collection,
            source_path: source_path.into(),
            has_level1_joins: false,
        }
    }

    /// Returns a view identical to `self` but with `level` 0 replaced by the rows matching
    /// `predicate`. Mirrors what `view.sql(predicate)` produces in the reader collaborator:
    /// only level 0 is filtered directly, deeper levels cascade through the reindexing
    /// algorithm's snapshot-anchored ancestry walk.
    #[must_use]
    pub fn filter_level0(mut self, predicate: impl Fn(&Table, usize) -> bool) -> Self {
        let level0 = &self.levels[0];
        let keep: Vec<bool> = (0..level0.num_rows()).map(|row| predicate(level0, row)).collect();
        let filtered = level0.filter_rows(&keep);
        self.filtered_levels.insert(0, filtered);
        self
    }

    /// Marks this view as carrying joins at levels ≥ 1 (exercised by planner rejection
    /// tests; no in-memory view otherwise produces one).
    #[must_use]
    pub fn with_level1_joins(mut self, has_joins: bool) -> Self {
        self.has_level1_joins = has_joins;
        self
    }

    /// Concatenates several views into one, tagging every row with its originating source
    /// path/file so the reindexing algorithm can scope ancestry lookups per source even
    /// when the sources reuse the same `internal:current_id` space (§4.1 step 2).
    #[must_use]
    pub fn concat(views: &[&MemoryView]) -> Self {
        assert!(!views.is_empty(), "concat requires at least one view");
        let max_depth = views.iter().map(|v| v.max_depth()).max().unwrap_or(0);

        let mut levels = Vec::with_capacity(max_depth + 1);
        for level in 0..=max_depth {
            let tagged: Vec<Table> = views
                .iter()
                .filter(|v| level <= v.max_depth())
                .map(|v| {
                    let table = v.table_for_reindex(level);
                    let source_path = vec![v.source_path.clone(); table.num_rows()];
                    let source_file = vec![file_name(&v.source_path); table.num_rows()];
                    table
                        .with_string_column(METADATA_SOURCE_PATH, &source_path)
                        .with_string_column(METADATA_SOURCE_FILE, &source_file)
                })
                .collect();
            levels.push(Table::vstack(&tagged));
        }

        let root_count: usize = views.iter().map(|v| v.root_count()).sum();
        let mut collection = views[0].collection.clone();
        if let Some(pit) = collection.get_mut(PIT_SCHEMA_KEY).and_then(|v| v.as_object_mut()) {
            pit.insert("root".into(), serde_json::json!({ "n": root_count }));
        }

        Self {
            levels,
            filtered_levels: HashMap::new(),
            collection,
            source_path: views.iter().map(|v| v.source_path.as_str()).collect::<Vec<_>>().join(","),
            has_level1_joins: views.iter().any(|v| v.has_level1_joins()),
        }
    }
}

fn file_name(path: &str) -> String {
    path.rsplit('/').next().unwrap_or(path).to_owned()
}

impl DatasetView for MemoryView {
    fn max_depth(&self) -> usize {
        self.levels.len() - 1
    }

    fn level(&self, level: usize) -> &Table {
        &self.levels[level]
    }

    fn filtered_level(&self, level: usize) -> Option<&Table> {
        self.filtered_levels.get(&level)
    }

    fn collection(&self) -> &Manifest {
        &self.collection
    }

    fn root_count(&self) -> usize {
        self.table_for_reindex(0).num_rows()
    }

    fn source_path(&self) -> &str {
        &self.source_path
    }

    fn has_level1_joins(&self) -> bool {
        self.has_level1_joins
    }
}

/// Children of `parent_current_id` at `level`, scoped by `source_key` when the level
/// carries concat provenance. Used by the planner's folder-recursion walk (§4.2).
#[must_use]
pub fn children_of(
    view: &dyn DatasetView,
    level: usize,
    parent_current_id: i64,
    source_key: Option<&str>,
) -> Vec<usize> {
    let table = view.table_for_reindex(level);
    (0..table.num_rows())
        .filter(|&row| {
            if table.get_i64(row, METADATA_PARENT_ID) != Some(parent_current_id) {
                return false;
            }
            match source_key {
                Some(key) => {
                    let row_key = table
                        .get_string(row, METADATA_SOURCE_PATH)
                        .or_else(|| table.get_string(row, METADATA_SOURCE_FILE))
                        .unwrap_or_default();
                    row_key == key
                }
                None => true,
            }
        })
        .collect()
}

/// Derives the `(source_key, current_id)` pair identifying a row, per the reindexing
/// algorithm's `source_key` definition (§4.1 step 2): `internal:source_path` if present,
/// else `internal:source_file`, else the empty string.
#[must_use]
pub fn source_key(table: &Table, row: usize) -> String {
    table
        .get_string(row, METADATA_SOURCE_PATH)
        .or_else(|| table.get_string(row, METADATA_SOURCE_FILE))
        .unwrap_or_default()
}

#[must_use]
pub fn current_id(table: &Table, row: usize) -> i64 {
    table.get_i64(row, METADATA_CURRENT_ID).unwrap_or(-1)
}

/// Loads a view, failing with [`crate::error::ErrorKind::Plan`] if the root count is zero.
pub fn require_nonempty(view: &dyn DatasetView) -> BridgeResult<()> {
    if view.root_count() == 0 {
        return Err(plan_error("empty view"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{COLUMN_ID, COLUMN_TYPE, METADATA_CURRENT_ID, METADATA_GDAL_VSI, METADATA_PARENT_ID};
    use crate::table::Cell;

    fn flat(rows: &[(i64, i64)], prefix: &str) -> Table {
        let data: Vec<Vec<Cell>> = rows
            .iter()
            .map(|(id, cloud_cover)| {
                vec![
                    format!("{prefix}-{id}").into(),
                    "FILE".into(),
                    (*id).into(),
                    (*id).into(),
                    format!("/data/{prefix}-{id}.tif").into(),
                    (*cloud_cover).into(),
                ]
            })
            .collect();
        Table::from_rows(
            &[COLUMN_ID, COLUMN_TYPE, METADATA_CURRENT_ID, METADATA_PARENT_ID, METADATA_GDAL_VSI, "cloud_cover"],
            &data,
        )
    }

    fn flat_a() -> MemoryView {
        let rows: Vec<(i64, i64)> = (0..10).map(|i| (i, i * 10)).collect();
        MemoryView::new(vec![flat(&rows, "flat_a")], serde_json::json!({ "taco:pit_schema": { "root": { "n": 10 } } }), "flat_a.archive")
    }

    #[test]
    fn flat_filter_keeps_matching_rows() {
        let filtered = flat_a().filter_level0(|t, row| t.get_i64(row, "cloud_cover").unwrap_or(i64::MAX) < 50);
        assert_eq!(filtered.root_count(), 5);
        assert_eq!(filtered.level0_snapshot().get_i64(0, METADATA_CURRENT_ID), Some(0));
    }

    #[test]
    fn concat_tags_source_provenance() {
        let a = flat_a();
        let b = {
            let rows: Vec<(i64, i64)> = (0..10).map(|i| (i, i * 5)).collect();
            MemoryView::new(vec![flat(&rows, "flat_b")], serde_json::json!({ "taco:pit_schema": { "root": { "n": 10 } } }), "flat_b.archive")
        };
        let concatenated = MemoryView::concat(&[&a, &b]);
        assert_eq!(concatenated.root_count(), 20);
        let snapshot = concatenated.level0_snapshot();
        assert_eq!(snapshot.num_rows(), 20);
        assert_eq!(source_key(&snapshot, 0), "flat_a.archive");
        assert_eq!(source_key(&snapshot, 10), "flat_b.archive");
    }

    #[test]
    fn empty_view_is_rejected() {
        let empty = flat_a().filter_level0(|_, _| false);
        assert!(require_nonempty(&empty).is_err());
    }
}
