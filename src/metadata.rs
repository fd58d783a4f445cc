//! The metadata engine (§4.1): column stripping, identifier reindexing across a
//! filtered/concatenated hierarchy, local per-folder metadata, and collection manifest
//! preparation. Every operation here is a pure function of its table/view arguments except
//! [`prepare_collection`], whose clock read is passed in rather than read internally (see
//! the "global state" design note: inject it behind a small capability for deterministic
//! tests).

use std::collections::HashMap;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde_json::{json, ser::PrettyFormatter, Serializer, Value as Manifest};

use crate::{
    constants::{
        export_strip_columns, level_parquet_name, COLUMN_ID, COLUMN_TYPE, METADATA_CURRENT_ID, METADATA_PARENT_ID,
        METADATA_RELATIVE_PATH, PIT_SCHEMA_KEY, SAMPLE_TYPE_FOLDER, SUBSET_DATE_KEY, SUBSET_OF_KEY,
    },
    table::Table,
    view::{source_key, DatasetView},
};

/// Returns a new table with `columns` removed when present; missing columns are ignored.
/// Defaults to `{internal:offset, internal:size, internal:source_path, internal:source_file}`.
#[must_use]
pub fn strip_columns(table: &Table, columns: Option<&[&str]>) -> Table {
    match columns {
        Some(cols) => table.drop_columns(cols),
        None => table.drop_columns(&export_strip_columns()),
    }
}

/// For each level of `view`, fetches the full table and strips the archive-only columns
/// (`internal:offset`, `internal:size`). Used by `plan_zip2folder` against a freshly loaded,
/// unfiltered view, where no reindexing is needed.
#[must_use]
pub fn strip_archive_columns(view: &dyn DatasetView) -> Vec<Table> {
    (0..=view.max_depth())
        .map(|level| strip_columns(view.level(level), Some(&crate::constants::ARCHIVE_ONLY_COLUMNS)))
        .collect()
}

/// Replaces `internal:current_id` and `internal:parent_id` in bulk with the provided
/// sequences, which must be the same length as `table.num_rows()`.
#[must_use]
pub fn reindex_table(table: &Table, new_current_ids: &[i64], new_parent_ids: &[i64]) -> Table {
    table
        .with_i64_column(METADATA_CURRENT_ID, new_current_ids)
        .with_i64_column(METADATA_PARENT_ID, new_parent_ids)
}

/// The core reindexing algorithm (§4.1). `level0_snapshot` must be the *same* table the
/// caller used to collect transfer tasks — read it once and pass the same value here,
/// never re-fetch it from the view (see the "lazy re-evaluation pitfall" design note).
///
/// Returns densely-numbered output levels and the per-folder local metadata derived from
/// them.
#[must_use]
pub fn reindex_from_snapshot(view: &dyn DatasetView, level0_snapshot: &Table) -> (Vec<Table>, HashMap<String, Table>) {
    let mut mapping: HashMap<(String, i64), i64> = HashMap::new();
    let mut levels = Vec::with_capacity(view.max_depth() + 1);

    let n0 = level0_snapshot.num_rows();
    for row in 0..n0 {
        let old_id = level0_snapshot.get_i64(row, METADATA_CURRENT_ID).unwrap_or(row as i64);
        mapping.insert((source_key(level0_snapshot, row), old_id), row as i64);
    }
    let ids0: Vec<i64> = (0..n0 as i64).collect();
    levels.push(strip_columns(&reindex_table(level0_snapshot, &ids0, &ids0), None));

    for level in 1..=view.max_depth() {
        let table = view.table_for_reindex(level);
        let mut keep_rows = Vec::new();
        let mut new_parent_ids = Vec::new();
        for row in 0..table.num_rows() {
            let old_parent_id = table.get_i64(row, METADATA_PARENT_ID).unwrap_or(-1);
            let key = (source_key(table, row), old_parent_id);
            if let Some(&new_parent) = mapping.get(&key) {
                keep_rows.push(row as i64);
                new_parent_ids.push(new_parent);
            }
        }

        let kept = table.take_rows(&keep_rows);
        for (new_index, &old_row) in keep_rows.iter().enumerate() {
            let old_row = old_row as usize;
            let old_id = table.get_i64(old_row, METADATA_CURRENT_ID).unwrap_or(old_row as i64);
            mapping.insert((source_key(table, old_row), old_id), new_index as i64);
        }

        let new_current_ids: Vec<i64> = (0..kept.num_rows() as i64).collect();
        levels.push(strip_columns(&reindex_table(&kept, &new_current_ids, &new_parent_ids), None));
    }

    let local_metadata = build_local_metadata(&levels);
    (levels, local_metadata)
}

/// Produces a mapping from output folder path (e.g. `DATA/region_a/sensor_0/`) to the
/// children table destined to live there. Walks `levels` pairwise; empty folders map to
/// zero-row tables with the child level's schema.
#[must_use]
pub fn build_local_metadata(levels: &[Table]) -> HashMap<String, Table> {
    let mut local_metadata = HashMap::new();
    let mut path_by_current_id: HashMap<i64, String> = HashMap::new();

    for (level, table) in levels.iter().enumerate() {
        let mut next_path_by_current_id: HashMap<i64, String> = HashMap::new();
        for row in 0..table.num_rows() {
            let id = table.get_string(row, COLUMN_ID).unwrap_or_default();
            let current_id = table.get_i64(row, METADATA_CURRENT_ID).unwrap_or(-1);
            let row_type = table.get_string(row, COLUMN_TYPE).unwrap_or_default();

            let path = if level == 0 {
                id
            } else {
                let parent_id = table.get_i64(row, METADATA_PARENT_ID).unwrap_or(-1);
                let parent_path = path_by_current_id.get(&parent_id).cloned().unwrap_or_default();
                format!("{parent_path}/{id}")
            };

            if row_type == SAMPLE_TYPE_FOLDER {
                next_path_by_current_id.insert(current_id, path.clone());
                let children = match levels.get(level + 1) {
                    Some(next) => {
                        let indices: Vec<i64> = (0..next.num_rows())
                            .filter(|&r| next.get_i64(r, METADATA_PARENT_ID) == Some(current_id))
                            .map(|r| r as i64)
                            .collect();
                        next.take_rows(&indices).drop_columns(&[METADATA_RELATIVE_PATH])
                    }
                    None => table.empty_like().drop_columns(&[METADATA_RELATIVE_PATH]),
                };
                local_metadata.insert(format!("DATA/{path}/"), children);
            }
        }
        path_by_current_id = next_path_by_current_id;
    }

    local_metadata
}

/// Deep-copies `view`'s collection, overwrites `taco:pit_schema.root.n` with the view's
/// root count, sets `taco:subset_of` to the source collection's `id` (or `"unknown"`), and
/// stamps `taco:subset_date` with `now` in ISO-8601. `now` is supplied by the caller so the
/// function stays pure and deterministic in tests.
#[must_use]
pub fn prepare_collection(view: &dyn DatasetView, now: DateTime<Utc>) -> Manifest {
    let mut collection = view.collection().clone();
    let root_count = view.root_count();
    if let Some(root) = collection
        .get_mut(PIT_SCHEMA_KEY)
        .and_then(Manifest::as_object_mut)
        .and_then(|pit| pit.get_mut("root"))
        .and_then(Manifest::as_object_mut)
    {
        root.insert("n".to_owned(), json!(root_count));
    }
    let subset_of = collection
        .get("id")
        .and_then(Manifest::as_str)
        .map(str::to_owned)
        .unwrap_or_else(|| "unknown".to_owned());
    if let Some(obj) = collection.as_object_mut() {
        obj.insert(SUBSET_OF_KEY.to_owned(), json!(subset_of));
        obj.insert(SUBSET_DATE_KEY.to_owned(), json!(now.to_rfc3339_opts(SecondsFormat::Secs, true)));
    }
    collection
}

/// Relative file name for a level's consolidated metadata output, e.g. `level0.parquet`.
#[must_use]
pub fn level_file_name(level: usize) -> String {
    level_parquet_name(level)
}

/// Serializes `value` as 4-space-indented UTF-8 JSON, matching `COLLECTION.json`'s contract
/// (§4.4, §6) and the original's `json.dumps(..., indent=4, ensure_ascii=False)`.
/// `serde_json::to_vec_pretty` indents with 2 spaces, so we build the formatter directly.
pub fn to_pretty_json(value: &Manifest) -> serde_json::Result<Vec<u8>> {
    let mut buf = Vec::new();
    let formatter = PrettyFormatter::with_indent(b"    ");
    let mut serializer = Serializer::with_formatter(&mut buf, formatter);
    value.serialize(&mut serializer)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{METADATA_CURRENT_ID, METADATA_GDAL_VSI, METADATA_PARENT_ID};
    use crate::table::Cell;
    use crate::view::MemoryView;

    fn folder_row(id: &str, current_id: i64, parent_id: i64) -> Vec<Cell> {
        vec![id.into(), SAMPLE_TYPE_FOLDER.into(), current_id.into(), parent_id.into(), Cell::Null]
    }

    fn file_row(id: &str, current_id: i64, parent_id: i64, cloud_cover: i64) -> Vec<Cell> {
        vec![
            id.into(),
            "FILE".into(),
            current_id.into(),
            parent_id.into(),
            format!("/data/{id}.tif").into(),
            cloud_cover.into(),
        ]
    }

    fn columns() -> [&'static str; 6] {
        [COLUMN_ID, COLUMN_TYPE, METADATA_CURRENT_ID, METADATA_PARENT_ID, METADATA_GDAL_VSI, "cloud_cover"]
    }

    /// 5 folders with `cloud_cover ∈ {0,15,30,45,60}`, 3 children each: the spec's
    /// "nested filter" scenario.
    fn nested_a() -> MemoryView {
        let mut level0_rows = Vec::new();
        let mut level1_rows = Vec::new();
        for (i, cloud_cover) in [0, 15, 30, 45, 60].into_iter().enumerate() {
            let i = i as i64;
            let mut row = folder_row(&format!("folder-{i}"), i, i);
            row.push(cloud_cover.into());
            level0_rows.push(row);
            for c in 0..3 {
                level1_rows.push(file_row(&format!("folder-{i}-child-{c}"), i * 3 + c, i, cloud_cover));
            }
        }
        let level0 = Table::from_rows(&columns(), &level0_rows);
        let level1 = Table::from_rows(&columns(), &level1_rows);
        MemoryView::new(vec![level0, level1], json!({ "taco:pit_schema": { "root": { "n": 5 } } }), "nested_a.archive")
    }

    #[test]
    fn nested_filter_produces_expected_row_counts() {
        let view = nested_a().filter_level0(|t, row| t.get_i64(row, "cloud_cover").unwrap_or(i64::MAX) < 30);
        let snapshot = view.level0_snapshot();
        assert_eq!(snapshot.num_rows(), 2);

        let (levels, local_metadata) = reindex_from_snapshot(&view, &snapshot);
        assert_eq!(levels[0].num_rows(), 2);
        assert_eq!(levels[1].num_rows(), 6);
        assert_eq!(local_metadata.len(), 2);
    }

    #[test]
    fn reindexed_levels_are_column_pure() {
        let view = nested_a();
        let snapshot = view.level0_snapshot();
        let (levels, _) = reindex_from_snapshot(&view, &snapshot);
        for level in &levels {
            for column in export_strip_columns() {
                assert!(!level.has_column(column));
            }
        }
    }

    #[test]
    fn level0_self_parent_convention() {
        let view = nested_a();
        let snapshot = view.level0_snapshot();
        let (levels, _) = reindex_from_snapshot(&view, &snapshot);
        for row in 0..levels[0].num_rows() {
            assert_eq!(
                levels[0].get_i64(row, METADATA_CURRENT_ID),
                levels[0].get_i64(row, METADATA_PARENT_ID)
            );
        }
    }

    #[test]
    fn prepare_collection_stamps_subset_metadata() {
        let view = nested_a();
        let now: DateTime<Utc> = "2026-07-31T00:00:00Z".parse().unwrap();
        let collection = prepare_collection(&view, now);
        assert_eq!(collection[SUBSET_OF_KEY], json!("unknown"));
        assert_eq!(collection[PIT_SCHEMA_KEY]["root"]["n"], json!(5));
    }

    #[test]
    fn prepare_collection_preserves_sibling_root_keys() {
        let mut row = folder_row("folder-0", 0, 0);
        row.push(0i64.into());
        let level0 = Table::from_rows(&columns(), &[row]);
        let view = MemoryView::new(
            vec![level0],
            json!({ "taco:pit_schema": { "root": { "n": 1, "max_depth": 3 }, "other": true } }),
            "single.archive",
        );

        let now: DateTime<Utc> = "2026-07-31T00:00:00Z".parse().unwrap();
        let collection = prepare_collection(&view, now);
        assert_eq!(collection[PIT_SCHEMA_KEY]["root"]["n"], json!(1));
        assert_eq!(collection[PIT_SCHEMA_KEY]["root"]["max_depth"], json!(3));
        assert_eq!(collection[PIT_SCHEMA_KEY]["other"], json!(true));
    }

    #[test]
    fn to_pretty_json_uses_four_space_indent() {
        let value = json!({ "a": { "b": 1 } });
        let bytes = to_pretty_json(&value).unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert_eq!(text, "{\n    \"a\": {\n        \"b\": 1\n    }\n}");
    }
}
