//! The planner (§4.2): produces an immutable [`Plan`] for one of the three supported
//! operations, failing with [`crate::error::ErrorKind::Plan`] before any write occurs.

use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
};

use chrono::Utc;
use serde_json::Value as Manifest;
use walkdir::WalkDir;

use crate::{
    constants::{
        level_parquet_name, COLUMN_ID, COLUMN_TYPE, FOLDER_COLLECTION_FILENAME, FOLDER_DATA_DIR, FOLDER_META_FILENAME,
        METADATA_GDAL_VSI, METADATA_RELATIVE_PATH, SAMPLE_TYPE_FILE, VSI_SUBFILE_PREFIX,
    },
    error::{plan_error, BridgeResult},
    metadata::{build_local_metadata, prepare_collection, reindex_from_snapshot, strip_archive_columns},
    table::Table,
    view::{children_of, current_id, require_nonempty, source_key, DatasetView},
};

/// A single byte-transfer task. A task with both `offset` and `size` present is a partial
/// read; otherwise whole-object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub src: String,
    pub dest: PathBuf,
    pub offset: Option<u64>,
    pub size: Option<u64>,
}

/// A pre-existing local file and the path it shall have inside the output archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveRef {
    pub src: PathBuf,
    pub archive_path: String,
}

/// The reindexed level tables, per-folder local metadata, and updated collection manifest
/// common to every plan variant.
#[derive(Debug, Clone)]
pub struct PlanMetadata {
    pub levels: Vec<Table>,
    pub local_metadata: HashMap<String, Table>,
    pub collection: Manifest,
}

#[derive(Debug, Clone)]
pub struct ExportPlan {
    pub tasks: Vec<Task>,
    pub source_path: String,
    pub output: PathBuf,
    pub metadata: PlanMetadata,
}

#[derive(Debug, Clone)]
pub struct Zip2FolderPlan {
    pub tasks: Vec<Task>,
    pub source_path: String,
    pub output: PathBuf,
    pub metadata: PlanMetadata,
}

#[derive(Debug, Clone)]
pub struct Folder2ZipPlan {
    pub entries: Vec<ArchiveRef>,
    pub source_path: String,
    pub output: PathBuf,
    pub metadata: PlanMetadata,
}

/// The three plan variants, dispatched on by the finalizer. A sum type with an explicit
/// match rather than interface polymorphism: the variants differ in lifecycle (tasks vs.
/// entries) more than in behavior (§9).
#[derive(Debug, Clone)]
pub enum Plan {
    Export(ExportPlan),
    Zip2Folder(Zip2FolderPlan),
    Folder2Zip(Folder2ZipPlan),
}

impl Plan {
    #[must_use]
    pub fn output(&self) -> &Path {
        match self {
            Self::Export(p) => &p.output,
            Self::Zip2Folder(p) => &p.output,
            Self::Folder2Zip(p) => &p.output,
        }
    }
}

fn reject_existing_output(output: &Path) -> BridgeResult<()> {
    if output.exists() {
        return Err(plan_error("already exists").attach_context("output", output.display().to_string()));
    }
    Ok(())
}

/// Parses a byte-range location string into `(archive_path, offset, size)`, stripping any
/// URL scheme prefix from the archive path.
fn parse_vsi(rest: &str) -> Option<(String, u64, u64)> {
    let mut parts = rest.rsplitn(3, ',');
    let size: u64 = parts.next()?.parse().ok()?;
    let offset: u64 = parts.next()?.parse().ok()?;
    let archive_path = parts.next()?.to_owned();
    Some((archive_path, offset, size))
}

fn strip_url_scheme(path: &str) -> String {
    for scheme in ["file://", "https://", "http://"] {
        if let Some(rest) = path.strip_prefix(scheme) {
            return rest.to_owned();
        }
    }
    path.to_owned()
}

/// Converts an `internal:gdal_vsi` location string into a [`Task`] writing to `dest`.
#[must_use]
pub fn vsi_to_task(location: &str, dest: PathBuf) -> Task {
    if let Some(rest) = location.strip_prefix(VSI_SUBFILE_PREFIX) {
        if let Some((archive_path, offset, size)) = parse_vsi(rest) {
            return Task {
                src: strip_url_scheme(&archive_path),
                dest,
                offset: Some(offset),
                size: Some(size),
            };
        }
    }
    Task { src: location.to_owned(), dest, offset: None, size: None }
}

/// Recursively walks `view` from `(level, row)`, emitting one task per leaf file into
/// `tasks`. Folder children are looked up scoped by the row's source key, so concatenated
/// views with reused identifier spaces never cross-contaminate.
fn collect_tasks(view: &dyn DatasetView, level: usize, row: usize, output: &Path, tasks: &mut Vec<Task>) {
    let table = view.table_for_reindex(level);
    let row_type = table.get_string(row, COLUMN_TYPE).unwrap_or_default();

    if row_type == SAMPLE_TYPE_FILE {
        let relative = table
            .get_string(row, METADATA_RELATIVE_PATH)
            .or_else(|| table.get_string(row, COLUMN_ID))
            .unwrap_or_default();
        let dest = output.join(FOLDER_DATA_DIR).join(&relative);
        if let Some(vsi) = table.get_string(row, METADATA_GDAL_VSI) {
            tasks.push(vsi_to_task(&vsi, dest));
        }
        return;
    }

    let parent = current_id(table, row);
    let key = source_key(table, row);
    for child_row in children_of(view, level + 1, parent, Some(&key)) {
        collect_tasks(view, level + 1, child_row, output, tasks);
    }
}

/// `plan_export(view, output)` (§4.2). Takes the level-0 snapshot exactly once and reuses
/// it for both task collection and reindexing.
pub fn plan_export(view: &dyn DatasetView, output: impl Into<PathBuf>) -> BridgeResult<ExportPlan> {
    let output = output.into();
    reject_existing_output(&output)?;
    require_nonempty(view)?;
    if view.has_level1_joins() {
        return Err(plan_error("view carries joins at levels >= 1, which export cannot flatten"));
    }

    let snapshot = view.level0_snapshot();

    let mut tasks = Vec::new();
    for row in 0..snapshot.num_rows() {
        let row_type = snapshot.get_string(row, COLUMN_TYPE).unwrap_or_default();
        if row_type == SAMPLE_TYPE_FILE {
            let relative = snapshot
                .get_string(row, METADATA_RELATIVE_PATH)
                .or_else(|| snapshot.get_string(row, COLUMN_ID))
                .unwrap_or_default();
            let dest = output.join(FOLDER_DATA_DIR).join(&relative);
            if let Some(vsi) = snapshot.get_string(row, METADATA_GDAL_VSI) {
                tasks.push(vsi_to_task(&vsi, dest));
            }
        } else {
            let parent = current_id(&snapshot, row);
            let key = source_key(&snapshot, row);
            for child_row in children_of(view, 1, parent, Some(&key)) {
                collect_tasks(view, 1, child_row, &output, &mut tasks);
            }
        }
    }

    let (levels, local_metadata) = reindex_from_snapshot(view, &snapshot);
    let collection = prepare_collection(view, Utc::now());

    Ok(ExportPlan {
        tasks,
        source_path: view.source_path().to_owned(),
        output,
        metadata: PlanMetadata { levels, local_metadata, collection },
    })
}

/// `plan_zip2folder(archive_path, output)` (§4.2). No reindexing: identifiers are already
/// dense in a freshly loaded archive.
pub fn plan_zip2folder(view: &dyn DatasetView, output: impl Into<PathBuf>) -> BridgeResult<Zip2FolderPlan> {
    let output = output.into();
    reject_existing_output(&output)?;

    let mut tasks = Vec::new();
    for row in 0..view.level(0).num_rows() {
        let row_type = view.level(0).get_string(row, COLUMN_TYPE).unwrap_or_default();
        if row_type == SAMPLE_TYPE_FILE {
            let relative = view
                .level(0)
                .get_string(row, METADATA_RELATIVE_PATH)
                .or_else(|| view.level(0).get_string(row, COLUMN_ID))
                .unwrap_or_default();
            let dest = output.join(FOLDER_DATA_DIR).join(&relative);
            if let Some(vsi) = view.level(0).get_string(row, METADATA_GDAL_VSI) {
                tasks.push(vsi_to_task(&vsi, dest));
            }
        } else {
            let parent = current_id(view.level(0), row);
            for child_row in children_of(view, 1, parent, None) {
                collect_tasks_unfiltered(view, 1, child_row, &output, &mut tasks);
            }
        }
    }

    let levels = strip_archive_columns(view);
    let local_metadata = build_local_metadata(&levels);

    Ok(Zip2FolderPlan {
        tasks,
        source_path: view.source_path().to_owned(),
        output,
        metadata: PlanMetadata { levels, local_metadata, collection: view.collection().clone() },
    })
}

fn collect_tasks_unfiltered(view: &dyn DatasetView, level: usize, row: usize, output: &Path, tasks: &mut Vec<Task>) {
    let table = view.level(level);
    let row_type = table.get_string(row, COLUMN_TYPE).unwrap_or_default();

    if row_type == SAMPLE_TYPE_FILE {
        let relative = table
            .get_string(row, METADATA_RELATIVE_PATH)
            .or_else(|| table.get_string(row, COLUMN_ID))
            .unwrap_or_default();
        let dest = output.join(FOLDER_DATA_DIR).join(&relative);
        if let Some(vsi) = table.get_string(row, METADATA_GDAL_VSI) {
            tasks.push(vsi_to_task(&vsi, dest));
        }
        return;
    }

    let parent = current_id(table, row);
    for child_row in children_of(view, level + 1, parent, None) {
        collect_tasks_unfiltered(view, level + 1, child_row, output, tasks);
    }
}

/// `plan_folder2zip(folder, output)` (§4.2). Tasks are *references* to existing local
/// files; no executor phase is required for this operation.
pub fn plan_folder2zip(folder: impl Into<PathBuf>, output: impl Into<PathBuf>) -> BridgeResult<Folder2ZipPlan> {
    let folder = folder.into();
    let output = output.into();
    reject_existing_output(&output)?;

    if !folder.exists() {
        return Err(plan_error("source folder does not exist").attach_context("folder", folder.display().to_string()));
    }

    let collection_path = folder.join(FOLDER_COLLECTION_FILENAME);
    let collection_text = fs::read_to_string(&collection_path)
        .map_err(|e| plan_error("reading COLLECTION.json").attach_context("cause", e.to_string()))?;
    let collection: Manifest = serde_json::from_str(&collection_text)
        .map_err(|e| plan_error("parsing COLLECTION.json").attach_context("cause", e.to_string()))?;

    let metadata_dir = folder.join("METADATA");
    let mut levels = Vec::new();
    let mut level = 0;
    loop {
        let path = metadata_dir.join(level_parquet_name(level));
        if !path.exists() {
            break;
        }
        levels.push(Table::read_parquet(&path)?);
        level += 1;
    }
    if levels.is_empty() {
        return Err(plan_error("folder/METADATA/level0.parquet missing or empty"));
    }

    let local_metadata = build_local_metadata(&levels);

    let data_dir = folder.join(FOLDER_DATA_DIR);
    let mut entries = Vec::new();
    for entry in WalkDir::new(&data_dir).into_iter().filter_map(Result::ok) {
        if !entry.file_type().is_file() {
            continue;
        }
        if entry.file_name() == FOLDER_META_FILENAME {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(&data_dir)
            .expect("walked entry is under data_dir")
            .to_string_lossy()
            .replace('\\', "/");
        entries.push(ArchiveRef { src: entry.path().to_path_buf(), archive_path: format!("{FOLDER_DATA_DIR}/{relative}") });
    }
    if entries.is_empty() {
        return Err(plan_error("No data files found"));
    }

    Ok(Folder2ZipPlan {
        entries,
        source_path: folder.display().to_string(),
        output,
        metadata: PlanMetadata { levels, local_metadata, collection },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{METADATA_CURRENT_ID, METADATA_PARENT_ID};
    use crate::table::Cell;
    use crate::view::MemoryView;
    use serde_json::json;

    fn flat_a() -> MemoryView {
        let rows: Vec<Vec<Cell>> = (0..10)
            .map(|i: i64| {
                vec![
                    format!("flat_a-{i}").into(),
                    SAMPLE_TYPE_FILE.into(),
                    i.into(),
                    i.into(),
                    format!("/data/flat_a-{i}.tif").into(),
                    (i * 10).into(),
                ]
            })
            .collect();
        let level0 = Table::from_rows(
            &[COLUMN_ID, COLUMN_TYPE, METADATA_CURRENT_ID, METADATA_PARENT_ID, METADATA_GDAL_VSI, "cloud_cover"],
            &rows,
        );
        MemoryView::new(vec![level0], json!({ "taco:pit_schema": { "root": { "n": 10 } } }), "flat_a.archive")
    }

    #[test]
    fn plan_export_rejects_existing_output() {
        let dir = tempfile::tempdir().unwrap();
        let view = flat_a();
        let err = plan_export(&view, dir.path()).unwrap_err();
        assert!(err.to_string().contains("already exists"));
    }

    #[test]
    fn plan_export_flat_filter_produces_five_tasks() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("out");
        let view = flat_a().filter_level0(|t, row| t.get_i64(row, "cloud_cover").unwrap_or(i64::MAX) < 50);
        let plan = plan_export(&view, &output).unwrap();
        assert_eq!(plan.tasks.len(), 5);
        assert_eq!(plan.metadata.levels[0].num_rows(), 5);
    }

    #[test]
    fn vsi_to_task_parses_byte_range() {
        let task = vsi_to_task("/vsisubfile/flat_a.archive/DATA/a.tif,128,64", PathBuf::from("/tmp/out"));
        assert_eq!(task.src, "flat_a.archive/DATA/a.tif");
        assert_eq!(task.offset, Some(128));
        assert_eq!(task.size, Some(64));
    }

    #[test]
    fn vsi_to_task_passes_through_plain_paths() {
        let task = vsi_to_task("/local/path/a.tif", PathBuf::from("/tmp/out"));
        assert_eq!(task.src, "/local/path/a.tif");
        assert_eq!(task.offset, None);
    }
}
