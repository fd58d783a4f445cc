//! The finalizer (§4.4): writes consolidated metadata, local per-folder metadata, and the
//! collection manifest for folder output, or invokes the archive writer for archive output.

use std::{
    fs,
    path::{Path, PathBuf},
};

use crate::{
    archive_writer::{write_archive, ArchiveView, MetadataPackage},
    chunker::content_defined_row_groups,
    constants::{level_parquet_name, FOLDER_COLLECTION_FILENAME, FOLDER_DATA_DIR, FOLDER_META_FILENAME, FOLDER_METADATA_DIR},
    error::{finalize_error, BridgeResult},
    plan::{Plan, PlanMetadata},
    view::DatasetView,
};

/// Writes `METADATA/level<N>.parquet` (content-defined-chunked), every folder's
/// `__meta__` (plain), and `COLLECTION.json`, under `output`.
fn finalize_folder(output: &Path, metadata: &PlanMetadata) -> BridgeResult<PathBuf> {
    let metadata_dir = output.join(FOLDER_METADATA_DIR);
    fs::create_dir_all(&metadata_dir)
        .map_err(|e| finalize_error(format!("creating {}", metadata_dir.display())).attach_context("cause", e.to_string()))?;

    for (level, table) in metadata.levels.iter().enumerate() {
        let path = metadata_dir.join(level_parquet_name(level));
        let row_groups = content_defined_row_groups(table);
        table.write_parquet_chunked(&path, &row_groups)?;
        log::debug!("wrote {}: {} rows", path.display(), table.num_rows());
    }

    for (folder_path, table) in &metadata.local_metadata {
        let dir = output.join(folder_path);
        fs::create_dir_all(&dir).map_err(|e| finalize_error(format!("creating {}", dir.display())).attach_context("cause", e.to_string()))?;
        let meta_path = dir.join(FOLDER_META_FILENAME);
        table.write_parquet(&meta_path)?;
        log::debug!("wrote {}", meta_path.display());
    }

    let collection_path = output.join(FOLDER_COLLECTION_FILENAME);
    let json = crate::metadata::to_pretty_json(&metadata.collection)
        .map_err(|e| finalize_error("serializing COLLECTION.json").attach_context("cause", e.to_string()))?;
    fs::write(&collection_path, json)
        .map_err(|e| finalize_error(format!("writing {}", collection_path.display())).attach_context("cause", e.to_string()))?;
    log::debug!("wrote {}", collection_path.display());

    log::info!("finalized folder: {}", output.display());
    Ok(output.to_path_buf())
}

/// `finalize(plan)` (§4.4). Dispatches on plan variant: folder output for `ExportPlan` and
/// `Zip2FolderPlan`, archive output for `Folder2ZipPlan`. Assumes the plan's tasks (if any)
/// have already been executed by the caller.
pub fn finalize(plan: &Plan) -> BridgeResult<PathBuf> {
    match plan {
        Plan::Export(p) => finalize_folder(&p.output, &p.metadata),
        Plan::Zip2Folder(p) => finalize_folder(&p.output, &p.metadata),
        Plan::Folder2Zip(p) => {
            let package = MetadataPackage {
                levels: &p.metadata.levels,
                local_metadata: &p.metadata.local_metadata,
                collection: &p.metadata.collection,
            };
            log::info!("packaging {} files into archive...", p.entries.len());
            let result = write_archive(&p.entries, &package, &p.output)?;
            log::info!("finalized archive: {}", result.display());
            Ok(result)
        }
    }
}

/// Fast path for local archive → folder (§5): bypasses the planner/executor entirely,
/// extracting every `DATA/*` member directly from the archive instead of going through
/// one `execute()` call per file. Must produce a byte-identical result to
/// `finalize(plan_zip2folder(..))` after its tasks have been executed.
pub fn fast_zip2folder(archive_path: &Path, output: &Path) -> BridgeResult<PathBuf> {
    if output.exists() {
        return Err(crate::error::plan_error("already exists").attach_context("output", output.display().to_string()));
    }

    let view = ArchiveView::open(archive_path)?;
    let levels = crate::metadata::strip_archive_columns(&view);
    let local_metadata = crate::metadata::build_local_metadata(&levels);
    let metadata = PlanMetadata { levels, local_metadata, collection: view.collection().clone() };

    for archive_member in ArchiveView::data_members(archive_path)? {
        let relative = archive_member
            .strip_prefix(&format!("{FOLDER_DATA_DIR}/"))
            .unwrap_or(&archive_member);
        let dest = output.join(FOLDER_DATA_DIR).join(relative);
        ArchiveView::extract_member(archive_path, &archive_member, &dest)?;
    }

    let result = finalize_folder(output, &metadata)?;
    log::info!("extracted to folder: {}", result.display());
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        archive_writer::{write_archive, MetadataPackage},
        constants::{COLUMN_ID, COLUMN_TYPE, METADATA_CURRENT_ID, METADATA_GDAL_VSI, METADATA_PARENT_ID, METADATA_RELATIVE_PATH},
        plan::ArchiveRef,
        table::Table,
    };
    use serde_json::json;
    use std::{collections::HashMap, io::Write as _};

    fn sample_archive(dir: &std::path::Path) -> PathBuf {
        let src = dir.join("a.tif");
        fs::File::create(&src).unwrap().write_all(b"fake raster bytes").unwrap();

        let level0 = Table::from_rows(
            &[COLUMN_ID, COLUMN_TYPE, METADATA_CURRENT_ID, METADATA_PARENT_ID, METADATA_RELATIVE_PATH, METADATA_GDAL_VSI],
            &[vec!["a".into(), "FILE".into(), 0i64.into(), 0i64.into(), "a.tif".into(), "/data/a.tif".into()]],
        );
        let local_metadata = HashMap::new();
        let collection = json!({ "taco:pit_schema": { "root": { "n": 1 } } });
        let package = MetadataPackage { levels: &[level0], local_metadata: &local_metadata, collection: &collection };
        let entries = vec![ArchiveRef { src, archive_path: "DATA/a.tif".to_owned() }];

        let archive_path = dir.join("source.zip");
        write_archive(&entries, &package, &archive_path).unwrap();
        archive_path
    }

    #[test]
    fn fast_zip2folder_extracts_payload_and_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let archive_path = sample_archive(dir.path());
        let output = dir.path().join("out");

        fast_zip2folder(&archive_path, &output).unwrap();

        assert!(output.join(FOLDER_DATA_DIR).join("a.tif").exists());
        assert_eq!(fs::read(output.join(FOLDER_DATA_DIR).join("a.tif")).unwrap(), b"fake raster bytes");
        assert!(output.join(FOLDER_COLLECTION_FILENAME).exists());
        assert!(output.join(FOLDER_METADATA_DIR).join("level0.parquet").exists());
    }

    #[test]
    fn fast_zip2folder_rejects_existing_output() {
        let dir = tempfile::tempdir().unwrap();
        let archive_path = sample_archive(dir.path());
        let output = dir.path().join("out");
        fs::create_dir_all(&output).unwrap();

        assert!(fast_zip2folder(&archive_path, &output).is_err());
    }
}
