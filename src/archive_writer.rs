//! The archive writer and reader (§6: "archive format delegated to the archive writer").
//!
//! We own a concrete implementation rather than treating it as a true external
//! collaborator, built on the real `zip` crate with `CompressionMethod::Stored` so every
//! member's byte offset inside the file is retrievable exactly — the foundation of the
//! `internal:gdal_vsi` byte-range contract. A payload member's bytes are never
//! re-encoded between write and read, so offsets computed at write time remain valid.

use std::{
    collections::HashMap,
    fs::{self, File},
    io::{Read, Write},
    path::{Path, PathBuf},
};

use serde_json::Value as Manifest;
use zip::{write::SimpleFileOptions, CompressionMethod, ZipArchive, ZipWriter};

use crate::{
    constants::{
        COLUMN_ID, COLUMN_TYPE, FOLDER_COLLECTION_FILENAME, FOLDER_DATA_DIR, FOLDER_META_FILENAME, METADATA_GDAL_VSI,
        METADATA_OFFSET, METADATA_RELATIVE_PATH, METADATA_SIZE, PIT_SCHEMA_KEY, SAMPLE_TYPE_FILE, VSI_SUBFILE_PREFIX,
    },
    error::{execute_error, finalize_error, plan_error, BridgeResult},
    plan::ArchiveRef,
    table::Table,
    view::DatasetView,
};

const METADATA_DIR: &str = "METADATA";

fn level_member_name(level: usize) -> String {
    format!("{METADATA_DIR}/{}", crate::constants::level_parquet_name(level))
}

/// Everything the archive writer needs: the flat list of payload files to embed, and the
/// metadata produced by the finalizer (consolidated levels, per-folder local metadata, and
/// the collection manifest).
pub struct MetadataPackage<'a> {
    pub levels: &'a [Table],
    pub local_metadata: &'a HashMap<String, Table>,
    pub collection: &'a Manifest,
}

fn stored_options() -> SimpleFileOptions {
    SimpleFileOptions::default().compression_method(CompressionMethod::Stored)
}

/// Rewrites `internal:gdal_vsi`, `internal:offset`, and `internal:size` on every `FILE` row
/// of `table` whose archive path is present in `offsets`, pointing it at the byte range the
/// payload ended up at inside the just-written archive.
fn patch_locations(table: &Table, archive_name: &str, offsets: &HashMap<String, (u64, u64)>) -> Table {
    let mut gdal_vsi = Vec::with_capacity(table.num_rows());
    let mut offset_col = Vec::with_capacity(table.num_rows());
    let mut size_col = Vec::with_capacity(table.num_rows());

    for row in 0..table.num_rows() {
        let row_type = table.get_string(row, COLUMN_TYPE).unwrap_or_default();
        if row_type != SAMPLE_TYPE_FILE {
            gdal_vsi.push(table.get_string(row, METADATA_GDAL_VSI).unwrap_or_default());
            offset_col.push(0);
            size_col.push(0);
            continue;
        }
        let relative = table
            .get_string(row, METADATA_RELATIVE_PATH)
            .or_else(|| table.get_string(row, COLUMN_ID))
            .unwrap_or_default();
        let archive_path = format!("{FOLDER_DATA_DIR}/{relative}");
        match offsets.get(&archive_path) {
            Some(&(offset, size)) => {
                gdal_vsi.push(format!("{VSI_SUBFILE_PREFIX}{archive_name},{offset},{size}"));
                offset_col.push(offset as i64);
                size_col.push(size as i64);
            }
            None => {
                gdal_vsi.push(table.get_string(row, METADATA_GDAL_VSI).unwrap_or_default());
                offset_col.push(0);
                size_col.push(0);
            }
        }
    }

    table
        .with_string_column(METADATA_GDAL_VSI, &gdal_vsi)
        .with_i64_column(METADATA_OFFSET, &offset_col)
        .with_i64_column(METADATA_SIZE, &size_col)
}

/// Writes a single-file archive at `output` containing `entries`' payload bytes plus the
/// metadata package, and returns `output`. Two zip-writer passes: payload members first
/// (their offsets aren't known until the writer has placed them), then the metadata
/// members, patched with those offsets.
pub fn write_archive(entries: &[ArchiveRef], package: &MetadataPackage<'_>, output: &Path) -> BridgeResult<PathBuf> {
    // Opened read-write: the payload pass is later reopened for reading (`finish_into_readable`)
    // to learn each member's on-disk offset before the metadata pass patches `internal:gdal_vsi`.
    let file = fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(output)
        .map_err(|e| finalize_error(format!("creating archive {}", output.display())).attach_context("cause", e.to_string()))?;
    let mut writer = ZipWriter::new(file);
    let options = stored_options();

    for entry in entries {
        writer
            .start_file(&entry.archive_path, options)
            .map_err(|e| finalize_error(format!("starting archive member {}", entry.archive_path)).attach_context("cause", e.to_string()))?;
        let bytes = fs::read(&entry.src)
            .map_err(|e| finalize_error(format!("reading source file {}", entry.src.display())).attach_context("cause", e.to_string()))?;
        writer
            .write_all(&bytes)
            .map_err(|e| finalize_error(format!("writing archive member {}", entry.archive_path)).attach_context("cause", e.to_string()))?;
    }

    let readable = writer
        .finish_into_readable()
        .map_err(|e| finalize_error("finalizing payload pass").attach_context("cause", e.to_string()))?;

    let mut offsets = HashMap::new();
    let mut archive = readable;
    for entry in entries {
        let member = archive
            .by_name(&entry.archive_path)
            .map_err(|e| finalize_error(format!("locating written member {}", entry.archive_path)).attach_context("cause", e.to_string()))?;
        offsets.insert(entry.archive_path.clone(), (member.data_start(), member.size()));
    }

    let archive_name = output.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
    let mut writer = ZipWriter::new_append(archive.into_inner())
        .map_err(|e| finalize_error("reopening archive for metadata pass").attach_context("cause", e.to_string()))?;

    for (level, table) in package.levels.iter().enumerate() {
        let patched = patch_locations(table, &archive_name, &offsets);
        let bytes = patched.to_parquet_bytes()?;
        let name = level_member_name(level);
        writer
            .start_file(&name, options)
            .map_err(|e| finalize_error(format!("starting archive member {name}")).attach_context("cause", e.to_string()))?;
        writer
            .write_all(&bytes)
            .map_err(|e| finalize_error(format!("writing archive member {name}")).attach_context("cause", e.to_string()))?;
    }

    for (folder_path, table) in package.local_metadata {
        let patched = patch_locations(table, &archive_name, &offsets);
        let bytes = patched.to_parquet_bytes()?;
        let name = format!("{folder_path}{FOLDER_META_FILENAME}");
        writer
            .start_file(&name, options)
            .map_err(|e| finalize_error(format!("starting archive member {name}")).attach_context("cause", e.to_string()))?;
        writer
            .write_all(&bytes)
            .map_err(|e| finalize_error(format!("writing archive member {name}")).attach_context("cause", e.to_string()))?;
    }

    let collection_bytes = crate::metadata::to_pretty_json(package.collection)
        .map_err(|e| finalize_error("serializing COLLECTION.json").attach_context("cause", e.to_string()))?;
    writer
        .start_file(FOLDER_COLLECTION_FILENAME, options)
        .map_err(|e| finalize_error("starting COLLECTION.json member").attach_context("cause", e.to_string()))?;
    writer
        .write_all(&collection_bytes)
        .map_err(|e| finalize_error("writing COLLECTION.json member").attach_context("cause", e.to_string()))?;

    writer
        .finish()
        .map_err(|e| finalize_error("finalizing archive").attach_context("cause", e.to_string()))?;

    Ok(output.to_path_buf())
}

/// A [`DatasetView`] backed by an archive written by [`write_archive`].
pub struct ArchiveView {
    source_path: String,
    levels: Vec<Table>,
    collection: Manifest,
}

impl ArchiveView {
    /// Opens `path`, reading back `METADATA/level*.parquet` (in order) and
    /// `COLLECTION.json`.
    pub fn open(path: &Path) -> BridgeResult<Self> {
        let file = File::open(path)
            .map_err(|e| plan_error(format!("opening archive {}", path.display())).attach_context("cause", e.to_string()))?;
        let mut archive = ZipArchive::new(file)
            .map_err(|e| plan_error(format!("reading archive {}", path.display())).attach_context("cause", e.to_string()))?;

        let mut levels = Vec::new();
        let mut level = 0;
        loop {
            let name = level_member_name(level);
            match archive.by_name(&name) {
                Ok(mut member) => {
                    let mut buf = Vec::with_capacity(member.size() as usize);
                    member
                        .read_to_end(&mut buf)
                        .map_err(|e| plan_error(format!("reading archive member {name}")).attach_context("cause", e.to_string()))?;
                    levels.push(Table::read_parquet_bytes(bytes::Bytes::from(buf))?);
                    level += 1;
                }
                Err(_) => break,
            }
        }
        if levels.is_empty() {
            return Err(plan_error(format!("{} has no METADATA/level0.parquet member", path.display())));
        }

        let collection = {
            let mut member = archive
                .by_name(FOLDER_COLLECTION_FILENAME)
                .map_err(|e| plan_error(format!("{} has no COLLECTION.json member", path.display())).attach_context("cause", e.to_string()))?;
            let mut buf = String::new();
            member
                .read_to_string(&mut buf)
                .map_err(|e| plan_error("reading COLLECTION.json member").attach_context("cause", e.to_string()))?;
            serde_json::from_str(&buf).map_err(|e| plan_error("parsing COLLECTION.json member").attach_context("cause", e.to_string()))?
        };

        Ok(Self { source_path: path.display().to_string(), levels, collection })
    }

    /// Every `DATA/*` member that isn't a `__meta__` file, paired with its archive path.
    /// Used by the local fast path for archive → folder (§5).
    pub fn data_members(path: &Path) -> BridgeResult<Vec<String>> {
        let file = File::open(path)
            .map_err(|e| plan_error(format!("opening archive {}", path.display())).attach_context("cause", e.to_string()))?;
        let archive = ZipArchive::new(file)
            .map_err(|e| plan_error(format!("reading archive {}", path.display())).attach_context("cause", e.to_string()))?;
        Ok(archive
            .file_names()
            .filter(|name| name.starts_with(&format!("{FOLDER_DATA_DIR}/")) && !name.ends_with(FOLDER_META_FILENAME))
            .map(str::to_owned)
            .collect())
    }

    /// Extracts the member named `archive_path` from the archive at `path` to `dest`,
    /// creating parent directories as needed.
    pub fn extract_member(path: &Path, archive_path: &str, dest: &Path) -> BridgeResult<()> {
        let file = File::open(path)
            .map_err(|e| execute_error(format!("opening archive {}", path.display())).attach_context("cause", e.to_string()))?;
        let mut archive = ZipArchive::new(file)
            .map_err(|e| execute_error(format!("reading archive {}", path.display())).attach_context("cause", e.to_string()))?;
        let mut member = archive
            .by_name(archive_path)
            .map_err(|e| execute_error(format!("locating archive member {archive_path}")).attach_context("cause", e.to_string()))?;
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| execute_error(format!("creating directory {}", parent.display())).attach_context("cause", e.to_string()))?;
        }
        let mut out = File::create(dest)
            .map_err(|e| execute_error(format!("creating {}", dest.display())).attach_context("cause", e.to_string()))?;
        std::io::copy(&mut member, &mut out)
            .map_err(|e| execute_error(format!("extracting {archive_path} to {}", dest.display())).attach_context("cause", e.to_string()))?;
        Ok(())
    }
}

impl DatasetView for ArchiveView {
    fn max_depth(&self) -> usize {
        self.levels.len() - 1
    }

    fn level(&self, level: usize) -> &Table {
        &self.levels[level]
    }

    fn collection(&self) -> &Manifest {
        &self.collection
    }

    fn root_count(&self) -> usize {
        self.collection
            .get(PIT_SCHEMA_KEY)
            .and_then(|pit| pit.get("root"))
            .and_then(|root| root.get("n"))
            .and_then(serde_json::Value::as_u64)
            .map_or(self.levels[0].num_rows(), |n| n as usize)
    }

    fn source_path(&self) -> &str {
        &self.source_path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{METADATA_CURRENT_ID, METADATA_PARENT_ID};
    use serde_json::json;

    #[test]
    fn write_then_open_round_trips_level0_ids() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("a.tif");
        fs::File::create(&src).unwrap().write_all(b"fake raster bytes").unwrap();

        let level0 = Table::from_rows(
            &[COLUMN_ID, COLUMN_TYPE, METADATA_CURRENT_ID, METADATA_PARENT_ID, METADATA_RELATIVE_PATH, METADATA_GDAL_VSI],
            &[vec!["a".into(), SAMPLE_TYPE_FILE.into(), 0i64.into(), 0i64.into(), "a.tif".into(), "/data/a.tif".into()]],
        );
        let local_metadata = HashMap::new();
        let collection = json!({ "taco:pit_schema": { "root": { "n": 1 } } });
        let package = MetadataPackage { levels: &[level0], local_metadata: &local_metadata, collection: &collection };
        let entries = vec![ArchiveRef { src: src.clone(), archive_path: "DATA/a.tif".to_owned() }];

        let output = dir.path().join("out.zip");
        write_archive(&entries, &package, &output).unwrap();

        let view = ArchiveView::open(&output).unwrap();
        assert_eq!(view.level(0).num_rows(), 1);
        assert_eq!(view.level(0).get_string(0, COLUMN_ID).as_deref(), Some("a"));
        let vsi = view.level(0).get_string(0, METADATA_GDAL_VSI).unwrap();
        assert!(vsi.starts_with(VSI_SUBFILE_PREFIX));
        assert_eq!(view.level(0).get_i64(0, METADATA_SIZE), Some(17));
    }
}
