//! Column names, manifest keys, and on-disk templates shared across the crate.

/// User-visible identifier of the entity at a level.
pub const COLUMN_ID: &str = "id";
/// `FILE` or `FOLDER`.
pub const COLUMN_TYPE: &str = "type";

/// Integer identifier unique within a level.
pub const METADATA_CURRENT_ID: &str = "internal:current_id";
/// Integer identifier referencing the parent row at level-1.
pub const METADATA_PARENT_ID: &str = "internal:parent_id";
/// Location string for the payload (plain path/URL or byte-range reference).
pub const METADATA_GDAL_VSI: &str = "internal:gdal_vsi";
/// Archive-internal relative path for leaf files.
pub const METADATA_RELATIVE_PATH: &str = "internal:relative_path";
/// Byte offset of a leaf's payload inside an archive.
pub const METADATA_OFFSET: &str = "internal:offset";
/// Byte size of a leaf's payload inside an archive.
pub const METADATA_SIZE: &str = "internal:size";
/// Path of the archive a row in a concatenated view was read from.
pub const METADATA_SOURCE_PATH: &str = "internal:source_path";
/// File name of the archive a row in a concatenated view was read from.
pub const METADATA_SOURCE_FILE: &str = "internal:source_file";

/// Row type marking a payload-bearing leaf.
pub const SAMPLE_TYPE_FILE: &str = "FILE";
/// Row type marking an internal tree node.
pub const SAMPLE_TYPE_FOLDER: &str = "FOLDER";

/// Columns present only in archive form, stripped on conversion to folder form.
pub const ARCHIVE_ONLY_COLUMNS: [&str; 2] = [METADATA_OFFSET, METADATA_SIZE];
/// Columns added while concatenating views, tracking row provenance.
pub const CONCAT_COLUMNS: [&str; 2] = [METADATA_SOURCE_PATH, METADATA_SOURCE_FILE];

/// All columns removed when producing the levels of an output dataset.
pub fn export_strip_columns() -> [&'static str; 4] {
    [
        METADATA_OFFSET,
        METADATA_SIZE,
        METADATA_SOURCE_PATH,
        METADATA_SOURCE_FILE,
    ]
}

/// Name of the collection manifest file at the root of a folder-form dataset.
pub const FOLDER_COLLECTION_FILENAME: &str = "COLLECTION.json";
/// Name of the data directory of a folder-form dataset.
pub const FOLDER_DATA_DIR: &str = "DATA";
/// Name of the consolidated metadata directory of a folder-form dataset.
pub const FOLDER_METADATA_DIR: &str = "METADATA";
/// Name of the per-folder local metadata file.
pub const FOLDER_META_FILENAME: &str = "__meta__";

/// Template for a consolidated level metadata file.
#[must_use]
pub fn level_parquet_name(level: usize) -> String {
    format!("level{level}.parquet")
}

/// Template for the scratch folder used while exporting to archive form.
#[must_use]
pub fn temp_folder_name(output_stem: &str) -> String {
    format!(".{output_stem}_temp")
}

/// Key of the position-invariant tree schema in the collection manifest.
pub const PIT_SCHEMA_KEY: &str = "taco:pit_schema";
/// Key of the field-description schema in the collection manifest.
pub const FIELD_SCHEMA_KEY: &str = "taco:field_schema";
/// Key recording the id of the dataset this one was subset from.
pub const SUBSET_OF_KEY: &str = "taco:subset_of";
/// Key recording the UTC timestamp a subset/export was produced.
pub const SUBSET_DATE_KEY: &str = "taco:subset_date";

/// Prefix of a byte-range location string pointing inside an archive member.
pub const VSI_SUBFILE_PREFIX: &str = "/vsisubfile/";

/// File extensions recognized as archive (ZIP) form.
pub const ARCHIVE_EXTENSIONS: [&str; 2] = [".zip", ".tacozip"];
