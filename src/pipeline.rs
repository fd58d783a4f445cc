//! End-to-end orchestration of the plan / execute / finalize pipeline (§1, §5) for the
//! three operations a caller actually invokes. The three phases stay independently usable
//! through [`crate::plan`], [`crate::dispatch`] and [`crate::finalize`] directly; this
//! module is the convenience a CLI collaborator would otherwise reassemble at every call
//! site, and it is the only place the export-to-archive transient folder (§5, §9) is
//! acquired and released.

use std::{
    fs,
    path::{Path, PathBuf},
};

use crate::{
    constants::temp_folder_name,
    dispatch::run_parallel,
    error::{finalize_error, BridgeResult},
    finalize::finalize,
    plan::{plan_export, plan_folder2zip, plan_zip2folder, Plan},
    view::DatasetView,
};

/// Owns a scratch directory for the duration of export-to-archive and removes it on every
/// exit path, success or failure, per the "scoped resources" design note (§9). A bare
/// `Drop` guard rather than a callback: the directory is acquired once, before any task
/// runs, and the only action on release is an unconditional best-effort removal.
struct TempFolderGuard {
    path: PathBuf,
}

impl TempFolderGuard {
    fn new(output: &Path) -> BridgeResult<Self> {
        let parent = output.parent().unwrap_or_else(|| Path::new("."));
        let stem = output.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default();
        let path = parent.join(temp_folder_name(&stem));
        if path.exists() {
            fs::remove_dir_all(&path)
                .map_err(|e| finalize_error(format!("clearing stale temp folder {}", path.display())).attach_context("cause", e.to_string()))?;
        }
        Ok(Self { path })
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TempFolderGuard {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.path);
    }
}

/// Exports `view` to folder form at `output`: plans, executes every transfer task on the
/// global rayon pool, then finalizes. A thin composition of [`plan_export`],
/// [`run_parallel`] and [`finalize`] for callers that don't need to inspect the plan or
/// control dispatch themselves.
pub fn export_to_folder(view: &dyn DatasetView, output: impl Into<PathBuf>) -> BridgeResult<PathBuf> {
    let plan = Plan::Export(plan_export(view, output)?);
    if let Plan::Export(p) = &plan {
        run_parallel(&p.tasks)?;
    }
    finalize(&plan)
}

/// Exports `view` to archive form at `output` (§5 "Transient state"): builds the folder
/// form in a scratch directory `<output-parent>/.<output-stem>_temp/` acquired before any
/// task runs, packages it into the archive, and removes the scratch directory on every
/// exit path via [`TempFolderGuard`] — including when planning, execution, or the second
/// (folder→archive) finalize step fails.
pub fn export_to_archive(view: &dyn DatasetView, output: impl Into<PathBuf>) -> BridgeResult<PathBuf> {
    let output = output.into();
    if output.exists() {
        return Err(crate::error::plan_error("already exists").attach_context("output", output.display().to_string()));
    }
    let guard = TempFolderGuard::new(&output)?;
    log::debug!("exporting via scratch folder {}", guard.path().display());

    let result = (|| {
        let folder_plan = Plan::Export(plan_export(view, guard.path())?);
        if let Plan::Export(p) = &folder_plan {
            run_parallel(&p.tasks)?;
        }
        finalize(&folder_plan)?;

        let archive_plan = Plan::Folder2Zip(plan_folder2zip(guard.path(), &output)?);
        finalize(&archive_plan)
    })();

    drop(guard);
    result
}

/// Converts the archive at `archive_path` to folder form at `output`: plans, executes, and
/// finalizes. Prefer [`crate::finalize::fast_zip2folder`] for a local archive when the
/// plan/execute split isn't otherwise needed — it produces a byte-identical result without
/// the per-file task round trip.
pub fn zip_to_folder(archive_path: &dyn DatasetView, output: impl Into<PathBuf>) -> BridgeResult<PathBuf> {
    let plan = Plan::Zip2Folder(plan_zip2folder(archive_path, output)?);
    if let Plan::Zip2Folder(p) = &plan {
        run_parallel(&p.tasks)?;
    }
    finalize(&plan)
}

/// Converts the folder dataset at `folder` to archive form at `output`. No executor phase:
/// `plan_folder2zip`'s tasks are references to files already in place.
pub fn folder_to_zip(folder: impl Into<PathBuf>, output: impl Into<PathBuf>) -> BridgeResult<PathBuf> {
    let plan = Plan::Folder2Zip(plan_folder2zip(folder, output)?);
    finalize(&plan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        archive_writer::ArchiveView,
        constants::{COLUMN_ID, COLUMN_TYPE, METADATA_CURRENT_ID, METADATA_GDAL_VSI, METADATA_PARENT_ID},
        table::Table,
        view::MemoryView,
    };
    use serde_json::json;
    use std::io::Write as _;

    fn sample_view(dir: &Path) -> MemoryView {
        let src = dir.join("a.tif");
        fs::File::create(&src).unwrap().write_all(b"payload bytes").unwrap();
        let level0 = Table::from_rows(
            &[COLUMN_ID, COLUMN_TYPE, METADATA_CURRENT_ID, METADATA_PARENT_ID, METADATA_GDAL_VSI],
            &[vec!["a.tif".into(), "FILE".into(), 0i64.into(), 0i64.into(), src.display().to_string().into()]],
        );
        MemoryView::new(vec![level0], json!({ "taco:pit_schema": { "root": { "n": 1 } } }), "source.archive")
    }

    #[test]
    fn export_to_archive_cleans_up_temp_folder_on_success() {
        let dir = tempfile::tempdir().unwrap();
        let view = sample_view(dir.path());
        let output = dir.path().join("out.zip");

        export_to_archive(&view, &output).unwrap();

        assert!(output.exists());
        assert!(!dir.path().join(".out_temp").exists());

        let archived = ArchiveView::open(&output).unwrap();
        assert_eq!(archived.level(0).num_rows(), 1);
    }

    #[test]
    fn export_to_archive_cleans_up_temp_folder_on_failure() {
        let dir = tempfile::tempdir().unwrap();
        let view = sample_view(dir.path());
        let output = dir.path().join("out.zip");
        fs::write(&output, b"already here").unwrap();

        let err = export_to_archive(&view, &output);

        assert!(err.is_err());
        assert!(!dir.path().join(".out_temp").exists());
    }

    #[test]
    fn export_to_folder_round_trips_row_count() {
        let dir = tempfile::tempdir().unwrap();
        let view = sample_view(dir.path());
        let output = dir.path().join("out");

        export_to_folder(&view, &output).unwrap();

        assert!(output.join("DATA/a.tif").exists());
        assert!(output.join("METADATA/level0.parquet").exists());
    }
}
