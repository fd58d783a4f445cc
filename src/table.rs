//! A thin columnar table wrapper around [`arrow`]'s [`RecordBatch`], with the handful of
//! operations the metadata engine needs: dropping/replacing columns, filtering rows, taking
//! a row selection, and persisting to/from parquet.
//!
//! This stands in for the "underlying columnar table format" the real reader/writer
//! collaborators would otherwise own; we only need read-mostly, row-oriented access.

use std::{fs::File, path::Path, sync::Arc};

use arrow::{
    array::{Array, ArrayRef, Int64Array, RecordBatch, StringArray},
    compute::{concat_batches, filter_record_batch, take_record_batch},
    datatypes::{DataType, Field, Schema, SchemaRef},
};
use parquet::arrow::{arrow_reader::ParquetRecordBatchReaderBuilder, arrow_writer::ArrowWriter};

use crate::error::{finalize_error, plan_error, BridgeResult};

/// A single level's (or folder's) rows, typed columns, column order preserved.
#[derive(Debug, Clone, PartialEq)]
pub struct Table(RecordBatch);

impl Table {
    /// Wraps a [`RecordBatch`] as a [`Table`].
    #[must_use]
    pub fn new(batch: RecordBatch) -> Self {
        Self(batch)
    }

    /// The underlying record batch.
    #[must_use]
    pub fn batch(&self) -> &RecordBatch {
        &self.0
    }

    #[must_use]
    pub fn schema(&self) -> SchemaRef {
        self.0.schema()
    }

    #[must_use]
    pub fn num_rows(&self) -> usize {
        self.0.num_rows()
    }

    #[must_use]
    pub fn has_column(&self, name: &str) -> bool {
        self.0.schema().field_with_name(name).is_ok()
    }

    fn column_index(&self, name: &str) -> Option<usize> {
        self.0.schema().index_of(name).ok()
    }

    /// Returns the string value of `column` at `row`, if the column exists and is non-null.
    #[must_use]
    pub fn get_string(&self, row: usize, column: &str) -> Option<String> {
        let idx = self.column_index(column)?;
        let array = self.0.column(idx).as_any().downcast_ref::<StringArray>()?;
        if array.is_null(row) {
            None
        } else {
            Some(array.value(row).to_owned())
        }
    }

    /// Returns the i64 value of `column` at `row`, if the column exists and is non-null.
    #[must_use]
    pub fn get_i64(&self, row: usize, column: &str) -> Option<i64> {
        let idx = self.column_index(column)?;
        let array = self.0.column(idx).as_any().downcast_ref::<Int64Array>()?;
        if array.is_null(row) {
            None
        } else {
            Some(array.value(row))
        }
    }

    /// Returns a new table with the named columns removed. Columns that don't exist are
    /// silently ignored.
    #[must_use]
    pub fn drop_columns(&self, columns: &[&str]) -> Self {
        let schema = self.0.schema();
        let keep: Vec<usize> = (0..schema.fields().len())
            .filter(|&i| !columns.contains(&schema.field(i).name().as_str()))
            .collect();
        self.project(&keep)
    }

    fn project(&self, indices: &[usize]) -> Self {
        let schema = self.0.schema();
        let fields: Vec<Field> = indices.iter().map(|&i| schema.field(i).clone()).collect();
        let columns: Vec<ArrayRef> = indices.iter().map(|&i| self.0.column(i).clone()).collect();
        let new_schema = Arc::new(Schema::new(fields));
        Self(RecordBatch::try_new(new_schema, columns).expect("projection preserves row count"))
    }

    /// Returns a new table with `column` replaced (or appended, if absent) by `values`,
    /// encoded as an `Int64` array. `values.len()` must equal `num_rows()`.
    #[must_use]
    pub fn with_i64_column(&self, column: &str, values: &[i64]) -> Self {
        assert_eq!(values.len(), self.num_rows(), "column length must match row count");
        let array: ArrayRef = Arc::new(Int64Array::from(values.to_vec()));
        let schema = self.0.schema();
        match schema.index_of(column) {
            Ok(idx) => {
                let mut columns: Vec<ArrayRef> = self.0.columns().to_vec();
                columns[idx] = array;
                Self(RecordBatch::try_new(schema, columns).expect("same schema, same row count"))
            }
            Err(_) => {
                let mut fields: Vec<Field> = schema.fields().iter().map(|f| (**f).clone()).collect();
                fields.push(Field::new(column, DataType::Int64, false));
                let mut columns: Vec<ArrayRef> = self.0.columns().to_vec();
                columns.push(array);
                let new_schema = Arc::new(Schema::new(fields));
                Self(RecordBatch::try_new(new_schema, columns).expect("appended column matches row count"))
            }
        }
    }

    /// Returns a new table with `column` replaced (or appended, if absent) by `values`,
    /// encoded as a `Utf8` array. `values.len()` must equal `num_rows()`.
    #[must_use]
    pub fn with_string_column(&self, column: &str, values: &[String]) -> Self {
        assert_eq!(values.len(), self.num_rows(), "column length must match row count");
        let array: ArrayRef = Arc::new(StringArray::from(values.to_vec()));
        let schema = self.0.schema();
        match schema.index_of(column) {
            Ok(idx) => {
                let mut columns: Vec<ArrayRef> = self.0.columns().to_vec();
                columns[idx] = array;
                Self(RecordBatch::try_new(schema, columns).expect("same schema, same row count"))
            }
            Err(_) => {
                let mut fields: Vec<Field> = schema.fields().iter().map(|f| (**f).clone()).collect();
                fields.push(Field::new(column, DataType::Utf8, false));
                let mut columns: Vec<ArrayRef> = self.0.columns().to_vec();
                columns.push(array);
                let new_schema = Arc::new(Schema::new(fields));
                Self(RecordBatch::try_new(new_schema, columns).expect("appended column matches row count"))
            }
        }
    }

    /// Concatenates `tables` row-wise, harmonizing schemas: a column present in some tables
    /// but not others is added as a null `Utf8` column to the tables missing it. Used when
    /// concatenating views that don't share an identical column set (e.g. provenance columns
    /// added to only one side).
    #[must_use]
    pub fn vstack(tables: &[Self]) -> Self {
        assert!(!tables.is_empty(), "vstack requires at least one table");
        if tables.len() == 1 {
            return tables[0].clone();
        }

        let mut column_order: Vec<String> = Vec::new();
        for table in tables {
            for field in table.0.schema().fields() {
                if !column_order.iter().any(|c| c == field.name()) {
                    column_order.push(field.name().clone());
                }
            }
        }

        let harmonized: Vec<RecordBatch> = tables
            .iter()
            .map(|table| {
                let schema = table.0.schema();
                let mut fields = Vec::with_capacity(column_order.len());
                let mut columns: Vec<ArrayRef> = Vec::with_capacity(column_order.len());
                for name in &column_order {
                    match schema.index_of(name) {
                        Ok(idx) => {
                            fields.push(schema.field(idx).clone());
                            columns.push(table.0.column(idx).clone());
                        }
                        Err(_) => {
                            fields.push(Field::new(name, DataType::Utf8, true));
                            columns.push(Arc::new(StringArray::from(vec![None::<String>; table.num_rows()])));
                        }
                    }
                }
                RecordBatch::try_new(Arc::new(Schema::new(fields)), columns).expect("harmonized schema matches row count")
            })
            .collect();

        let schema = harmonized[0].schema();
        Self(concat_batches(&schema, &harmonized).expect("harmonized batches share a schema"))
    }

    /// Returns a new table containing only the rows at `indices`, in order.
    #[must_use]
    pub fn take_rows(&self, indices: &[i64]) -> Self {
        let idx_array = Int64Array::from(indices.to_vec());
        let taken = take_record_batch(&self.0, &idx_array).expect("indices within bounds");
        Self(taken)
    }

    /// Returns a new table containing only rows where `keep[row]` is true.
    #[must_use]
    pub fn filter_rows(&self, keep: &[bool]) -> Self {
        assert_eq!(keep.len(), self.num_rows(), "mask length must match row count");
        let mask = arrow::array::BooleanArray::from(keep.to_vec());
        let filtered = filter_record_batch(&self.0, &mask).expect("mask length matches batch");
        Self(filtered)
    }

    /// Returns an empty table (zero rows) with the same schema.
    #[must_use]
    pub fn empty_like(&self) -> Self {
        self.take_rows(&[])
    }

    /// Iterates row indices where `column` equals `value` (string comparison).
    pub fn rows_where_string_eq<'a>(&'a self, column: &'a str, value: &'a str) -> impl Iterator<Item = usize> + 'a {
        (0..self.num_rows()).filter(move |&row| self.get_string(row, column).as_deref() == Some(value))
    }

    /// Writes the table as a single-row-group parquet file.
    pub fn write_parquet(&self, path: &Path) -> BridgeResult<()> {
        let file = File::create(path)
            .map_err(|e| finalize_error(format!("creating parquet file {}", path.display())).attach_context("cause", e.to_string()))?;
        let mut writer = ArrowWriter::try_new(file, self.0.schema(), None)
            .map_err(|e| finalize_error(format!("opening parquet writer for {}", path.display())).attach_context("cause", e.to_string()))?;
        writer
            .write(&self.0)
            .map_err(|e| finalize_error(format!("writing parquet rows to {}", path.display())).attach_context("cause", e.to_string()))?;
        writer
            .close()
            .map_err(|e| finalize_error(format!("closing parquet writer for {}", path.display())).attach_context("cause", e.to_string()))?;
        Ok(())
    }

    /// Writes the table as a parquet file with one row group per chunk, per `row_groups`
    /// (a list of row counts summing to `num_rows()`). Used by the content-defined-chunking
    /// writer variant to align row-group boundaries with content boundaries.
    pub fn write_parquet_chunked(&self, path: &Path, row_groups: &[usize]) -> BridgeResult<()> {
        let file = File::create(path)
            .map_err(|e| finalize_error(format!("creating parquet file {}", path.display())).attach_context("cause", e.to_string()))?;
        let mut writer = ArrowWriter::try_new(file, self.0.schema(), None)
            .map_err(|e| finalize_error(format!("opening parquet writer for {}", path.display())).attach_context("cause", e.to_string()))?;
        let mut offset = 0usize;
        for &len in row_groups {
            let chunk = self.0.slice(offset, len);
            writer
                .write(&chunk)
                .map_err(|e| finalize_error(format!("writing parquet row group to {}", path.display())).attach_context("cause", e.to_string()))?;
            offset += len;
        }
        writer
            .close()
            .map_err(|e| finalize_error(format!("closing parquet writer for {}", path.display())).attach_context("cause", e.to_string()))?;
        Ok(())
    }

    /// Reads a table back from a parquet file, concatenating all row groups into one batch.
    pub fn read_parquet(path: &Path) -> BridgeResult<Self> {
        let file = File::open(path)
            .map_err(|e| plan_error(format!("opening parquet file {}", path.display())).attach_context("cause", e.to_string()))?;
        let builder = ParquetRecordBatchReaderBuilder::try_new(file)
            .map_err(|e| plan_error(format!("reading parquet metadata from {}", path.display())).attach_context("cause", e.to_string()))?;
        let schema = builder.schema().clone();
        let reader = builder
            .build()
            .map_err(|e| plan_error(format!("building parquet reader for {}", path.display())).attach_context("cause", e.to_string()))?;
        let mut batches = Vec::new();
        for batch in reader {
            let batch = batch.map_err(|e| {
                plan_error(format!("reading parquet batch from {}", path.display())).attach_context("cause", e.to_string())
            })?;
            batches.push(batch);
        }
        if batches.is_empty() {
            return Ok(Self(RecordBatch::new_empty(schema)));
        }
        let combined = concat_batches(&schema, &batches)
            .map_err(|e| plan_error(format!("concatenating parquet batches from {}", path.display())).attach_context("cause", e.to_string()))?;
        Ok(Self(combined))
    }

    /// Serializes the table to parquet bytes in memory, single row group. Used when the
    /// destination is a zip archive member rather than a standalone file.
    pub fn to_parquet_bytes(&self) -> BridgeResult<Vec<u8>> {
        let mut buffer = Vec::new();
        let mut writer = ArrowWriter::try_new(&mut buffer, self.0.schema(), None)
            .map_err(|e| finalize_error("opening in-memory parquet writer").attach_context("cause", e.to_string()))?;
        writer
            .write(&self.0)
            .map_err(|e| finalize_error("writing in-memory parquet rows").attach_context("cause", e.to_string()))?;
        writer
            .close()
            .map_err(|e| finalize_error("closing in-memory parquet writer").attach_context("cause", e.to_string()))?;
        Ok(buffer)
    }

    /// Reads a table from parquet bytes already in memory (e.g. a zip archive member read
    /// into a buffer), concatenating all row groups into one batch.
    pub fn read_parquet_bytes(bytes: bytes::Bytes) -> BridgeResult<Self> {
        let builder = ParquetRecordBatchReaderBuilder::try_new(bytes)
            .map_err(|e| plan_error("reading parquet metadata from archive member").attach_context("cause", e.to_string()))?;
        let schema = builder.schema().clone();
        let reader = builder
            .build()
            .map_err(|e| plan_error("building parquet reader for archive member").attach_context("cause", e.to_string()))?;
        let mut batches = Vec::new();
        for batch in reader {
            let batch = batch
                .map_err(|e| plan_error("reading parquet batch from archive member").attach_context("cause", e.to_string()))?;
            batches.push(batch);
        }
        if batches.is_empty() {
            return Ok(Self(RecordBatch::new_empty(schema)));
        }
        let combined = concat_batches(&schema, &batches)
            .map_err(|e| plan_error("concatenating parquet batches from archive member").attach_context("cause", e.to_string()))?;
        Ok(Self(combined))
    }
}

/// A single typed cell, used by [`Table::from_rows`] to build tables row-by-row without
/// hand-assembling arrow array builders at every call site.
#[derive(Debug, Clone)]
pub enum Cell {
    Str(String),
    Int(i64),
    Null,
}

impl From<&str> for Cell {
    fn from(value: &str) -> Self {
        Self::Str(value.to_owned())
    }
}

impl From<String> for Cell {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<i64> for Cell {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl<T: Into<Cell>> From<Option<T>> for Cell {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

impl Table {
    /// Builds a table from row-major data. `columns` fixes the schema and column order;
    /// each entry of `rows` must supply one [`Cell`] per column, in that order. The type of
    /// a column is inferred from the first non-null cell seen for it; a column that is
    /// entirely null is typed as `Utf8`.
    #[must_use]
    pub fn from_rows(columns: &[&str], rows: &[Vec<Cell>]) -> Self {
        let mut is_int = vec![None; columns.len()];
        for row in rows {
            for (i, cell) in row.iter().enumerate() {
                if is_int[i].is_none() {
                    is_int[i] = match cell {
                        Cell::Str(_) => Some(false),
                        Cell::Int(_) => Some(true),
                        Cell::Null => None,
                    };
                }
            }
        }

        let mut fields = Vec::with_capacity(columns.len());
        let mut arrays: Vec<ArrayRef> = Vec::with_capacity(columns.len());
        for (i, &name) in columns.iter().enumerate() {
            if is_int[i] == Some(true) {
                let values: Vec<Option<i64>> = rows
                    .iter()
                    .map(|row| match &row[i] {
                        Cell::Int(v) => Some(*v),
                        Cell::Null => None,
                        Cell::Str(_) => panic!("column {name} mixes string and integer cells"),
                    })
                    .collect();
                fields.push(Field::new(name, DataType::Int64, true));
                arrays.push(Arc::new(Int64Array::from(values)));
            } else {
                let values: Vec<Option<String>> = rows
                    .iter()
                    .map(|row| match &row[i] {
                        Cell::Str(v) => Some(v.clone()),
                        Cell::Null => None,
                        Cell::Int(_) => panic!("column {name} mixes string and integer cells"),
                    })
                    .collect();
                fields.push(Field::new(name, DataType::Utf8, true));
                arrays.push(Arc::new(StringArray::from(values)));
            }
        }

        let schema = Arc::new(Schema::new(fields));
        Self(RecordBatch::try_new(schema, arrays).expect("columns sized to row count"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Table {
        Table::from_rows(
            &["id", "type", "internal:current_id", "internal:parent_id"],
            &[
                vec!["a".into(), "FOLDER".into(), 0i64.into(), 0i64.into()],
                vec!["b".into(), "FILE".into(), 1i64.into(), 0i64.into()],
            ],
        )
    }

    #[test]
    fn drop_columns_removes_only_named_ones() {
        let t = sample().drop_columns(&["internal:parent_id", "nonexistent"]);
        assert!(!t.has_column("internal:parent_id"));
        assert!(t.has_column("internal:current_id"));
    }

    #[test]
    fn with_i64_column_replaces_values() {
        let t = sample().with_i64_column("internal:current_id", &[5, 6]);
        assert_eq!(t.get_i64(0, "internal:current_id"), Some(5));
        assert_eq!(t.get_i64(1, "internal:current_id"), Some(6));
    }

    #[test]
    fn filter_rows_keeps_selected() {
        let t = sample().filter_rows(&[false, true]);
        assert_eq!(t.num_rows(), 1);
        assert_eq!(t.get_string(0, "id").as_deref(), Some("b"));
    }

    #[test]
    fn parquet_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("level0.parquet");
        let t = sample();
        t.write_parquet(&path).unwrap();
        let read = Table::read_parquet(&path).unwrap();
        assert_eq!(read.num_rows(), t.num_rows());
        assert_eq!(read.get_string(1, "id"), t.get_string(1, "id"));
    }
}

