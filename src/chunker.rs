//! Content-defined row-group boundaries for the consolidated level parquet files.
//!
//! Row groups are ordinary parquet row groups, but unlike the plain writer, their
//! boundaries are picked by a rolling hash over a canonical serialization of each row
//! rather than by a fixed row count. Two level files that share a long common prefix of
//! rows (e.g. the same dataset exported twice with a handful of rows appended) end up with
//! identical leading row groups, which lets a content-addressed store deduplicate them
//! without re-encoding. Grounded on the `rustic_cdc`-based chunker the teacher uses to
//! split file content into dedupable blobs; here the stream being cut is row boundaries of
//! a table instead of raw file bytes.

use rustic_cdc::SeparatorIter;

use crate::{
    constants::{COLUMN_ID, COLUMN_TYPE, METADATA_CURRENT_ID, METADATA_GDAL_VSI, METADATA_PARENT_ID},
    table::Table,
};

/// Columns folded into the canonical per-row byte string the rolling hash runs over.
const CDC_COLUMNS: [&str; 5] = [
    COLUMN_ID,
    COLUMN_TYPE,
    METADATA_CURRENT_ID,
    METADATA_PARENT_ID,
    METADATA_GDAL_VSI,
];

/// Serializes a single row's identifying columns into a delimited byte string, stable
/// across runs so that identical rows always hash identically.
fn row_bytes(table: &Table, row: usize) -> Vec<u8> {
    let mut out = Vec::new();
    for column in CDC_COLUMNS {
        if !table.has_column(column) {
            continue;
        }
        if let Some(value) = table.get_string(row, column) {
            out.extend_from_slice(value.as_bytes());
        } else if let Some(value) = table.get_i64(row, column) {
            out.extend_from_slice(&value.to_le_bytes());
        }
        out.push(0);
    }
    out.push(b'\n');
    out
}

/// Computes content-defined row-group sizes for `table`, summing to `table.num_rows()`.
///
/// Concatenates each row's canonical serialization, slides a rolling hash (64-byte
/// window) over the resulting byte stream, and cuts a new row group at the first row
/// boundary at or after each hash-defined separator. Rows are never split mid-row: a
/// separator falling inside a row's bytes is attributed to the end of that row.
#[must_use]
pub fn content_defined_row_groups(table: &Table) -> Vec<usize> {
    let num_rows = table.num_rows();
    if num_rows == 0 {
        return Vec::new();
    }

    let mut row_end_offsets = Vec::with_capacity(num_rows);
    let mut stream = Vec::new();
    for row in 0..num_rows {
        stream.extend(row_bytes(table, row));
        row_end_offsets.push(stream.len() as u64);
    }

    let separators = SeparatorIter::new(stream.into_iter());

    let mut row_groups = Vec::new();
    let mut last_row_cut = 0usize;
    let mut next_row = 0usize;
    for separator in separators {
        // advance to the first row whose bytes end at or after this separator
        while next_row < num_rows && row_end_offsets[next_row] < separator.index {
            next_row += 1;
        }
        if next_row >= num_rows {
            break;
        }
        let group_size = next_row + 1 - last_row_cut;
        if group_size > 0 {
            row_groups.push(group_size);
        }
        last_row_cut = next_row + 1;
        next_row += 1;
    }
    if last_row_cut < num_rows {
        row_groups.push(num_rows - last_row_cut);
    }
    row_groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::Cell;

    fn rows(n: usize) -> Table {
        let data: Vec<Vec<Cell>> = (0..n)
            .map(|i| {
                vec![
                    format!("row-{i}").into(),
                    "FILE".into(),
                    (i as i64).into(),
                    0i64.into(),
                    format!("/data/row-{i}.tif").into(),
                ]
            })
            .collect();
        Table::from_rows(
            &[COLUMN_ID, COLUMN_TYPE, METADATA_CURRENT_ID, METADATA_PARENT_ID, METADATA_GDAL_VSI],
            &data,
        )
    }

    #[test]
    fn row_groups_sum_to_row_count() {
        let table = rows(500);
        let groups = content_defined_row_groups(&table);
        assert_eq!(groups.iter().sum::<usize>(), 500);
        assert!(!groups.is_empty());
    }

    #[test]
    fn identical_prefix_yields_identical_leading_groups() {
        let a = rows(300);
        let b = rows(400); // shares rows 0..300 with `a`, then diverges
        let groups_a = content_defined_row_groups(&a);
        let groups_b = content_defined_row_groups(&b);

        let mut prefix_a = 0;
        let mut prefix_b = 0;
        let mut shared = 0;
        for (&ga, &gb) in groups_a.iter().zip(groups_b.iter()) {
            if ga != gb {
                break;
            }
            prefix_a += ga;
            prefix_b += ga;
            shared += 1;
        }
        assert!(shared > 0, "expected at least one identical leading row group");
        assert_eq!(prefix_a, prefix_b);
    }

    #[test]
    fn empty_table_has_no_row_groups() {
        let table = rows(0);
        assert!(content_defined_row_groups(&table).is_empty());
    }
}
