//! Parquet ⇄ `TableView` conversion.
//!
//! Arrow types are normalised on read so the rest of the crate only deals with
//! the six `ColumnType`s: every integer width becomes int64, every float (and
//! decimal) float64, every string flavour utf8, dates date32 and timestamps
//! microseconds with the file's timezone kept as a tag.

use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use arrow_array::cast::AsArray;
use arrow_array::types::{Date32Type, Float64Type, Int64Type, TimestampMicrosecondType};
use arrow_array::{
    Array, ArrayRef, BooleanArray, Date32Array, Float64Array, Int64Array, RecordBatch,
    RecordBatchOptions, StringArray, TimestampMicrosecondArray, new_empty_array,
};
use arrow_cast::cast;
use arrow_schema::{DataType, Field, Schema, TimeUnit};
use parquet::arrow::ArrowWriter;
use parquet::arrow::ProjectionMask;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use walkdir::WalkDir;

use super::column::Column;
use super::table::TableView;
use super::{StorageError, parent_dir};

/// Read a parquet file, or a directory of `*.parquet` shards concatenated in
/// file-name order. `columns` restricts the projection.
pub fn read_table(path: &Path, columns: Option<&[&str]>) -> Result<TableView, StorageError> {
    if path.is_dir() {
        let shards: Vec<_> = WalkDir::new(path)
            .min_depth(1)
            .max_depth(1)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| {
                e.file_type().is_file()
                    && e.path().extension().and_then(|x| x.to_str()) == Some("parquet")
            })
            .collect();
        if shards.is_empty() {
            return Err(StorageError::NotFound(path.to_path_buf()));
        }
        log::debug!("Reading {} shards from {}", shards.len(), path.display());
        let tables = shards
            .iter()
            .map(|e| read_file(e.path(), columns))
            .collect::<Result<Vec<_>, _>>()?;
        return TableView::concat(&tables);
    }
    if !path.is_file() {
        return Err(StorageError::NotFound(path.to_path_buf()));
    }
    read_file(path, columns)
}

fn read_file(path: &Path, columns: Option<&[&str]>) -> Result<TableView, StorageError> {
    let file = File::open(path)?;
    let mut builder = ParquetRecordBatchReaderBuilder::try_new(file)?;
    let schema = builder.schema().clone();

    let selected: Vec<usize> = match columns {
        Some(names) => names
            .iter()
            .map(|n| {
                schema
                    .index_of(n)
                    .map_err(|_| StorageError::UnknownColumn((*n).to_string()))
            })
            .collect::<Result<_, _>>()?,
        None => (0..schema.fields().len()).collect(),
    };
    if columns.is_some() {
        let mask = ProjectionMask::roots(builder.parquet_schema(), selected.iter().copied());
        builder = builder.with_projection(mask);
    }

    // Projection keeps file order; remember it so the caller's order can be restored.
    let mut file_order = selected.clone();
    file_order.sort_unstable();

    let mut out: Vec<(String, Column)> = file_order
        .iter()
        .map(|&i| {
            let field = schema.field(i);
            let empty = new_empty_array(field.data_type());
            Ok((field.name().clone(), to_column(field.name(), &empty)?))
        })
        .collect::<Result<_, StorageError>>()?;

    for batch in builder.build()? {
        let batch = batch?;
        for ((name, dst), array) in out.iter_mut().zip(batch.columns()) {
            dst.append(to_column(name, array)?)?;
        }
    }

    let table = TableView::new(out)?;
    match columns {
        Some(names) => table.select(names),
        None => Ok(table),
    }
}

fn to_column(name: &str, array: &ArrayRef) -> Result<Column, StorageError> {
    let column = match array.data_type() {
        DataType::Boolean => Column::Boolean(array.as_boolean().iter().collect()),
        DataType::Int8
        | DataType::Int16
        | DataType::Int32
        | DataType::Int64
        | DataType::UInt8
        | DataType::UInt16
        | DataType::UInt32
        | DataType::UInt64 => {
            let a = cast(array, &DataType::Int64)?;
            Column::Int64(a.as_primitive::<Int64Type>().iter().collect())
        }
        DataType::Float16
        | DataType::Float32
        | DataType::Float64
        | DataType::Decimal128(..)
        | DataType::Decimal256(..) => {
            let a = cast(array, &DataType::Float64)?;
            Column::Float64(a.as_primitive::<Float64Type>().iter().collect())
        }
        DataType::Utf8 | DataType::LargeUtf8 | DataType::Utf8View | DataType::Dictionary(..) => {
            let a = cast(array, &DataType::Utf8)?;
            Column::Utf8(
                a.as_string::<i32>()
                    .iter()
                    .map(|s| s.map(str::to_string))
                    .collect(),
            )
        }
        DataType::Date32 | DataType::Date64 => {
            let a = cast(array, &DataType::Date32)?;
            Column::Date(a.as_primitive::<Date32Type>().iter().collect())
        }
        DataType::Timestamp(_, tz) => {
            let a = cast(array, &DataType::Timestamp(TimeUnit::Microsecond, tz.clone()))?;
            Column::Timestamp {
                values: a.as_primitive::<TimestampMicrosecondType>().iter().collect(),
                tz: tz.as_deref().map(str::to_string),
            }
        }
        other => {
            return Err(StorageError::UnsupportedType {
                column: name.to_string(),
                data_type: other.to_string(),
            });
        }
    };
    Ok(column)
}

pub(crate) fn to_arrow(column: &Column) -> (DataType, ArrayRef) {
    match column {
        Column::Boolean(v) => (DataType::Boolean, Arc::new(BooleanArray::from(v.clone()))),
        Column::Int64(v) => (DataType::Int64, Arc::new(Int64Array::from(v.clone()))),
        Column::Float64(v) => (DataType::Float64, Arc::new(Float64Array::from(v.clone()))),
        Column::Utf8(v) => (
            DataType::Utf8,
            Arc::new(StringArray::from(
                v.iter().map(|s| s.as_deref()).collect::<Vec<_>>(),
            )),
        ),
        Column::Date(v) => (DataType::Date32, Arc::new(Date32Array::from(v.clone()))),
        Column::Timestamp { values, tz } => {
            let array = TimestampMicrosecondArray::from(values.clone()).with_timezone_opt(tz.clone());
            (array.data_type().clone(), Arc::new(array))
        }
    }
}

/// Write a table as a single parquet file, atomically.
pub fn write_table(path: &Path, table: &TableView) -> Result<(), StorageError> {
    let mut fields = Vec::with_capacity(table.num_columns());
    let mut arrays = Vec::with_capacity(table.num_columns());
    for (name, column) in table.fields() {
        let (dtype, array) = to_arrow(column);
        fields.push(Field::new(name, dtype, true));
        arrays.push(array);
    }
    let schema = Arc::new(Schema::new(fields));
    let options = RecordBatchOptions::new().with_row_count(Some(table.num_rows()));
    let batch = RecordBatch::try_new_with_options(schema.clone(), arrays, &options)?;

    let parent = parent_dir(path);
    std::fs::create_dir_all(parent)?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    {
        let mut writer = ArrowWriter::try_new(tmp.as_file_mut(), schema, None)?;
        writer.write(&batch)?;
        writer.close()?;
    }
    tmp.persist(path).map_err(|e| StorageError::Io(e.error))?;
    log::debug!("Wrote {} rows to {}", table.num_rows(), path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> TableView {
        TableView::new(vec![
            ("file_id".into(), Column::Int64(vec![Some(1), Some(2), None])),
            ("ok".into(), Column::Boolean(vec![Some(true), None, Some(false)])),
            ("score".into(), Column::Float64(vec![Some(0.5), Some(f64::MAX), None])),
            (
                "site".into(),
                Column::Utf8(vec![Some("X/a".into()), None, Some("X/b".into())]),
            ),
            ("date".into(), Column::Date(vec![Some(19_358), None, Some(0)])),
            (
                "timestamp".into(),
                Column::Timestamp {
                    values: vec![Some(1_672_531_200_000_000), Some(0), None],
                    tz: Some("Australia/Brisbane".into()),
                },
            ),
        ])
        .unwrap()
    }

    #[test]
    fn test_write_then_read_preserves_columns() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.parquet");
        write_table(&path, &sample()).unwrap();
        let back = read_table(&path, None).unwrap();
        assert_eq!(back, sample());
        assert_eq!(back.column("timestamp").unwrap().timezone(), Some("Australia/Brisbane"));
    }

    #[test]
    fn test_projection_keeps_requested_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.parquet");
        write_table(&path, &sample()).unwrap();
        let t = read_table(&path, Some(&["site", "file_id"])).unwrap();
        assert_eq!(t.column_names(), &["site", "file_id"]);
        assert!(matches!(
            read_table(&path, Some(&["nope"])),
            Err(StorageError::UnknownColumn(_))
        ));
    }

    #[test]
    fn test_shard_directory() {
        let dir = tempfile::tempdir().unwrap();
        let shards = dir.path().join("features.parquet");
        let a = sample().take(&[0]);
        let b = sample().take(&[1, 2]);
        write_table(&shards.join("part-1.parquet"), &b).unwrap();
        write_table(&shards.join("part-0.parquet"), &a).unwrap();
        let t = read_table(&shards, None).unwrap();
        assert_eq!(t, sample());
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            read_table(&dir.path().join("nope.parquet"), None),
            Err(StorageError::NotFound(_))
        ));
    }

    #[test]
    fn test_empty_table_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.parquet");
        let empty = sample().take(&[]);
        write_table(&path, &empty).unwrap();
        let back = read_table(&path, None).unwrap();
        assert_eq!(back.num_rows(), 0);
        assert_eq!(back.column_names(), empty.column_names());
    }
}
