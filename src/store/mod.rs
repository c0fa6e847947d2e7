//! In-memory columnar tables backed by parquet files.

pub mod column;
pub mod ops;
pub mod parquet;
pub mod predicate;
pub mod table;
pub mod zone;

use std::io::Write;
use std::path::{Path, PathBuf};

use thiserror::Error;

pub use column::{Column, ColumnType, Value};
pub use ops::{Agg, AggSpec, JoinHow};
pub use self::parquet::{read_table, write_table};
pub use predicate::{CmpOp, Predicate};
pub use table::TableView;
pub use zone::Zone;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Table not found: {}", .0.display())]
    NotFound(PathBuf),
    #[error("Parquet error: {0}")]
    Parquet(#[from] ::parquet::errors::ParquetError),
    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow_schema::ArrowError),
    #[error("Schema mismatch: {0}")]
    Schema(String),
    #[error("Unknown column: {0}")]
    UnknownColumn(String),
    #[error("Unsupported type {data_type} for column `{column}`")]
    UnsupportedType { column: String, data_type: String },
    #[error("Invalid predicate: {0}")]
    Predicate(String),
}

/// Write `bytes` to `path` through a temp file in the same directory and a rename.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StorageError> {
    let parent = parent_dir(path);
    std::fs::create_dir_all(parent)?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| StorageError::Io(e.error))?;
    Ok(())
}

pub(crate) fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_atomic_replaces_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sidecar");
        write_atomic(&path, b"first").unwrap();
        write_atomic(&path, b"second").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "second");
        // no temp files left behind
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }
}
