use std::collections::HashSet;
use std::sync::Arc;

use arrow_array::UInt64Array;
use arrow_ord::sort::{SortColumn, lexsort_to_indices};
use arrow_schema::SortOptions;

use super::StorageError;
use super::column::{Column, ColumnType, Value};
use super::predicate::Predicate;

/// An in-memory table: named, typed columns of equal length.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TableView {
    names: Vec<String>,
    columns: Vec<Column>,
    num_rows: usize,
}

impl TableView {
    pub fn new(fields: Vec<(String, Column)>) -> Result<Self, StorageError> {
        let num_rows = fields.first().map_or(0, |(_, c)| c.len());
        let mut seen = HashSet::new();
        let mut names = Vec::with_capacity(fields.len());
        let mut columns = Vec::with_capacity(fields.len());

        for (name, column) in fields {
            if column.len() != num_rows {
                return Err(StorageError::Schema(format!(
                    "column `{name}` has {} rows, expected {num_rows}",
                    column.len()
                )));
            }
            if !seen.insert(name.clone()) {
                return Err(StorageError::Schema(format!("duplicate column `{name}`")));
            }
            names.push(name);
            columns.push(column);
        }

        Ok(Self {
            names,
            columns,
            num_rows,
        })
    }

    pub fn num_rows(&self) -> usize {
        self.num_rows
    }

    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.num_rows == 0
    }

    pub fn column_names(&self) -> &[String] {
        &self.names
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.index_of(name).is_some()
    }

    fn index_of(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }

    pub fn column(&self, name: &str) -> Result<&Column, StorageError> {
        self.index_of(name)
            .map(|i| &self.columns[i])
            .ok_or_else(|| StorageError::UnknownColumn(name.to_string()))
    }

    pub fn column_type(&self, name: &str) -> Result<ColumnType, StorageError> {
        Ok(self.column(name)?.column_type())
    }

    /// Name/column pairs in order.
    pub fn fields(&self) -> impl Iterator<Item = (&str, &Column)> {
        self.names.iter().map(String::as_str).zip(self.columns.iter())
    }

    pub fn into_fields(self) -> Vec<(String, Column)> {
        self.names.into_iter().zip(self.columns).collect()
    }

    /// Values of one row, in column order.
    pub fn row(&self, idx: usize) -> Vec<Value> {
        self.columns.iter().map(|c| c.get(idx)).collect()
    }

    pub fn select<S: AsRef<str>>(&self, names: &[S]) -> Result<Self, StorageError> {
        let fields = names
            .iter()
            .map(|n| {
                let n = n.as_ref();
                self.column(n).map(|c| (n.to_string(), c.clone()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let mut table = Self::new(fields)?;
        if table.columns.is_empty() {
            table.num_rows = self.num_rows;
        }
        Ok(table)
    }

    /// Drop the named columns; names that don't exist are ignored.
    pub fn drop_columns<S: AsRef<str>>(&self, names: &[S]) -> Self {
        let mut out = self.clone();
        for n in names {
            if let Some(i) = out.index_of(n.as_ref()) {
                out.names.remove(i);
                out.columns.remove(i);
            }
        }
        out
    }

    pub fn rename(&self, from: &str, to: &str) -> Result<Self, StorageError> {
        let i = self
            .index_of(from)
            .ok_or_else(|| StorageError::UnknownColumn(from.to_string()))?;
        if from != to && self.has_column(to) {
            return Err(StorageError::Schema(format!("duplicate column `{to}`")));
        }
        let mut out = self.clone();
        out.names[i] = to.to_string();
        Ok(out)
    }

    /// Replace a column of the same name or append a new one.
    pub fn with_column(&self, name: &str, column: Column) -> Result<Self, StorageError> {
        if !self.columns.is_empty() && column.len() != self.num_rows {
            return Err(StorageError::Schema(format!(
                "column `{name}` has {} rows, expected {}",
                column.len(),
                self.num_rows
            )));
        }
        let mut out = self.clone();
        out.num_rows = column.len();
        match out.index_of(name) {
            Some(i) => out.columns[i] = column,
            None => {
                out.names.push(name.to_string());
                out.columns.push(column);
            }
        }
        Ok(out)
    }

    pub fn take(&self, indices: &[usize]) -> Self {
        Self {
            names: self.names.clone(),
            columns: self.columns.iter().map(|c| c.take(indices)).collect(),
            num_rows: indices.len(),
        }
    }

    pub fn filter_mask(&self, mask: &[bool]) -> Self {
        let indices: Vec<usize> = mask
            .iter()
            .enumerate()
            .filter_map(|(i, &keep)| keep.then_some(i))
            .collect();
        self.take(&indices)
    }

    /// Keep rows satisfying a predicate string. An empty string keeps everything.
    pub fn filter(&self, predicate: &str) -> Result<Self, StorageError> {
        if predicate.trim().is_empty() {
            return Ok(self.clone());
        }
        self.filter_by(&Predicate::parse(predicate)?)
    }

    pub fn filter_by(&self, predicate: &Predicate) -> Result<Self, StorageError> {
        let mask = predicate.evaluate(self)?;
        Ok(self.filter_mask(&mask))
    }

    /// Stable sort by the given columns, ascending, nulls first.
    pub fn sort_by<S: AsRef<str>>(&self, keys: &[S]) -> Result<Self, StorageError> {
        let options = Some(SortOptions {
            descending: false,
            nulls_first: true,
        });
        let mut sort_columns = keys
            .iter()
            .map(|k| {
                let (_, values) = super::parquet::to_arrow(self.column(k.as_ref())?);
                Ok(SortColumn { values, options })
            })
            .collect::<Result<Vec<_>, StorageError>>()?;
        // row number as the last key keeps ties in input order
        sort_columns.push(SortColumn {
            values: Arc::new(UInt64Array::from_iter_values(0..self.num_rows as u64)),
            options,
        });
        let indices = lexsort_to_indices(&sort_columns, None)?;
        let indices: Vec<usize> = indices.values().iter().map(|&i| i as usize).collect();
        Ok(self.take(&indices))
    }

    /// Distinct non-null values of a column, sorted.
    pub fn unique(&self, name: &str) -> Result<Vec<Value>, StorageError> {
        let col = self.column(name)?;
        let mut values: Vec<Value> = (0..self.num_rows)
            .map(|i| col.get(i))
            .filter(|v| !v.is_null())
            .collect();
        values.sort();
        values.dedup();
        Ok(values)
    }

    /// Minimum of a numeric column, ignoring nulls and NaN.
    pub fn min(&self, name: &str) -> Result<Option<f64>, StorageError> {
        let col = self.numeric(name)?;
        Ok((0..self.num_rows)
            .filter_map(|i| col.f64_at(i))
            .filter(|x| !x.is_nan())
            .reduce(f64::min))
    }

    /// Maximum of a numeric column, ignoring nulls and NaN.
    pub fn max(&self, name: &str) -> Result<Option<f64>, StorageError> {
        let col = self.numeric(name)?;
        Ok((0..self.num_rows)
            .filter_map(|i| col.f64_at(i))
            .filter(|x| !x.is_nan())
            .reduce(f64::max))
    }

    fn numeric(&self, name: &str) -> Result<&Column, StorageError> {
        let col = self.column(name)?;
        if !col.column_type().is_numeric() {
            return Err(StorageError::Schema(format!(
                "column `{name}` is {}, expected a numeric column",
                col.column_type()
            )));
        }
        Ok(col)
    }

    /// Stack tables with identical column names and types.
    pub fn concat(tables: &[TableView]) -> Result<Self, StorageError> {
        let Some(first) = tables.first() else {
            return Ok(Self::default());
        };
        let mut out = first.clone();
        for t in &tables[1..] {
            if t.names != out.names {
                return Err(StorageError::Schema(format!(
                    "cannot concatenate tables with columns {:?} and {:?}",
                    out.names, t.names
                )));
            }
            for (dst, src) in out.columns.iter_mut().zip(&t.columns) {
                dst.append(src.clone())?;
            }
            out.num_rows += t.num_rows;
        }
        Ok(out)
    }

    /// List-of-records rendering for transport.
    pub fn to_records(&self) -> Vec<serde_json::Map<String, serde_json::Value>> {
        (0..self.num_rows)
            .map(|i| {
                self.names
                    .iter()
                    .zip(&self.columns)
                    .map(|(n, c)| (n.clone(), c.json_at(i)))
                    .collect()
            })
            .collect()
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::Value::Array(
            self.to_records()
                .into_iter()
                .map(serde_json::Value::Object)
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> TableView {
        TableView::new(vec![
            ("id".into(), Column::Int64(vec![Some(3), Some(1), Some(2)])),
            (
                "name".into(),
                Column::Utf8(vec![Some("c".into()), Some("a".into()), None]),
            ),
        ])
        .unwrap()
    }

    #[test]
    fn test_rejects_ragged_columns() {
        let r = TableView::new(vec![
            ("a".into(), Column::Int64(vec![Some(1)])),
            ("b".into(), Column::Int64(vec![])),
        ]);
        assert!(r.is_err());
    }

    #[test]
    fn test_sort_and_unique() {
        let t = sample().sort_by(&["id"]).unwrap();
        assert_eq!(t.column("id").unwrap(), &Column::Int64(vec![Some(1), Some(2), Some(3)]));
        assert_eq!(
            sample().unique("name").unwrap(),
            vec![Value::Str("a".into()), Value::Str("c".into())]
        );
    }

    #[test]
    fn test_sort_is_stable_with_nulls_first() {
        let t = TableView::new(vec![
            ("k".into(), Column::Float64(vec![Some(2.0), None, Some(-1.0), Some(2.0), None])),
            ("tag".into(), Column::Utf8(vec![Some("a".into()), Some("b".into()), Some("c".into()), Some("d".into()), Some("e".into())])),
        ])
        .unwrap();
        let sorted = t.sort_by(&["k"]).unwrap();
        assert_eq!(
            sorted.column("tag").unwrap(),
            &Column::Utf8(vec![Some("b".into()), Some("e".into()), Some("c".into()), Some("a".into()), Some("d".into())])
        );
        assert_eq!(t.sort_by::<&str>(&[]).unwrap(), t);
    }

    #[test]
    fn test_filter_string() {
        let t = sample().filter("id >= 2").unwrap();
        assert_eq!(t.num_rows(), 2);
        assert_eq!(sample().filter("").unwrap(), sample());
    }

    #[test]
    fn test_min_max() {
        assert_eq!(sample().min("id").unwrap(), Some(1.0));
        assert_eq!(sample().max("id").unwrap(), Some(3.0));
        assert!(sample().max("name").is_err());
    }

    #[test]
    fn test_concat_checks_names() {
        let a = sample();
        let b = sample().rename("name", "other").unwrap();
        assert!(TableView::concat(&[a.clone(), b]).is_err());
        assert_eq!(TableView::concat(&[a.clone(), a]).unwrap().num_rows(), 6);
    }

    #[test]
    fn test_records() {
        let recs = sample().to_records();
        assert_eq!(recs[0]["id"], serde_json::json!(3));
        assert_eq!(recs[2]["name"], serde_json::Value::Null);
    }
}
