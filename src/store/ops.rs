//! Relational operations on `TableView`: grouping, joins, and pivots.

use std::collections::BTreeMap;

use super::StorageError;
use super::column::{Column, ColumnType, Value};
use super::table::TableView;

/// Aggregation functions available to `GroupBy::agg`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Agg {
    /// Non-null count
    Count,
    Sum,
    Mean,
    /// Sample standard deviation (n - 1)
    Std,
    NUnique,
    Max,
    Min,
}

/// One output column of an aggregation.
#[derive(Debug, Clone)]
pub struct AggSpec {
    pub column: String,
    pub agg: Agg,
    pub output: String,
}

impl AggSpec {
    pub fn new(column: &str, agg: Agg, output: &str) -> Self {
        Self {
            column: column.to_string(),
            agg,
            output: output.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinHow {
    Left,
    Inner,
    /// Left rows with at least one match, once each; right columns are not added.
    Semi,
}

/// Rows of a table partitioned by key columns, in ascending key order.
#[derive(Debug)]
pub struct GroupBy<'a> {
    table: &'a TableView,
    keys: Vec<String>,
    groups: BTreeMap<Vec<Value>, Vec<usize>>,
}

impl TableView {
    pub fn group_by<S: AsRef<str>>(&self, keys: &[S]) -> Result<GroupBy<'_>, StorageError> {
        let cols = keys
            .iter()
            .map(|k| self.column(k.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        let mut groups: BTreeMap<Vec<Value>, Vec<usize>> = BTreeMap::new();
        for i in 0..self.num_rows() {
            let key: Vec<Value> = cols.iter().map(|c| c.get(i)).collect();
            groups.entry(key).or_default().push(i);
        }
        Ok(GroupBy {
            table: self,
            keys: keys.iter().map(|k| k.as_ref().to_string()).collect(),
            groups,
        })
    }

    /// Join `right` onto this table by equal key values.
    ///
    /// Left row order is preserved; rows with a null key never match.
    /// Non-key right columns whose name clashes with a left column get a `_right` suffix.
    pub fn join<S: AsRef<str>>(
        &self,
        right: &TableView,
        on: &[S],
        how: JoinHow,
    ) -> Result<TableView, StorageError> {
        let on: Vec<&str> = on.iter().map(|k| k.as_ref()).collect();
        let mut left_keys = Vec::with_capacity(on.len());
        let mut right_keys = Vec::with_capacity(on.len());
        for k in &on {
            let l = self.column(k)?;
            let r = right.column(k)?;
            let (lt, rt) = (l.column_type(), r.column_type());
            if lt != rt && !(lt.is_numeric() && rt.is_numeric()) {
                return Err(StorageError::Schema(format!(
                    "join key `{k}` is {lt} on the left but {rt} on the right"
                )));
            }
            left_keys.push(l);
            right_keys.push(r);
        }

        let mut index: BTreeMap<Vec<Value>, Vec<usize>> = BTreeMap::new();
        for j in 0..right.num_rows() {
            let key: Vec<Value> = right_keys.iter().map(|c| c.get(j)).collect();
            if key.iter().any(Value::is_null) {
                continue;
            }
            index.entry(key).or_default().push(j);
        }

        let mut left_idx = Vec::with_capacity(self.num_rows());
        let mut right_idx: Vec<Option<usize>> = Vec::with_capacity(self.num_rows());
        for i in 0..self.num_rows() {
            let key: Vec<Value> = left_keys.iter().map(|c| c.get(i)).collect();
            match index.get(&key) {
                Some(_) if how == JoinHow::Semi => {
                    left_idx.push(i);
                    right_idx.push(None);
                }
                Some(matches) if !key.iter().any(Value::is_null) => {
                    for &j in matches {
                        left_idx.push(i);
                        right_idx.push(Some(j));
                    }
                }
                _ => {
                    if how == JoinHow::Left {
                        left_idx.push(i);
                        right_idx.push(None);
                    }
                }
            }
        }

        let mut fields: Vec<(String, Column)> = self
            .fields()
            .map(|(n, c)| (n.to_string(), c.take(&left_idx)))
            .collect();
        if how == JoinHow::Semi {
            return TableView::new(fields);
        }
        for (name, col) in right.fields() {
            if on.contains(&name) {
                continue;
            }
            let out_name = if self.has_column(name) {
                format!("{name}_right")
            } else {
                name.to_string()
            };
            fields.push((out_name, col.take_opt(&right_idx)));
        }
        TableView::new(fields)
    }

    /// Long → wide: one output row per distinct `index` key, one column per
    /// distinct value of `names_from` (sorted), filled from `values_from`.
    /// Duplicate (index, name) pairs keep the last value.
    pub fn pivot_wider<S: AsRef<str>>(
        &self,
        index: &[S],
        names_from: &str,
        values_from: &str,
    ) -> Result<TableView, StorageError> {
        let names_col = self.column(names_from)?;
        let values_col = self.column(values_from)?;
        let grouped = self.group_by(index)?;

        let mut names: Vec<String> = (0..self.num_rows())
            .map(|i| names_col.get(i))
            .filter(|v| !v.is_null())
            .map(|v| v.to_string())
            .collect();
        names.sort();
        names.dedup();

        let n_out = grouped.groups.len();
        let mut cells: BTreeMap<&str, Vec<Option<usize>>> =
            names.iter().map(|n| (n.as_str(), vec![None; n_out])).collect();
        let mut first_rows = Vec::with_capacity(n_out);

        for (row, rows) in grouped.groups.values().enumerate() {
            first_rows.push(rows[0]);
            for &i in rows {
                let name = names_col.get(i);
                if name.is_null() {
                    continue;
                }
                if let Some(slot) = cells.get_mut(name.to_string().as_str()) {
                    slot[row] = Some(i);
                }
            }
        }

        let mut fields: Vec<(String, Column)> = grouped
            .keys
            .iter()
            .map(|k| Ok((k.clone(), self.column(k)?.take(&first_rows))))
            .collect::<Result<_, StorageError>>()?;
        for name in &names {
            if grouped.keys.contains(name) {
                return Err(StorageError::Schema(format!(
                    "pivoted column `{name}` clashes with an index column"
                )));
            }
            fields.push((name.clone(), values_col.take_opt(&cells[name.as_str()])));
        }
        TableView::new(fields)
    }

    /// Wide → long: each row becomes one row per value column.
    pub fn pivot_longer<S: AsRef<str>>(
        &self,
        id_columns: &[S],
        value_columns: &[S],
        names_to: &str,
        values_to: &str,
    ) -> Result<TableView, StorageError> {
        let value_cols = value_columns
            .iter()
            .map(|n| self.column(n.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        let Some(first) = value_cols.first() else {
            return Err(StorageError::Schema("pivot_longer needs value columns".into()));
        };
        let mut value_type = first.column_type();
        for c in &value_cols {
            let t = c.column_type();
            if t != value_type {
                if t.is_numeric() && value_type.is_numeric() {
                    value_type = ColumnType::Float64;
                } else {
                    return Err(StorageError::Schema(format!(
                        "cannot stack {t} with {value_type} columns"
                    )));
                }
            }
        }

        let n = self.num_rows() * value_cols.len();
        let mut repeat = Vec::with_capacity(n);
        let mut names = Vec::with_capacity(n);
        let mut values = Column::with_capacity(value_type, n);
        for i in 0..self.num_rows() {
            for (name, col) in value_columns.iter().zip(&value_cols) {
                repeat.push(i);
                names.push(Some(name.as_ref().to_string()));
                values.push(&col.get(i));
            }
        }

        let mut fields = id_columns
            .iter()
            .map(|k| Ok((k.as_ref().to_string(), self.column(k.as_ref())?.take(&repeat))))
            .collect::<Result<Vec<_>, StorageError>>()?;
        fields.push((names_to.to_string(), Column::Utf8(names)));
        fields.push((values_to.to_string(), values));
        TableView::new(fields)
    }
}

impl GroupBy<'_> {
    pub fn num_groups(&self) -> usize {
        self.groups.len()
    }

    /// Key columns of the result, one row per group.
    fn key_fields(&self) -> Result<Vec<(String, Column)>, StorageError> {
        let first_rows: Vec<usize> = self.groups.values().map(|rows| rows[0]).collect();
        self.keys
            .iter()
            .map(|k| Ok((k.clone(), self.table.column(k)?.take(&first_rows))))
            .collect()
    }

    /// Row count per group.
    pub fn size(&self, output: &str) -> Result<TableView, StorageError> {
        let mut fields = self.key_fields()?;
        fields.push((
            output.to_string(),
            Column::Int64(self.groups.values().map(|r| Some(r.len() as i64)).collect()),
        ));
        TableView::new(fields)
    }

    pub fn agg(&self, specs: &[AggSpec]) -> Result<TableView, StorageError> {
        let mut fields = self.key_fields()?;
        for spec in specs {
            let col = self.table.column(&spec.column)?;
            let out = match spec.agg {
                Agg::Count => Column::Int64(
                    self.groups
                        .values()
                        .map(|rows| Some(rows.iter().filter(|&&i| !col.is_null(i)).count() as i64))
                        .collect(),
                ),
                Agg::NUnique => Column::Int64(
                    self.groups
                        .values()
                        .map(|rows| {
                            let mut vals: Vec<Value> = rows
                                .iter()
                                .map(|&i| col.get(i))
                                .filter(|v| !v.is_null())
                                .collect();
                            vals.sort();
                            vals.dedup();
                            Some(vals.len() as i64)
                        })
                        .collect(),
                ),
                Agg::Sum | Agg::Mean | Agg::Std => {
                    if !col.column_type().is_numeric() {
                        return Err(StorageError::Schema(format!(
                            "cannot aggregate {} column `{}` with {:?}",
                            col.column_type(),
                            spec.column,
                            spec.agg
                        )));
                    }
                    Column::Float64(
                        self.groups
                            .values()
                            .map(|rows| {
                                let xs: Vec<f64> = rows.iter().filter_map(|&i| col.f64_at(i)).collect();
                                numeric_agg(spec.agg, &xs)
                            })
                            .collect(),
                    )
                }
                Agg::Max | Agg::Min => {
                    let picks: Vec<Option<usize>> = self
                        .groups
                        .values()
                        .map(|rows| {
                            let candidates = rows.iter().copied().filter(|&i| !col.is_null(i));
                            if spec.agg == Agg::Max {
                                candidates.max_by(|&a, &b| col.get(a).cmp(&col.get(b)))
                            } else {
                                candidates.min_by(|&a, &b| col.get(a).cmp(&col.get(b)))
                            }
                        })
                        .collect();
                    col.take_opt(&picks)
                }
            };
            fields.push((spec.output.clone(), out));
        }
        TableView::new(fields)
    }
}

fn numeric_agg(agg: Agg, xs: &[f64]) -> Option<f64> {
    let n = xs.len() as f64;
    match agg {
        Agg::Sum => Some(xs.iter().sum()),
        Agg::Mean if xs.is_empty() => None,
        Agg::Mean => Some(xs.iter().sum::<f64>() / n),
        Agg::Std if xs.len() < 2 => None,
        Agg::Std => {
            let mean = xs.iter().sum::<f64>() / n;
            let var = xs.iter().map(|x| (x - mean) * (x - mean)).sum::<f64>() / (n - 1.0);
            Some(var.sqrt())
        }
        _ => None,
    }
}
