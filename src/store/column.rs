use std::cmp::Ordering;
use std::fmt;

use chrono::{DateTime, Datelike, NaiveDate, Utc};

use super::StorageError;
use super::zone::Zone;

/// Days between 0001-01-01 (CE day 1) and 1970-01-01.
const UNIX_EPOCH_CE_DAYS: i32 = 719_163;

/// Storage type of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Boolean,
    Int64,
    Float64,
    Utf8,
    Date,
    Timestamp,
}

impl ColumnType {
    pub fn is_numeric(self) -> bool {
        matches!(self, Self::Int64 | Self::Float64)
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Boolean => "boolean",
            Self::Int64 => "int64",
            Self::Float64 => "float64",
            Self::Utf8 => "utf8",
            Self::Date => "date",
            Self::Timestamp => "timestamp",
        };
        f.write_str(name)
    }
}

/// Column storage: one typed vector of nullable values.
#[derive(Debug, Clone, PartialEq)]
pub enum Column {
    Boolean(Vec<Option<bool>>),
    Int64(Vec<Option<i64>>),
    Float64(Vec<Option<f64>>),
    Utf8(Vec<Option<String>>),
    /// Days since 1970-01-01
    Date(Vec<Option<i32>>),
    /// Microseconds since epoch (UTC), tagged with the zone the clock was read in
    Timestamp {
        values: Vec<Option<i64>>,
        tz: Option<String>,
    },
}

impl Column {
    pub fn with_capacity(column_type: ColumnType, capacity: usize) -> Self {
        match column_type {
            ColumnType::Boolean => Self::Boolean(Vec::with_capacity(capacity)),
            ColumnType::Int64 => Self::Int64(Vec::with_capacity(capacity)),
            ColumnType::Float64 => Self::Float64(Vec::with_capacity(capacity)),
            ColumnType::Utf8 => Self::Utf8(Vec::with_capacity(capacity)),
            ColumnType::Date => Self::Date(Vec::with_capacity(capacity)),
            ColumnType::Timestamp => Self::Timestamp {
                values: Vec::with_capacity(capacity),
                tz: None,
            },
        }
    }

    /// A column of `len` nulls.
    pub fn nulls(column_type: ColumnType, len: usize) -> Self {
        match column_type {
            ColumnType::Boolean => Self::Boolean(vec![None; len]),
            ColumnType::Int64 => Self::Int64(vec![None; len]),
            ColumnType::Float64 => Self::Float64(vec![None; len]),
            ColumnType::Utf8 => Self::Utf8(vec![None; len]),
            ColumnType::Date => Self::Date(vec![None; len]),
            ColumnType::Timestamp => Self::Timestamp {
                values: vec![None; len],
                tz: None,
            },
        }
    }

    /// Build a column from scalar values. Values that don't fit the type become null.
    pub fn from_values(column_type: ColumnType, values: &[Value]) -> Self {
        let mut col = Self::with_capacity(column_type, values.len());
        for v in values {
            col.push(v);
        }
        col
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Boolean(v) => v.len(),
            Self::Int64(v) => v.len(),
            Self::Float64(v) => v.len(),
            Self::Utf8(v) => v.len(),
            Self::Date(v) => v.len(),
            Self::Timestamp { values, .. } => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn column_type(&self) -> ColumnType {
        match self {
            Self::Boolean(_) => ColumnType::Boolean,
            Self::Int64(_) => ColumnType::Int64,
            Self::Float64(_) => ColumnType::Float64,
            Self::Utf8(_) => ColumnType::Utf8,
            Self::Date(_) => ColumnType::Date,
            Self::Timestamp { .. } => ColumnType::Timestamp,
        }
    }

    /// Timezone of a timestamp column.
    pub fn timezone(&self) -> Option<&str> {
        match self {
            Self::Timestamp { tz, .. } => tz.as_deref(),
            _ => None,
        }
    }

    pub fn is_null(&self, idx: usize) -> bool {
        match self {
            Self::Boolean(v) => v[idx].is_none(),
            Self::Int64(v) => v[idx].is_none(),
            Self::Float64(v) => v[idx].is_none(),
            Self::Utf8(v) => v[idx].is_none(),
            Self::Date(v) => v[idx].is_none(),
            Self::Timestamp { values, .. } => values[idx].is_none(),
        }
    }

    /// Scalar at `idx`.
    pub fn get(&self, idx: usize) -> Value {
        match self {
            Self::Boolean(v) => v[idx].map_or(Value::Null, Value::Boolean),
            Self::Int64(v) => v[idx].map_or(Value::Null, Value::Int),
            Self::Float64(v) => v[idx].map_or(Value::Null, Value::Float),
            Self::Utf8(v) => v[idx].clone().map_or(Value::Null, Value::Str),
            Self::Date(v) => v[idx].map_or(Value::Null, Value::Date),
            Self::Timestamp { values, .. } => values[idx].map_or(Value::Null, Value::Timestamp),
        }
    }

    /// Numeric view of the value at `idx` (int or float columns only).
    pub fn f64_at(&self, idx: usize) -> Option<f64> {
        match self {
            Self::Int64(v) => v[idx].map(|x| x as f64),
            Self::Float64(v) => v[idx],
            _ => None,
        }
    }

    pub fn str_at(&self, idx: usize) -> Option<&str> {
        match self {
            Self::Utf8(v) => v[idx].as_deref(),
            _ => None,
        }
    }

    pub fn i64_at(&self, idx: usize) -> Option<i64> {
        match self {
            Self::Int64(v) => v[idx],
            Self::Timestamp { values, .. } => values[idx],
            Self::Date(v) => v[idx].map(i64::from),
            _ => None,
        }
    }

    /// Compare the value at `idx` against a scalar of the same kind without allocating.
    /// Returns `None` when the cell is null or the kinds are incomparable.
    pub fn cmp_at(&self, idx: usize, value: &Value) -> Option<Ordering> {
        match (self, value) {
            (Self::Boolean(v), Value::Boolean(b)) => v[idx].map(|x| x.cmp(b)),
            (Self::Int64(v), Value::Int(b)) => v[idx].map(|x| x.cmp(b)),
            (Self::Int64(v), Value::Float(b)) => v[idx].map(|x| (x as f64).total_cmp(b)),
            (Self::Float64(v), Value::Float(b)) => v[idx].map(|x| x.total_cmp(b)),
            (Self::Float64(v), Value::Int(b)) => v[idx].map(|x| x.total_cmp(&(*b as f64))),
            (Self::Utf8(v), Value::Str(b)) => v[idx].as_deref().map(|x| x.cmp(b.as_str())),
            (Self::Date(v), Value::Date(b)) => v[idx].map(|x| x.cmp(b)),
            (Self::Timestamp { values, .. }, Value::Timestamp(b)) => values[idx].map(|x| x.cmp(b)),
            _ => None,
        }
    }

    /// Append a scalar. Mismatched kinds are stored as null, ints widen into float columns.
    pub fn push(&mut self, value: &Value) {
        match self {
            Self::Boolean(v) => v.push(match value {
                Value::Boolean(b) => Some(*b),
                _ => None,
            }),
            Self::Int64(v) => v.push(match value {
                Value::Int(x) => Some(*x),
                _ => None,
            }),
            Self::Float64(v) => v.push(value.as_f64()),
            Self::Utf8(v) => v.push(match value {
                Value::Null => None,
                Value::Str(s) => Some(s.clone()),
                other => Some(other.to_string()),
            }),
            Self::Date(v) => v.push(match value {
                Value::Date(d) => Some(*d),
                _ => None,
            }),
            Self::Timestamp { values, .. } => values.push(match value {
                Value::Timestamp(t) => Some(*t),
                _ => None,
            }),
        }
    }

    /// Gather rows by index.
    pub fn take(&self, indices: &[usize]) -> Self {
        match self {
            Self::Boolean(v) => Self::Boolean(indices.iter().map(|&i| v[i]).collect()),
            Self::Int64(v) => Self::Int64(indices.iter().map(|&i| v[i]).collect()),
            Self::Float64(v) => Self::Float64(indices.iter().map(|&i| v[i]).collect()),
            Self::Utf8(v) => Self::Utf8(indices.iter().map(|&i| v[i].clone()).collect()),
            Self::Date(v) => Self::Date(indices.iter().map(|&i| v[i]).collect()),
            Self::Timestamp { values, tz } => Self::Timestamp {
                values: indices.iter().map(|&i| values[i]).collect(),
                tz: tz.clone(),
            },
        }
    }

    /// Gather rows by optional index; `None` produces a null row (outer joins).
    pub fn take_opt(&self, indices: &[Option<usize>]) -> Self {
        match self {
            Self::Boolean(v) => Self::Boolean(indices.iter().map(|i| i.and_then(|i| v[i])).collect()),
            Self::Int64(v) => Self::Int64(indices.iter().map(|i| i.and_then(|i| v[i])).collect()),
            Self::Float64(v) => Self::Float64(indices.iter().map(|i| i.and_then(|i| v[i])).collect()),
            Self::Utf8(v) => {
                Self::Utf8(indices.iter().map(|i| i.and_then(|i| v[i].clone())).collect())
            }
            Self::Date(v) => Self::Date(indices.iter().map(|i| i.and_then(|i| v[i])).collect()),
            Self::Timestamp { values, tz } => Self::Timestamp {
                values: indices.iter().map(|i| i.and_then(|i| values[i])).collect(),
                tz: tz.clone(),
            },
        }
    }

    /// Append all rows of `other`, which must have the same type.
    pub fn append(&mut self, other: Column) -> Result<(), StorageError> {
        match (self, other) {
            (Self::Boolean(a), Self::Boolean(b)) => a.extend(b),
            (Self::Int64(a), Self::Int64(b)) => a.extend(b),
            (Self::Float64(a), Self::Float64(b)) => a.extend(b),
            (Self::Utf8(a), Self::Utf8(b)) => a.extend(b),
            (Self::Date(a), Self::Date(b)) => a.extend(b),
            (Self::Timestamp { values: a, tz }, Self::Timestamp { values: b, tz: other_tz }) => {
                if tz.is_none() {
                    *tz = other_tz;
                }
                a.extend(b);
            }
            (a, b) => {
                return Err(StorageError::Schema(format!(
                    "cannot append {} column to {} column",
                    b.column_type(),
                    a.column_type()
                )));
            }
        }
        Ok(())
    }

    /// Render a cell as JSON for list-of-records transport.
    pub fn json_at(&self, idx: usize) -> serde_json::Value {
        match self {
            Self::Boolean(v) => v[idx].map_or(serde_json::Value::Null, serde_json::Value::from),
            Self::Int64(v) => v[idx].map_or(serde_json::Value::Null, serde_json::Value::from),
            Self::Float64(v) => v[idx].map_or(serde_json::Value::Null, serde_json::Value::from),
            Self::Utf8(v) => v[idx]
                .as_deref()
                .map_or(serde_json::Value::Null, serde_json::Value::from),
            Self::Date(v) => v[idx]
                .and_then(date_from_days)
                .map_or(serde_json::Value::Null, |d| {
                    serde_json::Value::from(d.format("%Y-%m-%d").to_string())
                }),
            Self::Timestamp { values, tz } => {
                let zone = tz.as_deref().and_then(Zone::parse).unwrap_or(Zone::Utc);
                values[idx]
                    .and_then(|t| zone.to_rfc3339(t))
                    .map_or(serde_json::Value::Null, serde_json::Value::from)
            }
        }
    }
}

/// A single cell value with a total order.
///
/// Ints and floats compare numerically with each other; otherwise values of
/// different kinds order by kind, with null first.
#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Boolean(bool),
    Int(i64),
    Float(f64),
    Str(String),
    /// Days since 1970-01-01
    Date(i32),
    /// Microseconds since epoch
    Timestamp(i64),
}

impl Value {
    fn rank(&self) -> u8 {
        match self {
            Self::Null => 0,
            Self::Boolean(_) => 1,
            Self::Int(_) | Self::Float(_) => 2,
            Self::Str(_) => 3,
            Self::Date(_) => 4,
            Self::Timestamp(_) => 5,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(x) => Some(*x as f64),
            Self::Float(x) => Some(*x),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Null => serde_json::Value::Null,
            Self::Boolean(b) => serde_json::Value::from(*b),
            Self::Int(x) => serde_json::Value::from(*x),
            Self::Float(x) => serde_json::Value::from(*x),
            Self::Str(s) => serde_json::Value::from(s.as_str()),
            Self::Date(_) | Self::Timestamp(_) => serde_json::Value::from(self.to_string()),
        }
    }

    /// Best-effort conversion from a JSON payload value.
    pub fn from_json(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Boolean(*b),
            serde_json::Value::Number(n) => n
                .as_i64()
                .map(Self::Int)
                .or_else(|| n.as_f64().map(Self::Float))
                .unwrap_or(Self::Null),
            serde_json::Value::String(s) => Self::Str(s.clone()),
            other => Self::Str(other.to_string()),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Value {}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Null, Self::Null) => Ordering::Equal,
            (Self::Boolean(a), Self::Boolean(b)) => a.cmp(b),
            (Self::Int(a), Self::Int(b)) => a.cmp(b),
            (Self::Float(a), Self::Float(b)) => a.total_cmp(b),
            (Self::Int(a), Self::Float(b)) => (*a as f64).total_cmp(b),
            (Self::Float(a), Self::Int(b)) => a.total_cmp(&(*b as f64)),
            (Self::Str(a), Self::Str(b)) => a.cmp(b),
            (Self::Date(a), Self::Date(b)) => a.cmp(b),
            (Self::Timestamp(a), Self::Timestamp(b)) => a.cmp(b),
            (a, b) => a.rank().cmp(&b.rank()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("null"),
            Self::Boolean(b) => write!(f, "{b}"),
            Self::Int(x) => write!(f, "{x}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::Str(s) => f.write_str(s),
            Self::Date(d) => match date_from_days(*d) {
                Some(date) => write!(f, "{}", date.format("%Y-%m-%d")),
                None => write!(f, "{d}"),
            },
            Self::Timestamp(t) => match DateTime::<Utc>::from_timestamp_micros(*t) {
                Some(dt) => write!(f, "{}", dt.to_rfc3339()),
                None => write!(f, "{t}"),
            },
        }
    }
}

/// Calendar date for a day count since the Unix epoch.
pub fn date_from_days(days: i32) -> Option<NaiveDate> {
    NaiveDate::from_num_days_from_ce_opt(days.checked_add(UNIX_EPOCH_CE_DAYS)?)
}

/// Day count since the Unix epoch for a calendar date.
pub fn days_from_date(date: NaiveDate) -> i32 {
    date.num_days_from_ce() - UNIX_EPOCH_CE_DAYS
}
