//! Construction of the denormalised dataset views from their source tables.

use std::collections::{BTreeMap, HashSet};

use chrono::{Datelike, NaiveDate, NaiveTime, Timelike};

use super::{DatasetError, Result};
use crate::store::column::days_from_date;
use crate::store::{Column, JoinHow, TableView, Value, Zone};

pub const FILE_COLUMNS: &[&str] = &["file_id", "site_id", "file_path", "timestamp", "duration"];
pub const LOCATION_COLUMNS: &[&str] = &["site_id", "site_name"];
pub const WEATHER_COLUMNS: &[&str] = &["site_id", "timestamp"];
pub const SOLAR_COLUMNS: &[&str] = &["site_id", "date"];
pub const DETECTION_COLUMNS: &[&str] = &["file_id", "start_time", "end_time", "species", "confidence"];
pub const SPECIES_COLUMNS: &[&str] = &["scientific_name"];
pub const FEATURE_COLUMNS: &[&str] = &["file_id"];

pub const SOLAR_EVENTS: [&str; 5] = ["dawn", "sunrise", "noon", "sunset", "dusk"];

/// Files view columns carried onto each detection for filtering and grouping.
const DETECTION_CONTEXT: &[&str] = &[
    "site_id",
    "site",
    "site_name",
    "date",
    "timestamp",
    "hour_continuous",
    "hour_categorical",
    "week_continuous",
    "week_categorical",
    "weekday",
    "month",
    "year",
    "time",
    "dddn",
];

/// Non-descriptor columns that may appear in the features table.
const FEATURE_META: &[&str] = &[
    "file_id",
    "segment_id",
    "file_path",
    "x",
    "y",
    "offset",
    "start_time",
    "end_time",
    "duration",
];

const MICROS_PER_HOUR: i64 = 3_600_000_000;

/// Fail with a schema error naming the first missing column.
pub fn require(table_name: &str, table: &TableView, columns: &[&str]) -> Result<()> {
    match columns.iter().find(|c| !table.has_column(c)) {
        Some(missing) => Err(DatasetError::Schema {
            table: table_name.to_string(),
            column: (*missing).to_string(),
        }),
        None => Ok(()),
    }
}

/// Locations with `site` (`<dataset>/<site_name>`) and one `sitelevel_k`
/// column per path segment below the dataset.
pub fn locations_view(dataset: &str, raw: &TableView) -> Result<TableView> {
    require("locations_table", raw, LOCATION_COLUMNS)?;
    let names = raw.column("site_name")?;

    let segments: Vec<Option<Vec<String>>> = (0..raw.num_rows())
        .map(|i| {
            let name = names.get(i);
            (!name.is_null()).then(|| {
                name.to_string()
                    .split('/')
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
        })
        .collect();
    let sites = segments
        .iter()
        .map(|s| s.as_ref().map(|segs| format!("{dataset}/{}", segs.join("/"))))
        .collect();
    let depth = segments.iter().flatten().map(Vec::len).max().unwrap_or(0);

    let mut out = raw.with_column("site", Column::Utf8(sites))?;
    for k in 0..depth {
        let level = segments
            .iter()
            .map(|s| s.as_ref().and_then(|segs| segs.get(k).cloned()))
            .collect();
        out = out.with_column(&format!("sitelevel_{}", k + 1), Column::Utf8(level))?;
    }
    Ok(out)
}

/// Per-file calendar and solar columns, computed in the clip's local time.
#[derive(Default)]
struct Calendar {
    hour: Vec<Option<i64>>,
    week: Vec<Option<i64>>,
    weekday: Vec<Option<String>>,
    date: Vec<Option<i32>>,
    month: Vec<Option<String>>,
    year: Vec<Option<String>>,
    time: Vec<Option<f64>>,
    nearest_hour: Vec<Option<i64>>,
    hours_after: [Vec<Option<i64>>; 5],
    dddn: Vec<Option<String>>,
}

/// Solar rows keyed by (site, local date).
struct SolarIndex<'a> {
    rows: BTreeMap<(Value, i32), usize>,
    events: [Option<&'a Column>; 5],
}

impl<'a> SolarIndex<'a> {
    fn new(solar: &'a TableView) -> Result<Self> {
        require("solar_table", solar, SOLAR_COLUMNS)?;
        let sites = solar.column("site_id")?;
        let dates = solar.column("date")?;
        let mut rows = BTreeMap::new();
        for i in 0..solar.num_rows() {
            if let Some(day) = day_of(dates, i) {
                rows.insert((sites.get(i), day), i);
            }
        }
        let events = SOLAR_EVENTS.map(|e| solar.column(e).ok());
        Ok(Self { rows, events })
    }

    /// Signed hours from each event to the clip (positive after the event).
    fn hours_since(&self, site: &Value, day: i32, t: i64, local_hours: f64) -> [Option<f64>; 5] {
        let Some(&row) = self.rows.get(&(site.clone(), day)) else {
            return [None; 5];
        };
        self.events.map(|col| {
            let col = col?;
            match col {
                Column::Timestamp { values, .. } => {
                    values[row].map(|e| (t - e) as f64 / MICROS_PER_HOUR as f64)
                }
                Column::Utf8(_) => col
                    .str_at(row)
                    .and_then(clock_hours)
                    .map(|e| local_hours - e),
                _ => col.f64_at(row).map(|e| local_hours - e),
            }
        })
    }
}

/// Day number for a solar `date` cell in any of the supported encodings.
fn day_of(col: &Column, i: usize) -> Option<i32> {
    match col {
        Column::Date(v) => v[i],
        Column::Timestamp { values, tz } => {
            let zone = tz.as_deref().and_then(Zone::parse).unwrap_or(Zone::Utc);
            values[i]
                .and_then(|t| zone.local(t))
                .map(|dt| days_from_date(dt.date()))
        }
        Column::Utf8(_) => col
            .str_at(i)
            .and_then(|s| NaiveDate::parse_from_str(s.get(..10)?, "%Y-%m-%d").ok())
            .map(days_from_date),
        _ => None,
    }
}

/// Decimal hours for an `HH:MM[:SS]` clock string.
fn clock_hours(s: &str) -> Option<f64> {
    let t = NaiveTime::parse_from_str(s, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M"))
        .ok()?;
    Some(decimal_hours(t))
}

fn decimal_hours(t: NaiveTime) -> f64 {
    t.hour() as f64 + t.minute() as f64 / 60.0 + t.second() as f64 / 3600.0
}

fn solar_category(since: &[Option<f64>; 5]) -> Option<&'static str> {
    let [dawn, sunrise, _, sunset, dusk] = *since;
    let (dawn, sunrise, sunset, dusk) = (dawn?, sunrise?, sunset?, dusk?);
    Some(if dawn >= 0.0 && sunrise < 0.0 {
        "dawn"
    } else if sunrise >= 0.0 && sunset < 0.0 {
        "day"
    } else if sunset >= 0.0 && dusk < 0.0 {
        "dusk"
    } else {
        "night"
    })
}

/// The files table with derived time columns, left-joined with weather on
/// (`site_id`, `nearest_hour`) and with locations on `site_id`.
pub fn files_view(
    raw: &TableView,
    locations: &TableView,
    weather: Option<&TableView>,
    solar: Option<&TableView>,
) -> Result<TableView> {
    require("files_table", raw, FILE_COLUMNS)?;
    let Column::Timestamp { values, tz } = raw.column("timestamp")? else {
        return Err(DatasetError::Schema {
            table: "files_table".into(),
            column: "timestamp (expected a timestamp column)".into(),
        });
    };
    let sites = raw.column("site_id")?;

    let column_zone = tz.as_deref().and_then(Zone::parse);
    let site_zones: BTreeMap<Value, Zone> = match locations.column("timezone") {
        Ok(zones) => {
            let ids = locations.column("site_id")?;
            (0..locations.num_rows())
                .filter_map(|i| Some((ids.get(i), Zone::parse(zones.str_at(i)?)?)))
                .collect()
        }
        Err(_) => BTreeMap::new(),
    };
    let solar = solar.map(SolarIndex::new).transpose()?;

    let n = raw.num_rows();
    let mut cal = Calendar::default();
    for i in 0..n {
        let site = sites.get(i);
        let zone = column_zone
            .or_else(|| site_zones.get(&site).copied())
            .unwrap_or(Zone::Utc);
        let local = values[i].and_then(|t| Some((t, zone.local(t)?)));

        let Some((t, local)) = local else {
            cal.hour.push(None);
            cal.week.push(None);
            cal.weekday.push(None);
            cal.date.push(None);
            cal.month.push(None);
            cal.year.push(None);
            cal.time.push(None);
            cal.nearest_hour.push(None);
            for h in &mut cal.hours_after {
                h.push(None);
            }
            cal.dddn.push(None);
            continue;
        };

        let day = days_from_date(local.date());
        let hours = decimal_hours(local.time());
        cal.hour.push(Some(i64::from(local.hour())));
        cal.week.push(Some(i64::from(local.iso_week().week())));
        cal.weekday.push(Some(local.format("%a").to_string()));
        cal.date.push(Some(day));
        cal.month.push(Some(local.format("%b").to_string()));
        cal.year.push(Some(local.year().to_string()));
        cal.time.push(Some(hours));
        cal.nearest_hour
            .push(Some((t + MICROS_PER_HOUR / 2).div_euclid(MICROS_PER_HOUR) * MICROS_PER_HOUR));

        let since = solar
            .as_ref()
            .map_or([None; 5], |s| s.hours_since(&site, day, t, hours));
        for (h, s) in cal.hours_after.iter_mut().zip(since) {
            h.push(s.map(|x| x.round() as i64));
        }
        cal.dddn.push(solar_category(&since).map(str::to_string));
    }

    let mut out = raw
        .with_column("hour_continuous", Column::Int64(cal.hour.clone()))?
        .with_column(
            "hour_categorical",
            Column::Utf8(cal.hour.iter().map(|h| h.map(|h| h.to_string())).collect()),
        )?
        .with_column("week_continuous", Column::Int64(cal.week.clone()))?
        .with_column(
            "week_categorical",
            Column::Utf8(cal.week.iter().map(|w| w.map(|w| w.to_string())).collect()),
        )?
        .with_column("weekday", Column::Utf8(cal.weekday))?
        .with_column("date", Column::Date(cal.date))?
        .with_column("month", Column::Utf8(cal.month))?
        .with_column("year", Column::Utf8(cal.year))?
        .with_column("time", Column::Float64(cal.time))?
        .with_column(
            "nearest_hour",
            Column::Timestamp {
                values: cal.nearest_hour,
                tz: tz.clone(),
            },
        )?;

    if let Some(solar) = &solar {
        for (k, event) in SOLAR_EVENTS.iter().enumerate() {
            if solar.events[k].is_some() {
                out = out.with_column(
                    &format!("hours_after_{event}"),
                    Column::Int64(std::mem::take(&mut cal.hours_after[k])),
                )?;
            }
        }
        if cal.dddn.iter().any(Option::is_some) {
            out = out.with_column("dddn", Column::Utf8(cal.dddn))?;
        }
    }

    if let Some(weather) = weather {
        require("weather_table", weather, WEATHER_COLUMNS)?;
        let weather = weather.rename("timestamp", "nearest_hour")?;
        out = out.join(&weather, &["site_id", "nearest_hour"], JoinHow::Left)?;
    }
    Ok(out.join(locations, &["site_id"], JoinHow::Left)?)
}

/// Detections joined (inner) with the files view's site and time columns and
/// (left) with species attributes.
pub fn detections_view(
    raw: &TableView,
    files: &TableView,
    species: Option<&TableView>,
) -> Result<TableView> {
    require("birdnet_species_probs_table", raw, DETECTION_COLUMNS)?;
    let keep: Vec<&str> = files
        .column_names()
        .iter()
        .map(String::as_str)
        .filter(|c| {
            *c == "file_id"
                || (!raw.has_column(c)
                    && (DETECTION_CONTEXT.contains(c)
                        || c.starts_with("sitelevel_")
                        || c.starts_with("hours_after_")))
        })
        .collect();
    let mut out = raw.join(&files.select(&keep)?, &["file_id"], JoinHow::Inner)?;

    if let Some(species) = species {
        let attrs = species_attributes(species, &out)?;
        out = out.join(&attrs, &["species"], JoinHow::Left)?;
    }
    Ok(out)
}

/// One row per scientific name (first wins), keyed as `species`.
fn species_attributes(species: &TableView, detections: &TableView) -> Result<TableView> {
    require("species_table", species, SPECIES_COLUMNS)?;
    let names = species.column("scientific_name")?;
    let mut seen = HashSet::new();
    let first: Vec<usize> = (0..species.num_rows())
        .filter(|&i| names.str_at(i).is_some_and(|n| seen.insert(n.to_string())))
        .collect();
    let keep: Vec<&str> = species
        .column_names()
        .iter()
        .map(String::as_str)
        .filter(|c| *c == "scientific_name" || !detections.has_column(c))
        .collect();
    Ok(species
        .take(&first)
        .select(&keep)?
        .rename("scientific_name", "species")?)
}

/// Wide acoustic feature rows joined with the files view, plus the names of
/// the descriptor columns.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureView {
    pub table: TableView,
    pub descriptors: Vec<String>,
}

pub fn features_view(
    raw: &TableView,
    files: &TableView,
    strip_prefix: Option<&str>,
) -> Result<FeatureView> {
    require("recording_acoustic_features_table", raw, FEATURE_COLUMNS)?;

    let mut wide = if raw.has_column("feature") && raw.has_column("value") {
        let index: Vec<&str> = raw
            .column_names()
            .iter()
            .map(String::as_str)
            .filter(|c| *c != "feature" && *c != "value")
            .collect();
        raw.pivot_wider(&index, "feature", "value")?
    } else {
        raw.clone()
    };

    if let (Some(prefix), Ok(Column::Utf8(paths))) = (strip_prefix, wide.column("file_path")) {
        let stripped = paths
            .iter()
            .map(|p| {
                p.as_deref()
                    .map(|p| p.strip_prefix(prefix).unwrap_or(p).to_string())
            })
            .collect();
        wide = wide.with_column("file_path", Column::Utf8(stripped))?;
    }

    let descriptors: Vec<String> = wide
        .fields()
        .filter(|(name, col)| col.column_type().is_numeric() && !FEATURE_META.contains(name))
        .map(|(name, _)| name.to_string())
        .collect();

    let keep: Vec<&str> = files
        .column_names()
        .iter()
        .map(String::as_str)
        .filter(|c| *c == "file_id" || !wide.has_column(c))
        .collect();
    let table = wide.join(&files.select(&keep)?, &["file_id"], JoinHow::Inner)?;
    Ok(FeatureView { table, descriptors })
}
