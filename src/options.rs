//! Per-dataset enumeration of the dimensions data can be filtered, coloured,
//! and faceted along.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::json;

use crate::dataset::{Dataset, DatasetConfig, DatasetError};
use crate::store::{ColumnType, StorageError, TableView, Value};

pub const GROUPS: &[&str] = &[
    "File Level",
    "Site Level",
    "Time of Day",
    "Time",
    "Temporal",
    "Spatial",
    "Temperature",
    "Precipitation",
    "Wind",
    "Species Habitat",
    "Functional Groups",
    "Acoustic Features",
];

const MONTHS: &[&str] = &[
    "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
];
const WEEKDAYS: &[&str] = &["Mon", "Tue", "Wed", "Thu", "Fri", "Sat", "Sun"];
const DDDN: &[&str] = &["dawn", "day", "dusk", "night"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OptionKind {
    Categorical,
    Continuous,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Source {
    Files,
    Species,
}

struct CatalogueEntry {
    column: &'static str,
    label: &'static str,
    group: &'static str,
    kind: OptionKind,
    source: Source,
}

const fn entry(
    column: &'static str,
    label: &'static str,
    group: &'static str,
    kind: OptionKind,
    source: Source,
) -> CatalogueEntry {
    CatalogueEntry {
        column,
        label,
        group,
        kind,
        source,
    }
}

use OptionKind::{Categorical as Cat, Continuous as Cont};
use Source::{Files, Species};

/// Fixed options. Site levels and acoustic features are added per dataset.
const CATALOGUE: &[CatalogueEntry] = &[
    entry("duration", "Duration", "File Level", Cont, Files),
    entry("sample_rate", "Sample Rate", "File Level", Cat, Files),
    entry("valid", "Valid", "File Level", Cat, Files),
    entry("dddn", "Dawn/Day/Dusk/Night", "Time of Day", Cat, Files),
    entry("hours_after_dawn", "Hours After Dawn", "Time", Cont, Files),
    entry("hours_after_sunrise", "Hours After Sunrise", "Time", Cont, Files),
    entry("hours_after_noon", "Hours After Noon", "Time", Cont, Files),
    entry("hours_after_sunset", "Hours After Sunset", "Time", Cont, Files),
    entry("hours_after_dusk", "Hours After Dusk", "Time", Cont, Files),
    entry("hour_continuous", "Hour", "Temporal", Cont, Files),
    entry("week_continuous", "Week of Year", "Temporal", Cont, Files),
    entry("time", "Time of Day (hours)", "Temporal", Cont, Files),
    entry("hour_categorical", "Hour", "Temporal", Cat, Files),
    entry("week_categorical", "Week of Year", "Temporal", Cat, Files),
    entry("weekday", "Day of the Week", "Temporal", Cat, Files),
    entry("month", "Month", "Temporal", Cat, Files),
    entry("year", "Year", "Temporal", Cat, Files),
    entry("site_name", "Location", "Spatial", Cat, Files),
    entry("site", "Site", "Spatial", Cat, Files),
    entry("site_id", "Recorder", "Spatial", Cat, Files),
    entry("temperature_2m", "Temperature (2m)", "Temperature", Cont, Files),
    entry("rain", "Rain", "Precipitation", Cont, Files),
    entry("snowfall", "Snowfall", "Precipitation", Cont, Files),
    entry("wind_speed_10m", "Wind Speed (10m)", "Wind", Cont, Files),
    entry("wind_speed_100m", "Wind Speed (100m)", "Wind", Cont, Files),
    entry("wind_direction_10m", "Wind Direction (10m)", "Wind", Cont, Files),
    entry("wind_direction_100m", "Wind Direction (100m)", "Wind", Cont, Files),
    entry("wind_gusts_10m", "Wind Gusts (10m)", "Wind", Cont, Files),
    entry("habitat_type", "Habitat Type", "Species Habitat", Cat, Species),
    entry("habitat_density", "Habitat Density", "Species Habitat", Cat, Species),
    entry("trophic_niche", "Trophic Niche", "Functional Groups", Cat, Species),
    entry("trophic_level", "Trophic Level", "Functional Groups", Cat, Species),
    entry("primary_lifestyle", "Primary Lifestyle", "Functional Groups", Cat, Species),
];

const WEATHER_GROUPS: &[&str] = &["Temperature", "Precipitation", "Wind"];
const SPATIAL_GROUPS: &[&str] = &["Spatial", "Site Level"];

/// Observed values of one column.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnSummary {
    pub column_type: ColumnType,
    /// Distinct non-null values, for columns offered as categories.
    pub unique: Option<Vec<Value>>,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl ColumnSummary {
    pub fn of(table: &TableView, column: &str, kind: OptionKind) -> Result<Self, StorageError> {
        let col = table.column(column)?;
        let (min, max) = if col.column_type().is_numeric() {
            (table.min(column)?, table.max(column)?)
        } else {
            (None, None)
        };
        Ok(Self {
            column_type: col.column_type(),
            unique: (kind == OptionKind::Categorical)
                .then(|| table.unique(column))
                .transpose()?,
            min,
            max,
        })
    }
}

/// Column summaries of a dataset plus its acoustic descriptor names.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ColumnProfile {
    columns: BTreeMap<String, ColumnSummary>,
    site_levels: Vec<String>,
    descriptors: Vec<String>,
}

impl ColumnProfile {
    pub fn get(&self, column: &str) -> Option<&ColumnSummary> {
        self.columns.get(column)
    }

    pub fn insert(&mut self, column: &str, summary: ColumnSummary) {
        self.columns.insert(column.to_string(), summary);
    }

    pub fn add_site_level(&mut self, column: &str, summary: ColumnSummary) {
        self.site_levels.push(column.to_string());
        self.insert(column, summary);
    }

    pub fn add_descriptor(&mut self, column: &str, summary: ColumnSummary) {
        self.descriptors.push(column.to_string());
        self.insert(column, summary);
    }
}

/// Summarise every option-bearing column of a dataset.
pub fn profile_dataset(ds: &Dataset) -> Result<ColumnProfile, DatasetError> {
    let files = ds.files()?;
    let mut profile = ColumnProfile::default();

    for entry in CATALOGUE.iter().filter(|s| s.source == Files) {
        if files.has_column(entry.column) {
            profile.insert(entry.column, ColumnSummary::of(&files, entry.column, entry.kind)?);
        }
    }
    let mut levels: Vec<&String> = files
        .column_names()
        .iter()
        .filter(|c| c.starts_with("sitelevel_"))
        .collect();
    levels.sort_by_key(|c| c["sitelevel_".len()..].parse::<u32>().unwrap_or(u32::MAX));
    for level in levels {
        profile.add_site_level(level, ColumnSummary::of(&files, level, OptionKind::Categorical)?);
    }

    match ds.species() {
        Ok(species) => {
            for entry in CATALOGUE.iter().filter(|s| s.source == Species) {
                if species.has_column(entry.column) {
                    profile.insert(entry.column, ColumnSummary::of(&species, entry.column, entry.kind)?);
                }
            }
        }
        Err(DatasetError::Storage(StorageError::NotFound(_))) => {
            log::debug!("{}: no species table, skipping species options", ds.name());
        }
        Err(e) => return Err(e),
    }

    match ds.features() {
        Ok(features) => {
            for d in &features.descriptors {
                profile.add_descriptor(d, ColumnSummary::of(&features.table, d, OptionKind::Continuous)?);
            }
        }
        Err(DatasetError::Storage(StorageError::NotFound(_))) => {
            log::debug!("{}: no acoustic features, skipping feature options", ds.name());
        }
        Err(e) => return Err(e),
    }
    Ok(profile)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OptionRecord {
    pub value: String,
    pub label: String,
    pub group: String,
    #[serde(rename = "type")]
    pub kind: OptionKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order: Option<Vec<serde_json::Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OptionGroup {
    pub name: String,
    pub options: Vec<OptionRecord>,
}

/// Non-empty option groups in canonical group order.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(transparent)]
pub struct OptionGroups(pub Vec<OptionGroup>);

/// Options of a dataset. Reads the cached column profile and current labels.
pub fn options_of(ds: &Dataset) -> Result<OptionGroups, DatasetError> {
    let profile = ds.column_profile()?;
    Ok(build_options(&profile, &ds.config()))
}

pub fn build_options(profile: &ColumnProfile, config: &DatasetConfig) -> OptionGroups {
    let mut by_group: BTreeMap<&str, Vec<OptionRecord>> = BTreeMap::new();

    for entry in CATALOGUE {
        if let Some(summary) = profile.get(entry.column) {
            if let Some(record) = make_record(entry.column, entry.label, entry.group, entry.kind, summary) {
                by_group.entry(entry.group).or_default().push(record);
            }
        }
    }
    for (k, level) in profile.site_levels.iter().enumerate() {
        let fallback = format!("Site Level {}", k + 1);
        let label = config.site_label(level).unwrap_or(&fallback);
        if let Some(record) = profile
            .get(level)
            .and_then(|s| make_record(level, label, "Site Level", OptionKind::Categorical, s))
        {
            by_group.entry("Site Level").or_default().push(record);
        }
    }
    for d in &profile.descriptors {
        if let Some(record) = profile
            .get(d)
            .and_then(|s| make_record(d, d, "Acoustic Features", OptionKind::Continuous, s))
        {
            by_group.entry("Acoustic Features").or_default().push(record);
        }
    }

    OptionGroups(
        GROUPS
            .iter()
            .filter_map(|g| {
                by_group.remove(g).map(|options| OptionGroup {
                    name: g.to_string(),
                    options,
                })
            })
            .collect(),
    )
}

fn make_record(
    column: &str,
    label: &str,
    group: &str,
    kind: OptionKind,
    summary: &ColumnSummary,
) -> Option<OptionRecord> {
    let (order, min, max) = match kind {
        OptionKind::Categorical => {
            let observed = summary.unique.as_deref().unwrap_or_default();
            let order = category_order(column, observed)
                .iter()
                .map(Value::to_json)
                .collect();
            (Some(order), None, None)
        }
        OptionKind::Continuous => {
            let (lo, hi) = slider_bounds(summary.min?, summary.max?);
            (None, Some(lo), Some(hi))
        }
    };
    Some(OptionRecord {
        value: column.to_string(),
        label: label.to_string(),
        group: group.to_string(),
        kind,
        order,
        min,
        max,
    })
}

/// Canonical order of observed category values: calendar order for months and
/// weekdays, solar order for dddn, numeric order for numeric-looking strings.
/// Always a permutation of `observed`.
pub fn category_order(column: &str, observed: &[Value]) -> Vec<Value> {
    let canonical: &[&str] = match column {
        "month" => MONTHS,
        "weekday" => WEEKDAYS,
        "dddn" => DDDN,
        _ => &[],
    };
    let mut known: Vec<(usize, Value)> = Vec::new();
    let mut rest: Vec<Value> = Vec::new();
    for v in observed {
        match v.as_str().and_then(|s| canonical.iter().position(|c| *c == s)) {
            Some(pos) => known.push((pos, v.clone())),
            None => rest.push(v.clone()),
        }
    }
    known.sort_by_key(|(pos, _)| *pos);
    rest.sort_by(natural_cmp);
    known.into_iter().map(|(_, v)| v).chain(rest).collect()
}

fn natural_cmp(a: &Value, b: &Value) -> Ordering {
    let num = |v: &Value| v.as_str().and_then(|s| s.trim().parse::<f64>().ok());
    match (num(a), num(b)) {
        (Some(x), Some(y)) => x.total_cmp(&y).then_with(|| a.cmp(b)),
        _ => a.cmp(b),
    }
}

/// Round outward to two decimals; a collapsed interval gets one unit of width.
pub fn slider_bounds(min: f64, max: f64) -> (f64, f64) {
    let mut lo = (min * 100.0).floor() / 100.0;
    if lo > min {
        lo -= 0.01;
    }
    let mut hi = (max * 100.0).ceil() / 100.0;
    if hi < max {
        hi += 0.01;
    }
    if hi <= lo {
        hi = lo + 1.0;
    }
    (lo, hi)
}

impl OptionGroups {
    pub fn options(&self) -> impl Iterator<Item = &OptionRecord> {
        self.0.iter().flat_map(|g| g.options.iter())
    }

    pub fn get(&self, value: &str) -> Option<&OptionRecord> {
        self.options().find(|o| o.value == value)
    }

    /// `value` → option record.
    pub fn options_map(&self) -> serde_json::Value {
        let map: serde_json::Map<String, serde_json::Value> = self
            .options()
            .map(|o| (o.value.clone(), serde_json::to_value(o).unwrap_or_default()))
            .collect();
        serde_json::Value::Object(map)
    }

    /// `value` → ordered categories, for categorical options.
    pub fn category_orders(&self) -> serde_json::Value {
        let map: serde_json::Map<String, serde_json::Value> = self
            .options()
            .filter_map(|o| Some((o.value.clone(), serde_json::Value::Array(o.order.clone()?))))
            .collect();
        serde_json::Value::Object(map)
    }

    /// `[{group, options: [{value, label}]}]` for grouped dropdowns.
    pub fn dropdown_groups(&self) -> serde_json::Value {
        self.0
            .iter()
            .map(|g| {
                json!({
                    "group": g.name,
                    "options": g.options.iter()
                        .map(|o| json!({"value": o.value, "label": o.label}))
                        .collect::<Vec<_>>(),
                })
            })
            .collect()
    }

    /// Continuous weather options with their bounds.
    pub fn weather_options(&self) -> serde_json::Value {
        self.records_where(|o| {
            WEATHER_GROUPS.contains(&o.group.as_str()) && o.kind == OptionKind::Continuous
        })
    }

    pub fn spatial_options(&self) -> serde_json::Value {
        self.records_where(|o| SPATIAL_GROUPS.contains(&o.group.as_str()))
    }

    pub fn categorical_options(&self) -> serde_json::Value {
        self.records_where(|o| o.kind == OptionKind::Categorical)
    }

    fn records_where(&self, keep: impl Fn(&OptionRecord) -> bool) -> serde_json::Value {
        self.options()
            .filter(|o| keep(*o))
            .map(|o| serde_json::to_value(o).unwrap_or_default())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Column;

    fn summarise_column(column: &Column, kind: OptionKind) -> Result<ColumnSummary, StorageError> {
        let table = TableView::new(vec![("c".to_string(), column.clone())])?;
        ColumnSummary::of(&table, "c", kind)
    }

    fn strs(values: &[&str]) -> Column {
        Column::Utf8(values.iter().map(|s| Some(s.to_string())).collect())
    }

    fn config() -> DatasetConfig {
        DatasetConfig::parse(
            "[Dataset]\nname = X\naudio_path = /a\n[Site Hierarchy]\nsitelevel_1 = Region\n",
        )
        .unwrap()
    }

    fn profile() -> ColumnProfile {
        let mut p = ColumnProfile::default();
        p.insert(
            "month",
            summarise_column(&strs(&["Mar", "Jan", "Dec"]), Cat).unwrap(),
        );
        p.insert(
            "hour_categorical",
            summarise_column(&strs(&["10", "2", "23"]), Cat).unwrap(),
        );
        p.insert(
            "temperature_2m",
            summarise_column(&Column::Float64(vec![Some(-1.234), Some(20.001), None]), Cont).unwrap(),
        );
        p.insert(
            "duration",
            summarise_column(&Column::Float64(vec![Some(60.0), Some(60.0)]), Cont).unwrap(),
        );
        p.add_site_level("sitelevel_1", summarise_column(&strs(&["b", "a"]), Cat).unwrap());
        p.add_site_level("sitelevel_2", summarise_column(&strs(&["3", "12"]), Cat).unwrap());
        p.add_descriptor(
            "bioacoustic index",
            summarise_column(&Column::Float64(vec![Some(0.1), Some(0.9)]), Cont).unwrap(),
        );
        p
    }

    #[test]
    fn test_calendar_and_numeric_orders() {
        let groups = build_options(&profile(), &config());
        let order = |v: &str| groups.get(v).unwrap().order.clone().unwrap();
        assert_eq!(order("month"), vec![json!("Jan"), json!("Mar"), json!("Dec")]);
        assert_eq!(order("hour_categorical"), vec![json!("2"), json!("10"), json!("23")]);
        assert_eq!(order("sitelevel_2"), vec![json!("3"), json!("12")]);
    }

    #[test]
    fn test_bounds_rounded_outward_and_widened() {
        let groups = build_options(&profile(), &config());
        let t = groups.get("temperature_2m").unwrap();
        assert_eq!((t.min, t.max), (Some(-1.24), Some(20.01)));
        let d = groups.get("duration").unwrap();
        assert_eq!((d.min, d.max), (Some(60.0), Some(61.0)));
    }

    #[test]
    fn test_slider_bounds_contain_observed() {
        for (lo, hi) in [(0.07, 0.29), (0.57, 0.57), (-3.333, 1e-9), (100.0, 250.5)] {
            let (a, b) = slider_bounds(lo, hi);
            assert!(a <= lo && hi <= b && a < b, "{lo}..{hi} → {a}..{b}");
        }
    }

    #[test]
    fn test_groups_in_canonical_order_with_labels() {
        let groups = build_options(&profile(), &config());
        let names: Vec<&str> = groups.0.iter().map(|g| g.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["File Level", "Site Level", "Temporal", "Temperature", "Acoustic Features"]
        );
        assert_eq!(groups.get("sitelevel_1").unwrap().label, "Region");
        assert_eq!(groups.get("sitelevel_2").unwrap().label, "Site Level 2");
    }

    #[test]
    fn test_derived_shapes() {
        let groups = build_options(&profile(), &config());
        let orders = groups.category_orders();
        assert!(orders.get("month").is_some());
        assert!(orders.get("duration").is_none());

        let weather = groups.weather_options();
        assert_eq!(weather.as_array().unwrap().len(), 1);
        assert_eq!(weather[0]["type"], "continuous");

        let spatial = groups.spatial_options();
        assert_eq!(spatial.as_array().unwrap().len(), 2);

        let dropdown = groups.dropdown_groups();
        assert_eq!(dropdown[0]["group"], "File Level");
        assert_eq!(groups.options_map()["month"]["group"], "Temporal");
    }

    #[test]
    fn test_order_is_permutation_with_unknown_values() {
        let observed = vec![Value::Str("night".into()), Value::Str("twilight".into()), Value::Str("dawn".into())];
        let order = category_order("dddn", &observed);
        assert_eq!(
            order,
            vec![Value::Str("dawn".into()), Value::Str("night".into()), Value::Str("twilight".into())]
        );
    }
}
