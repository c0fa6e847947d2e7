//! Compile a UI filter state into a predicate over the files view.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::dataset::{Dataset, DatasetError, SiteTree};
use crate::store::column::days_from_date;
use crate::store::{CmpOp, Predicate, StorageError, Value};

#[derive(Error, Debug)]
pub enum FilterError {
    #[error("Unknown site: {0}")]
    UnknownSite(String),
    #[error("Site {0} is not part of the site tree")]
    SiteNotInTree(String),
    #[error("Unknown weather variable: {0}")]
    UnknownVariable(String),
    #[error("Unknown acoustic feature: {0}")]
    UnknownFeature(String),
    #[error("Unknown column: {0}")]
    UnknownColumn(String),
    #[error("Invalid range for {name}: {low} > {high}")]
    InvertedRange { name: String, low: String, high: String },
    #[error("Range for {name} ({low}, {high}) lies outside its bounds")]
    OutOfBounds { name: String, low: String, high: String },
    #[error("Dataset error: {0}")]
    Dataset(#[from] DatasetError),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WeatherFilter {
    pub variable_range_bounds: Option<(f64, f64)>,
    pub variable_range: Option<(f64, f64)>,
}

/// The filter record the UI stores and passes to every query.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterState {
    pub date_range_bounds: Option<(NaiveDate, NaiveDate)>,
    pub date_range: Option<(NaiveDate, NaiveDate)>,
    /// Descriptor name → (min, max) bounds.
    pub acoustic_features: BTreeMap<String, (f64, f64)>,
    pub current_feature: Option<String>,
    pub current_feature_range: Option<(f64, f64)>,
    pub weather_variables: BTreeMap<String, WeatherFilter>,
    /// Site universe.
    pub tree: Vec<String>,
    pub current_sites: Vec<String>,
    /// Selection id → clip ids to exclude.
    pub files: BTreeMap<String, Vec<serde_json::Value>>,
    pub species: Vec<String>,
}

/// What the compiler needs to know about a dataset.
#[derive(Debug, Clone, Default)]
pub struct FilterContext {
    pub dataset: String,
    /// `(site path, site_id)` for every location.
    pub sites: Vec<(String, Value)>,
    /// Columns of the files view.
    pub columns: BTreeSet<String>,
    pub features: BTreeSet<String>,
}

impl FilterContext {
    /// Context from a dataset's locations, files view, and (when present)
    /// feature descriptors.
    pub fn for_dataset(ds: &Dataset) -> Result<Self, FilterError> {
        let locations = ds.locations()?;
        let paths = locations.column("site")?;
        let ids = locations.column("site_id")?;
        let sites = (0..locations.num_rows())
            .filter_map(|i| Some((paths.str_at(i)?.to_string(), ids.get(i))))
            .collect();
        let columns = ds.files()?.column_names().iter().cloned().collect();
        let features = match ds.features() {
            Ok(f) => f.descriptors.iter().cloned().collect(),
            Err(DatasetError::Storage(StorageError::NotFound(_))) => BTreeSet::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            dataset: ds.name().to_string(),
            sites,
            columns,
            features,
        })
    }

    /// `site_id`s at `path` or below it.
    fn site_ids(&self, path: &str) -> Vec<Value> {
        let below = format!("{path}/");
        self.sites
            .iter()
            .filter(|(site, _)| site == path || site.starts_with(&below))
            .map(|(_, id)| id.clone())
            .collect()
    }

    fn is_known_path(&self, path: &str) -> bool {
        path == self.dataset
            || self.sites.iter().any(|(site, _)| {
                site == path || site.strip_prefix(path).is_some_and(|r| r.starts_with('/'))
            })
    }
}

/// Compiled filter: conjunctive parts over the files view plus the feature
/// clause and the species selection.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompiledFilter {
    parts: Vec<Predicate>,
    feature: Option<Predicate>,
    species: Vec<String>,
}

impl CompiledFilter {
    /// Sites, exclusions, dates, and weather.
    pub fn files_predicate(&self) -> Option<Predicate> {
        Predicate::all(self.parts.clone())
    }

    /// `files_predicate` plus the current feature range.
    pub fn features_predicate(&self) -> Option<Predicate> {
        Predicate::all(self.parts.iter().chain(&self.feature).cloned().collect())
    }

    /// Selected species, sorted and de-duplicated. Applied to detection queries only.
    pub fn species(&self) -> &[String] {
        &self.species
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty() && self.feature.is_none() && self.species.is_empty()
    }
}

impl fmt::Display for CompiledFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.features_predicate() {
            Some(p) => write!(f, "{p}"),
            None => Ok(()),
        }
    }
}

fn check_range<T: PartialOrd + fmt::Display>(
    name: &str,
    range: (T, T),
    bounds: Option<(T, T)>,
) -> Result<(), FilterError> {
    let (low, high) = range;
    if low > high {
        return Err(FilterError::InvertedRange {
            name: name.to_string(),
            low: low.to_string(),
            high: high.to_string(),
        });
    }
    if let Some((min, max)) = bounds {
        if low < min || high > max {
            return Err(FilterError::OutOfBounds {
                name: name.to_string(),
                low: low.to_string(),
                high: high.to_string(),
            });
        }
    }
    Ok(())
}

fn sorted_unique(mut values: Vec<Value>) -> Vec<Value> {
    values.retain(|v| !v.is_null());
    values.sort();
    values.dedup();
    values
}

/// Compile `state` against a dataset context. Pure: equal inputs give equal output.
pub fn compile(state: &FilterState, ctx: &FilterContext) -> Result<CompiledFilter, FilterError> {
    let mut parts = Vec::new();

    if !state.current_sites.is_empty() {
        let tree = (!state.tree.is_empty()).then(|| SiteTree::from_paths(&ctx.dataset, &state.tree));
        let mut ids = Vec::new();
        for site in &state.current_sites {
            if tree.as_ref().is_some_and(|t| !t.contains(site) && !state.tree.contains(site)) {
                return Err(FilterError::SiteNotInTree(site.clone()));
            }
            if !ctx.is_known_path(site) {
                return Err(FilterError::UnknownSite(site.clone()));
            }
            ids.extend(ctx.site_ids(site));
        }
        parts.push(Predicate::is_in("site_id", sorted_unique(ids)));
    }

    let excluded: Vec<Value> = state
        .files
        .values()
        .flatten()
        .map(Value::from_json)
        .collect();
    let excluded = sorted_unique(excluded);
    if !excluded.is_empty() {
        parts.push(Predicate::not_in("file_id", excluded));
        parts.push(Predicate::compare("duration", CmpOp::Ge, Value::Int(60)));
    }

    if let Some((start, end)) = state.date_range {
        check_range("date_range", (start, end), state.date_range_bounds)?;
        parts.push(Predicate::between(
            "date",
            Value::Date(days_from_date(start)),
            Value::Date(days_from_date(end)),
        ));
    }

    for (name, weather) in &state.weather_variables {
        let Some((low, high)) = weather.variable_range else {
            continue;
        };
        if !ctx.columns.contains(name) {
            return Err(FilterError::UnknownVariable(name.clone()));
        }
        check_range(name, (low, high), weather.variable_range_bounds)?;
        parts.push(Predicate::Or(vec![
            Predicate::between(name, Value::Float(low), Value::Float(high)),
            Predicate::is_null(name),
        ]));
    }

    for part in &parts {
        if let Some(missing) = part.columns().into_iter().find(|c| !ctx.columns.contains(*c)) {
            return Err(FilterError::UnknownColumn(missing.to_string()));
        }
    }

    let feature = match (&state.current_feature, state.current_feature_range) {
        (Some(name), Some((low, high))) => {
            if !ctx.features.contains(name) {
                return Err(FilterError::UnknownFeature(name.clone()));
            }
            check_range(name, (low, high), state.acoustic_features.get(name).copied())?;
            Some(Predicate::between(name, Value::Float(low), Value::Float(high)))
        }
        _ => None,
    };

    let mut species = state.species.clone();
    species.sort();
    species.dedup();

    Ok(CompiledFilter {
        parts,
        feature,
        species,
    })
}
