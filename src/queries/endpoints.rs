//! Query functions behind each endpoint name.
//!
//! Every function takes the catalogue and the request's named arguments and
//! returns plain JSON: tables as lists of records, everything else as maps.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value as Json, json};

use super::{Payload, QueryError, Result};
use crate::cache::{Spill, ViewKey};
use crate::catalogue::Catalogue;
use crate::dataset::{Dataset, DatasetError, derive};
use crate::filter::{self, CompiledFilter, FilterContext, FilterState, WeatherFilter};
use crate::options::{self, OptionGroups};
use crate::store::{CmpOp, Predicate, StorageError, TableView, Value};
use crate::views::{self, AggregateArgs};

pub const UMAP_VIEW: &str = "umap_projection";

// ---------------------------------------------------------------------------
// Payload helpers
// ---------------------------------------------------------------------------

/// Optional argument; JSON null counts as absent.
fn arg<T: DeserializeOwned>(payload: &Payload, key: &str) -> Result<Option<T>> {
    payload
        .get(key)
        .filter(|v| !v.is_null())
        .map(|v| T::deserialize(v).map_err(|e| QueryError::invalid(key, e.to_string())))
        .transpose()
}

fn required<T: DeserializeOwned>(payload: &Payload, key: &str) -> Result<T> {
    arg(payload, key)?.ok_or_else(|| QueryError::invalid(key, "missing"))
}

/// The dataset named by `dataset_name`. May be omitted when exactly one
/// dataset is loaded.
fn dataset<'a>(cat: &'a Catalogue, payload: &Payload) -> Result<&'a Arc<Dataset>> {
    match arg::<String>(payload, "dataset_name")? {
        Some(name) => cat.get(&name).ok_or(QueryError::UnknownDataset(name)),
        None => {
            let mut all = cat.iter();
            match (all.next(), all.next()) {
                (Some(only), None) => Ok(only),
                _ => Err(QueryError::invalid(
                    "dataset_name",
                    format!("required with {} datasets loaded", cat.len()),
                )),
            }
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum WeatherArg {
    Range((f64, f64)),
    Filter(WeatherFilter),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum FeatureArg {
    Name(String),
    Ranged(String, (f64, f64)),
}

/// Filter state from a `filters` object, overridden by the shorthand keys
/// `dates`, `locations`, `file_filters`, `weather_filters`, `current_feature`
/// and `species`.
pub fn filter_state(payload: &Payload) -> Result<FilterState> {
    let mut state: FilterState = arg(payload, "filters")?.unwrap_or_default();
    if let Some(dates) = arg(payload, "dates")? {
        state.date_range = Some(dates);
    }
    if let Some(locations) = arg(payload, "locations")? {
        state.current_sites = locations;
    }
    if let Some(files) = arg(payload, "file_filters")? {
        state.files = files;
    }
    if let Some(weather) = arg::<BTreeMap<String, WeatherArg>>(payload, "weather_filters")? {
        state.weather_variables = weather
            .into_iter()
            .map(|(name, w)| {
                let w = match w {
                    WeatherArg::Range(range) => WeatherFilter {
                        variable_range: Some(range),
                        ..WeatherFilter::default()
                    },
                    WeatherArg::Filter(w) => w,
                };
                (name, w)
            })
            .collect();
    }
    match arg(payload, "current_feature")? {
        Some(FeatureArg::Name(name)) => state.current_feature = Some(name),
        Some(FeatureArg::Ranged(name, range)) => {
            state.current_feature = Some(name);
            state.current_feature_range = Some(range);
        }
        None => {}
    }
    if let Some(species) = arg(payload, "species")? {
        state.species = species;
    }
    Ok(state)
}

fn compiled(ds: &Dataset, payload: &Payload) -> Result<CompiledFilter> {
    let state = filter_state(payload)?;
    Ok(filter::compile(&state, &FilterContext::for_dataset(ds)?)?)
}

fn apply(table: &TableView, predicate: Option<Predicate>) -> Result<TableView> {
    Ok(match predicate {
        Some(p) => table.filter_by(&p)?,
        None => table.clone(),
    })
}

/// Narrow to the optional `columns` argument.
fn project(table: TableView, payload: &Payload) -> Result<TableView> {
    match arg::<Vec<String>>(payload, "columns")? {
        Some(columns) => Ok(table.select(&columns)?),
        None => Ok(table),
    }
}

fn aggregate_args(payload: &Payload) -> Result<AggregateArgs> {
    Ok(AggregateArgs {
        threshold: required(payload, "threshold")?,
        group_by: arg(payload, "group_by")?.unwrap_or_default(),
        filters: filter_state(payload)?,
        ..AggregateArgs::default()
    })
}

fn option_groups(cat: &Catalogue, payload: &Payload) -> Result<OptionGroups> {
    Ok(options::options_of(dataset(cat, payload)?)?)
}

// ---------------------------------------------------------------------------
// Datasets and configuration
// ---------------------------------------------------------------------------

pub fn fetch_datasets(cat: &Catalogue, _payload: &Payload) -> Result<Json> {
    Ok(json!(cat.names()))
}

/// Validate and echo a dataset name. Selection state lives with the caller.
pub fn set_current_dataset(cat: &Catalogue, payload: &Payload) -> Result<Json> {
    let name: String = required(payload, "dataset_name")?;
    let ds = cat.get(&name).ok_or(QueryError::UnknownDataset(name))?;
    Ok(json!(ds.name()))
}

pub fn fetch_dataset_config(cat: &Catalogue, payload: &Payload) -> Result<Json> {
    Ok(dataset(cat, payload)?.config().to_json())
}

pub fn set_dataset_config(cat: &Catalogue, payload: &Payload) -> Result<Json> {
    let ds = dataset(cat, payload)?;
    let labels: Vec<String> = required(payload, "site_labels")?;
    Ok(ds.set_site_labels(&labels)?.to_json())
}

pub fn fetch_dataset_sites_tree(cat: &Catalogue, payload: &Payload) -> Result<Json> {
    let tree = dataset(cat, payload)?.sites_tree()?;
    Ok(serde_json::to_value(&*tree)?)
}

// ---------------------------------------------------------------------------
// Tables
// ---------------------------------------------------------------------------

pub fn fetch_files(cat: &Catalogue, payload: &Payload) -> Result<Json> {
    let ds = dataset(cat, payload)?;
    let filter = compiled(ds, payload)?;
    let files = apply(&*ds.files()?, filter.files_predicate())?;
    log::debug!("{}: fetch_files [{filter}] -> {} rows", ds.name(), files.num_rows());
    Ok(project(files, payload)?.to_json())
}

pub fn fetch_locations(cat: &Catalogue, payload: &Payload) -> Result<Json> {
    let ds = dataset(cat, payload)?;
    Ok(project(ds.locations()?.as_ref().clone(), payload)?.to_json())
}

pub fn fetch_acoustic_features(cat: &Catalogue, payload: &Payload) -> Result<Json> {
    let ds = dataset(cat, payload)?;
    let filter = compiled(ds, payload)?;
    let features = apply(&ds.features()?.table, filter.features_predicate())?;
    Ok(project(features, payload)?.to_json())
}

/// Filtered feature rows with `x`/`y` from the dataset's encoder. Projections
/// are cached and spilled per filter.
pub fn fetch_acoustic_features_umap(cat: &Catalogue, payload: &Payload) -> Result<Json> {
    let ds = dataset(cat, payload)?;
    let filter = compiled(ds, payload)?;
    let key = ViewKey::new(ds.name(), UMAP_VIEW).arg("filter", filter.to_string());
    let projected = cat.cache().get_or_compute(
        &key,
        Spill::Disk(&ds.views_dir()),
        || -> Result<TableView> {
            let features = ds.features()?;
            let rows = apply(&features.table, filter.features_predicate())?;
            Ok(ds.umap(&rows)?)
        },
    )?;
    Ok(project(projected.as_ref().clone(), payload)?.to_json())
}

/// Detections under the filter, above an optional `threshold`.
pub fn fetch_birdnet_species(cat: &Catalogue, payload: &Payload) -> Result<Json> {
    let ds = dataset(cat, payload)?;
    let filter = compiled(ds, payload)?;
    let detections = views::filter_detections(ds, &filter, arg(payload, "threshold")?)?;
    Ok(project(detections, payload)?.to_json())
}

/// Weather at the nearest hour of one clip, as a single record.
pub fn fetch_file_weather(cat: &Catalogue, payload: &Payload) -> Result<Json> {
    let ds = dataset(cat, payload)?;
    let file_id: Json = required(payload, "file_id")?;
    let files = ds.files()?;
    let row = files.filter_by(&Predicate::compare(
        "file_id",
        CmpOp::Eq,
        Value::from_json(&file_id),
    ))?;
    if row.is_empty() {
        return Err(QueryError::invalid("file_id", format!("no clip with id {file_id}")));
    }

    let mut columns = vec!["file_id".to_string(), "site_id".to_string(), "nearest_hour".to_string()];
    match ds.weather() {
        Ok(weather) => columns.extend(
            weather
                .column_names()
                .iter()
                .filter(|c| !derive::WEATHER_COLUMNS.contains(&c.as_str()) && files.has_column(c))
                .cloned(),
        ),
        Err(DatasetError::Storage(StorageError::NotFound(_))) => {}
        Err(e) => return Err(e.into()),
    }
    let record = row.take(&[0]).select(&columns)?.to_records().into_iter().next();
    Ok(record.map(Json::Object).unwrap_or(Json::Null))
}

// ---------------------------------------------------------------------------
// Species
// ---------------------------------------------------------------------------

/// The shared species dictionary plus the dataset's saved selection.
pub fn fetch_species(cat: &Catalogue, payload: &Payload) -> Result<Json> {
    let ds = dataset(cat, payload)?;
    let species = match ds.species() {
        Ok(table) => table.to_json(),
        Err(DatasetError::Storage(StorageError::NotFound(_))) => json!([]),
        Err(e) => return Err(e.into()),
    };
    Ok(json!({
        "species": species,
        "selected": *ds.species_list()?,
    }))
}

pub fn set_species_list(cat: &Catalogue, payload: &Payload) -> Result<Json> {
    let ds = dataset(cat, payload)?;
    let list: Vec<String> = required(payload, "species_list")?;
    Ok(json!(*ds.set_species_list(list)?))
}

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

pub fn fetch_dataset_options(cat: &Catalogue, payload: &Payload) -> Result<Json> {
    Ok(option_groups(cat, payload)?.options_map())
}

pub fn fetch_dataset_category_orders(cat: &Catalogue, payload: &Payload) -> Result<Json> {
    Ok(option_groups(cat, payload)?.category_orders())
}

pub fn fetch_dataset_dropdown_option_groups(cat: &Catalogue, payload: &Payload) -> Result<Json> {
    Ok(option_groups(cat, payload)?.dropdown_groups())
}

pub fn fetch_dataset_weather_options(cat: &Catalogue, payload: &Payload) -> Result<Json> {
    Ok(option_groups(cat, payload)?.weather_options())
}

pub fn fetch_dataset_spatial_dropdown_options(cat: &Catalogue, payload: &Payload) -> Result<Json> {
    Ok(option_groups(cat, payload)?.spatial_options())
}

pub fn fetch_dataset_categorical_dropdown_options(cat: &Catalogue, payload: &Payload) -> Result<Json> {
    Ok(option_groups(cat, payload)?.categorical_options())
}

// ---------------------------------------------------------------------------
// Aggregates
// ---------------------------------------------------------------------------

pub fn species_richness(cat: &Catalogue, payload: &Payload) -> Result<Json> {
    let ds = dataset(cat, payload)?;
    let args = aggregate_args(payload)?;
    Ok(views::species_richness(ds, cat.cache(), &args)?.to_json())
}

pub fn species_abundance(cat: &Catalogue, payload: &Payload) -> Result<Json> {
    let ds = dataset(cat, payload)?;
    let args = aggregate_args(payload)?;
    Ok(views::species_abundance(ds, cat.cache(), &args)?.to_json())
}
