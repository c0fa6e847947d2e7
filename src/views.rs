//! Cached aggregates over a dataset's detections.

use std::sync::Arc;

use chrono::NaiveDate;
use thiserror::Error;

use crate::cache::{CacheError, Spill, ViewCache, ViewKey};
use crate::dataset::{Dataset, DatasetError};
use crate::filter::{self, CompiledFilter, FilterContext, FilterError, FilterState};
use crate::store::{Agg, AggSpec, CmpOp, Column, JoinHow, Predicate, StorageError, TableView, Value};

pub const RICHNESS_VIEW: &str = "species_richness";
pub const ABUNDANCE_VIEW: &str = "species_abundance";

#[derive(Error, Debug)]
pub enum ViewError {
    #[error("Dataset error: {0}")]
    Dataset(#[from] DatasetError),
    #[error("Filter error: {0}")]
    Filter(#[from] FilterError),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),
}

/// Arguments shared by the detection aggregates.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AggregateArgs {
    /// Detections must score strictly above this confidence.
    pub threshold: f64,
    pub group_by: Vec<String>,
    /// Inclusive date interval.
    pub dates: Option<(NaiveDate, NaiveDate)>,
    /// Site paths; each matches itself and its descendants.
    pub locations: Vec<String>,
    pub species: Vec<String>,
    /// Rest of the filter (weather ranges, exclusions). `dates`, `locations`
    /// and `species` override their counterparts here when set.
    pub filters: FilterState,
}

impl AggregateArgs {
    pub fn filter_state(&self) -> FilterState {
        let mut state = self.filters.clone();
        if self.dates.is_some() {
            state.date_range = self.dates;
        }
        if !self.locations.is_empty() {
            state.current_sites = self.locations.clone();
        }
        if !self.species.is_empty() {
            state.species = self.species.clone();
        }
        state
    }

    fn compile(&self, ds: &Dataset) -> Result<CompiledFilter, ViewError> {
        Ok(filter::compile(&self.filter_state(), &FilterContext::for_dataset(ds)?)?)
    }

    /// Keyed on the compiled files predicate, so equivalent filter states share an entry.
    fn key(&self, ds: &Dataset, view: &str, compiled: &CompiledFilter) -> ViewKey {
        let predicate = compiled
            .files_predicate()
            .map(|p| p.to_string())
            .unwrap_or_default();
        ViewKey::new(ds.name(), view)
            .arg("threshold", self.threshold)
            .arg("group_by", self.group_by.clone())
            .arg("filter", predicate)
            .set_arg("species", compiled.species().to_vec())
    }
}

/// Detections of clips that pass the files predicate, scoring above
/// `threshold`, limited to the selected species.
pub fn filter_detections(
    ds: &Dataset,
    compiled: &CompiledFilter,
    threshold: Option<f64>,
) -> Result<TableView, ViewError> {
    let detections = ds.detections()?;
    let mut parts: Vec<Predicate> = threshold
        .map(|t| Predicate::compare("confidence", CmpOp::Gt, Value::Float(t)))
        .into_iter()
        .collect();
    if !compiled.species().is_empty() {
        parts.push(Predicate::is_in(
            "species",
            compiled.species().iter().map(|s| Value::Str(s.clone())).collect(),
        ));
    }
    let mut out = match Predicate::all(parts) {
        Some(p) => detections.filter_by(&p)?,
        None => detections.as_ref().clone(),
    };
    // semi-join on the filtered files view: weather and duration live there
    if let Some(p) = compiled.files_predicate() {
        let kept = ds.files()?.filter_by(&p)?.select(&["file_id"])?;
        out = out.join(&kept, &["file_id"], JoinHow::Semi)?;
    }
    Ok(out)
}

/// Distinct species per group, as `richness`.
pub fn species_richness(
    ds: &Dataset,
    cache: &ViewCache,
    args: &AggregateArgs,
) -> Result<Arc<TableView>, ViewError> {
    let compiled = args.compile(ds)?;
    let key = args.key(ds, RICHNESS_VIEW, &compiled);
    cache.get_or_compute(&key, Spill::Disk(&ds.views_dir()), || -> Result<TableView, ViewError> {
        let detections = filter_detections(ds, &compiled, Some(args.threshold))?;
        let out = detections
            .group_by(&args.group_by)?
            .agg(&[AggSpec::new("species", Agg::NUnique, "richness")])?;
        log::debug!(
            "{}: richness over {} detections -> {} groups",
            ds.name(),
            detections.num_rows(),
            out.num_rows()
        );
        Ok(out)
    })
}

/// Co-occurring detections of a species within one (start, end) window,
/// maximised over windows and summed over species, as `abundance`.
pub fn species_abundance(
    ds: &Dataset,
    cache: &ViewCache,
    args: &AggregateArgs,
) -> Result<Arc<TableView>, ViewError> {
    let compiled = args.compile(ds)?;
    let key = args.key(ds, ABUNDANCE_VIEW, &compiled);
    cache.get_or_compute(&key, Spill::Disk(&ds.views_dir()), || -> Result<TableView, ViewError> {
        let detections = filter_detections(ds, &compiled, Some(args.threshold))?;

        let mut window_keys = args.group_by.clone();
        window_keys.extend(["species", "start_time", "end_time"].map(String::from));
        let per_window = detections.group_by(&window_keys)?.size("n")?;

        let mut species_keys = args.group_by.clone();
        species_keys.push("species".into());
        let per_species = per_window
            .group_by(&species_keys)?
            .agg(&[AggSpec::new("n", Agg::Max, "n")])?;

        let summed = per_species
            .group_by(&args.group_by)?
            .agg(&[AggSpec::new("n", Agg::Sum, "abundance")])?;
        let counts = summed.column("abundance")?;
        let counts = Column::Int64(
            (0..summed.num_rows())
                .map(|i| counts.f64_at(i).map(|x| x.round() as i64))
                .collect(),
        );
        Ok(summed.with_column("abundance", counts)?)
    })
}
