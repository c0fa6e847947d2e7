//! The process-wide endpoint table.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use super::endpoints as ep;
use super::{Payload, Result};
use crate::catalogue::Catalogue;

pub type QueryFn = fn(&Catalogue, &Payload) -> Result<serde_json::Value>;

static REGISTRY: LazyLock<BTreeMap<&'static str, QueryFn>> = LazyLock::new(|| {
    let entries: [(&'static str, QueryFn); 21] = [
        ("fetch_datasets", ep::fetch_datasets),
        ("set_current_dataset", ep::set_current_dataset),
        ("fetch_dataset_config", ep::fetch_dataset_config),
        ("set_dataset_config", ep::set_dataset_config),
        ("fetch_dataset_sites_tree", ep::fetch_dataset_sites_tree),
        ("fetch_files", ep::fetch_files),
        ("fetch_locations", ep::fetch_locations),
        ("fetch_acoustic_features", ep::fetch_acoustic_features),
        ("fetch_acoustic_features_umap", ep::fetch_acoustic_features_umap),
        ("fetch_birdnet_species", ep::fetch_birdnet_species),
        ("fetch_file_weather", ep::fetch_file_weather),
        ("fetch_species", ep::fetch_species),
        ("set_species_list", ep::set_species_list),
        ("fetch_dataset_options", ep::fetch_dataset_options),
        ("fetch_dataset_category_orders", ep::fetch_dataset_category_orders),
        ("fetch_dataset_dropdown_option_groups", ep::fetch_dataset_dropdown_option_groups),
        ("fetch_dataset_weather_options", ep::fetch_dataset_weather_options),
        ("fetch_dataset_spatial_dropdown_options", ep::fetch_dataset_spatial_dropdown_options),
        (
            "fetch_dataset_categorical_dropdown_options",
            ep::fetch_dataset_categorical_dropdown_options,
        ),
        ("species_richness", ep::species_richness),
        ("species_abundance", ep::species_abundance),
    ];
    entries.into_iter().collect()
});

pub fn lookup(endpoint: &str) -> Option<QueryFn> {
    REGISTRY.get(endpoint).copied()
}

/// Registered endpoint names, sorted.
pub fn endpoints() -> impl Iterator<Item = &'static str> {
    REGISTRY.keys().copied()
}
