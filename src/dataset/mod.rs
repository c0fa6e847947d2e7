//! One field deployment on disk and its lazily materialised views.

pub mod config;
pub mod derive;
pub mod slot;
pub mod tree;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use thiserror::Error;

use crate::options::ColumnProfile;
use crate::store::{self, Column, StorageError, TableView};
use crate::umap::{ModelError, UmapModel};

pub use config::DatasetConfig;
pub use derive::FeatureView;
pub use slot::Slot;
pub use tree::SiteTree;

pub const CONFIG_FILE: &str = "config";
pub const FILES_TABLE: &str = "files_table.parquet";
pub const LOCATIONS_TABLE: &str = "locations_table.parquet";
pub const WEATHER_TABLE: &str = "weather_table.parquet";
pub const SOLAR_TABLE: &str = "solar_table.parquet";
pub const FEATURES_TABLE: &str = "recording_acoustic_features_table.parquet";
pub const DETECTIONS_TABLE: &str = "birdnet_species_probs_table.parquet";
pub const SPECIES_LIST: &str = "species_list.parquet";
pub const SPECIES_TABLE: &str = "species_table.parquet";
pub const UMAP_DIR: &str = "umap";
pub const VIEWS_DIR: &str = "views";

/// Tables a directory must contain to be loaded as a dataset.
pub const REQUIRED_TABLES: &[&str] = &[FILES_TABLE, LOCATIONS_TABLE];

#[derive(Error, Debug)]
pub enum DatasetError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Config parse error: {0}")]
    ConfigParse(#[from] ini::ParseError),
    #[error("Invalid config: {0}")]
    Config(String),
    #[error("Schema error: {table} is missing column `{column}`")]
    Schema { table: String, column: String },
    #[error("Model error: {0}")]
    Model(#[from] ModelError),
}

pub type Result<T> = std::result::Result<T, DatasetError>;

/// The cross-dataset species dictionary at `<root>/species_table.parquet`.
#[derive(Debug)]
pub struct SharedSpecies {
    path: PathBuf,
    table: Slot<TableView>,
}

impl SharedSpecies {
    pub fn new(root: &Path) -> Self {
        Self {
            path: root.join(SPECIES_TABLE),
            table: Slot::new(),
        }
    }

    pub fn table(&self) -> Result<Arc<TableView>> {
        self.table.get_or_try_init(|| {
            let table = store::read_table(&self.path, None)?;
            derive::require("species_table", &table, derive::SPECIES_COLUMNS)?;
            log::info!("Loaded species table ({} rows)", table.num_rows());
            Ok(table)
        })
    }
}

/// A dataset: identity, sidecar configuration, and one single-flight slot per view.
#[derive(Debug)]
pub struct Dataset {
    name: String,
    id: String,
    root: PathBuf,
    audio_path: PathBuf,
    umap_batch_size: usize,

    config: RwLock<Arc<DatasetConfig>>,
    config_edit: Mutex<()>,
    species_list: Mutex<Option<Arc<Vec<String>>>>,
    shared_species: Arc<SharedSpecies>,

    locations: Slot<TableView>,
    files: Slot<TableView>,
    weather: Slot<TableView>,
    solar: Slot<TableView>,
    detections: Slot<TableView>,
    features: Slot<FeatureView>,
    sites_tree: Slot<SiteTree>,
    encoder: Slot<UmapModel>,
    profile: Slot<ColumnProfile>,
}

impl Dataset {
    /// Read the sidecar and set up empty view slots. No table is read here.
    pub fn open(root: &Path, shared_species: Arc<SharedSpecies>, umap_batch_size: usize) -> Result<Self> {
        let config = DatasetConfig::load(&root.join(CONFIG_FILE))?;
        Ok(Self {
            name: config.name().to_string(),
            id: config.id().to_string(),
            root: root.to_path_buf(),
            audio_path: PathBuf::from(config.audio_path()),
            umap_batch_size,
            config: RwLock::new(Arc::new(config)),
            config_edit: Mutex::new(()),
            species_list: Mutex::new(None),
            shared_species,
            locations: Slot::new(),
            files: Slot::new(),
            weather: Slot::new(),
            solar: Slot::new(),
            detections: Slot::new(),
            features: Slot::new(),
            sites_tree: Slot::new(),
            encoder: Slot::new(),
            profile: Slot::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn audio_path(&self) -> &Path {
        &self.audio_path
    }

    pub fn views_dir(&self) -> PathBuf {
        self.root.join(VIEWS_DIR)
    }

    /// Snapshot of the current configuration.
    pub fn config(&self) -> Arc<DatasetConfig> {
        self.config.read().clone()
    }

    pub fn save_config(&self) -> Result<()> {
        let _edit = self.config_edit.lock();
        self.config().save(&self.root.join(CONFIG_FILE))
    }

    /// Replace the site-level labels and persist the sidecar. The in-memory
    /// config only changes once the file has been written.
    pub fn set_site_labels(&self, labels: &[String]) -> Result<Arc<DatasetConfig>> {
        let _edit = self.config_edit.lock();
        let mut updated = (*self.config()).clone();
        updated.set_site_labels(labels);
        updated.save(&self.root.join(CONFIG_FILE))?;
        let updated = Arc::new(updated);
        *self.config.write() = Arc::clone(&updated);
        log::info!("{}: site labels set to {:?}", self.name, labels);
        Ok(updated)
    }

    fn read(&self, file: &str) -> Result<TableView> {
        let started = Instant::now();
        let table = store::read_table(&self.root.join(file), None)?;
        log::debug!(
            "{}: read {file} ({} rows) in {:.1?}",
            self.name,
            table.num_rows(),
            started.elapsed()
        );
        Ok(table)
    }

    pub fn locations(&self) -> Result<Arc<TableView>> {
        self.locations.get_or_try_init(|| {
            let raw = self.read(LOCATIONS_TABLE)?;
            derive::locations_view(&self.name, &raw)
        })
    }

    pub fn weather(&self) -> Result<Arc<TableView>> {
        self.weather.get_or_try_init(|| {
            let table = self.read(WEATHER_TABLE)?;
            derive::require("weather_table", &table, derive::WEATHER_COLUMNS)?;
            Ok(table)
        })
    }

    pub fn solar(&self) -> Result<Arc<TableView>> {
        self.solar.get_or_try_init(|| {
            let table = self.read(SOLAR_TABLE)?;
            derive::require("solar_table", &table, derive::SOLAR_COLUMNS)?;
            Ok(table)
        })
    }

    pub fn species(&self) -> Result<Arc<TableView>> {
        self.shared_species.table()
    }

    /// Files joined with weather and locations, with derived time columns.
    /// Weather and solar tables are optional inputs.
    pub fn files(&self) -> Result<Arc<TableView>> {
        self.files.get_or_try_init(|| {
            let locations = self.locations()?;
            let weather = self.optional(self.weather())?;
            let solar = self.optional(self.solar())?;
            let raw = self.read(FILES_TABLE)?;
            let view = derive::files_view(&raw, &locations, weather.as_deref(), solar.as_deref())?;
            log::info!(
                "{}: files view ready ({} rows, {} columns)",
                self.name,
                view.num_rows(),
                view.num_columns()
            );
            Ok(view)
        })
    }

    pub fn detections(&self) -> Result<Arc<TableView>> {
        self.detections.get_or_try_init(|| {
            let files = self.files()?;
            let species = self.optional(self.species())?;
            let raw = self.read(DETECTIONS_TABLE)?;
            let view = derive::detections_view(&raw, &files, species.as_deref())?;
            log::info!("{}: detections view ready ({} rows)", self.name, view.num_rows());
            Ok(view)
        })
    }

    pub fn features(&self) -> Result<Arc<FeatureView>> {
        self.features.get_or_try_init(|| {
            let files = self.files()?;
            let raw = self.read(FEATURES_TABLE)?;
            let config = self.config();
            let view = derive::features_view(&raw, &files, config.strip_path_prefix())?;
            log::info!(
                "{}: features view ready ({} rows, {} descriptors)",
                self.name,
                view.table.num_rows(),
                view.descriptors.len()
            );
            Ok(view)
        })
    }

    pub fn sites_tree(&self) -> Result<Arc<SiteTree>> {
        self.sites_tree.get_or_try_init(|| {
            let locations = self.locations()?;
            let paths: Vec<String> = locations
                .unique("site")?
                .into_iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect();
            Ok(SiteTree::from_paths(&self.name, &paths))
        })
    }

    pub fn encoder(&self) -> Result<Arc<UmapModel>> {
        self.encoder
            .get_or_try_init(|| Ok(UmapModel::load(&self.root.join(UMAP_DIR))?))
    }

    /// Apply the persisted scaler + encoder to `rows`, adding `x` and `y`.
    pub fn umap(&self, rows: &TableView) -> Result<TableView> {
        Ok(self.encoder()?.project(rows, self.umap_batch_size)?)
    }

    /// Unique values and numeric bounds of every option-bearing column.
    pub fn column_profile(&self) -> Result<Arc<ColumnProfile>> {
        self.profile
            .get_or_try_init(|| crate::options::profile_dataset(self))
    }

    /// Dataset-scoped species selection; empty when never saved.
    pub fn species_list(&self) -> Result<Arc<Vec<String>>> {
        let mut guard = self.species_list.lock();
        if let Some(list) = guard.as_ref() {
            return Ok(Arc::clone(list));
        }
        let path = self.root.join(SPECIES_LIST);
        let list = match store::read_table(&path, Some(&["scientific_name"])) {
            Ok(table) => {
                let col = table.column("scientific_name")?;
                (0..table.num_rows())
                    .filter_map(|i| col.str_at(i).map(str::to_string))
                    .collect()
            }
            Err(StorageError::NotFound(_)) => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        let list = Arc::new(list);
        *guard = Some(Arc::clone(&list));
        Ok(list)
    }

    pub fn set_species_list(&self, species: Vec<String>) -> Result<Arc<Vec<String>>> {
        let mut guard = self.species_list.lock();
        let table = TableView::new(vec![(
            "scientific_name".to_string(),
            Column::Utf8(species.iter().cloned().map(Some).collect()),
        )])?;
        store::write_table(&self.root.join(SPECIES_LIST), &table)?;
        let list = Arc::new(species);
        *guard = Some(Arc::clone(&list));
        log::info!("{}: saved species list ({} entries)", self.name, list.len());
        Ok(list)
    }

    /// Treat a missing optional table as absent.
    fn optional<T>(&self, result: Result<Arc<T>>) -> Result<Option<Arc<T>>> {
        match result {
            Ok(t) => Ok(Some(t)),
            Err(DatasetError::Storage(StorageError::NotFound(path))) => {
                log::debug!("{}: optional table {} not present", self.name, path.display());
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}
