//! Discovery of datasets under a root directory.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use walkdir::WalkDir;

use crate::cache::{DEFAULT_CAPACITY, ViewCache};
use crate::dataset::{self, Dataset, SharedSpecies};
use crate::umap;

#[derive(Error, Debug)]
pub enum CatalogueError {
    #[error("No dataset could be loaded from {}", .0.display())]
    Empty(PathBuf),
    #[error("Dataset root does not exist: {}", .0.display())]
    RootMissing(PathBuf),
    #[error("Walk error: {0}")]
    Walk(#[from] walkdir::Error),
}

#[derive(Debug, Clone, Copy)]
pub struct CatalogueOptions {
    /// In-memory views kept per view family.
    pub cache_capacity: usize,
    pub umap_batch_size: usize,
}

impl Default for CatalogueOptions {
    fn default() -> Self {
        Self {
            cache_capacity: DEFAULT_CAPACITY,
            umap_batch_size: umap::DEFAULT_BATCH_SIZE,
        }
    }
}

/// Every dataset found under one root, plus the state they share.
#[derive(Debug)]
pub struct Catalogue {
    root: PathBuf,
    datasets: Vec<Arc<Dataset>>,
    species: Arc<SharedSpecies>,
    cache: ViewCache,
}

impl Catalogue {
    /// Load every immediate subdirectory that holds a sidecar and the required
    /// tables. Directories that fail to load are logged and skipped.
    pub fn discover(root: &Path, options: CatalogueOptions) -> Result<Self, CatalogueError> {
        if !root.is_dir() {
            return Err(CatalogueError::RootMissing(root.to_path_buf()));
        }
        let species = Arc::new(SharedSpecies::new(root));
        let mut datasets: Vec<Arc<Dataset>> = Vec::new();

        let entries = WalkDir::new(root)
            .min_depth(1)
            .max_depth(1)
            .sort_by_file_name()
            .into_iter();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type().is_dir() {
                continue;
            }
            let dir = entry.path();
            if let Some(missing) = missing_file(dir) {
                log::warn!("Skipping {}: missing {missing}", dir.display());
                continue;
            }
            match Dataset::open(dir, Arc::clone(&species), options.umap_batch_size) {
                Ok(ds) if datasets.iter().any(|d| d.name() == ds.name()) => {
                    log::warn!(
                        "Skipping {}: dataset name {} already loaded",
                        dir.display(),
                        ds.name()
                    );
                }
                Ok(ds) => {
                    log::info!("Loaded dataset {} from {}", ds.name(), dir.display());
                    datasets.push(Arc::new(ds));
                }
                Err(e) => log::warn!("Skipping {}: {e}", dir.display()),
            }
        }

        log::info!("Catalogue at {}: {} datasets", root.display(), datasets.len());
        Ok(Self {
            root: root.to_path_buf(),
            datasets,
            species,
            cache: ViewCache::new(options.cache_capacity),
        })
    }

    /// `discover`, failing when nothing could be loaded.
    pub fn open(root: &Path, options: CatalogueOptions) -> Result<Self, CatalogueError> {
        let catalogue = Self::discover(root, options)?;
        if catalogue.is_empty() {
            return Err(CatalogueError::Empty(root.to_path_buf()));
        }
        Ok(catalogue)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Dataset names, alphabetically.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.datasets.iter().map(|d| d.name().to_string()).collect();
        names.sort();
        names
    }

    pub fn get(&self, name: &str) -> Option<&Arc<Dataset>> {
        self.datasets.iter().find(|d| d.name() == name)
    }

    /// Datasets in discovery order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Dataset>> {
        self.datasets.iter()
    }

    pub fn len(&self) -> usize {
        self.datasets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.datasets.is_empty()
    }

    pub fn cache(&self) -> &ViewCache {
        &self.cache
    }

    pub fn species(&self) -> &Arc<SharedSpecies> {
        &self.species
    }
}

fn missing_file(dir: &Path) -> Option<&'static str> {
    std::iter::once(dataset::CONFIG_FILE)
        .chain(dataset::REQUIRED_TABLES.iter().copied())
        .find(|f| !dir.join(f).exists())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_dataset(root: &Path, dir: &str, name: &str) {
        let path = root.join(dir);
        std::fs::create_dir_all(&path).unwrap();
        std::fs::write(
            path.join(dataset::CONFIG_FILE),
            format!("[Dataset]\nname = {name}\naudio_path = /a\n"),
        )
        .unwrap();
        for table in dataset::REQUIRED_TABLES {
            std::fs::write(path.join(table), b"").unwrap();
        }
    }

    #[test]
    fn test_empty_root() {
        let dir = tempfile::tempdir().unwrap();
        let cat = Catalogue::discover(dir.path(), CatalogueOptions::default()).unwrap();
        assert!(cat.is_empty());
        assert!(cat.names().is_empty());
        assert!(matches!(
            Catalogue::open(dir.path(), CatalogueOptions::default()),
            Err(CatalogueError::Empty(_))
        ));
    }

    #[test]
    fn test_missing_root() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            Catalogue::discover(&dir.path().join("nope"), CatalogueOptions::default()),
            Err(CatalogueError::RootMissing(_))
        ));
    }

    #[test]
    fn test_discovery_skips_incomplete_directories() {
        let dir = tempfile::tempdir().unwrap();
        make_dataset(dir.path(), "b_dir", "Beta");
        make_dataset(dir.path(), "a_dir", "Alpha");
        make_dataset(dir.path(), "c_dir", "Alpha");
        std::fs::create_dir(dir.path().join("no_config")).unwrap();
        std::fs::write(dir.path().join("stray.txt"), b"x").unwrap();
        let broken = dir.path().join("broken");
        std::fs::create_dir(&broken).unwrap();
        std::fs::write(broken.join(dataset::CONFIG_FILE), "[Dataset\nname = broken\n").unwrap();
        for table in dataset::REQUIRED_TABLES {
            std::fs::write(broken.join(table), b"").unwrap();
        }

        let cat = Catalogue::open(dir.path(), CatalogueOptions::default()).unwrap();
        assert_eq!(cat.names(), vec!["Alpha", "Beta"]);
        let order: Vec<&str> = cat.iter().map(|d| d.name()).collect();
        assert_eq!(order, vec!["Alpha", "Beta"]);
        assert_eq!(cat.get("Alpha").unwrap().root(), dir.path().join("a_dir"));
        assert!(cat.get("Gamma").is_none());
    }
}
