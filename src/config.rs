use std::path::PathBuf;

use directories::ProjectDirs;
use serde::Deserialize;

use crate::catalogue::CatalogueOptions;

/// Application configuration loaded from TOML config file.
/// Every field has a default; the config file is optional.
#[derive(Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    /// Directory holding one subdirectory per dataset (overrides XDG default).
    pub data_root: Option<PathBuf>,
    /// In-memory views kept per view family.
    pub cache_capacity: usize,
    /// Number of parallel workers. 0 = auto-detect (cores / 2, min 1).
    pub workers: usize,
    /// Rows per parallel UMAP encoder batch.
    pub umap_batch_size: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            data_root: None,
            cache_capacity: crate::cache::DEFAULT_CAPACITY,
            workers: 0,
            umap_batch_size: crate::umap::DEFAULT_BATCH_SIZE,
        }
    }
}

impl AppConfig {
    /// Load config from `~/.config/soundscape/config.toml`.
    /// Returns default config if file doesn't exist.
    /// Logs a warning if the file exists but can't be parsed.
    pub fn load() -> Self {
        match Self::config_path() {
            Some(path) if path.exists() => match std::fs::read_to_string(&path) {
                Ok(contents) => match Self::parse(&contents) {
                    Ok(config) => {
                        log::info!("Loaded config from {}", path.display());
                        config
                    }
                    Err(e) => {
                        log::warn!("Failed to parse {}: {}. Using defaults.", path.display(), e);
                        Self::default()
                    }
                },
                Err(e) => {
                    log::warn!("Failed to read {}: {}. Using defaults.", path.display(), e);
                    Self::default()
                }
            },
            _ => {
                log::debug!("No config file found, using defaults");
                Self::default()
            }
        }
    }

    pub fn parse(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    /// Resolve worker count: 0 → auto-detect (cores / 2, min 1).
    pub fn resolve_workers(&self) -> usize {
        if self.workers > 0 {
            self.workers
        } else {
            let cores = std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(2);
            (cores / 2).max(1)
        }
    }

    /// Dataset root: CLI flag > config `data_root` > XDG default.
    pub fn resolve_root(&self, cli: Option<PathBuf>) -> PathBuf {
        cli.or_else(|| self.data_root.clone())
            .unwrap_or_else(default_data_root)
    }

    pub fn catalogue_options(&self) -> CatalogueOptions {
        CatalogueOptions {
            cache_capacity: self.cache_capacity,
            umap_batch_size: self.umap_batch_size,
        }
    }

    fn config_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", crate::APP_NAME)
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }
}

/// `<XDG data dir>/soundscape/datasets`.
pub fn default_data_root() -> PathBuf {
    if let Some(dirs) = ProjectDirs::from("", "", crate::APP_NAME) {
        dirs.data_dir().join("datasets")
    } else {
        // Fallback: current directory
        PathBuf::from("datasets")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        assert_eq!(AppConfig::parse("").unwrap(), AppConfig::default());
        assert_eq!(AppConfig::default().cache_capacity, 10);
    }

    #[test]
    fn test_partial_config() {
        let config = AppConfig::parse("data_root = \"/srv/data\"\nworkers = 3\n").unwrap();
        assert_eq!(config.data_root, Some(PathBuf::from("/srv/data")));
        assert_eq!(config.resolve_workers(), 3);
        assert_eq!(config.umap_batch_size, crate::umap::DEFAULT_BATCH_SIZE);
    }

    #[test]
    fn test_root_resolution_order() {
        let config = AppConfig::parse("data_root = \"/srv/data\"").unwrap();
        assert_eq!(config.resolve_root(Some("/cli".into())), PathBuf::from("/cli"));
        assert_eq!(config.resolve_root(None), PathBuf::from("/srv/data"));
        assert!(AppConfig::default().resolve_root(None).ends_with("datasets"));
    }

    #[test]
    fn test_auto_workers_at_least_one() {
        assert!(AppConfig::default().resolve_workers() >= 1);
    }
}
