pub mod cache;
pub mod catalogue;
pub mod config;
pub mod dataset;
pub mod filter;
pub mod options;
pub mod queries;
pub mod store;
pub mod umap;
pub mod views;
pub mod warm;

pub use catalogue::{Catalogue, CatalogueError, CatalogueOptions};
pub use queries::{Dispatcher, Payload, QueryError};

/// Application name for XDG paths
pub const APP_NAME: &str = "soundscape";
