//! Endpoint-name dispatch with uniform failure containment.
//!
//! Every UI request arrives as an endpoint name plus a JSON object of named
//! arguments. [`Dispatcher::dispatch`] never fails: any error (or panic)
//! inside a query is logged once and replaced by the caller's default.

pub mod endpoints;
pub mod registry;

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use thiserror::Error;

use crate::cache::CacheError;
use crate::catalogue::Catalogue;
use crate::dataset::DatasetError;
use crate::filter::FilterError;
use crate::store::StorageError;
use crate::umap::ModelError;
use crate::views::ViewError;

pub use registry::{QueryFn, endpoints, lookup};

/// Named arguments of one request.
pub type Payload = serde_json::Map<String, serde_json::Value>;

#[derive(Error, Debug)]
pub enum QueryError {
    #[error("Unknown endpoint: {0}")]
    UnknownEndpoint(String),
    #[error("Unknown dataset: {0}")]
    UnknownDataset(String),
    #[error("Invalid payload `{key}`: {reason}")]
    InvalidPayload { key: String, reason: String },
    #[error("Query panicked: {0}")]
    Panicked(String),
    #[error("Dataset error: {0}")]
    Dataset(#[from] DatasetError),
    #[error("Filter error: {0}")]
    Filter(#[from] FilterError),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Model error: {0}")]
    Model(#[from] ModelError),
    #[error("View error: {0}")]
    View(#[from] ViewError),
    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl QueryError {
    pub fn invalid(key: &str, reason: impl Into<String>) -> Self {
        Self::InvalidPayload {
            key: key.to_string(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, QueryError>;

/// Routes endpoint names to query functions over one catalogue.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    catalogue: Arc<Catalogue>,
}

impl Dispatcher {
    pub fn new(catalogue: Arc<Catalogue>) -> Self {
        Self { catalogue }
    }

    pub fn catalogue(&self) -> &Catalogue {
        &self.catalogue
    }

    /// Run `endpoint`, returning its typed error on failure.
    pub fn try_dispatch(&self, endpoint: &str, payload: &Payload) -> Result<serde_json::Value> {
        let query = lookup(endpoint).ok_or_else(|| QueryError::UnknownEndpoint(endpoint.to_string()))?;
        let catalogue = &*self.catalogue;
        panic::catch_unwind(AssertUnwindSafe(|| query(catalogue, payload)))
            .unwrap_or_else(|cause| Err(QueryError::Panicked(panic_message(cause.as_ref()))))
    }

    /// Run `endpoint`; on any failure log a warning and return `default`.
    pub fn dispatch(
        &self,
        endpoint: &str,
        default: serde_json::Value,
        payload: &Payload,
    ) -> serde_json::Value {
        match self.try_dispatch(endpoint, payload) {
            Ok(value) => value,
            Err(e) => {
                let keys: Vec<&str> = payload.keys().map(String::as_str).collect();
                log::warn!("endpoint={endpoint} keys=[{}] error={e}", keys.join(","));
                default
            }
        }
    }
}

fn panic_message(cause: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = cause.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = cause.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalogue::CatalogueOptions;
    use serde_json::json;

    fn dispatcher() -> (tempfile::TempDir, Dispatcher) {
        let dir = tempfile::tempdir().unwrap();
        let cat = Catalogue::discover(dir.path(), CatalogueOptions::default()).unwrap();
        (dir, Dispatcher::new(Arc::new(cat)))
    }

    #[test]
    fn test_fetch_datasets_on_empty_root() {
        let (_dir, d) = dispatcher();
        assert_eq!(d.dispatch("fetch_datasets", json!(null), &Payload::new()), json!([]));
    }

    #[test]
    fn test_unknown_endpoint_returns_default() {
        let (_dir, d) = dispatcher();
        assert!(matches!(
            d.try_dispatch("fetch_everything", &Payload::new()),
            Err(QueryError::UnknownEndpoint(_))
        ));
        assert_eq!(d.dispatch("fetch_everything", json!({"x": 1}), &Payload::new()), json!({"x": 1}));
    }

    #[test]
    fn test_every_endpoint_contains_failure() {
        let (_dir, d) = dispatcher();
        let mut payload = Payload::new();
        payload.insert("dataset_name".into(), json!("missing"));
        for endpoint in endpoints() {
            if endpoint == "fetch_datasets" {
                continue;
            }
            assert_eq!(
                d.dispatch(endpoint, json!("fallback"), &payload),
                json!("fallback"),
                "{endpoint}"
            );
        }
    }

    #[test]
    fn test_panic_message() {
        let cause = std::panic::catch_unwind(|| panic!("boom")).unwrap_err();
        assert_eq!(panic_message(cause.as_ref()), "boom");
    }
}
