//! Content-addressed view cache: a bounded in-memory LRU per view family,
//! single-flight computation per key, and optional parquet spill on disk.

use std::collections::HashMap;
use std::fmt;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use lru::LruCache;
use parking_lot::{Condvar, Mutex};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::store::{self, StorageError, TableView};

pub const DEFAULT_CAPACITY: usize = 10;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("View computation failed: {0}")]
    Compute(String),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Identity of a cached view: dataset, view name, and canonicalised arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct ViewKey {
    dataset: String,
    view: String,
    args: serde_json::Map<String, serde_json::Value>,
}

impl ViewKey {
    pub fn new(dataset: &str, view: &str) -> Self {
        Self {
            dataset: dataset.to_string(),
            view: view.to_string(),
            args: serde_json::Map::new(),
        }
    }

    /// An argument whose order matters.
    pub fn arg(mut self, name: &str, value: impl Into<serde_json::Value>) -> Self {
        self.args.insert(name.to_string(), value.into());
        self
    }

    /// A list argument whose order is irrelevant; its items are sorted.
    pub fn set_arg<T: Into<serde_json::Value>>(mut self, name: &str, items: impl IntoIterator<Item = T>) -> Self {
        let mut items: Vec<(String, serde_json::Value)> = items
            .into_iter()
            .map(|v| {
                let v = v.into();
                (v.to_string(), v)
            })
            .collect();
        items.sort_by(|a, b| a.0.cmp(&b.0));
        self.args.insert(
            name.to_string(),
            serde_json::Value::Array(items.into_iter().map(|(_, v)| v).collect()),
        );
        self
    }

    pub fn view(&self) -> &str {
        &self.view
    }

    pub fn dataset(&self) -> &str {
        &self.dataset
    }

    /// Canonical serialisation: compact JSON with object keys sorted at every
    /// level, whatever order the map iterates in.
    pub fn canonical(&self) -> String {
        let key = serde_json::json!({
            "dataset": self.dataset,
            "view": self.view,
            "args": self.args,
        });
        let mut out = String::new();
        write_canonical(&key, &mut out);
        out
    }

    /// Hex SHA-256 of the canonical form.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.canonical().as_bytes());
        format!("{:x}", hasher.finalize())
    }

    pub fn spill_path(&self, dir: &Path) -> PathBuf {
        dir.join(format!("{}_{}.parquet", self.view, self.digest()))
    }
}

fn write_canonical(value: &serde_json::Value, out: &mut String) {
    match value {
        serde_json::Value::Object(map) => {
            let mut entries: Vec<(&String, &serde_json::Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (k, v)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::Value::from(k.as_str()).to_string());
                out.push(':');
                write_canonical(v, out);
            }
            out.push('}');
        }
        serde_json::Value::Array(items) => {
            out.push('[');
            for (i, v) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(v, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

impl fmt::Display for ViewKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.dataset, self.view)
    }
}

/// Where a computed view is kept besides memory.
#[derive(Debug, Clone, Copy)]
pub enum Spill<'a> {
    Memory,
    /// Persist under this directory (typically `<dataset>/views`).
    Disk(&'a Path),
}

type Outcome = Result<Arc<TableView>, String>;

/// Completion signal for one in-flight computation.
#[derive(Default)]
struct Flight {
    outcome: Mutex<Option<Outcome>>,
    done: Condvar,
}

impl Flight {
    fn finish(&self, outcome: Outcome) {
        *self.outcome.lock() = Some(outcome);
        self.done.notify_all();
    }

    fn wait(&self) -> Outcome {
        let mut outcome = self.outcome.lock();
        loop {
            if let Some(o) = outcome.as_ref() {
                return o.clone();
            }
            self.done.wait(&mut outcome);
        }
    }
}

#[derive(Default)]
struct State {
    families: HashMap<String, LruCache<String, Arc<TableView>>>,
    in_flight: HashMap<String, Arc<Flight>>,
}

pub struct ViewCache {
    capacity: NonZeroUsize,
    state: Mutex<State>,
}

impl fmt::Debug for ViewCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ViewCache")
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}

impl Default for ViewCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

/// Publishes the leader's outcome and clears the in-flight entry, also when
/// the computation unwinds.
struct Leader<'a> {
    cache: &'a ViewCache,
    key: &'a ViewKey,
    digest: String,
    flight: Arc<Flight>,
    outcome: Option<Outcome>,
}

impl Drop for Leader<'_> {
    fn drop(&mut self) {
        let outcome = self
            .outcome
            .take()
            .unwrap_or_else(|| Err(format!("computation of {} panicked", self.key)));
        {
            let mut state = self.cache.state.lock();
            state.in_flight.remove(&self.digest);
            if let Ok(table) = &outcome {
                let capacity = self.cache.capacity;
                state
                    .families
                    .entry(self.key.view.clone())
                    .or_insert_with(|| LruCache::new(capacity))
                    .put(self.digest.clone(), Arc::clone(table));
            }
        }
        self.flight.finish(outcome);
    }
}

impl ViewCache {
    /// `capacity` items per view family; 0 is treated as 1.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN),
            state: Mutex::new(State::default()),
        }
    }

    /// Number of views held in memory for a family.
    pub fn len(&self, view: &str) -> usize {
        self.state.lock().families.get(view).map_or(0, |f| f.len())
    }

    pub fn clear(&self) {
        self.state.lock().families.clear();
    }

    /// Return the cached view for `key`, computing it at most once across
    /// concurrent callers. A failed computation is reported to every waiter
    /// and nothing is cached.
    pub fn get_or_compute<E, F>(&self, key: &ViewKey, spill: Spill<'_>, compute: F) -> Result<Arc<TableView>, E>
    where
        F: FnOnce() -> Result<TableView, E>,
        E: From<CacheError> + fmt::Display,
    {
        let digest = key.digest();
        let flight = {
            let mut state = self.state.lock();
            if let Some(hit) = state.families.get_mut(&key.view).and_then(|f| f.get(&digest)) {
                log::debug!("cache hit {key} {}", &digest[..12]);
                return Ok(Arc::clone(hit));
            }
            if let Some(flight) = state.in_flight.get(&digest) {
                let flight = Arc::clone(flight);
                drop(state);
                log::debug!("cache wait {key} {}", &digest[..12]);
                return flight
                    .wait()
                    .map_err(|msg| E::from(CacheError::Compute(msg)));
            }
            let flight = Arc::new(Flight::default());
            state.in_flight.insert(digest.clone(), Arc::clone(&flight));
            flight
        };

        let mut leader = Leader {
            cache: self,
            key,
            digest,
            flight,
            outcome: None,
        };
        let result = Self::load_or_compute(key, &leader.digest, spill, compute).map(Arc::new);
        leader.outcome = Some(match &result {
            Ok(table) => Ok(Arc::clone(table)),
            Err(e) => Err(e.to_string()),
        });
        result
    }

    fn load_or_compute<E, F>(key: &ViewKey, digest: &str, spill: Spill<'_>, compute: F) -> Result<TableView, E>
    where
        F: FnOnce() -> Result<TableView, E>,
        E: From<CacheError>,
    {
        let Spill::Disk(dir) = spill else {
            log::debug!("cache miss {key} {}", &digest[..12]);
            return compute();
        };
        let path = key.spill_path(dir);
        if path.is_file() {
            match store::read_table(&path, None) {
                Ok(table) => {
                    log::debug!("cache disk hit {}", path.display());
                    return Ok(table);
                }
                Err(e) => {
                    log::warn!("Discarding unreadable view {}: {e}", path.display());
                    if let Err(e) = std::fs::remove_file(&path) {
                        log::warn!("Failed to remove {}: {e}", path.display());
                    }
                }
            }
        }
        log::debug!("cache miss {key} {}", &digest[..12]);
        let table = compute()?;
        store::write_table(&path, &table).map_err(CacheError::from)?;
        log::debug!("cache spilled {}", path.display());
        Ok(table)
    }
}
