use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;

/// A lazily computed, immutable value with single-flight initialisation.
///
/// Once filled, reads are lock-free. Concurrent first accesses serialise on the
/// init mutex so the computation runs once; the losers observe the winner's
/// value. A failed computation leaves the slot empty and the next caller retries.
#[derive(Debug)]
pub struct Slot<T> {
    value: OnceLock<Arc<T>>,
    init: Mutex<()>,
}

impl<T> Default for Slot<T> {
    fn default() -> Self {
        Self {
            value: OnceLock::new(),
            init: Mutex::new(()),
        }
    }
}

impl<T> Slot<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Option<Arc<T>> {
        self.value.get().cloned()
    }

    pub fn is_filled(&self) -> bool {
        self.value.get().is_some()
    }

    pub fn get_or_try_init<E>(&self, init: impl FnOnce() -> Result<T, E>) -> Result<Arc<T>, E> {
        if let Some(v) = self.value.get() {
            return Ok(Arc::clone(v));
        }
        let _guard = self.init.lock();
        if let Some(v) = self.value.get() {
            return Ok(Arc::clone(v));
        }
        let v = Arc::new(init()?);
        // Cannot already be set: every writer holds `init`.
        let _ = self.value.set(Arc::clone(&v));
        Ok(v)
    }
}
