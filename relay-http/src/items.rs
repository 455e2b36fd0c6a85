//! Per-call item bag shared across recursive re-entries.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::value::Dynamic;

/// String-keyed bag of values created once per top-level call.
///
/// Cloning an `Items` yields another handle to the same bag; nested calls
/// started through `recursive_result` see every entry their parent wrote.
#[derive(Clone, Default)]
pub struct Items {
    inner: Arc<Mutex<HashMap<String, Dynamic>>>,
}

impl Items {
    /// Create an empty bag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a value, returning the previous one.
    pub fn insert<T: Any + Send + Sync>(&self, key: impl Into<String>, value: T) -> Option<Dynamic> {
        self.inner.lock().insert(key.into(), Dynamic::new(value))
    }

    /// Get a typed copy of a value.
    pub fn get<T: Any + Clone>(&self, key: &str) -> Option<T> {
        self.inner.lock().get(key).and_then(|value| value.downcast::<T>())
    }

    /// Get the erased value.
    pub fn get_dynamic(&self, key: &str) -> Option<Dynamic> {
        self.inner.lock().get(key).cloned()
    }

    /// Read-modify-write a typed value under a single lock.
    ///
    /// A missing or differently typed entry starts from `T::default()`.
    pub fn update<T, F>(&self, key: &str, f: F) -> T
    where
        T: Any + Clone + Default + Send + Sync,
        F: FnOnce(&mut T),
    {
        let mut map = self.inner.lock();
        let mut value = map
            .get(key)
            .and_then(|value| value.downcast::<T>())
            .unwrap_or_default();
        f(&mut value);
        map.insert(key.to_string(), Dynamic::new(value.clone()));
        value
    }

    /// Remove a value.
    pub fn remove(&self, key: &str) -> Option<Dynamic> {
        self.inner.lock().remove(key)
    }

    /// Whether a key is present.
    pub fn contains_key(&self, key: &str) -> bool {
        self.inner.lock().contains_key(key)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Whether the bag is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Snapshot of the keys.
    pub fn keys(&self) -> Vec<String> {
        self.inner.lock().keys().cloned().collect()
    }
}

impl fmt::Debug for Items {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.inner.lock().iter()).finish()
    }
}
