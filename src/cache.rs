//! Version-counter-keyed memoization of derived artifacts (component C2, cache
//! half). Keys carry which logical artifact they were computed from; entries are
//! invalidated lazily by comparing against the artifact's current version counter
//! on the next read, rather than being proactively evicted on write.

use std::{any::Any, collections::HashMap, sync::Arc};

use parking_lot::Mutex;

use crate::element::MajorAxis;

/// Discriminates the derived value a cache entry memoizes.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum DataKey {
    ScalarNames,
    AxisNames,
    AxisEntries(String),
    VectorNames(String),
    Vector(String, String),
    MatrixNames(String, String),
    Matrix(String, String, String, MajorAxisKey),
}

/// [`MajorAxis`] mirrored as a hashable key (the original is not `Hash`-derived to
/// keep it a plain value type used pervasively outside of caching).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MajorAxisKey {
    Row,
    Column,
}

impl From<MajorAxis> for MajorAxisKey {
    fn from(value: MajorAxis) -> Self {
        match value {
            MajorAxis::Row => MajorAxisKey::Row,
            MajorAxis::Column => MajorAxisKey::Column,
        }
    }
}

struct CacheEntry {
    version: u32,
    value: Arc<dyn Any + Send + Sync>,
}

/// A process-thread-safe memoization table, one per dataset.
#[derive(Default)]
pub struct Cache {
    entries: Mutex<HashMap<DataKey, CacheEntry>>,
}

impl Cache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached value for `key` if present and still at `current_version`,
    /// otherwise computes it with `compute`, stores it, and returns it.
    pub fn get_or_compute<T, F>(&self, key: DataKey, current_version: u32, compute: F) -> Arc<T>
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> T,
    {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get(&key) {
            if entry.version == current_version {
                if let Ok(value) = Arc::clone(&entry.value).downcast::<T>() {
                    return value;
                }
            }
        }
        let value: Arc<T> = Arc::new(compute());
        entries.insert(
            key,
            CacheEntry {
                version: current_version,
                value: Arc::clone(&value) as Arc<dyn Any + Send + Sync>,
            },
        );
        value
    }

    /// Drops the cached entry for `key`, if any. Mutations don't need to call this
    /// directly in the common path: bumping the artifact's version counter already
    /// makes the next `get_or_compute` recompute. It exists for callers (e.g. axis
    /// deletion) that want to reclaim memory for artifacts that will never be read
    /// again under the old key.
    pub fn invalidate(&self, key: &DataKey) {
        self.entries.lock().remove(key);
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[test]
    fn recomputes_only_when_version_changes() {
        let cache = Cache::new();
        let calls = AtomicU32::new(0);
        let key = DataKey::AxisNames;

        let v1 = cache.get_or_compute(key.clone(), 1, || {
            calls.fetch_add(1, Ordering::SeqCst);
            vec!["a".to_string()]
        });
        let v2 = cache.get_or_compute(key.clone(), 1, || {
            calls.fetch_add(1, Ordering::SeqCst);
            vec!["b".to_string()]
        });
        assert_eq!(*v1, *v2);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let v3 = cache.get_or_compute(key, 2, || {
            calls.fetch_add(1, Ordering::SeqCst);
            vec!["c".to_string()]
        });
        assert_eq!(*v3, vec!["c".to_string()]);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn invalidate_forces_recompute_even_at_same_version() {
        let cache = Cache::new();
        let key = DataKey::ScalarNames;
        let _ = cache.get_or_compute(key.clone(), 1, || 10u32);
        cache.invalidate(&key);
        let calls = AtomicU32::new(0);
        let v = cache.get_or_compute(key, 1, || {
            calls.fetch_add(1, Ordering::SeqCst);
            11u32
        });
        assert_eq!(*v, 11);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
