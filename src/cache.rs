//! Explicit caching of derived layers, keyed by the parameters that
//! produced them.
//!
//! The cache never computes or invalidates on its own: a changed parameter
//! is a different key, and discarding stale entries is the caller's job.

use dashmap::DashMap;
use ordered_float::OrderedFloat;
use std::hash::Hash;
use std::sync::Arc;

/// Cache key for a hex-grid layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HexKey {
    pub resolution: u8,
}

/// Cache key for a density-cluster layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClusterKey {
    pub eps_distance: OrderedFloat<f64>,
    pub min_samples: usize,
}

impl ClusterKey {
    pub fn new(eps_distance: f64, min_samples: usize) -> Self {
        Self {
            eps_distance: OrderedFloat(eps_distance),
            min_samples,
        }
    }
}

/// Cache key for a proximity-link layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LinkKey {
    pub max_distance_km: OrderedFloat<f64>,
}

impl LinkKey {
    pub fn new(max_distance_km: f64) -> Self {
        Self {
            max_distance_km: OrderedFloat(max_distance_km),
        }
    }
}

/// A concurrent map from parameter key to a shared, immutable result.
pub struct LayerCache<K, V> {
    entries: DashMap<K, Arc<V>>,
}

impl<K: Eq + Hash, V> LayerCache<K, V> {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    pub fn insert(&self, key: K, value: V) -> Arc<V> {
        let value = Arc::new(value);
        self.entries.insert(key, value.clone());
        value
    }

    pub fn get(&self, key: &K) -> Option<Arc<V>> {
        self.entries.get(key).map(|entry| entry.value().clone())
    }

    pub fn invalidate(&self, key: &K) -> bool {
        self.entries.remove(key).is_some()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K: Eq + Hash, V> Default for LayerCache<K, V> {
    fn default() -> Self {
        Self::new()
    }
}
