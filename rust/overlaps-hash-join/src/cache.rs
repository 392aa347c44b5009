// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use log::debug;
use parking_lot::Mutex;

use crate::bucket::{BucketSize, TupleCountEstimate};
use crate::hash_table::OverlapsHashTable;
use crate::key::{HashTableKey, TuningParamsKey};

/// Default number of entries a [HashTableCache] holds
pub const DEFAULT_CACHE_CAPACITY: usize = 256;

/// Result of auto tuning a shape, reused to skip tuning on later builds
#[derive(Debug, Clone, PartialEq)]
pub struct TunedParameters {
    pub bucket_threshold: f64,
    pub bucket_size: BucketSize,
    pub estimate: TupleCountEstimate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum CacheKey {
    HashTable(HashTableKey),
    TuningParams(TuningParamsKey),
}

#[derive(Debug, Clone)]
enum CacheValue {
    HashTable(Arc<OverlapsHashTable>),
    TuningParams(TunedParameters),
}

impl CacheValue {
    /// Tables still referenced outside the cache are never evicted
    fn is_evictable(&self) -> bool {
        match self {
            CacheValue::HashTable(table) => Arc::strong_count(table) == 1,
            CacheValue::TuningParams(_) => true,
        }
    }
}

#[derive(Debug)]
struct CacheEntry {
    value: CacheValue,
    last_access: u64,
}

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<CacheKey, CacheEntry>,
    clock: u64,
}

impl CacheState {
    fn get(&mut self, key: &CacheKey) -> Option<CacheValue> {
        self.clock += 1;
        let clock = self.clock;
        self.entries.get_mut(key).map(|entry| {
            entry.last_access = clock;
            entry.value.clone()
        })
    }

    /// Insert `value` unless `key` is present; returns the value held afterwards
    fn insert(&mut self, key: CacheKey, value: CacheValue) -> CacheValue {
        self.clock += 1;
        let clock = self.clock;
        let entry = self.entries.entry(key).or_insert(CacheEntry {
            value,
            last_access: clock,
        });
        entry.last_access = clock;
        entry.value.clone()
    }

    fn evict(&mut self, capacity: usize) {
        while self.entries.len() > capacity {
            let victim = self
                .entries
                .iter()
                .filter(|(_, entry)| entry.value.is_evictable())
                .min_by_key(|(_, entry)| entry.last_access)
                .map(|(key, _)| *key);
            match victim {
                Some(key) => {
                    debug!("Evicting {key:?} from the overlaps hash table cache");
                    self.entries.remove(&key);
                }
                None => break,
            }
        }
    }
}

/// Process-wide cache of overlaps hash tables and auto tuning results.
///
/// Lookups and inserts are serialized by one lock, builds happen outside of it. When two
/// builds of the same key race, the first insert wins and both callers end up with the
/// winner's table.
#[derive(Debug)]
pub struct HashTableCache {
    capacity: usize,
    state: Mutex<CacheState>,
}

impl Default for HashTableCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_CAPACITY)
    }
}

impl HashTableCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            state: Mutex::new(CacheState::default()),
        }
    }

    /// The cache shared by all builds of this process
    pub fn global() -> Arc<HashTableCache> {
        static GLOBAL: OnceLock<Arc<HashTableCache>> = OnceLock::new();
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(HashTableCache::default())))
    }

    pub fn lookup(&self, key: &HashTableKey) -> Option<Arc<OverlapsHashTable>> {
        match self.state.lock().get(&CacheKey::HashTable(*key)) {
            Some(CacheValue::HashTable(table)) => Some(table),
            _ => None,
        }
    }

    /// Insert a table unless one is already cached under `key`, and return the cached one
    pub fn insert(
        &self,
        key: HashTableKey,
        table: Arc<OverlapsHashTable>,
    ) -> Arc<OverlapsHashTable> {
        let mut state = self.state.lock();
        let value = state.insert(
            CacheKey::HashTable(key),
            CacheValue::HashTable(Arc::clone(&table)),
        );
        state.evict(self.capacity);
        match value {
            CacheValue::HashTable(winner) => winner,
            // Hash table keys only ever map to hash tables
            CacheValue::TuningParams(_) => table,
        }
    }

    pub fn lookup_tuned_parameters(&self, key: &TuningParamsKey) -> Option<TunedParameters> {
        match self.state.lock().get(&CacheKey::TuningParams(*key)) {
            Some(CacheValue::TuningParams(params)) => Some(params),
            _ => None,
        }
    }

    /// Record tuning parameters unless some are already cached under `key`
    pub fn insert_tuned_parameters(&self, key: TuningParamsKey, params: TunedParameters) {
        let mut state = self.state.lock();
        state.insert(CacheKey::TuningParams(key), CacheValue::TuningParams(params));
        state.evict(self.capacity);
    }

    /// Number of cached hash tables and tuning results
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of cached hash tables only
    pub fn hash_table_count(&self) -> usize {
        self.state
            .lock()
            .entries
            .keys()
            .filter(|key| matches!(key, CacheKey::HashTable(_)))
            .count()
    }

    /// Drop every entry. Tables still in use stay alive until their last handle is dropped.
    pub fn clear(&self) {
        self.state.lock().entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash_table::HashLayout;
    use crate::join_condition::{ColumnRef, OverlapsPredicate};
    use crate::columns::{DevicePlacement, MemoryTier};
    use crate::key::JoinShape;

    const CPU: DevicePlacement = DevicePlacement {
        tier: MemoryTier::Cpu,
        device_count: 1,
    };

    fn shape() -> JoinShape {
        JoinShape {
            build_column: ColumnRef::new(1, 1),
            probe_column: ColumnRef::new(2, 1),
            predicate: OverlapsPredicate::Intersects,
        }
    }

    fn table(threshold: f64) -> Arc<OverlapsHashTable> {
        Arc::new(OverlapsHashTable::new(
            HashLayout::ManyToMany,
            BucketSize::unbounded(),
            TupleCountEstimate::default(),
            threshold,
            1024,
            vec![],
        ))
    }

    fn params(threshold: f64) -> TunedParameters {
        TunedParameters {
            bucket_threshold: threshold,
            bucket_size: BucketSize::new([2.0, 2.0]),
            estimate: TupleCountEstimate::new(8, 7),
        }
    }

    #[test]
    fn test_first_insert_wins() {
        let cache = HashTableCache::new(8);
        let key = HashTableKey::new(shape(), CPU, 0.1, 1024);
        let first = table(0.1);
        let second = table(0.1);

        let winner = cache.insert(key, Arc::clone(&first));
        assert!(Arc::ptr_eq(&winner, &first));
        let winner = cache.insert(key, Arc::clone(&second));
        assert!(Arc::ptr_eq(&winner, &first));
        assert!(Arc::ptr_eq(&cache.lookup(&key).unwrap(), &first));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_tuned_parameters_share_the_cache() {
        let cache = HashTableCache::new(8);
        let params_key = TuningParamsKey {
            shape: shape(),
            placement: CPU,
            max_size_bytes: 1024,
        };
        assert_eq!(cache.lookup_tuned_parameters(&params_key), None);
        cache.insert_tuned_parameters(params_key, params(0.01));
        cache.insert_tuned_parameters(params_key, params(0.5));
        assert_eq!(cache.lookup_tuned_parameters(&params_key), Some(params(0.01)));

        cache.insert(HashTableKey::new(shape(), CPU, 0.01, 1024), table(0.01));
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.hash_table_count(), 1);
        assert!(cache
            .lookup(&HashTableKey::new(shape(), CPU, 0.01, 2048))
            .is_none());

        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.lookup_tuned_parameters(&params_key), None);
    }

    #[test]
    fn test_eviction_skips_tables_in_use() {
        let cache = HashTableCache::new(2);
        let key = |t: f64| HashTableKey::new(shape(), CPU, t, 1024);

        let in_use = cache.insert(key(0.1), table(0.1));
        cache.insert(key(0.2), table(0.2));
        // Touch 0.2 so that 0.1 is the least recently used entry
        assert!(cache.lookup(&key(0.2)).is_some());
        cache.insert(key(0.3), table(0.3));

        assert_eq!(cache.len(), 2);
        assert!(cache.lookup(&key(0.1)).is_some());
        assert!(cache.lookup(&key(0.2)).is_none());
        assert!(cache.lookup(&key(0.3)).is_some());

        drop(in_use);
        cache.insert(key(0.4), table(0.4));
        assert_eq!(cache.len(), 2);
        assert!(cache.lookup(&key(0.4)).is_some());
    }

    #[test]
    fn test_global_cache_is_shared() {
        assert!(Arc::ptr_eq(
            &HashTableCache::global(),
            &HashTableCache::global()
        ));
    }
}
