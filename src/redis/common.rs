use std::sync::Arc;

use dashmap::DashMap;

use crate::{Dimension, ResourceKey};

/// Builds and caches the Redis keys of each resource's ledgers.
///
/// Layout, with the resource wrapped in a hash tag so every key of one
/// resource lands in the same cluster slot:
///
/// - `<prefix>:{<resource>}:<dimension>:z` sorted set of record ids scored by slot time
/// - `<prefix>:{<resource>}:<dimension>:h` hash of record id to amount
/// - `<prefix>:{<resource>}:<dimension>:t` running total of the amounts hash
/// - `<prefix>:{<resource>}:r` hash of record id to status
/// - `<prefix>:{<resource>}:e` sorted set of record ids scored by expiry
#[derive(Debug)]
pub(crate) struct RedisKeyGenerator {
    pub prefix: ResourceKey,
    pub slots_key_suffix: String,
    pub amounts_key_suffix: String,
    pub totals_key_suffix: String,
    pub records_key_suffix: String,
    pub expiries_key_suffix: String,

    // caches
    slots_key_cache: DashMap<(ResourceKey, Dimension), Arc<str>>,
    amounts_key_cache: DashMap<(ResourceKey, Dimension), Arc<str>>,
    totals_key_cache: DashMap<(ResourceKey, Dimension), Arc<str>>,
    records_key_cache: DashMap<ResourceKey, Arc<str>>,
    expiries_key_cache: DashMap<ResourceKey, Arc<str>>,
}

impl RedisKeyGenerator {
    pub(crate) fn new(prefix: ResourceKey) -> Self {
        Self {
            prefix,
            slots_key_suffix: "z".to_string(),
            amounts_key_suffix: "h".to_string(),
            totals_key_suffix: "t".to_string(),
            records_key_suffix: "r".to_string(),
            expiries_key_suffix: "e".to_string(),
            slots_key_cache: DashMap::new(),
            amounts_key_cache: DashMap::new(),
            totals_key_cache: DashMap::new(),
            records_key_cache: DashMap::new(),
            expiries_key_cache: DashMap::new(),
        }
    }

    fn get_resource_key(&self, key: &ResourceKey, suffix: &str) -> String {
        format!("{}:{{{}}}:{}", self.prefix, key, suffix)
    }

    fn get_dimension_key(&self, key: &ResourceKey, dimension: Dimension, suffix: &str) -> String {
        format!("{}:{{{}}}:{}:{}", self.prefix, key, dimension, suffix)
    }

    pub(crate) fn get_slots_key(&self, key: &ResourceKey, dimension: Dimension) -> Arc<str> {
        let cache_key = (key.clone(), dimension);

        match self.slots_key_cache.get(&cache_key) {
            Some(value) => value.clone(),
            None => {
                let value: Arc<str> =
                    Arc::from(self.get_dimension_key(key, dimension, &self.slots_key_suffix));
                self.slots_key_cache.insert(cache_key, value.clone());

                value
            }
        }
    }

    pub(crate) fn get_amounts_key(&self, key: &ResourceKey, dimension: Dimension) -> Arc<str> {
        let cache_key = (key.clone(), dimension);

        match self.amounts_key_cache.get(&cache_key) {
            Some(value) => value.clone(),
            None => {
                let value: Arc<str> =
                    Arc::from(self.get_dimension_key(key, dimension, &self.amounts_key_suffix));
                self.amounts_key_cache.insert(cache_key, value.clone());

                value
            }
        }
    }

    pub(crate) fn get_totals_key(&self, key: &ResourceKey, dimension: Dimension) -> Arc<str> {
        let cache_key = (key.clone(), dimension);

        match self.totals_key_cache.get(&cache_key) {
            Some(value) => value.clone(),
            None => {
                let value: Arc<str> =
                    Arc::from(self.get_dimension_key(key, dimension, &self.totals_key_suffix));
                self.totals_key_cache.insert(cache_key, value.clone());

                value
            }
        }
    }

    pub(crate) fn get_records_key(&self, key: &ResourceKey) -> Arc<str> {
        match self.records_key_cache.get(key) {
            Some(value) => value.clone(),
            None => {
                let value: Arc<str> =
                    Arc::from(self.get_resource_key(key, &self.records_key_suffix));
                self.records_key_cache.insert(key.clone(), value.clone());

                value
            }
        }
    }

    pub(crate) fn get_expiries_key(&self, key: &ResourceKey) -> Arc<str> {
        match self.expiries_key_cache.get(key) {
            Some(value) => value.clone(),
            None => {
                let value: Arc<str> =
                    Arc::from(self.get_resource_key(key, &self.expiries_key_suffix));
                self.expiries_key_cache.insert(key.clone(), value.clone());

                value
            }
        }
    }
}
