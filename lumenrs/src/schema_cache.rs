use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::config::SchemaCacheConfig;
use crate::introspection::DatabaseSchema;
use crate::pool_manager::PoolKey;

#[derive(Debug, Clone)]
struct Cached {
    schema: DatabaseSchema,
    expires_at: Instant,
}

impl Cached {
    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// Introspection results per connection. Entries expire after the TTL; when
/// full, expired entries go first, then the one closest to expiry.
#[derive(Debug)]
pub struct SchemaCache {
    entries: HashMap<PoolKey, Cached>,
    ttl: Duration,
    capacity: usize,
}

impl Default for SchemaCache {
    fn default() -> Self {
        Self::with_config(&SchemaCacheConfig::default())
    }
}

impl SchemaCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: &SchemaCacheConfig) -> Self {
        Self {
            entries: HashMap::new(),
            ttl: Duration::from_secs(config.ttl_secs),
            capacity: config.max_size,
        }
    }

    pub fn insert(&mut self, key: PoolKey, schema: DatabaseSchema) {
        if self.capacity == 0 {
            return;
        }
        let now = Instant::now();
        if !self.entries.contains_key(&key) && self.entries.len() >= self.capacity {
            self.entries.retain(|_, cached| cached.is_live(now));
            if self.entries.len() >= self.capacity {
                self.drop_soonest_expiring();
            }
        }
        self.entries.insert(
            key,
            Cached {
                schema,
                expires_at: now + self.ttl,
            },
        );
    }

    /// Live entry for `key`; expired entries read as misses.
    pub fn get(&self, key: &PoolKey) -> Option<&DatabaseSchema> {
        let now = Instant::now();
        self.entries
            .get(key)
            .filter(|cached| cached.is_live(now))
            .map(|cached| &cached.schema)
    }

    pub fn invalidate(&mut self, key: &PoolKey) -> bool {
        self.entries.remove(key).is_some()
    }

    pub fn evict_expired(&mut self) {
        let now = Instant::now();
        self.entries.retain(|_, cached| cached.is_live(now));
    }

    fn drop_soonest_expiring(&mut self) {
        let victim = self
            .entries
            .iter()
            .min_by_key(|(_, cached)| cached.expires_at)
            .map(|(key, _)| key.clone());
        if let Some(key) = victim {
            tracing::debug!(connection = %key, "schema cache full, dropping entry");
            self.entries.remove(&key);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
