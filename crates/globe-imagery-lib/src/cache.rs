//! Byte-budgeted LRU cache for decoded tile textures
//!
//! Once usage exceeds the capacity, entries are evicted in least-recently-used order
//! until usage drops to the low-water mark, so a full cache does not evict on every insert.
//! Entries referenced by the current frame's draw list are pinned and never evicted.

use crate::{ImageryError, Result};
use lru::LruCache;
use std::collections::HashSet;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Size limits for a [`TextureCache`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct CacheConfig {
    /// Usage above which eviction starts
    pub capacity_bytes: usize,
    /// Usage that eviction brings the cache back down to
    pub low_water_bytes: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity_bytes: 512 * 1024 * 1024,
            low_water_bytes: 384 * 1024 * 1024,
        }
    }
}

impl CacheConfig {
    pub fn validate(&self) -> Result<()> {
        if self.capacity_bytes == 0 {
            return Err(ImageryError::InvalidConfig(
                "cache capacity must be greater than zero".to_string(),
            ));
        }
        if self.low_water_bytes >= self.capacity_bytes {
            return Err(ImageryError::InvalidConfig(format!(
                "cache low-water mark ({}) must be below its capacity ({})",
                self.low_water_bytes, self.capacity_bytes
            )));
        }
        Ok(())
    }
}

struct CacheEntry<V> {
    payload: V,
    size_bytes: usize,
}

/// A usage-ordered store mapping resource keys to payloads.
pub struct TextureCache<V> {
    entries: LruCache<String, CacheEntry<V>>,
    pinned: HashSet<String>,
    config: CacheConfig,
    used_bytes: usize,
}

#[cfg_attr(feature = "profiling", profiling::all_functions)]
impl<V> TextureCache<V> {
    pub fn new(config: CacheConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            entries: LruCache::unbounded(),
            pinned: HashSet::new(),
            config,
            used_bytes: 0,
        })
    }

    /// Insert or replace an entry, evicting down to the low-water mark if over capacity.
    pub fn put(&mut self, key: &str, payload: V, size_bytes: usize) {
        if let Some(old) = self.entries.put(
            key.to_string(),
            CacheEntry {
                payload,
                size_bytes,
            },
        ) {
            self.used_bytes -= old.size_bytes;
        }
        self.used_bytes += size_bytes;

        if self.used_bytes > self.config.capacity_bytes {
            self.evict_to(self.config.low_water_bytes);
        }
    }

    /// Look up an entry and mark it most recently used.
    pub fn get(&mut self, key: &str) -> Option<&V> {
        self.entries.get(key).map(|e| &e.payload)
    }

    /// Look up an entry without touching its recency.
    pub fn peek(&self, key: &str) -> Option<&V> {
        self.entries.peek(key).map(|e| &e.payload)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<V> {
        self.pinned.remove(key);
        self.entries.pop(key).map(|e| {
            self.used_bytes -= e.size_bytes;
            e.payload
        })
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.pinned.clear();
        self.used_bytes = 0;
    }

    /// Protect an entry from eviction until the next [`TextureCache::unpin_all`].
    pub fn pin(&mut self, key: &str) {
        if self.entries.contains(key) {
            self.pinned.insert(key.to_string());
        }
    }

    pub fn unpin_all(&mut self) {
        self.pinned.clear();
    }

    pub fn is_pinned(&self, key: &str) -> bool {
        self.pinned.contains(key)
    }

    pub fn used_bytes(&self) -> usize {
        self.used_bytes
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Evict unpinned entries, least recently used first, until usage is at most `target`.
    fn evict_to(&mut self, target: usize) {
        // Walk from the LRU end, skipping pinned entries
        let victims: Vec<String> = {
            let mut projected = self.used_bytes;
            self.entries
                .iter()
                .rev()
                .filter(|(key, _)| !self.pinned.contains(key.as_str()))
                .take_while(|(_, entry)| {
                    let over = projected > target;
                    if over {
                        projected -= entry.size_bytes;
                    }
                    over
                })
                .map(|(key, _)| key.clone())
                .collect()
        };

        for key in &victims {
            if let Some(entry) = self.entries.pop(key) {
                self.used_bytes -= entry.size_bytes;
            }
        }

        if !victims.is_empty() {
            tracing::debug!(
                evicted = victims.len(),
                used_bytes = self.used_bytes,
                "Texture cache trimmed"
            );
        }
        if self.used_bytes > self.config.capacity_bytes {
            tracing::warn!(
                used_bytes = self.used_bytes,
                capacity_bytes = self.config.capacity_bytes,
                pinned = self.pinned.len(),
                "Texture cache over capacity with only pinned entries left"
            );
        }
    }
}
