//! Read-through item cache.

use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::codec::Item;
use crate::schema::PrimaryKey;

type CacheKey = (String, PrimaryKey);

/// LRU cache of decoded-ready items keyed by table and primary key.
///
/// Only positive lookups are cached. Every write path invalidates the keys
/// it touches, and every invalidation advances a generation counter. A read
/// takes the generation before going to the backend and only fills the
/// cache through [`insert_if_current`](Self::insert_if_current) when no
/// invalidation happened meanwhile, so a slow read racing a write can never
/// park the older item in the cache.
#[derive(Debug)]
pub struct ItemCache {
    state: Mutex<CacheState>,
}

#[derive(Debug)]
struct CacheState {
    entries: LruCache<CacheKey, Item>,
    generation: u64,
}

impl ItemCache {
    /// Cache holding at most `capacity` items
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            state: Mutex::new(CacheState {
                entries: LruCache::new(capacity),
                generation: 0,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Cached copy of an item
    pub fn get(&self, table: &str, key: &PrimaryKey) -> Option<Item> {
        self.state()
            .entries
            .get(&(table.to_string(), key.clone()))
            .cloned()
    }

    /// Current generation, to be taken before reading from the backend
    pub fn generation(&self) -> u64 {
        self.state().generation
    }

    /// Remember an item unconditionally
    pub fn insert(&self, table: &str, key: PrimaryKey, item: Item) {
        let _ = self.state().entries.put((table.to_string(), key), item);
    }

    /// Remember an item read at `generation`, unless something was
    /// invalidated since. Returns whether the item was cached.
    pub fn insert_if_current(&self, table: &str, key: PrimaryKey, item: Item, generation: u64) -> bool {
        let mut state = self.state();
        if state.generation != generation {
            return false;
        }
        let _ = state.entries.put((table.to_string(), key), item);
        true
    }

    /// Forget an item
    pub fn invalidate(&self, table: &str, key: &PrimaryKey) {
        let mut state = self.state();
        state.generation = state.generation.wrapping_add(1);
        let _ = state.entries.pop(&(table.to_string(), key.clone()));
    }

    /// Forget everything
    pub fn clear(&self) {
        let mut state = self.state();
        state.generation = state.generation.wrapping_add(1);
        state.entries.clear();
    }

    /// Number of cached items
    pub fn len(&self) -> usize {
        self.state().entries.len()
    }

    /// Whether the cache is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{KeyPart, TypedValue};

    fn key(id: &str) -> PrimaryKey {
        PrimaryKey {
            partition: KeyPart::String(id.to_string()),
            sort: None,
        }
    }

    fn item(id: &str) -> Item {
        Item::from([("id".to_string(), TypedValue::S(id.to_string()))])
    }

    #[test]
    fn test_insert_get_invalidate() {
        let cache = ItemCache::new(8);
        cache.insert("tokens", key("a"), item("a"));

        assert_eq!(cache.get("tokens", &key("a")), Some(item("a")));
        assert_eq!(cache.get("other", &key("a")), None);

        cache.invalidate("tokens", &key("a"));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_evicts_least_recently_used() {
        let cache = ItemCache::new(2);
        cache.insert("t", key("a"), item("a"));
        cache.insert("t", key("b"), item("b"));
        let _ = cache.get("t", &key("a"));
        cache.insert("t", key("c"), item("c"));

        assert!(cache.get("t", &key("a")).is_some());
        assert!(cache.get("t", &key("b")).is_none());
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_insert_after_invalidation_is_dropped() {
        let cache = ItemCache::new(8);
        let generation = cache.generation();

        // a write lands between the backend read and the fill
        cache.invalidate("tokens", &key("a"));
        assert!(!cache.insert_if_current("tokens", key("a"), item("stale"), generation));
        assert!(cache.get("tokens", &key("a")).is_none());

        let generation = cache.generation();
        assert!(cache.insert_if_current("tokens", key("a"), item("a"), generation));
        assert_eq!(cache.get("tokens", &key("a")), Some(item("a")));
    }
}
