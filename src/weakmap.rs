use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::entry::CacheEntry;

/// Maps keys to their entries by reference identity while holding the keys
/// weakly.
///
/// Two `Arc` clones of one allocation are the same key; structurally equal
/// values in distinct allocations are distinct keys. The map keys on the
/// allocation address. An installed entry holds a weak handle to its key,
/// which pins the key's control block, so a live probe key whose address
/// hits the map always refers to that entry's own key; a recycled-address
/// collision cannot occur.
///
/// The map's lock is disjoint from the cache lock and is never held while
/// the producer callback runs: the producer invokes the user function and
/// takes the cache's write lock to register the entry, and holding the map
/// lock across that would invert the lock order against removal paths.
pub(crate) struct WeakKeyMap<K, V, E> {
    map: Mutex<FxHashMap<usize, Arc<CacheEntry<K, V, E>>>>,
}

#[inline]
fn address<K>(key: &Arc<K>) -> usize {
    Arc::as_ptr(key) as usize
}

impl<K, V, E> WeakKeyMap<K, V, E> {
    pub fn new() -> Self {
        Self { map: Mutex::new(FxHashMap::default()) }
    }

    /// Look up the entry for `key`, if one is installed.
    pub fn lookup(&self, key: &Arc<K>) -> Option<Arc<CacheEntry<K, V, E>>> {
        let map = self.map.lock();
        let entry = map.get(&address(key))?;
        debug_assert!(std::ptr::eq(entry.key.as_ptr(), Arc::as_ptr(key)));
        Some(entry.clone())
    }

    /// Return the entry for `key`, producing and installing one on a miss.
    ///
    /// `produce` runs with the map lock released.
    pub fn get_or_add<Err>(
        &self,
        key: &Arc<K>,
        produce: impl FnOnce() -> Result<Arc<CacheEntry<K, V, E>>, Err>,
    ) -> Result<Arc<CacheEntry<K, V, E>>, Err> {
        if let Some(entry) = self.lookup(key) {
            return Ok(entry);
        }
        let entry = produce()?;
        self.map.lock().insert(address(key), entry.clone());
        Ok(entry)
    }

    /// Erase the mapping for `key`, if any.
    pub fn remove(&self, key: &Arc<K>) {
        self.map.lock().remove(&address(key));
    }

    /// Drop every mapping whose key has died.
    pub fn purge_stale(&self) {
        self.map.lock().retain(|_, entry| !entry.is_stale());
    }

    /// Drop all mappings, live and stale alike.
    pub fn clear(&self) {
        self.map.lock().clear();
    }
}
