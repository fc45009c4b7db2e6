use std::sync::Arc;
use std::sync::atomic::Ordering;

use slab::Slab;

use crate::entry::{CacheEntry, UNREGISTERED};

/// The strong-reference registry of all live entries.
///
/// Owning the entries here keeps their metadata and weak key handles alive
/// independent of the weak map's reclamation state; the trim pass iterates
/// this set to drive cleanup. Its length is the authoritative entry count.
pub(crate) struct EntrySet<K, V, E> {
    slots: Slab<Arc<CacheEntry<K, V, E>>>,
}

impl<K, V, E> EntrySet<K, V, E> {
    pub fn new() -> Self {
        Self { slots: Slab::new() }
    }

    /// Register an entry and assign its slot token.
    pub fn add(&mut self, entry: Arc<CacheEntry<K, V, E>>) {
        let slot = self.slots.insert(entry.clone());
        entry.slot.store(slot, Ordering::Release);
    }

    /// Deregister an entry. Returns false if it was not present.
    pub fn remove(&mut self, entry: &Arc<CacheEntry<K, V, E>>) -> bool {
        if !self.contains(entry) {
            return false;
        }
        let slot = entry.slot.load(Ordering::Acquire);
        self.slots.remove(slot);
        entry.slot.store(UNREGISTERED, Ordering::Release);
        true
    }

    /// Whether the entry is currently registered.
    pub fn contains(&self, entry: &Arc<CacheEntry<K, V, E>>) -> bool {
        let slot = entry.slot.load(Ordering::Acquire);
        slot != UNREGISTERED
            && self.slots.get(slot).is_some_and(|held| Arc::ptr_eq(held, entry))
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Iterate over all registered entries, in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<CacheEntry<K, V, E>>> {
        self.slots.iter().map(|(_, entry)| entry)
    }

    /// Drop every entry.
    pub fn clear(&mut self) {
        for (_, entry) in self.slots.iter() {
            entry.slot.store(UNREGISTERED, Ordering::Release);
        }
        self.slots.clear();
    }
}
