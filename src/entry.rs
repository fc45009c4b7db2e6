use std::sync::Weak;
use std::sync::atomic::AtomicUsize;
use std::time::Duration;

use parking_lot::Mutex;

/// Result of the single producing invocation for a key.
///
/// `Error` arms exist only in caches created with error caching enabled;
/// otherwise failures propagate to the caller and nothing is stored.
#[derive(Debug, Clone)]
pub enum Outcome<V, E> {
    /// The function returned a value.
    Value(V),
    /// The function failed and the failure was captured.
    Error(E),
}

/// A coherent snapshot of one entry's bookkeeping.
///
/// This is what rankers and [`trim_by_stats`](crate::MemoCache::trim_by_stats)
/// predicates see. Snapshots are taken under the entry's own lock, so no
/// individual field can tear; consistency across entries is not promised.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryStats {
    /// Completed calls served by this entry, the producing call included.
    pub hit_count: u64,
    /// Accumulated lookup time across those calls.
    pub total_duration: Duration,
    /// Cost of the single function invocation that produced the entry.
    pub invoke_duration: Duration,
    /// Clock stamp at which the entry was created.
    pub created_ticks: u64,
    /// Clock stamp of the most recent completed call.
    pub last_access_ticks: u64,
    /// Insertion sequence number, unique and increasing per cache.
    pub sequence: u64,
}

/// Sentinel slot for an entry not currently registered in the entry set.
pub(crate) const UNREGISTERED: usize = usize::MAX;

/// A cached result for one key.
///
/// The key is observed weakly; the entry never keeps it alive. Strong
/// ownership of the entry itself lies with the entry set, which is what
/// keeps the metadata and the weak handle around until a trim sweeps it.
pub(crate) struct CacheEntry<K, V, E> {
    /// Non-owning handle to the key. Also pins the key's allocation, which
    /// the weak map relies on for address-identity lookups.
    pub key: Weak<K>,
    pub outcome: Outcome<V, E>,
    pub sequence: u64,
    pub created_ticks: u64,
    pub invoke_duration: Duration,
    /// Slot in the entry set, `UNREGISTERED` until added.
    pub slot: AtomicUsize,
    touched: Mutex<Touched>,
}

/// The fields mutated on every hit.
struct Touched {
    hit_count: u64,
    total_duration: Duration,
    last_access_ticks: u64,
}

impl<K, V, E> CacheEntry<K, V, E> {
    pub fn new(
        key: Weak<K>,
        outcome: Outcome<V, E>,
        sequence: u64,
        created_ticks: u64,
        invoke_duration: Duration,
    ) -> Self {
        Self {
            key,
            outcome,
            sequence,
            created_ticks,
            invoke_duration,
            slot: AtomicUsize::new(UNREGISTERED),
            touched: Mutex::new(Touched {
                hit_count: 0,
                total_duration: Duration::ZERO,
                last_access_ticks: created_ticks,
            }),
        }
    }

    /// Record one completed call: bump the hit count, accumulate the lookup
    /// time, refresh the access stamp.
    #[inline]
    pub fn touch(&self, lookup: Duration, now_ticks: u64) {
        let mut touched = self.touched.lock();
        touched.hit_count += 1;
        touched.total_duration += lookup;
        touched.last_access_ticks = now_ticks;
    }

    /// Take a snapshot of the entry's statistics.
    pub fn stats(&self) -> EntryStats {
        let touched = self.touched.lock();
        EntryStats {
            hit_count: touched.hit_count,
            total_duration: touched.total_duration,
            invoke_duration: self.invoke_duration,
            created_ticks: self.created_ticks,
            last_access_ticks: touched.last_access_ticks,
            sequence: self.sequence,
        }
    }

    /// Whether the key has been dropped by the outside world.
    #[inline]
    pub fn is_stale(&self) -> bool {
        self.key.strong_count() == 0
    }
}
