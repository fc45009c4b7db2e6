use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::{RwLock, RwLockUpgradableReadGuard, RwLockWriteGuard};
use tracing::{debug, trace};

use crate::clock::{Clock, MonotonicClock};
use crate::entry::{CacheEntry, EntryStats, Outcome};
use crate::error::{CacheError, MemoError};
use crate::registry::EntrySet;
use crate::weakmap::WeakKeyMap;

/// Compares two entry snapshots for eviction ordering.
type Comparator = dyn Fn(&EntryStats, &EntryStats) -> std::cmp::Ordering + Send + Sync;

/// Builds a clock for each cache created by a factory.
type ClockFactory = dyn Fn() -> Arc<dyn Clock> + Send + Sync;

/// Source of per-thread tokens for re-entrance detection.
static NEXT_THREAD_TOKEN: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_TOKEN: u64 = NEXT_THREAD_TOKEN.fetch_add(1, Ordering::Relaxed);
}

fn thread_token() -> u64 {
    THREAD_TOKEN.with(|token| *token)
}

/// Clears the holder token once the owning operation finishes.
struct HolderGuard<'a> {
    holder: &'a AtomicU64,
}

impl Drop for HolderGuard<'_> {
    fn drop(&mut self) {
        self.holder.store(0, Ordering::Release);
    }
}

/// Per-cache options.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheOptions {
    /// Capture failures of the memoized function as cached outcomes. The
    /// captured error is then returned on every call for that key until the
    /// entry is evicted. Off by default: failures propagate and nothing is
    /// stored.
    pub cache_error: bool,
}

/// A snapshot of a cache's debug counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheMetrics {
    /// Completed calls served from an existing entry.
    pub hits: u64,
    /// Completed calls that ran the memoized function.
    pub misses: u64,
    /// Entries removed by ranked eviction.
    pub evictions: u64,
    /// Entries reclaimed because their key died.
    pub reclaimed: u64,
}

/// Creates [`MemoCache`]s that share one eviction policy.
///
/// The policy is a ranker over entry statistics, a capacity, and an age
/// threshold. When a cache is at capacity, only the oldest
/// `max(1, floor(max_capacity * age_threshold))` entries are eviction
/// candidates; fresh entries are shielded until enough newer ones arrive.
/// Within the candidates, the entry with the smallest metric leaves first
/// (or the largest, for a descending policy). Ties break by creation order,
/// then by insertion sequence.
pub struct CacheFactory {
    compare: Arc<Comparator>,
    max_capacity: usize,
    age_threshold: f64,
    clock: Arc<ClockFactory>,
}

impl CacheFactory {
    /// Create a factory for caches ranked by `ranker`.
    ///
    /// `ranker` derives a totally ordered metric from an entry's
    /// statistics. It is re-applied to fresh snapshots on every trim;
    /// nothing is cached across trims.
    ///
    /// Fails with [`CacheError::InvalidArgument`] if `max_capacity` is zero
    /// or `age_threshold` lies outside `[0, 1]`.
    pub fn new<M, R>(
        ranker: R,
        max_capacity: usize,
        age_threshold: f64,
        descending: bool,
    ) -> Result<Self, CacheError>
    where
        M: Ord,
        R: Fn(&EntryStats) -> M + Send + Sync + 'static,
    {
        if max_capacity == 0 {
            return Err(CacheError::InvalidArgument(
                "max capacity must be greater than zero",
            ));
        }
        if !(0.0..=1.0).contains(&age_threshold) {
            return Err(CacheError::InvalidArgument(
                "age threshold must lie within [0, 1]",
            ));
        }

        let compare = Arc::new(move |a: &EntryStats, b: &EntryStats| {
            let by_metric = ranker(a).cmp(&ranker(b));
            let by_metric = if descending { by_metric.reverse() } else { by_metric };
            by_metric
                .then(a.created_ticks.cmp(&b.created_ticks))
                .then(a.sequence.cmp(&b.sequence))
        });

        Ok(Self {
            compare,
            max_capacity,
            age_threshold,
            clock: Arc::new(|| Arc::new(MonotonicClock::start()) as Arc<dyn Clock>),
        })
    }

    /// A policy that evicts the least recently used candidate first.
    pub fn least_recently_used(
        max_capacity: usize,
        age_threshold: f64,
    ) -> Result<Self, CacheError> {
        Self::new(
            |stats: &EntryStats| stats.last_access_ticks,
            max_capacity,
            age_threshold,
            false,
        )
    }

    /// A policy that evicts the least frequently used candidate first.
    pub fn least_frequently_used(
        max_capacity: usize,
        age_threshold: f64,
    ) -> Result<Self, CacheError> {
        Self::new(
            |stats: &EntryStats| stats.hit_count,
            max_capacity,
            age_threshold,
            false,
        )
    }

    /// Replace the clock source used by caches created from this factory.
    pub fn with_clock(
        mut self,
        clock: impl Fn() -> Arc<dyn Clock> + Send + Sync + 'static,
    ) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Create a cache that memoizes `func` with default options.
    pub fn create<K, V, E, F>(&self, func: F) -> MemoCache<K, V, E>
    where
        F: Fn(&K) -> Result<V, E> + Send + Sync + 'static,
    {
        self.create_with(func, CacheOptions::default())
    }

    /// Create a cache that memoizes `func` with explicit options.
    pub fn create_with<K, V, E, F>(&self, func: F, options: CacheOptions) -> MemoCache<K, V, E>
    where
        F: Fn(&K) -> Result<V, E> + Send + Sync + 'static,
    {
        MemoCache {
            func: Box::new(func),
            weak: WeakKeyMap::new(),
            live: RwLock::new(EntrySet::new()),
            compare: self.compare.clone(),
            max_capacity: self.max_capacity,
            candidates: ((self.max_capacity as f64 * self.age_threshold) as usize).max(1),
            cache_error: options.cache_error,
            clock: (self.clock)(),
            sequence: AtomicU64::new(0),
            holder: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            reclaimed: AtomicU64::new(0),
            disposed: AtomicBool::new(false),
        }
    }
}

/// A memoization cache over a function from reference-identity keys to
/// values.
///
/// Keys are `Arc<K>` allocations: two clones of one `Arc` are the same key,
/// structurally equal values in distinct allocations are not. The cache
/// holds keys weakly, so an entry never keeps its key alive; once the
/// outside world drops the last strong handle, the entry is reclaimed by
/// the next trim without counting as an eviction.
///
/// Hits take the cache lock in shared mode and run concurrently, with each
/// other and with an in-flight producer. Misses serialize: the producing
/// path holds the lock's upgradable mode while the function runs and
/// upgrades to exclusive only to trim and to register the entry.
pub struct MemoCache<K, V, E> {
    func: Box<dyn Fn(&K) -> Result<V, E> + Send + Sync>,
    weak: WeakKeyMap<K, V, E>,
    live: RwLock<EntrySet<K, V, E>>,
    compare: Arc<Comparator>,
    max_capacity: usize,
    /// Size of the eviction candidate set.
    candidates: usize,
    cache_error: bool,
    clock: Arc<dyn Clock>,
    sequence: AtomicU64,
    /// Thread token of the current exclusive holder, zero when free.
    holder: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    reclaimed: AtomicU64,
    disposed: AtomicBool,
}

impl<K, V, E> MemoCache<K, V, E> {
    /// Return the memoized result for `key`, invoking the function on a
    /// miss.
    ///
    /// A hit returns a clone of the stored value (or, with error caching,
    /// a clone of the stored error) without re-invoking the function. The
    /// producing call counts toward the entry's hit statistics.
    pub fn get_or_add(&self, key: &Arc<K>) -> Result<V, MemoError<E>>
    where
        V: Clone,
        E: Clone,
    {
        self.check_live()?;
        self.check_reentry();

        // Fast path: a hit needs only shared access, so concurrent hits
        // proceed in parallel, even alongside an in-flight producer.
        {
            let _shared = self.live.read();
            // A concurrent dispose may have won the lock race.
            self.check_live()?;
            let t0 = self.clock.elapsed_ticks();
            if let Some(entry) = self.weak.lookup(key) {
                let now = self.clock.elapsed_ticks();
                entry.touch(Duration::from_nanos(now.saturating_sub(t0)), now);
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Self::resolve(&entry);
            }
        }

        // Miss: producers serialize on the lock's upgradable mode. Another
        // producer may have installed the entry since the probe; the weak
        // map hands back the winner and the hit bookkeeping still applies.
        let mut guard = Some(self.live.upgradable_read());
        self.check_live()?;
        let _held = self.mark_held();
        let t0 = self.clock.elapsed_ticks();

        let mut fresh = false;
        let entry = self.weak.get_or_add(key, || {
            fresh = true;
            self.produce(key, &mut guard)
        })?;

        let now = self.clock.elapsed_ticks();
        entry.touch(Duration::from_nanos(now.saturating_sub(t0)), now);
        if fresh {
            self.misses.fetch_add(1, Ordering::Relaxed);
        } else {
            self.hits.fetch_add(1, Ordering::Relaxed);
        }

        Self::resolve(&entry)
    }

    /// Turn a stored outcome into the caller-facing result.
    fn resolve(entry: &CacheEntry<K, V, E>) -> Result<V, MemoError<E>>
    where
        V: Clone,
        E: Clone,
    {
        match &entry.outcome {
            Outcome::Value(value) => Ok(value.clone()),
            Outcome::Error(error) => Err(MemoError::Computation(error.clone())),
        }
    }

    /// Number of live entries.
    pub fn count(&self) -> Result<usize, CacheError> {
        self.check_live()?;
        Ok(self.live.read().len())
    }

    /// Run a trim pass now: reclaim entries whose keys have died and, if
    /// the cache is over capacity, evict ranked candidates.
    pub fn trim(&self) -> Result<(), CacheError> {
        self.check_live()?;
        self.check_reentry();
        let mut set = self.live.write();
        let _held = self.mark_held();
        self.trim_locked(&mut set);
        Ok(())
    }

    /// Drop every entry and reset the debug counters.
    pub fn clear(&self) -> Result<(), CacheError> {
        self.check_live()?;
        self.check_reentry();
        let mut set = self.live.write();
        let _held = self.mark_held();
        self.clear_locked(&mut set);
        Ok(())
    }

    /// Tear the cache down.
    ///
    /// Fails with [`CacheError::Busy`] while another thread is inside the
    /// cache, without marking it disposed; the caller may retry. Once
    /// disposal succeeds, every further operation fails with
    /// [`CacheError::Disposed`]. Disposing twice is a no-op.
    pub fn dispose(&self) -> Result<(), CacheError> {
        if self.disposed.load(Ordering::Acquire) {
            return Ok(());
        }
        self.check_reentry();
        let Some(mut set) = self.live.try_write() else {
            return Err(CacheError::Busy);
        };
        let _held = self.mark_held();
        self.clear_locked(&mut set);
        self.disposed.store(true, Ordering::Release);
        debug!("disposed cache");
        Ok(())
    }

    /// Snapshot the debug counters.
    pub fn metrics(&self) -> CacheMetrics {
        CacheMetrics {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            reclaimed: self.reclaimed.load(Ordering::Relaxed),
        }
    }

    /// Evict every entry whose computed value satisfies `predicate`.
    ///
    /// Entries holding captured errors are not offered to the predicate.
    /// Entries whose keys have died are removed as well and count toward
    /// the returned total.
    pub fn trim_by_value(
        &self,
        mut predicate: impl FnMut(&K, &V) -> bool,
    ) -> Result<usize, CacheError> {
        self.trim_where(|key, entry| match &entry.outcome {
            Outcome::Value(value) => predicate(key, value),
            Outcome::Error(_) => false,
        })
    }

    /// Evict every entry whose full outcome satisfies `predicate`.
    ///
    /// Only available on caches created with error caching; otherwise
    /// fails with [`CacheError::InvalidArgument`].
    pub fn trim_by_outcome(
        &self,
        mut predicate: impl FnMut(&K, &Outcome<V, E>) -> bool,
    ) -> Result<usize, CacheError> {
        if !self.cache_error {
            return Err(CacheError::InvalidArgument(
                "outcome trimming requires error caching",
            ));
        }
        self.trim_where(|key, entry| predicate(key, &entry.outcome))
    }

    /// Evict every entry whose statistics satisfy `predicate`.
    pub fn trim_by_stats(
        &self,
        mut predicate: impl FnMut(&EntryStats) -> bool,
    ) -> Result<usize, CacheError> {
        self.trim_where(|_, entry| predicate(&entry.stats()))
    }

    /// Produce, time, and register the entry for a missed key. Runs with
    /// the upgradable guard in `guard`; the guard is upgraded around the
    /// trim and around registration, and handed back in upgradable mode.
    fn produce(
        &self,
        key: &Arc<K>,
        guard: &mut Option<RwLockUpgradableReadGuard<'_, EntrySet<K, V, E>>>,
    ) -> Result<Arc<CacheEntry<K, V, E>>, MemoError<E>> {
        self.trim_for_insert(guard);

        let t1 = self.clock.elapsed_ticks();
        let outcome = match (self.func)(key) {
            Ok(value) => Outcome::Value(value),
            Err(error) if self.cache_error => Outcome::Error(error),
            Err(error) => return Err(MemoError::Computation(error)),
        };
        let now = self.clock.elapsed_ticks();
        let invoke = Duration::from_nanos(now.saturating_sub(t1));

        let entry = Arc::new(CacheEntry::new(
            Arc::downgrade(key),
            outcome,
            self.sequence.fetch_add(1, Ordering::Relaxed),
            now,
            invoke,
        ));

        let Some(held) = guard.take() else {
            panic!("rememo: cache lock guard lost during produce");
        };
        let mut set = RwLockUpgradableReadGuard::upgrade(held);
        set.add(entry.clone());
        *guard = Some(RwLockWriteGuard::downgrade_to_upgradable(set));

        Ok(entry)
    }

    /// Insertion-triggered trim. The size check is a dirty read: concurrent
    /// producers may each pass it, transiently overshooting the capacity by
    /// the number of in-flight inserts; the next pass restores the bound.
    fn trim_for_insert(
        &self,
        guard: &mut Option<RwLockUpgradableReadGuard<'_, EntrySet<K, V, E>>>,
    ) {
        let Some(held) = guard.take() else {
            panic!("rememo: cache lock guard lost during trim");
        };
        if held.len() < self.max_capacity {
            *guard = Some(held);
            return;
        }
        let mut set = RwLockUpgradableReadGuard::upgrade(held);
        self.trim_locked(&mut set);
        *guard = Some(RwLockWriteGuard::downgrade_to_upgradable(set));
    }

    /// One full trim pass, under the write lock: sweep dead-key entries,
    /// then evict ranked candidates until the set fits the capacity.
    fn trim_locked(&self, set: &mut EntrySet<K, V, E>) {
        if set.is_empty() {
            return;
        }
        let stale: Vec<_> = set.iter().filter(|entry| entry.is_stale()).cloned().collect();
        if !stale.is_empty() {
            for entry in &stale {
                set.remove(entry);
            }
            self.weak.purge_stale();
            self.reclaimed.fetch_add(stale.len() as u64, Ordering::Relaxed);
            trace!(count = stale.len(), "reclaimed entries with dead keys");
        }

        if set.len() < self.max_capacity {
            return;
        }

        // Rebuilt from fresh snapshots on every pass; hit statistics move
        // continuously, so the ranking must not be cached across trims.
        let mut ranked: Vec<(EntryStats, Arc<CacheEntry<K, V, E>>)> =
            set.iter().map(|entry| (entry.stats(), entry.clone())).collect();
        ranked.sort_by(|(a, _), (b, _)| {
            (a.created_ticks, a.sequence).cmp(&(b.created_ticks, b.sequence))
        });
        ranked.truncate(self.candidates);
        ranked.sort_by(|(a, _), (b, _)| (self.compare)(a, b));

        let mut evicted = 0u64;
        for (_, victim) in &ranked {
            if set.len() < self.max_capacity {
                break;
            }
            if let Some(key) = victim.key.upgrade() {
                self.weak.remove(&key);
            }
            set.remove(victim);
            evicted += 1;
        }
        if evicted > 0 {
            self.evictions.fetch_add(evicted, Ordering::Relaxed);
            trace!(count = evicted, remaining = set.len(), "evicted ranked candidates");
        }
    }

    /// Shared sweep behind the `trim_by` views: select live entries by
    /// predicate, schedule every dead-key entry regardless, remove the lot
    /// from both structures.
    fn trim_where(
        &self,
        mut select: impl FnMut(&K, &CacheEntry<K, V, E>) -> bool,
    ) -> Result<usize, CacheError> {
        self.check_live()?;
        self.check_reentry();
        let mut set = self.live.write();
        let _held = self.mark_held();

        let mut victims = Vec::new();
        for entry in set.iter() {
            match entry.key.upgrade() {
                Some(key) => {
                    if select(&key, entry) {
                        victims.push((Some(key), entry.clone()));
                    }
                }
                None => victims.push((None, entry.clone())),
            }
        }
        for (key, entry) in &victims {
            if let Some(key) = key {
                self.weak.remove(key);
            }
            set.remove(entry);
        }
        self.weak.purge_stale();
        trace!(count = victims.len(), "trimmed entries by predicate");
        Ok(victims.len())
    }

    fn clear_locked(&self, set: &mut EntrySet<K, V, E>) {
        self.weak.clear();
        set.clear();
        for counter in [&self.hits, &self.misses, &self.evictions, &self.reclaimed] {
            counter.store(0, Ordering::Relaxed);
        }
        debug!("cleared cache");
    }

    fn check_live(&self) -> Result<(), CacheError> {
        if self.disposed.load(Ordering::Acquire) {
            Err(CacheError::Disposed)
        } else {
            Ok(())
        }
    }

    /// The lock is not re-entrant; a memoized function or trim predicate
    /// that calls back into its own cache must fail loudly instead of
    /// deadlocking.
    fn check_reentry(&self) {
        if self.holder.load(Ordering::Acquire) == thread_token() {
            panic!("rememo: re-entrant cache call from a memoized function or predicate");
        }
    }

    fn mark_held(&self) -> HolderGuard<'_> {
        self.holder.store(thread_token(), Ordering::Release);
        HolderGuard { holder: &self.holder }
    }
}
