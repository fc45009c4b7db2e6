use std::convert::Infallible;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use quickcheck_macros::quickcheck;
use rememo::{CacheFactory, Clock, EntryStats, ManualClock};

fn pinned(factory: CacheFactory, clock: &Arc<ManualClock>) -> CacheFactory {
    let clock = clock.clone();
    factory.with_clock(move || clock.clone() as Arc<dyn Clock>)
}

#[test]
fn ranked_eviction_prefers_low_hit_candidates() {
    let clock = Arc::new(ManualClock::new());
    let invocations = Arc::new(AtomicUsize::new(0));
    let counter = invocations.clone();
    let factory = pinned(
        CacheFactory::new(|stats: &EntryStats| stats.hit_count, 4, 0.5, false).unwrap(),
        &clock,
    );
    let cache = factory.create(move |n: &u32| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok::<_, Infallible>(*n)
    });

    let keys: Vec<Arc<u32>> = (1..=5).map(Arc::new).collect();
    for key in &keys[..4] {
        cache.get_or_add(key).unwrap();
        clock.advance(Duration::from_millis(1));
    }
    assert_eq!(invocations.load(Ordering::SeqCst), 4);

    for _ in 0..3 {
        cache.get_or_add(&keys[0]).unwrap();
    }
    cache.get_or_add(&keys[1]).unwrap();
    assert_eq!(invocations.load(Ordering::SeqCst), 4);

    // At capacity the candidates are the two oldest entries, k1 and k2;
    // k2 has the lower hit count and leaves first.
    cache.get_or_add(&keys[4]).unwrap();
    assert_eq!(invocations.load(Ordering::SeqCst), 5);
    assert_eq!(cache.count().unwrap(), 4);
    assert_eq!(cache.metrics().evictions, 1);

    // k1, k3, k4, k5 are still served from the cache.
    cache.get_or_add(&keys[0]).unwrap();
    cache.get_or_add(&keys[2]).unwrap();
    cache.get_or_add(&keys[3]).unwrap();
    cache.get_or_add(&keys[4]).unwrap();
    assert_eq!(invocations.load(Ordering::SeqCst), 5);

    // k2 is gone and recomputes.
    cache.get_or_add(&keys[1]).unwrap();
    assert_eq!(invocations.load(Ordering::SeqCst), 6);
}

#[test]
fn age_shield_protects_young_entries() {
    // Rank by recency, descending: the policy would love to evict the
    // youngest entry, but the shield only ever offers the oldest half.
    let clock = Arc::new(ManualClock::new());
    let invocations = Arc::new(AtomicUsize::new(0));
    let counter = invocations.clone();
    let factory = pinned(
        CacheFactory::new(|stats: &EntryStats| stats.last_access_ticks, 4, 0.5, true).unwrap(),
        &clock,
    );
    let cache = factory.create(move |n: &u32| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok::<_, Infallible>(*n)
    });

    let keys: Vec<Arc<u32>> = (1..=5).map(Arc::new).collect();
    for key in &keys[..4] {
        cache.get_or_add(key).unwrap();
        clock.advance(Duration::from_millis(1));
    }

    cache.get_or_add(&keys[4]).unwrap();
    assert_eq!(invocations.load(Ordering::SeqCst), 5);
    assert_eq!(cache.metrics().evictions, 1);

    // The young entries k3 and k4 were shielded; among the candidates the
    // descending ranker picked k2, the more recently accessed one.
    cache.get_or_add(&keys[2]).unwrap();
    cache.get_or_add(&keys[3]).unwrap();
    cache.get_or_add(&keys[0]).unwrap();
    assert_eq!(invocations.load(Ordering::SeqCst), 5);
    cache.get_or_add(&keys[1]).unwrap();
    assert_eq!(invocations.load(Ordering::SeqCst), 6);
}

#[test]
fn constant_metric_ties_break_by_creation_order() {
    // The clock never moves and the metric is constant, so the tiebreak
    // falls through to the insertion sequence: the oldest entry leaves.
    let clock = Arc::new(ManualClock::new());
    let invocations = Arc::new(AtomicUsize::new(0));
    let counter = invocations.clone();
    let factory = pinned(
        CacheFactory::new(|_: &EntryStats| 0u8, 3, 1.0, false).unwrap(),
        &clock,
    );
    let cache = factory.create(move |n: &u32| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok::<_, Infallible>(*n)
    });

    let keys: Vec<Arc<u32>> = (1..=4).map(Arc::new).collect();
    for key in &keys[..3] {
        cache.get_or_add(key).unwrap();
    }
    cache.get_or_add(&keys[3]).unwrap();
    assert_eq!(cache.count().unwrap(), 3);

    cache.get_or_add(&keys[1]).unwrap();
    cache.get_or_add(&keys[2]).unwrap();
    cache.get_or_add(&keys[3]).unwrap();
    assert_eq!(invocations.load(Ordering::SeqCst), 4);
    cache.get_or_add(&keys[0]).unwrap();
    assert_eq!(invocations.load(Ordering::SeqCst), 5);
}

#[test]
fn lru_preset_evicts_least_recently_used_candidate() {
    let clock = Arc::new(ManualClock::new());
    let invocations = Arc::new(AtomicUsize::new(0));
    let counter = invocations.clone();
    let factory = pinned(CacheFactory::least_recently_used(3, 1.0).unwrap(), &clock);
    let cache = factory.create(move |n: &u32| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok::<_, Infallible>(*n)
    });

    let keys: Vec<Arc<u32>> = (1..=4).map(Arc::new).collect();
    for key in &keys[..3] {
        cache.get_or_add(key).unwrap();
        clock.advance(Duration::from_millis(1));
    }
    // Refresh k1 so k2 becomes the least recently used entry.
    cache.get_or_add(&keys[0]).unwrap();
    clock.advance(Duration::from_millis(1));

    cache.get_or_add(&keys[3]).unwrap();
    assert_eq!(cache.count().unwrap(), 3);

    cache.get_or_add(&keys[0]).unwrap();
    cache.get_or_add(&keys[2]).unwrap();
    cache.get_or_add(&keys[3]).unwrap();
    assert_eq!(invocations.load(Ordering::SeqCst), 4);
    cache.get_or_add(&keys[1]).unwrap();
    assert_eq!(invocations.load(Ordering::SeqCst), 5);
}

#[test]
fn dead_keys_reclaim_without_eviction() {
    let invocations = Arc::new(AtomicUsize::new(0));
    let counter = invocations.clone();
    let factory = CacheFactory::new(|stats: &EntryStats| stats.hit_count, 16, 0.5, false).unwrap();
    let cache = factory.create(move |n: &u32| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok::<_, Infallible>(*n)
    });

    let k1 = Arc::new(1u32);
    let k2 = Arc::new(2u32);
    let k3 = Arc::new(3u32);
    let k4 = Arc::new(4u32);
    cache.get_or_add(&k1).unwrap();
    cache.get_or_add(&k2).unwrap();
    cache.get_or_add(&k3).unwrap();

    drop(k2);
    cache.get_or_add(&k4).unwrap();
    // No capacity pressure yet, so the dead entry lingers until a trim.
    assert_eq!(cache.count().unwrap(), 4);

    cache.trim().unwrap();
    assert_eq!(cache.count().unwrap(), 3);
    let metrics = cache.metrics();
    assert_eq!(metrics.evictions, 0);
    assert_eq!(metrics.reclaimed, 1);

    // A fresh allocation of the same value is a new key and recomputes.
    let k2_again = Arc::new(2u32);
    cache.get_or_add(&k2_again).unwrap();
    assert_eq!(invocations.load(Ordering::SeqCst), 5);
}

#[test]
fn stale_entries_free_slots_before_ranked_eviction() {
    let invocations = Arc::new(AtomicUsize::new(0));
    let counter = invocations.clone();
    let factory = CacheFactory::new(|stats: &EntryStats| stats.hit_count, 3, 1.0, false).unwrap();
    let cache = factory.create(move |n: &u32| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok::<_, Infallible>(*n)
    });

    let k1 = Arc::new(1u32);
    let k2 = Arc::new(2u32);
    let k3 = Arc::new(3u32);
    let k4 = Arc::new(4u32);
    cache.get_or_add(&k1).unwrap();
    cache.get_or_add(&k2).unwrap();
    cache.get_or_add(&k3).unwrap();

    drop(k2);
    // The dead entry frees the slot; no live entry pays for the insert.
    cache.get_or_add(&k4).unwrap();
    assert_eq!(cache.count().unwrap(), 3);
    let metrics = cache.metrics();
    assert_eq!(metrics.evictions, 0);
    assert_eq!(metrics.reclaimed, 1);

    cache.get_or_add(&k1).unwrap();
    cache.get_or_add(&k3).unwrap();
    cache.get_or_add(&k4).unwrap();
    assert_eq!(invocations.load(Ordering::SeqCst), 4);
}

#[quickcheck]
fn capacity_bound_holds_at_quiescence(
    capacity: u8,
    threshold_steps: u8,
    accesses: Vec<u8>,
) -> bool {
    let capacity = usize::from(capacity % 16) + 1;
    let age_threshold = f64::from(threshold_steps % 11) / 10.0;
    let factory =
        CacheFactory::new(|stats: &EntryStats| stats.hit_count, capacity, age_threshold, false)
            .unwrap();
    let cache = factory.create(|n: &u8| Ok::<_, Infallible>(u32::from(*n)));

    let keys: Vec<Arc<u8>> = (0..=u8::MAX).map(Arc::new).collect();
    for index in accesses {
        cache.get_or_add(&keys[usize::from(index)]).unwrap();
        if cache.count().unwrap() > capacity {
            return false;
        }
    }
    true
}

#[test]
fn concurrent_inserts_settle_within_capacity() {
    let factory = CacheFactory::new(|stats: &EntryStats| stats.hit_count, 8, 0.5, false).unwrap();
    let cache = factory.create(|n: &u32| Ok::<_, Infallible>(n.wrapping_mul(3)));
    let keys: Vec<Arc<u32>> = (0..64).map(Arc::new).collect();

    thread::scope(|scope| {
        for stride in 1..5usize {
            let cache = &cache;
            let keys = &keys;
            scope.spawn(move || {
                for i in 0..256usize {
                    let key = &keys[(i * stride * 7 + i) % keys.len()];
                    cache.get_or_add(key).unwrap();
                }
            });
        }
    });

    cache.trim().unwrap();
    assert!(cache.count().unwrap() <= 8);
}
