/*!
Weak-keyed memoization with ranked, age-guarded eviction.

A [`MemoCache`] wraps a pure, fallible function `f: K -> V` and remembers
its results, so that calling it again with the same key returns the stored
result without re-running `f`. Keys are compared by _reference identity_:
the key is an `Arc<K>` allocation, two clones of one `Arc` are the same
key, and structurally equal values in distinct allocations are not. Two
properties set this cache apart from a plain memo table:

- **Keys are held weakly.** An entry never keeps its key alive. Once the
  outside world drops its last strong handle on a key, the entry becomes
  reclaimable and the next trim sweeps it out silently, without counting
  as an eviction.

- **Eviction is ranked and age-guarded.** Caches are built from a
  [`CacheFactory`] carrying an eviction policy: a _ranker_ that derives an
  ordered metric from per-entry statistics (hit count, accumulated lookup
  time, access stamps), a capacity, and an _age threshold_. When the cache
  is full, only the oldest fraction of entries are eviction candidates, so
  a burst of fresh inserts cannot purge entries before they had a chance
  to accumulate statistics. Among the candidates, the ranker decides who
  leaves first.

Statistics are kept per entry and updated on every call; the ranking is
rebuilt from fresh snapshots on every trim. Failures of `f` either
propagate uncached (the default) or, with
[`CacheOptions::cache_error`](CacheOptions), are captured and replayed
like values. Selective purges are available through the
[`trim_by_value`](MemoCache::trim_by_value),
[`trim_by_outcome`](MemoCache::trim_by_outcome), and
[`trim_by_stats`](MemoCache::trim_by_stats) views.

The crate also ships a [`BroadcastSubject`], a small fan-out primitive
with a stable producer endpoint and snapshot-based dispatch to an evolving
set of observers.

# Example

```
use std::convert::Infallible;
use std::sync::Arc;

use rememo::{CacheFactory, EntryStats};

// Keep at most 128 entries; once full, evict the least-hit entry among
// the oldest quarter.
let factory = CacheFactory::new(
    |stats: &EntryStats| stats.hit_count,
    128,
    0.25,
    false,
).unwrap();

let cache = factory.create(|word: &String| {
    Ok::<_, Infallible>(word.chars().rev().collect::<String>())
});

let key = Arc::new(String::from("stressed"));
assert_eq!(cache.get_or_add(&key).unwrap(), "desserts");
// Served from the cache; the function does not run again.
assert_eq!(cache.get_or_add(&key).unwrap(), "desserts");
assert_eq!(cache.count().unwrap(), 1);
```
*/

mod cache;
mod clock;
mod entry;
mod error;
mod registry;
mod subject;
mod weakmap;

pub use crate::cache::{CacheFactory, CacheMetrics, CacheOptions, MemoCache};
pub use crate::clock::{Clock, ManualClock, MonotonicClock};
pub use crate::entry::{EntryStats, Outcome};
pub use crate::error::{CacheError, MemoError};
pub use crate::subject::{BroadcastSubject, Observer, Producer, SubjectError, Subscription};
