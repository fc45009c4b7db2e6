use thiserror::Error;

/// Errors from cache construction and maintenance operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CacheError {
    /// A construction parameter or requested capability was invalid.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    /// The cache was used after a successful dispose.
    #[error("cache has been disposed")]
    Disposed,
    /// Dispose could not take exclusive ownership of the cache because an
    /// operation is in flight. The caller may retry once the cache is idle.
    #[error("cache is in use")]
    Busy,
}

/// Error returned by [`MemoCache::get_or_add`](crate::MemoCache::get_or_add).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MemoError<E> {
    /// The cache itself rejected the call.
    #[error(transparent)]
    Cache(#[from] CacheError),
    /// The memoized function failed. With error caching enabled the same
    /// error is returned on every call until the entry is evicted.
    #[error("memoized function failed")]
    Computation(E),
}
