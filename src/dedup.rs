use moka::{policy::EvictionPolicy, sync::Cache};

/// Bounded set of segment URIs already handed to the fetch pool.
///
/// Eviction may let a very old URI through twice on long live streams; the fetch pool skips
/// segments already marked complete so that only costs a lookup.
#[derive(Clone)]
pub struct DedupCache {
    inner: Cache<String, ()>,
}

impl DedupCache {
    #[must_use]
    pub fn new(capacity: u64) -> Self {
        let inner = Cache::builder()
            .max_capacity(capacity)
            .eviction_policy(EvictionPolicy::lru())
            .build();

        Self { inner }
    }

    /// Whether `uri` was marked. Counts as a use for eviction purposes.
    #[must_use]
    pub fn seen(&self, uri: &str) -> bool {
        self.inner.get(uri).is_some()
    }

    pub fn mark(&self, uri: &str) {
        self.inner.insert(uri.to_string(), ());
    }

    /// Marks `uri`, returning `true` if it was not seen before
    pub fn mark_new(&self, uri: &str) -> bool {
        if self.seen(uri) {
            return false;
        }
        self.mark(uri);
        true
    }
}
