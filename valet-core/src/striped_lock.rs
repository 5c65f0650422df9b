//! Striped locking keyed by a hashable identifier.
//!
//! Used to serialize writes per note id (Knowledge Store) and per thread id
//! (orchestration) without paying for one lock per key. A fixed number of
//! stripes is allocated up front; a key's stripe is chosen by hashing it,
//! so unrelated keys usually don't contend.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use tokio::sync::{Mutex, MutexGuard};

/// A fixed-size array of mutexes, indexed by hashing a key.
///
/// Two different keys may land on the same stripe (a false contention),
/// but the same key always lands on the same stripe, which is all that's
/// required for correctness.
pub struct StripedLock {
    stripes: Vec<Mutex<()>>,
}

impl StripedLock {
    /// Create a new striped lock with `stripe_count` stripes.
    ///
    /// `stripe_count` should be a power of two; 64 is the default used by
    /// the Knowledge Store.
    pub fn new(stripe_count: usize) -> Self {
        assert!(stripe_count > 0, "stripe_count must be non-zero");
        let mut stripes = Vec::with_capacity(stripe_count);
        for _ in 0..stripe_count {
            stripes.push(Mutex::new(()));
        }
        Self { stripes }
    }

    fn index_for<K: Hash>(&self, key: &K) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() as usize) % self.stripes.len()
    }

    /// Acquire the stripe guarding `key`. Held only for the duration the
    /// caller needs exclusivity (e.g. one note write), never across I/O
    /// unrelated to that key.
    pub async fn lock<K: Hash>(&self, key: &K) -> MutexGuard<'_, ()> {
        let idx = self.index_for(key);
        self.stripes[idx].lock().await
    }

    pub fn stripe_count(&self) -> usize {
        self.stripes.len()
    }
}
