use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::hash::Hash;

use parking_lot::RwLock;

use crate::calls::Calls;
use crate::status::Status;

/// Caches the results of calls with the same key, executing only one of the callbacks in a batch
/// to build a missing value.
///
/// Unlike [`RefCache`](crate::RefCache), values are not reference-counted: evicting a value
/// simply drops the cache's copy of it.
pub struct Cache<K, V> {
    calls: Calls<K, V>,
    values: RwLock<HashMap<K, V>>,
}

impl<K, V> Default for Cache<K, V> {
    fn default() -> Self {
        Cache {
            calls: Calls::default(),
            values: RwLock::new(HashMap::new()),
        }
    }
}

impl<K, V> fmt::Debug for Cache<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cache")
            .field("values", &self.values.read().len())
            .field("calls", &self.calls)
            .finish()
    }
}

impl<K, V> Cache<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.values.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Retrieves the value for `key`, building it with `fetch` if necessary.
    ///
    /// A cached value is returned as [`Status::Shared`]. Otherwise this starts or joins the
    /// batch building the value for `key`, see [`Calls::run`]. Only values that `fetch` accepts
    /// are stored in the cache.
    pub async fn get<C, F, Fut>(&self, key: K, cancel: C, fetch: F) -> (Option<V>, Status)
    where
        C: Future<Output = ()>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = (V, bool)>,
    {
        let cached = self.values.read().get(&key).cloned();
        if let Some(value) = cached {
            metric!(counter("cache.hit") += 1);
            return (Some(value), Status::Shared);
        }

        let key_ = key.clone();
        self.calls
            .run(key, cancel, || async move {
                // the previous batch may have completed since we checked
                let cached = self.values.read().get(&key_).cloned();
                if let Some(value) = cached {
                    return (value, true);
                }
                metric!(counter("cache.miss") += 1);
                let (value, accept) = fetch().await;
                if accept {
                    self.values.write().insert(key_, value.clone());
                }
                (value, accept)
            })
            .await
    }

    /// Removes `key` from the cache, forcing it to be rebuilt the next time it is retrieved.
    pub fn delete(&self, key: &K) {
        self.values.write().remove(key);
    }

    /// Removes `key` from the cache unless `keep` returns `true` for its value.
    pub fn delete_unless<P>(&self, key: &K, keep: P)
    where
        P: FnOnce(&V) -> bool,
    {
        let mut values = self.values.write();
        if values.get(key).is_some_and(|value| !keep(value)) {
            values.remove(key);
        }
    }

    /// Removes all values for which `keep` returns `false`.
    pub fn purge<P>(&self, mut keep: P)
    where
        P: FnMut(&V) -> bool,
    {
        self.values.write().retain(|_, value| keep(value));
    }
}
