//! A cache of reference-counted values that are released exactly once.
//!
//! Every item in a [`RefCache`] carries a reference count: one reference is held by the cache's
//! index for as long as the item is listed, and one by every outstanding [`CacheRef`]. Removing
//! an item from the index (through [`RefCache::delete`], [`RefCache::purge`] or a failed validity
//! check) only drops the index's reference. The item's [`Releaser`] runs once the last reference
//! is gone, so holders can keep using a value after it was evicted, while a fresh item for the
//! same key is already being filled.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::ops::Deref;
use std::sync::atomic::{AtomicIsize, Ordering};
use std::sync::{Arc, OnceLock};

use futures::FutureExt;
use parking_lot::{Mutex, RwLock};

use crate::calls::Calls;
use crate::status::Status;

/// Cleans up a cached value once it has been evicted and all references to it are gone.
pub type Releaser = Box<dyn FnOnce() + Send + 'static>;

type Validator<V> = Box<dyn Fn(&V) -> bool + Send + Sync>;

/// Caches and shares the result of fetches with the same key until the result is removed from
/// the cache.
///
/// Cached items are explicitly reference-counted: [`RefCache::get`] hands out a [`CacheRef`]
/// that keeps the value alive, and the value's [`Releaser`] runs once the item has been removed
/// from the cache and every [`CacheRef`] to it has been dropped.
pub struct RefCache<K, V> {
    valid: Option<Validator<V>>,
    items: RwLock<HashMap<K, Arc<Item<V>>>>,
}

/// The outcome of [`RefCache::get`].
pub enum Fetched<V> {
    /// The value is cached, and the handle holds a reference to it.
    Cached(CacheRef<V>),
    /// This caller's own fetch declined to cache the value, which is handed back as is.
    Uncached(V),
    /// The caller was canceled before a value was available to it.
    Canceled,
}

impl<V> Fetched<V> {
    /// Returns the cached handle, if any.
    pub fn cached(self) -> Option<CacheRef<V>> {
        match self {
            Fetched::Cached(handle) => Some(handle),
            _ => None,
        }
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, Fetched::Canceled)
    }
}

impl<V: fmt::Debug> fmt::Debug for Fetched<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fetched::Cached(handle) => f.debug_tuple("Cached").field(handle).finish(),
            Fetched::Uncached(value) => f.debug_tuple("Uncached").field(value).finish(),
            Fetched::Canceled => f.write_str("Canceled"),
        }
    }
}

struct Item<V> {
    refs: AtomicIsize,
    /// Coordinates the fetches filling this item, under a single fixed key.
    fill: Calls<(), ()>,
    value: OnceLock<V>,
    releaser: Mutex<Option<Releaser>>,
}

/// What happened when a caller made sure an item was filled.
enum Fill<V> {
    /// The caller left before the item was filled.
    Canceled,
    /// The caller's fetch declined to cache its value.
    Declined(V),
    /// The caller filled the item with its own fetch.
    Fresh,
    /// The item was filled by somebody else.
    Shared,
}

impl<V> Item<V> {
    fn new() -> Self {
        Item {
            // the index's reference
            refs: AtomicIsize::new(1),
            fill: Calls::new(),
            value: OnceLock::new(),
            releaser: Mutex::new(None),
        }
    }

    fn is_filled(&self) -> bool {
        self.value.get().is_some()
    }

    /// Takes a new reference to the item.
    ///
    /// The caller must already hold a reference, or hold a lock on an index listing the item.
    fn acquire(self: &Arc<Self>) -> CacheRef<V> {
        self.refs.fetch_add(1, Ordering::AcqRel);
        CacheRef {
            item: Arc::clone(self),
        }
    }

    /// Drops a reference, running the releaser when it was the last one.
    fn release(&self) {
        let refs = self.refs.fetch_sub(1, Ordering::AcqRel) - 1;
        debug_assert!(refs >= 0, "released more references than were held");
        if refs != 0 {
            return;
        }
        let releaser = self.releaser.lock().take();
        if let Some(releaser) = releaser {
            tracing::debug!("Releasing cached value");
            metric!(counter("refcache.released") += 1);
            releaser();
        }
    }

    /// Makes sure the item is filled, running `fetch` if this caller leads the fill.
    async fn fill<C, F, Fut>(&self, cancel: C, fetch: &mut F) -> Fill<V>
    where
        C: Future<Output = ()>,
        F: FnMut() -> Fut,
        Fut: Future<Output = (V, Option<Releaser>)>,
    {
        if self.is_filled() {
            return Fill::Shared;
        }

        let mut declined = None;
        let mut filled_here = false;
        let (declined_slot, filled_flag) = (&mut declined, &mut filled_here);
        let (_, status) = self
            .fill
            .run((), cancel, move || async move {
                if self.is_filled() {
                    return ((), true);
                }
                let (value, releaser) = fetch().await;
                let Some(releaser) = releaser else {
                    *declined_slot = Some(value);
                    return ((), false);
                };
                // Only the leader of the fill gets here, so the slot is still empty.
                if self.value.set(value).is_ok() {
                    *self.releaser.lock() = Some(releaser);
                    *filled_flag = true;
                    metric!(counter("refcache.fill") += 1);
                }
                ((), true)
            })
            .await;

        match (status, declined) {
            (Status::Canceled, Some(value)) => Fill::Declined(value),
            (Status::Canceled, None) => Fill::Canceled,
            _ if filled_here => Fill::Fresh,
            _ => Fill::Shared,
        }
    }
}

/// A reference to a value in a [`RefCache`].
///
/// Dropping the handle, or calling [`release`](CacheRef::release), gives the reference back.
/// Cloning it takes an additional reference.
pub struct CacheRef<V> {
    item: Arc<Item<V>>,
}

impl<V> CacheRef<V> {
    /// Gives the reference back to the cache.
    pub fn release(self) {
        drop(self)
    }

    /// Returns `true` if both handles refer to the same cached item.
    pub fn ptr_eq(this: &Self, other: &Self) -> bool {
        Arc::ptr_eq(&this.item, &other.item)
    }
}

impl<V> Deref for CacheRef<V> {
    type Target = V;

    fn deref(&self) -> &V {
        match self.item.value.get() {
            Some(value) => value,
            // handles are only given out for filled items
            None => unreachable!("reference to an unfilled cache item"),
        }
    }
}

impl<V> Clone for CacheRef<V> {
    fn clone(&self) -> Self {
        self.item.acquire()
    }
}

impl<V> Drop for CacheRef<V> {
    fn drop(&mut self) {
        self.item.release();
    }
}

impl<V: fmt::Debug> fmt::Debug for CacheRef<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheRef")
            .field("value", &self.item.value.get())
            .field("refs", &self.item.refs.load(Ordering::Relaxed))
            .finish()
    }
}

impl<K, V> Default for RefCache<K, V> {
    fn default() -> Self {
        RefCache {
            valid: None,
            items: RwLock::new(HashMap::new()),
        }
    }
}

impl<K, V> fmt::Debug for RefCache<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefCache")
            .field("items", &self.items.read().len())
            .field("validated", &self.valid.is_some())
            .finish()
    }
}

impl<K, V> RefCache<K, V>
where
    K: Hash + Eq + Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a cache that checks cached values with `valid` before handing them out.
    ///
    /// A value that fails the check is evicted and a new one is fetched. The check is skipped
    /// for the caller whose own fetch just filled the item.
    pub fn with_validator<P>(valid: P) -> Self
    where
        P: Fn(&V) -> bool + Send + Sync + 'static,
    {
        RefCache {
            valid: Some(Box::new(valid)),
            items: RwLock::new(HashMap::new()),
        }
    }

    /// The number of items currently listed in the cache, including ones still being filled.
    pub fn len(&self) -> usize {
        self.items.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Retrieves the value for `key`, calling `fetch` if necessary to retrieve the value.
    ///
    /// `fetch` is only called if there is no value in the cache. If a value is in the process of
    /// being fetched, the result of the ongoing fetch is used instead of beginning a new fetch.
    /// If that fetch declines to cache its value, panics, or is dropped, one of the waiting
    /// callers runs its own `fetch` next.
    ///
    /// A fetch declines to cache its value by returning no [`Releaser`]. The value is then
    /// returned to that caller as [`Fetched::Uncached`], and nothing is cached.
    ///
    /// `cancel` lets a waiting caller give up, in which case [`Fetched::Canceled`] is returned.
    pub async fn get<C, F, Fut>(&self, key: K, cancel: C, mut fetch: F) -> Fetched<V>
    where
        C: Future<Output = ()>,
        F: FnMut() -> Fut,
        Fut: Future<Output = (V, Option<Releaser>)>,
    {
        // The lookup may restart, but the caller's cancellation must still be observed.
        let cancel = cancel.shared();

        loop {
            // This reference is released on every exit path, unless it is handed to the caller.
            let handle = self.lookup(&key);

            match handle.item.fill(cancel.clone(), &mut fetch).await {
                Fill::Canceled => return Fetched::Canceled,
                Fill::Declined(value) => return Fetched::Uncached(value),
                // This call did the fetch, the value is as fresh as it gets.
                Fill::Fresh => return Fetched::Cached(handle),
                Fill::Shared => {}
            }

            let valid = match &self.valid {
                Some(valid) => valid(&*handle),
                None => true,
            };
            if valid {
                return Fetched::Cached(handle);
            }

            tracing::debug!("Evicting invalid cached value");
            if self.evict(&key, &handle.item) {
                metric!(counter("refcache.invalidated") += 1);
            }
        }
    }

    /// Removes `key` from the cache, forcing it to be fetched again the next time it is
    /// retrieved.
    ///
    /// The removed value is released once all references to it have been dropped.
    pub fn delete(&self, key: &K) {
        let removed = self.items.write().remove(key);
        if let Some(item) = removed {
            item.release();
        }
    }

    /// Removes all filled items whose value `keep` rejects.
    ///
    /// `keep` is called without holding any lock on the cache, so it may be slow, or even use
    /// the cache itself.
    pub fn purge<P>(&self, mut keep: P)
    where
        P: FnMut(&V) -> bool,
    {
        let snapshot: Vec<_> = self
            .items
            .read()
            .iter()
            .filter(|(_, item)| item.is_filled())
            .map(|(key, item)| (key.clone(), Arc::clone(item)))
            .collect();

        let rejected: Vec<_> = snapshot
            .into_iter()
            .filter(|(_, item)| item.value.get().is_some_and(|value| !keep(value)))
            .collect();
        if rejected.is_empty() {
            return;
        }

        let removed: Vec<_> = {
            let mut items = self.items.write();
            rejected
                .into_iter()
                .filter_map(|(key, item)| {
                    // the key may have been refilled since we took the snapshot
                    let listed = items
                        .get(&key)
                        .is_some_and(|current| Arc::ptr_eq(current, &item));
                    if listed { items.remove(&key) } else { None }
                })
                .collect()
        };

        tracing::debug!("Purged {} cached values", removed.len());
        for item in removed {
            item.release();
        }
    }

    /// Removes all items from the cache.
    pub fn clear(&self) {
        let removed: Vec<_> = self.items.write().drain().map(|(_, item)| item).collect();
        for item in removed {
            item.release();
        }
    }

    /// Returns a new reference to the item listed for `key`, creating the item if necessary.
    fn lookup(&self, key: &K) -> CacheRef<V> {
        {
            let items = self.items.read();
            if let Some(item) = items.get(key) {
                // The item is listed and we hold the read lock, so the index's reference keeps
                // the count at one or more.
                return item.acquire();
            }
        }

        let mut items = self.items.write();
        let item = items.entry(key.clone()).or_insert_with(|| {
            metric!(counter("refcache.created") += 1);
            Arc::new(Item::new())
        });
        item.acquire()
    }

    /// Removes `item` from the index if it is still listed under `key`.
    fn evict(&self, key: &K, item: &Arc<Item<V>>) -> bool {
        let removed = {
            let mut items = self.items.write();
            match items.get(key) {
                Some(current) if Arc::ptr_eq(current, item) => items.remove(key),
                // Another caller has already done the cleanup.
                _ => None,
            }
        };
        match removed {
            Some(item) => {
                item.release();
                true
            }
            None => false,
        }
    }
}
