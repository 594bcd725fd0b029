use std::future::pending;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use syncgroup::{CacheRef, Fetched, RefCache, Releaser};

use crate::{Counter, Gate, join_all, settle, setup, spawn_many, timeout};

/// A value that tracks its own lifecycle.
#[derive(Debug)]
struct Resource {
    id: usize,
    closed: Arc<AtomicBool>,
}

fn open_resource(id: usize, released: &Counter) -> (Resource, Option<Releaser>) {
    let closed = Arc::new(AtomicBool::new(false));
    let releaser: Releaser = Box::new({
        let closed = Arc::clone(&closed);
        let released = released.clone();
        move || {
            assert!(!closed.swap(true, Ordering::SeqCst), "released twice");
            released.bump();
        }
    });
    (Resource { id, closed }, Some(releaser))
}

#[tokio::test(flavor = "multi_thread")]
async fn test_holders_release_in_any_order() {
    let cache = setup(RefCache::new());
    let fetched = Counter::new();
    let released = Counter::new();
    let gate = Gate::new();

    let tasks = spawn_many(6, |_| {
        let cache = Arc::clone(&cache);
        let fetched = fetched.clone();
        let released = released.clone();
        let gate = gate.clone();
        async move {
            let fetch = || {
                let fetched = fetched.clone();
                let released = released.clone();
                let gate = gate.clone();
                async move {
                    let id = fetched.bump();
                    gate.wait().await;
                    open_resource(id, &released)
                }
            };
            cache.get("db", pending(), fetch).await.cached()
        }
    });
    settle().await;
    gate.open();

    let mut handles: Vec<_> = join_all(tasks).await.into_iter().flatten().collect();
    assert_eq!(handles.len(), 6);
    assert_eq!(fetched.get(), 1);
    assert!(handles.iter().all(|handle| CacheRef::ptr_eq(handle, &handles[0])));

    cache.delete(&"db");
    let closed = Arc::clone(&handles[0].closed);

    // release from the middle outwards
    while !handles.is_empty() {
        assert!(!closed.load(Ordering::SeqCst));
        let handle = handles.remove(handles.len() / 2);
        handle.release();
    }
    assert!(closed.load(Ordering::SeqCst));
    assert_eq!(released.get(), 1);
}

#[tokio::test]
async fn test_invalidation_replaces_item() {
    syncgroup_test::setup();

    let cache = RefCache::with_validator(|resource: &Resource| resource.id < 2);
    let fetched = Counter::new();
    let released = Counter::new();
    let fetch = || async { open_resource(fetched.bump(), &released) };

    let first = cache.get("db", pending(), fetch).await.cached().unwrap();
    assert_eq!(first.id, 1);

    // the first item passes, so it is shared
    let shared = cache.get("db", pending(), fetch).await.cached().unwrap();
    assert!(CacheRef::ptr_eq(&first, &shared));
    drop(shared);

    // A fresh item is handed out without validation, but fails it on the next lookup.
    cache.delete(&"db");
    let second = cache.get("db", pending(), fetch).await.cached().unwrap();
    assert_eq!(second.id, 2);
    let third = cache.get("db", pending(), fetch).await.cached().unwrap();
    assert_eq!(third.id, 3);
    assert_eq!(fetched.get(), 3);

    // every holder keeps its own value until it lets go
    assert_eq!((first.id, second.id), (1, 2));
    assert_eq!(released.get(), 0);
    drop(first);
    drop(second);
    assert_eq!(released.get(), 2);

    cache.clear();
    drop(third);
    assert_eq!(released.get(), 3);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_every_fill_is_released_once() {
    let cache = setup(RefCache::new());
    let fetched = Counter::new();
    let released = Counter::new();

    let tasks = spawn_many(32, |i| {
        let cache = Arc::clone(&cache);
        let fetched = fetched.clone();
        let released = released.clone();
        async move {
            for round in 0..20 {
                let key = (i + round) % 4;
                let fetch = || {
                    let fetched = fetched.clone();
                    let released = released.clone();
                    async move {
                        tokio::task::yield_now().await;
                        open_resource(fetched.bump(), &released)
                    }
                };
                match cache.get(key, pending(), fetch).await {
                    Fetched::Cached(handle) => {
                        assert!(!handle.closed.load(Ordering::SeqCst));
                        if round % 3 == 0 {
                            cache.delete(&key);
                        }
                        tokio::task::yield_now().await;
                        assert!(!handle.closed.load(Ordering::SeqCst));
                    }
                    other => panic!("unexpected result: {other:?}"),
                }
            }
        }
    });
    join_all(tasks).await;

    cache.clear();
    assert!(cache.is_empty());
    assert_eq!(released.get(), fetched.get());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_canceled_waiter_does_not_keep_value() {
    let cache = setup(RefCache::new());
    let released = Counter::new();
    let gate = Gate::new();
    let started = Gate::new();

    let filling = tokio::spawn({
        let cache = Arc::clone(&cache);
        let released = released.clone();
        let gate = gate.clone();
        let started = started.clone();
        async move {
            let fetch = || {
                let released = released.clone();
                let gate = gate.clone();
                let started = started.clone();
                async move {
                    started.open();
                    gate.wait().await;
                    open_resource(1, &released)
                }
            };
            cache.get(1, pending(), fetch).await.cached()
        }
    });
    timeout(started.wait()).await;

    let gave_up = cache
        .get(1, tokio::time::sleep(Duration::from_millis(20)), || async {
            open_resource(2, &released)
        })
        .await;
    assert!(gave_up.is_canceled());

    gate.open();
    let handle = timeout(filling).await.unwrap().unwrap();
    assert_eq!(handle.id, 1);

    cache.delete(&1);
    drop(handle);
    assert_eq!(released.get(), 1);
}
