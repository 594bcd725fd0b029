use std::future::pending;
use std::sync::Arc;
use std::time::Duration;

use syncgroup::{Cache, Calls, Canceled, Status, TokenCalls};
use tokio_util::sync::CancellationToken;

use crate::{Counter, Gate, join_all, settle, setup, spawn_many, timeout};

#[tokio::test(flavor = "multi_thread")]
async fn test_concurrent_calls_execute_once() {
    let calls = setup(Calls::new());
    let executed = Counter::new();
    let gate = Gate::new();

    let tasks = spawn_many(16, |i| {
        let calls = Arc::clone(&calls);
        let executed = executed.clone();
        let gate = gate.clone();
        async move {
            calls
                .run("k", pending(), || async move {
                    executed.bump();
                    gate.wait().await;
                    (format!("result of {i}"), true)
                })
                .await
        }
    });
    settle().await;
    gate.open();

    let results = join_all(tasks).await;
    assert_eq!(executed.get(), 1);

    let (first, _) = &results[0];
    assert!(first.is_some());
    for (value, status) in &results {
        assert_eq!(value, first);
        assert_eq!(*status, Status::Shared);
    }
    assert!(calls.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_rejected_result_is_never_delivered() {
    let calls = setup(Calls::new());
    let executed = Counter::new();
    let gate = Gate::new();
    let started = Gate::new();

    let leader = tokio::spawn({
        let calls = Arc::clone(&calls);
        let executed = executed.clone();
        let gate = gate.clone();
        let started = started.clone();
        async move {
            calls
                .run("k", pending(), || async move {
                    executed.bump();
                    started.open();
                    gate.wait().await;
                    (usize::MAX, false)
                })
                .await
        }
    });
    timeout(started.wait()).await;

    let waiters = spawn_many(4, |i| {
        let calls = Arc::clone(&calls);
        let executed = executed.clone();
        async move {
            calls
                .run("k", pending(), || async move {
                    executed.bump();
                    (i, true)
                })
                .await
        }
    });
    settle().await;
    gate.open();

    assert_eq!(timeout(leader).await.unwrap(), (None, Status::Canceled));

    let results = join_all(waiters).await;
    // exactly one waiter took over
    assert_eq!(executed.get(), 2);
    let value = results[0].0;
    assert!(value.is_some_and(|value| value < 4));
    for result in results {
        assert_eq!(result, (value, Status::Shared));
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_timeout_as_cancellation() {
    let calls = setup(Calls::new());
    let gate = Gate::new();
    let started = Gate::new();

    let leader = tokio::spawn({
        let calls = Arc::clone(&calls);
        let gate = gate.clone();
        let started = started.clone();
        async move {
            calls
                .run(1, pending(), || async move {
                    started.open();
                    gate.wait().await;
                    ("slow", true)
                })
                .await
        }
    });
    timeout(started.wait()).await;

    let impatient = calls
        .run(1, tokio::time::sleep(Duration::from_millis(20)), || async {
            ("fast", true)
        })
        .await;
    assert_eq!(impatient, (None, Status::Canceled));

    // the leader is not affected by the waiter leaving
    gate.open();
    assert_eq!(
        timeout(leader).await.unwrap(),
        (Some("slow"), Status::Exclusive)
    );

    // late joiners start a new batch
    let late = calls.run(1, pending(), || async { ("late", true) }).await;
    assert_eq!(late, (Some("late"), Status::Exclusive));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_keys_are_independent() {
    let calls = setup(TokenCalls::<_, _, Canceled>::new());
    let gate = Gate::new();
    let started = Gate::new();
    let token = CancellationToken::new();

    let blocked = tokio::spawn({
        let calls = Arc::clone(&calls);
        let gate = gate.clone();
        let started = started.clone();
        let token = token.clone();
        async move {
            calls
                .run(&token, "a", || async move {
                    started.open();
                    gate.wait().await;
                    Ok(1)
                })
                .await
        }
    });
    timeout(started.wait()).await;

    let other = timeout(calls.run(&token, "b", || async { Ok(2) })).await;
    assert_eq!(other, (Ok(2), Status::Exclusive));

    gate.open();
    assert_eq!(timeout(blocked).await.unwrap(), (Ok(1), Status::Exclusive));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cache_shares_fetch() {
    let cache = setup(Cache::new());
    let fetched = Counter::new();
    let gate = Gate::new();

    let tasks = spawn_many(8, |i| {
        let cache = Arc::clone(&cache);
        let fetched = fetched.clone();
        let gate = gate.clone();
        async move {
            let key = i % 2;
            cache
                .get(key, pending(), || async move {
                    fetched.bump();
                    gate.wait().await;
                    (key * 100, true)
                })
                .await
        }
    });
    settle().await;
    gate.open();

    for (value, status) in join_all(tasks).await {
        assert!(matches!(value, Some(0) | Some(100)));
        assert_ne!(status, Status::Canceled);
    }
    assert_eq!(fetched.get(), 2);
    assert_eq!(cache.len(), 2);

    cache.purge(|value| *value > 0);
    let (value, status) = cache.get(0, pending(), || async { (7, true) }).await;
    assert_eq!((value, status), (Some(7), Status::Exclusive));
}
