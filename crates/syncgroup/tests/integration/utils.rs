use std::future::Future;
use std::sync::Arc;

use syncgroup_test as test;

pub use test::{Counter, Gate, settle, timeout};

/// Spawns `n` copies of the task built by `make`, each getting its index.
pub fn spawn_many<T, F, Fut>(n: usize, make: F) -> Vec<tokio::task::JoinHandle<T>>
where
    F: Fn(usize) -> Fut,
    Fut: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    (0..n).map(|i| tokio::spawn(make(i))).collect()
}

/// Awaits all `tasks`, failing the test if any of them panicked or timed out.
pub async fn join_all<T>(tasks: Vec<tokio::task::JoinHandle<T>>) -> Vec<T> {
    let mut results = Vec::with_capacity(tasks.len());
    for task in tasks {
        results.push(timeout(task).await.unwrap());
    }
    results
}

/// Sets up the test and wraps `value` for sharing between spawned tasks.
pub fn setup<T>(value: T) -> Arc<T> {
    test::setup();
    Arc::new(value)
}
