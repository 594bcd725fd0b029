//! Helpers for testing the concurrency primitives.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - Wrap every wait on a result or signal in [`timeout`]. A primitive that fails to wake its
//!    waiters then fails the test instead of hanging the test runner.
//!
//!  - Use a [`Gate`] to hold a callback inside its critical section until the test has lined up
//!    the other callers it wants to race against it.

use std::future::IntoFuture;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

/// How long [`timeout`] waits before failing a test.
pub const TIMEOUT: Duration = Duration::from_secs(10);

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `syncgroup` crate and mutes all
///    other logs.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("syncgroup=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Awaits `future`, panicking if it does not resolve within [`TIMEOUT`].
pub async fn timeout<F: IntoFuture>(future: F) -> F::Output {
    match tokio::time::timeout(TIMEOUT, future).await {
        Ok(output) => output,
        Err(_) => panic!("timed out after {TIMEOUT:?}"),
    }
}

/// Gives other tasks a chance to run and register themselves.
///
/// This is a heuristic, but waiting for a few milliseconds is plenty for tasks that are already
/// spawned to reach their first blocking point.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

/// A one-shot barrier that stays open once opened.
#[derive(Clone, Debug, Default)]
pub struct Gate {
    token: CancellationToken,
}

impl Gate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens the gate, releasing all current and future waiters.
    pub fn open(&self) {
        self.token.cancel();
    }

    pub fn is_open(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Waits until the gate is opened.
    pub async fn wait(&self) {
        self.token.cancelled().await
    }
}

/// A shared counter for asserting how often a callback ran.
#[derive(Clone, Debug, Default)]
pub struct Counter(Arc<AtomicUsize>);

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increments the counter, returning the new count.
    pub fn bump(&self) -> usize {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}
