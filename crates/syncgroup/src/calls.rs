//! Coalescing of concurrent calls with the same key.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::Semaphore;

use crate::signal::Latch;
use crate::status::Status;
use crate::utils::defer::defer;

/// Batches together calls with the same key to share the result of executing only one of the
/// callbacks in the batch.
///
/// The first caller for a key becomes the leader and runs its callback while later callers wait.
/// If the callback accepts its result, the result is handed to every waiter and the key is
/// retired, so the next caller for that key starts a new batch. If the callback rejects its
/// result, panics, or the leader's future is dropped, leadership passes to one of the remaining
/// waiters, which then runs its own callback.
pub struct Calls<K, T> {
    calls: Mutex<HashMap<K, Arc<Call<T>>>>,
}

/// The state of a single in-flight batch.
struct Call<T> {
    /// Holds one permit as long as nobody is running a callback for this batch.
    leader: Semaphore,
    /// Closed with the accepted result.
    done: Latch<T>,
    /// The callers registered against this batch, the leader included.
    ///
    /// Only callers that leave without taking part are removed again: canceled waiters and
    /// dropped futures. Leaders that rejected their result or panicked stay counted.
    waiters: AtomicUsize,
}

impl<T> Call<T> {
    fn new() -> Self {
        Call {
            leader: Semaphore::new(1),
            done: Latch::new(),
            waiters: AtomicUsize::new(0),
        }
    }
}

impl<K, T> Default for Calls<K, T> {
    fn default() -> Self {
        Calls {
            calls: Mutex::new(HashMap::new()),
        }
    }
}

impl<K, T> fmt::Debug for Calls<K, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Calls")
            .field("in-flight keys", &self.calls.lock().len())
            .finish()
    }
}

impl<K, T> Calls<K, T>
where
    K: Hash + Eq + Clone,
    T: Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// The number of keys that currently have a batch in flight.
    pub fn len(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Starts or joins the batch for `key`, waiting for a member of the batch to produce a
    /// result that it accepts.
    ///
    /// `callback` is only invoked if this caller becomes the leader of the batch. It returns the
    /// result together with a flag whether the result should be accepted by the batch.
    ///
    /// Resolving `cancel` lets a waiting caller leave the batch before a result is ready, in
    /// which case `(None, Status::Canceled)` is returned. Once this caller is running its own
    /// callback, `cancel` is no longer observed. A caller whose callback rejects its result also
    /// gets `(None, Status::Canceled)`.
    ///
    /// Panics of `callback` propagate to this caller, after leadership was handed back to the
    /// remaining waiters.
    pub async fn run<C, F, Fut>(&self, key: K, cancel: C, callback: F) -> (Option<T>, Status)
    where
        C: Future<Output = ()>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = (T, bool)>,
    {
        let call = {
            let mut calls = self.calls.lock();
            let call = calls
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Call::new()));
            call.waiters.fetch_add(1, Ordering::AcqRel);
            Arc::clone(call)
        };
        // A caller that is dropped while waiting or leading unregisters. A panicking leader took
        // part in the batch and stays registered.
        let membership = defer(|| {
            if !std::thread::panicking() {
                call.waiters.fetch_sub(1, Ordering::AcqRel);
            }
        });

        let done = call.done.signal();
        tokio::pin!(cancel);
        let permit = tokio::select! {
            biased;

            value = done.wait() => {
                metric!(counter("calls.shared") += 1);
                return (Some(value), Status::Shared);
            }
            () = &mut cancel => {
                let calls = self.calls.lock();
                let retired = !calls
                    .get(&key)
                    .is_some_and(|current| Arc::ptr_eq(current, &call));
                if retired {
                    // The batch completed while we were being canceled.
                    if let Some(value) = call.done.get() {
                        metric!(counter("calls.shared") += 1);
                        return (Some(value), Status::Shared);
                    }
                }
                drop(membership);
                drop(calls);
                metric!(counter("calls.canceled") += 1);
                return (None, Status::Canceled);
            }
            permit = call.leader.acquire() => permit,
        };
        let Ok(permit) = permit else {
            // The semaphore is never closed.
            return (None, Status::Canceled);
        };

        tracing::trace!("Running callback as leader of the batch");
        metric!(counter("calls.leader") += 1);
        let start = Instant::now();
        let (value, accept) = callback().await;
        metric!(timer("calls.callback.duration") = start.elapsed());

        if !accept {
            tracing::trace!("Callback rejected its result, handing over leadership");
            metric!(counter("calls.rejected") += 1);
            // The rejected attempt still counts as a member of the batch.
            membership.cancel();
            drop(permit);
            return (None, Status::Canceled);
        }

        // The batch is complete, nobody may lead it again.
        permit.forget();
        let waiters = {
            let mut calls = self.calls.lock();
            calls.remove(&key);
            // Waiters unregister as soon as they observe the result.
            let waiters = call.waiters.load(Ordering::Acquire);
            call.done.set(value.clone());
            waiters
        };
        drop(membership);
        metric!(histogram("calls.waiters") = waiters as u64);

        let status = if waiters > 1 {
            Status::Shared
        } else {
            Status::Exclusive
        };
        tracing::trace!(waiters, "Completed batch ({})", status.as_str());
        (Some(value), status)
    }
}
