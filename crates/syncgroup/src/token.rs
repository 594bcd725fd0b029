use std::fmt;
use std::future::Future;
use std::hash::Hash;

use tokio_util::sync::CancellationToken;

use crate::calls::Calls;
use crate::error::Canceled;
use crate::status::Status;

/// Batches together fallible calls with the same key, bound to cancellation tokens.
///
/// This is a [`Calls`] group whose callers bring a [`CancellationToken`]. A waiting caller leaves
/// the batch when its token is cancelled, and a leader's result is only shared if the leader's
/// token is still live once the callback returns. Otherwise another waiter takes over and runs
/// its own callback.
pub struct TokenCalls<K, T, E> {
    calls: Calls<K, Result<T, E>>,
}

impl<K, T, E> Default for TokenCalls<K, T, E> {
    fn default() -> Self {
        TokenCalls {
            calls: Calls::default(),
        }
    }
}

impl<K, T, E> fmt::Debug for TokenCalls<K, T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenCalls")
            .field("calls", &self.calls)
            .finish()
    }
}

impl<K, T, E> TokenCalls<K, T, E>
where
    K: Hash + Eq + Clone,
    T: Clone,
    E: Clone + From<Canceled>,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts or joins the batch for `key`.
    ///
    /// Returns the result of the callback that completed while its token was live, or
    /// `Err(Canceled)` with [`Status::Canceled`] if `token` was cancelled before a result was
    /// available to this caller.
    pub async fn run<F, Fut>(
        &self,
        token: &CancellationToken,
        key: K,
        callback: F,
    ) -> (Result<T, E>, Status)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let (result, status) = self
            .calls
            .run(key, token.cancelled(), || async move {
                let result = callback().await;
                (result, !token.is_cancelled())
            })
            .await;
        match result {
            Some(result) => (result, status),
            None => (Err(Canceled.into()), Status::Canceled),
        }
    }
}
