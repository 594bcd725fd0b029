//! One-shot broadcast signals carrying a value.
//!
//! A [`Latch`] is closed at most once, by the first call to [`Latch::set`]. Every [`Signal`]
//! subscribed to it observes that same value forever after. A latch that is dropped without ever
//! being set leaves its signals pending forever.

use std::fmt;
use std::future;

use tokio::sync::watch;

/// The writing half of a one-shot signal.
pub(crate) struct Latch<T> {
    tx: watch::Sender<Option<T>>,
}

impl<T> Latch<T> {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Latch { tx }
    }

    /// Closes the latch with `value`.
    ///
    /// Returns `false` and discards `value` if the latch was already closed.
    pub fn set(&self, value: T) -> bool {
        self.tx.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(value);
            true
        })
    }

    pub fn is_set(&self) -> bool {
        self.tx.borrow().is_some()
    }

    pub fn signal(&self) -> Signal<T> {
        Signal {
            rx: self.tx.subscribe(),
        }
    }
}

impl<T: Clone> Latch<T> {
    pub fn get(&self) -> Option<T> {
        self.tx.borrow().clone()
    }
}

impl<T> fmt::Debug for Latch<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Latch")
            .field("set", &self.is_set())
            .finish()
    }
}

/// A receive-only handle to a one-shot signal.
///
/// Signals are cheap to clone. Waiting on a signal never consumes it, so a signal can be raced
/// against a caller's own cancellation or timeout and awaited again later.
#[derive(Clone)]
pub struct Signal<T> {
    rx: watch::Receiver<Option<T>>,
}

impl<T: Clone> Signal<T> {
    /// A signal that has already fired with `value`.
    pub fn fired(value: T) -> Self {
        let (_tx, rx) = watch::channel(Some(value));
        Signal { rx }
    }

    /// A signal that never fires.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(None);
        Signal { rx }
    }

    /// Waits for the signal to fire and returns its value.
    ///
    /// If the signal can no longer fire, this never resolves.
    pub async fn wait(&self) -> T {
        let mut rx = self.rx.clone();
        let value = match rx.wait_for(Option::is_some).await {
            Ok(slot) => slot.clone(),
            Err(_) => None,
        };
        match value {
            Some(value) => value,
            None => future::pending().await,
        }
    }

    /// The value of the signal if it has already fired.
    pub fn get(&self) -> Option<T> {
        self.rx.borrow().clone()
    }

    pub fn is_fired(&self) -> bool {
        self.rx.borrow().is_some()
    }
}

impl<T> fmt::Debug for Signal<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signal")
            .field("fired", &self.rx.borrow().is_some())
            .finish()
    }
}
