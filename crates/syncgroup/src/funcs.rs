//! Fan-in of parallel functions with chained completion signals.
//!
//! Functions added to a [`Funcs`] group are not started right away. The first call to one of the
//! signal accessors spawns everything added so far as a new *generation*. Each generation is
//! chained to the one spawned before it, so its signals cover the whole history of the group:
//! [`Funcs::all_done`] only fires once every function ever added has finished, and
//! [`Funcs::first_error`] fires on the first failure of any generation.

use std::any::Any;
use std::fmt;
use std::future::{self, Future};
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error;
use crate::signal::{Latch, Signal};

/// The result of a function in a [`Funcs`] group.
pub trait Outcome: Clone + Send + Sync + 'static {
    /// Whether the result counts towards the first-ok signal, as opposed to the first-error
    /// signal.
    fn is_success(&self) -> bool;

    /// Whether the result was caused by a cancellation.
    ///
    /// Such a result is ignored if the function's cancellation token has fired.
    fn is_canceled(&self) -> bool {
        false
    }

    /// Whether the result should be left out of all reporting.
    fn is_ignored(&self) -> bool {
        false
    }
}

impl Outcome for bool {
    fn is_success(&self) -> bool {
        *self
    }
}

impl<T, E> Outcome for Result<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: std::error::Error + Clone + Send + Sync + 'static,
{
    fn is_success(&self) -> bool {
        self.is_ok()
    }

    fn is_canceled(&self) -> bool {
        self.as_ref().is_err_and(|err| error::is_canceled(err))
    }

    fn is_ignored(&self) -> bool {
        self.as_ref().is_err_and(|err| error::is_ignored(err))
    }
}

/// Turns the payload of a panicking function into its result.
pub type Recover<R> = Arc<dyn Fn(Box<dyn Any + Send>) -> R + Send + Sync>;

/// Observes every result that is not ignored.
pub type Monitor<R> = Arc<dyn Fn(&R) + Send + Sync>;

type Task<R> = Pin<Box<dyn Future<Output = R> + Send>>;

/// A function group over error-returning functions.
pub type ErrFuncs<E> = Funcs<Result<(), E>>;

/// A function group over functions that report success as `true`.
pub type BoolFuncs = Funcs<bool>;

/// Starts groups of parallel functions and signals when the first, the first successful, the
/// first failed, or all of them have completed.
pub struct Funcs<R> {
    state: Mutex<State<R>>,
}

struct State<R> {
    cancel: Option<CancellationToken>,
    recover: Option<Recover<R>>,
    monitor: Option<Monitor<R>>,
    added: Vec<Added<R>>,
    last: Option<Arc<Generation<R>>>,
}

/// A function added to the group, along with the settings at the time it was added.
struct Added<R> {
    task: Task<R>,
    cancel: Option<CancellationToken>,
    recover: Option<Recover<R>>,
    monitor: Option<Monitor<R>>,
}

/// The signals of one spawned batch of functions.
struct Generation<R> {
    first_done: Latch<R>,
    any_ok: Latch<()>,
    any_not: Latch<R>,
    all_done: Latch<()>,
}

enum Report<R> {
    Done(R),
    Ignored,
}

impl<R> Default for Funcs<R> {
    fn default() -> Self {
        Funcs {
            state: Mutex::new(State {
                cancel: None,
                recover: None,
                monitor: None,
                added: Vec::new(),
                last: None,
            }),
        }
    }
}

impl<R> fmt::Debug for Funcs<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Funcs")
            .field("added", &state.added.len())
            .field("spawned", &state.last.is_some())
            .finish()
    }
}

impl<R: Outcome> Funcs<R> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the cancellation token for functions added after this call.
    ///
    /// If the token has fired by the time such a function completes, and the function's result
    /// [is a cancellation](Outcome::is_canceled), the result is ignored.
    pub fn set_cancel(&self, cancel: Option<CancellationToken>) {
        self.state.lock().cancel = cancel;
    }

    /// Sets a recovery hook for functions added after this call.
    ///
    /// If such a function panics, the hook is called with the panic payload and its return value
    /// is used as the function's result. Without a hook, a panicking function is ignored.
    pub fn set_recover<F>(&self, recover: F)
    where
        F: Fn(Box<dyn Any + Send>) -> R + Send + Sync + 'static,
    {
        self.state.lock().recover = Some(Arc::new(recover));
    }

    /// Sets a monitor for functions added after this call.
    ///
    /// The monitor is called with every result that is not ignored.
    pub fn set_monitor<F>(&self, monitor: F)
    where
        F: Fn(&R) + Send + Sync + 'static,
    {
        self.state.lock().monitor = Some(Arc::new(monitor));
    }

    /// Removes the recovery hook and monitor for functions added after this call.
    pub fn clear_hooks(&self) {
        let mut state = self.state.lock();
        state.recover = None;
        state.monitor = None;
    }

    /// Adds a function to the group.
    ///
    /// The function is not started until one of the signal accessors is called.
    pub fn add<F>(&self, func: F)
    where
        F: Future<Output = R> + Send + 'static,
    {
        self.extend([func]);
    }

    /// Adds several functions to the group.
    pub fn extend<I, F>(&self, funcs: I)
    where
        I: IntoIterator<Item = F>,
        F: Future<Output = R> + Send + 'static,
    {
        let mut state = self.state.lock();
        let state = &mut *state;
        state.added.extend(funcs.into_iter().map(|func| Added {
            task: Box::pin(func),
            cancel: state.cancel.clone(),
            recover: state.recover.clone(),
            monitor: state.monitor.clone(),
        }));
    }

    /// Starts all added functions and returns a signal carrying the first result that is not
    /// ignored.
    ///
    /// # Panics
    ///
    /// Starting functions panics when called outside of a Tokio runtime.
    pub fn first_done(&self) -> Signal<R> {
        match self.start() {
            Some(generation) => generation.first_done.signal(),
            None => Signal::never(),
        }
    }

    /// Starts all added functions and returns a signal that fires on the first successful result.
    ///
    /// The signal never fires if no function succeeds.
    pub fn first_ok(&self) -> Signal<()> {
        match self.start() {
            Some(generation) => generation.any_ok.signal(),
            None => Signal::never(),
        }
    }

    /// Starts all added functions and returns a signal carrying the first failed result.
    ///
    /// The signal never fires if all functions succeed.
    pub fn first_error(&self) -> Signal<R> {
        match self.start() {
            Some(generation) => generation.any_not.signal(),
            None => Signal::never(),
        }
    }

    /// Starts all added functions and returns a signal that fires once every function ever added
    /// to the group has completed.
    pub fn all_done(&self) -> Signal<()> {
        match self.start() {
            Some(generation) => generation.all_done.signal(),
            None => Signal::fired(()),
        }
    }

    /// Spawns the added functions as a new generation, or returns the current one if nothing
    /// was added since.
    fn start(&self) -> Option<Arc<Generation<R>>> {
        let (added, generation, prev) = {
            let mut state = self.state.lock();
            if state.added.is_empty() {
                return state.last.clone();
            }
            let added = std::mem::take(&mut state.added);
            let generation = Arc::new(Generation::new());
            let prev = state.last.replace(Arc::clone(&generation));
            (added, generation, prev)
        };

        let tasks = added.len();
        tracing::trace!(tasks, "Spawning functions");
        metric!(counter("funcs.spawned") += tasks as i64);

        let (results, receiver) = mpsc::channel(tasks);
        for added in added {
            tokio::spawn(run_task(added, results.clone()));
        }
        drop(results);
        tokio::spawn(aggregate(Arc::clone(&generation), prev, receiver, tasks));

        Some(generation)
    }
}

impl<R: Outcome> Generation<R> {
    fn new() -> Self {
        Generation {
            first_done: Latch::new(),
            any_ok: Latch::new(),
            any_not: Latch::new(),
            all_done: Latch::new(),
        }
    }

    fn report(&self, result: R) {
        self.first_done.set(result.clone());
        if result.is_success() {
            self.any_ok.set(());
        } else {
            self.any_not.set(result);
        }
    }
}

async fn run_task<R: Outcome>(added: Added<R>, results: mpsc::Sender<Report<R>>) {
    let Added {
        task,
        cancel,
        recover,
        monitor,
    } = added;

    let result = match recover {
        Some(recover) => match AssertUnwindSafe(task).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => recover(panic),
        },
        None => task.await,
    };

    let canceled = cancel.as_ref().is_some_and(CancellationToken::is_cancelled);
    let report = if result.is_ignored() || (canceled && result.is_canceled()) {
        Report::Ignored
    } else {
        if let Some(monitor) = monitor {
            monitor(&result);
        }
        Report::Done(result)
    };

    // The channel has room for one report per function of the generation.
    let _ = results.try_send(report);
}

/// Waits for `signal`, or forever if there is none.
async fn fired<T: Clone>(signal: Option<Signal<T>>) -> T {
    match signal {
        Some(signal) => signal.wait().await,
        None => future::pending().await,
    }
}

/// Merges the results of a generation's functions with the signals of the previous generation.
async fn aggregate<R: Outcome>(
    generation: Arc<Generation<R>>,
    prev: Option<Arc<Generation<R>>>,
    mut results: mpsc::Receiver<Report<R>>,
    tasks: usize,
) {
    let prev_first_done = fired(prev.as_ref().map(|prev| prev.first_done.signal()));
    let prev_any_ok = fired(prev.as_ref().map(|prev| prev.any_ok.signal()));
    let prev_any_not = fired(prev.as_ref().map(|prev| prev.any_not.signal()));
    let prev_all_done = fired(prev.as_ref().map(|prev| prev.all_done.signal()));
    tokio::pin!(prev_first_done, prev_any_ok, prev_any_not, prev_all_done);

    let mut received = 0;
    let mut prev_done = prev.is_none();
    while received < tasks || !prev_done {
        tokio::select! {
            // Whatever the previous generation has already seen happened first.
            biased;

            result = &mut prev_first_done, if !generation.first_done.is_set() => {
                generation.report(result);
            }
            () = &mut prev_any_ok, if !generation.any_ok.is_set() => {
                generation.any_ok.set(());
            }
            result = &mut prev_any_not, if !generation.any_not.is_set() => {
                generation.any_not.set(result);
            }
            () = &mut prev_all_done, if !prev_done => prev_done = true,
            report = results.recv(), if received < tasks => match report {
                Some(Report::Done(result)) => {
                    received += 1;
                    generation.report(result);
                }
                Some(Report::Ignored) => received += 1,
                None => {
                    // Every remaining function terminated without reporting, most likely
                    // because it panicked without a recovery hook.
                    let unreported = tasks - received;
                    tracing::error!(unreported, "Functions terminated without a result");
                    metric!(counter("funcs.unreported") += unreported as i64);
                    received = tasks;
                }
            },
        }
    }

    generation.all_done.set(());
}
