//! Primitives for sharing work and results between concurrent callers.
//!
//! - [`Calls`] coalesces concurrent calls with the same key into a single execution, handing
//!   leadership to another waiter whenever the executed callback rejects its own result.
//! - [`RefCache`] caches values filled through a [`Calls`] group and reference-counts them, so
//!   that each value is released exactly once after it has been evicted and all holders are gone.
//! - [`Funcs`] runs batches of parallel futures and exposes first-done, first-ok, first-error and
//!   all-done signals that compose across every batch ever added.
//!
//! [`TokenCalls`] and [`Cache`] are thin variants built on the same contracts.

#[macro_use]
pub mod metrics;

pub mod cache;
pub mod calls;
pub mod config;
pub mod error;
pub mod funcs;
pub mod logging;
pub mod refcache;
pub mod signal;
pub mod status;
pub mod token;
pub mod utils;

pub use cache::Cache;
pub use calls::Calls;
pub use error::{Canceled, Ignored};
pub use funcs::{BoolFuncs, ErrFuncs, Funcs, Outcome};
pub use refcache::{CacheRef, Fetched, RefCache, Releaser};
pub use signal::Signal;
pub use status::Status;
pub use token::TokenCalls;
