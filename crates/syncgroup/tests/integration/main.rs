// See <https://matklad.github.io/2021/02/27/delete-cargo-integration-tests.html>

pub mod coalescing;
pub mod fan_in;
pub mod refcache;
pub mod utils;

pub use utils::*;
