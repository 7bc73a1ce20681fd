#![doc = include_str!("../README.md")]
#![deny(missing_docs)]
#![forbid(unsafe_code)]

#[cfg(not(any(feature = "redis-tokio", feature = "redis-smol")))]
compile_error!("enable either the `redis-tokio` or the `redis-smol` feature");

mod rate_limiter;
pub use rate_limiter::*;

mod engine;
pub use engine::*;

mod status;
pub use status::*;

mod ledger;
pub use ledger::*;

mod store;
pub use store::*;

mod memory;
pub use memory::*;

pub mod redis;

mod retry;
pub use retry::*;

mod error;
pub use error::*;

mod common;
pub use common::*;

mod runtime;

#[cfg(test)]
mod tests;
