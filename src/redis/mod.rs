//! Redis-backed reservation store.
//!
//! [`RedisConnectionManager`] owns a bounded pool of connections and retries
//! transient failures; [`RedisReservationStore`] implements the ledger
//! operations as Lua scripts issued through it.

mod connection_manager;
pub use connection_manager::*;

mod redis_reservation_store;
pub use redis_reservation_store::*;

mod common;
pub(crate) use common::*;
