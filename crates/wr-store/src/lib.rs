//! Typed client for the Redis-compatible key/value store.
//!
//! The [`KvStore`] trait is the only surface the queue, leader election,
//! and config cache see; [`RedisStore`] is the production implementation
//! and [`MemoryStore`] backs unit tests and local development.

pub mod memory;
pub mod redis_store;
pub mod store;

pub use memory::MemoryStore;
pub use redis_store::{RedisStore, RetryPolicy};
pub use store::{KvStore, Result, StoreError};
