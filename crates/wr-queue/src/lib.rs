//! Priority work queue with per-agent deduplication and circuit-breaker
//! backoff, layered on the key/value store's atomic primitives.
//!
//! Three FIFO lists (high/normal/low) hold serialized work items; the
//! `active` hash is the sole cross-node mutual-exclusion mechanism for
//! "one activation per agent at a time". Failure counters and backoff
//! deadlines live in two further hashes.

mod queue;

pub use queue::{QueueDepths, QueueError, Result, WorkQueue, WorkQueueConfig};
