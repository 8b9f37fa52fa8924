//! Deliver messages from a bucketed log with per-message visibility timeouts.
//!
//! `sluice-queue` implements the delivery and consistency engine of a multi-tenant message queue
//! with at-least-once semantics. Messages are appended to a per-queue log addressed by a
//! monotonically increasing index and grouped into fixed-size buckets. Readers claim messages with
//! compare-and-swap updates against a [driver::Driver] (no locks are taken anywhere), and a
//! background [repair] process republishes messages that were written into a bucket after it was
//! sealed.
//!
//! # Components
//!
//! - [index::Allocator]: hands out unique, strictly increasing indices.
//! - [message::Messages]: the message table (put, consume, ack, update, tombstones).
//! - [pointer::Pointer]: CAS cursors tracking reader, invisibility, and repair progress.
//! - [reader::Reader]: selects and claims the next consumable message.
//! - [repair]: seals, waits out a grace period, and republishes ghost messages.
//! - [receipt::PopReceipt]: the capability handed to consumers to ack or update a delivery.
//! - [Engine]: the entry point used by the (external) request layer.
//!
//! # Time
//!
//! Every visibility and grace-period comparison goes through [commonware_runtime::Clock]. Running
//! the engine on [commonware_runtime::deterministic] makes every interleaving reproducible and lets
//! tests skip through hours of virtual time instantly.
//!
//! # Status
//!
//! `sluice-queue` is **ALPHA** software and is not yet recommended for production use. Developers
//! should expect breaking changes and occasional instability.

use thiserror::Error;

mod definition;
pub use definition::QueueDefinition;
pub mod driver;
mod engine;
pub use engine::{Config, Delivery, Engine};
pub mod index;
pub mod message;
pub mod pointer;
pub mod reader;
pub mod receipt;
pub mod repair;

/// Errors that can occur when interacting with a queue.
#[derive(Debug, Error)]
pub enum Error {
    /// The allocator handed out an index that is already occupied.
    ///
    /// This is never retried: it means the allocator (or the store backing it) is broken.
    #[error("index collision: {0}")]
    IndexCollision(u64),
    #[error("driver error: {0}")]
    Driver(#[from] driver::Error),
}
