//! Row-level access to the replicated store backing every queue.
//!
//! The engine never holds a lock: every mutation is either an insert-if-absent or a conditional
//! update that applies only if the row still matches what the caller last read (the semantics of
//! Cassandra lightweight transactions). A [Driver] exposes exactly those primitives, keyed by the
//! queue id ([crate::QueueDefinition::id]):
//!
//! - **cells**: small integer rows addressed by `(queue, Cell)` used for the index counter and
//!   the three pointers.
//! - **messages**: rows addressed by `(queue, bucket, index)`.
//! - **tombstones**: rows addressed by `(queue, bucket)` recording when a bucket was sealed.
//!
//! A lost condition is reported as data (`false`, [Swap::Conflict]), never as an [Error].
//! [Error::Unavailable] is reserved for failures known to have happened before the operation was
//! applied, which makes them safe to retry (see [retry::Retrying]).

use crate::message::Message;
use std::{future::Future, time::SystemTime};
use thiserror::Error;

pub mod memory;
pub mod retry;

/// Errors that can occur when interacting with a [Driver].
#[derive(Debug, Error)]
pub enum Error {
    /// The store could not serve the request. The operation was not applied.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("retries exhausted after {attempts} attempts: {source}")]
    Exhausted {
        attempts: u32,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Whether the operation may succeed if attempted again.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Unavailable(_))
    }
}

/// Integer rows stored once per queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Cell {
    /// The next index to allocate.
    Monotonic,
    /// The bucket readers are consuming from.
    ReaderBucket,
    /// The earliest index that may become visible again.
    Invisibility,
    /// The next bucket the repair worker will inspect.
    RepairBucket,
}

/// Outcome of a conditional write to a [Cell].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Swap {
    /// The cell matched the expected value and now holds the desired value.
    Swapped,
    /// The cell did not match. Contains the value it holds (`None` if the row is absent).
    Conflict(Option<i64>),
}

/// Preconditions for a conditional message update.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Condition {
    /// The stored message must still have this version.
    pub version: u64,

    /// The stored message must not be acknowledged.
    pub unacked: bool,
}

/// Interface that any store backing a queue must implement.
pub trait Driver: Clone + Send + Sync + 'static {
    /// Read a cell, returning `None` if it was never written.
    fn read_cell(
        &self,
        queue: &str,
        cell: Cell,
    ) -> impl Future<Output = Result<Option<i64>, Error>> + Send;

    /// Set a cell to `desired` if it currently holds `expected` (`None` meaning absent).
    fn swap_cell(
        &self,
        queue: &str,
        cell: Cell,
        expected: Option<i64>,
        desired: i64,
    ) -> impl Future<Output = Result<Swap, Error>> + Send;

    /// Insert a message if no message exists at its index.
    ///
    /// Returns `false` (without modifying anything) if the slot is occupied.
    fn insert_message(
        &self,
        queue: &str,
        bucket: u64,
        message: Message,
    ) -> impl Future<Output = Result<bool, Error>> + Send;

    /// Read the message at `index`.
    fn read_message(
        &self,
        queue: &str,
        bucket: u64,
        index: u64,
    ) -> impl Future<Output = Result<Option<Message>, Error>> + Send;

    /// Read every message in `bucket`, ordered by index.
    fn read_bucket(
        &self,
        queue: &str,
        bucket: u64,
    ) -> impl Future<Output = Result<Vec<Message>, Error>> + Send;

    /// Replace the message at `message.index` if the stored row satisfies `condition`.
    ///
    /// Returns whether the write was applied.
    fn update_message(
        &self,
        queue: &str,
        bucket: u64,
        message: Message,
        condition: Condition,
    ) -> impl Future<Output = Result<bool, Error>> + Send;

    /// Record that `bucket` was sealed at `sealed_at`, unless it already was.
    ///
    /// Returns the stored timestamp (which is `sealed_at` only for the first writer).
    fn insert_tombstone(
        &self,
        queue: &str,
        bucket: u64,
        sealed_at: SystemTime,
    ) -> impl Future<Output = Result<SystemTime, Error>> + Send;

    /// Read when `bucket` was sealed, if it was.
    fn read_tombstone(
        &self,
        queue: &str,
        bucket: u64,
    ) -> impl Future<Output = Result<Option<SystemTime>, Error>> + Send;

    /// Remove every message in `bucket` (the tombstone is kept).
    fn delete_bucket(&self, queue: &str, bucket: u64)
        -> impl Future<Output = Result<(), Error>> + Send;

    /// Remove every row (cells, messages, and tombstones) belonging to `queue`.
    fn drop_queue(&self, queue: &str) -> impl Future<Output = Result<(), Error>> + Send;
}
