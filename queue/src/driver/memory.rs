//! An in-memory [Driver] with optional latency and failure injection.
//!
//! Every operation is applied atomically under a single mutex, which gives the same per-row
//! linearizability a replicated store provides for conditional writes. Injected latency is spent
//! (on the runtime [Clock]) before the operation is applied, so concurrent tasks interleave at
//! every storage call exactly like they would against a remote store.

use super::{Cell, Condition, Driver, Error, Swap};
use crate::message::Message;
use commonware_runtime::Clock;
use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::{Duration, SystemTime},
};
use tracing::trace;

/// Configuration for [Memory].
#[derive(Clone, Debug, Default)]
pub struct Config {
    /// Time spent before each operation is applied.
    pub latency: Option<Duration>,
}

/// Rows belonging to a single queue.
#[derive(Default)]
struct Rows {
    cells: HashMap<Cell, i64>,
    buckets: BTreeMap<u64, BTreeMap<u64, Message>>,
    tombstones: HashMap<u64, SystemTime>,
}

/// A [Driver] that keeps every row in process memory.
#[derive(Clone)]
pub struct Memory<E: Clock> {
    context: E,
    cfg: Config,
    queues: Arc<Mutex<HashMap<String, Rows>>>,
    failures: Arc<AtomicUsize>,
}

impl<E: Clock> Memory<E> {
    /// Create an empty store.
    pub fn new(context: E, cfg: Config) -> Self {
        Self {
            context,
            cfg,
            queues: Arc::new(Mutex::new(HashMap::new())),
            failures: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Fail the next `count` operations with [Error::Unavailable] (without applying them).
    pub fn fail(&self, count: usize) {
        self.failures.fetch_add(count, Ordering::SeqCst);
    }

    /// Wait out the configured latency and consume an injected failure, if any.
    async fn enter(&self, operation: &'static str) -> Result<(), Error> {
        if let Some(latency) = self.cfg.latency {
            self.context.sleep(latency).await;
        }
        let injected = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |pending| {
                pending.checked_sub(1)
            })
            .is_ok();
        if injected {
            trace!(operation, "injected failure");
            return Err(Error::Unavailable(format!("injected failure: {operation}")));
        }
        Ok(())
    }

    /// Apply `f` to the rows of `queue`.
    fn with_rows<T>(&self, queue: &str, f: impl FnOnce(&mut Rows) -> T) -> T {
        let mut queues = self.queues.lock().unwrap();
        let rows = queues.entry(queue.to_string()).or_default();
        f(rows)
    }
}

impl<E: Clock> Driver for Memory<E> {
    async fn read_cell(&self, queue: &str, cell: Cell) -> Result<Option<i64>, Error> {
        self.enter("read_cell").await?;
        Ok(self.with_rows(queue, |rows| rows.cells.get(&cell).copied()))
    }

    async fn swap_cell(
        &self,
        queue: &str,
        cell: Cell,
        expected: Option<i64>,
        desired: i64,
    ) -> Result<Swap, Error> {
        self.enter("swap_cell").await?;
        Ok(self.with_rows(queue, |rows| {
            let current = rows.cells.get(&cell).copied();
            if current != expected {
                return Swap::Conflict(current);
            }
            rows.cells.insert(cell, desired);
            Swap::Swapped
        }))
    }

    async fn insert_message(
        &self,
        queue: &str,
        bucket: u64,
        message: Message,
    ) -> Result<bool, Error> {
        self.enter("insert_message").await?;
        Ok(self.with_rows(queue, |rows| {
            let messages = rows.buckets.entry(bucket).or_default();
            if messages.contains_key(&message.index) {
                return false;
            }
            messages.insert(message.index, message);
            true
        }))
    }

    async fn read_message(
        &self,
        queue: &str,
        bucket: u64,
        index: u64,
    ) -> Result<Option<Message>, Error> {
        self.enter("read_message").await?;
        Ok(self.with_rows(queue, |rows| {
            rows.buckets
                .get(&bucket)
                .and_then(|messages| messages.get(&index))
                .cloned()
        }))
    }

    async fn read_bucket(&self, queue: &str, bucket: u64) -> Result<Vec<Message>, Error> {
        self.enter("read_bucket").await?;
        Ok(self.with_rows(queue, |rows| {
            rows.buckets
                .get(&bucket)
                .map(|messages| messages.values().cloned().collect())
                .unwrap_or_default()
        }))
    }

    async fn update_message(
        &self,
        queue: &str,
        bucket: u64,
        message: Message,
        condition: Condition,
    ) -> Result<bool, Error> {
        self.enter("update_message").await?;
        Ok(self.with_rows(queue, |rows| {
            let Some(stored) = rows
                .buckets
                .get_mut(&bucket)
                .and_then(|messages| messages.get_mut(&message.index))
            else {
                return false;
            };
            if stored.version != condition.version || (condition.unacked && stored.acked) {
                return false;
            }
            *stored = message;
            true
        }))
    }

    async fn insert_tombstone(
        &self,
        queue: &str,
        bucket: u64,
        sealed_at: SystemTime,
    ) -> Result<SystemTime, Error> {
        self.enter("insert_tombstone").await?;
        Ok(self.with_rows(queue, |rows| {
            *rows.tombstones.entry(bucket).or_insert(sealed_at)
        }))
    }

    async fn read_tombstone(&self, queue: &str, bucket: u64) -> Result<Option<SystemTime>, Error> {
        self.enter("read_tombstone").await?;
        Ok(self.with_rows(queue, |rows| rows.tombstones.get(&bucket).copied()))
    }

    async fn delete_bucket(&self, queue: &str, bucket: u64) -> Result<(), Error> {
        self.enter("delete_bucket").await?;
        self.with_rows(queue, |rows| {
            rows.buckets.remove(&bucket);
        });
        Ok(())
    }

    async fn drop_queue(&self, queue: &str) -> Result<(), Error> {
        self.enter("drop_queue").await?;
        self.queues.lock().unwrap().remove(queue);
        Ok(())
    }
}
