//! Allocate unique, strictly increasing message indices.
//!
//! The counter is a single [Cell::Monotonic] row per queue holding the next index to hand out.
//! Allocation reads the counter and swaps in its successor; whoever wins the swap owns the value
//! that was read. Losers simply try again, so indices are unique and strictly increasing across
//! successful allocations but not contiguous in the log: an allocated index whose message is never
//! written (for example because the publisher crashed) leaves a permanent gap.

use crate::driver::{Cell, Driver, Error, Swap};
use tracing::trace;

/// Allocates indices for one queue.
#[derive(Clone)]
pub struct Allocator<D: Driver> {
    driver: D,
    queue: String,
}

impl<D: Driver> Allocator<D> {
    /// Create an allocator for the queue with the given id.
    pub fn new(driver: D, queue: String) -> Self {
        Self { driver, queue }
    }

    /// Allocate the next index.
    ///
    /// There is no bound on the number of attempts: contention is resolved by the store (and
    /// its backoff), not here.
    pub async fn next(&self) -> Result<u64, Error> {
        let mut current = self.driver.read_cell(&self.queue, Cell::Monotonic).await?;
        loop {
            let index = current.unwrap_or(0);
            match self
                .driver
                .swap_cell(&self.queue, Cell::Monotonic, current, index + 1)
                .await?
            {
                Swap::Swapped => return Ok(index as u64),
                Swap::Conflict(actual) => {
                    trace!(queue = self.queue, index, ?actual, "lost allocation race");
                    current = actual;
                }
            }
        }
    }

    /// The next index that will be allocated (0 if nothing was ever allocated).
    pub async fn current(&self) -> Result<u64, Error> {
        let current = self.driver.read_cell(&self.queue, Cell::Monotonic).await?;
        Ok(current.unwrap_or(0) as u64)
    }
}
