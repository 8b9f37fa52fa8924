//! Cursors that track how far readers and the repair worker have progressed through a queue.
//!
//! Every pointer is a [Pointer] over a cell row, parameterized by a [Kind] that names the row and
//! its default value. The pointer itself only knows how to read and conditionally move; when and
//! where to move it is decided by [crate::reader] and [crate::repair].

use crate::driver::{Cell, Driver, Error, Swap};
use std::marker::PhantomData;

/// Identifies the row backing a [Pointer] and its value before the first write.
pub trait Kind: Clone + Send + Sync + 'static {
    const CELL: Cell;
    const DEFAULT: i64;
}

/// The bucket readers consume new messages from.
#[derive(Clone)]
pub struct ReaderBucket;

impl Kind for ReaderBucket {
    const CELL: Cell = Cell::ReaderBucket;
    const DEFAULT: i64 = 0;
}

/// The earliest index that may become visible again after a timeout.
///
/// Starts before index 0.
#[derive(Clone)]
pub struct Invisibility;

impl Kind for Invisibility {
    const CELL: Cell = Cell::Invisibility;
    const DEFAULT: i64 = -1;
}

/// The next bucket the repair worker inspects.
#[derive(Clone)]
pub struct RepairBucket;

impl Kind for RepairBucket {
    const CELL: Cell = Cell::RepairBucket;
    const DEFAULT: i64 = 0;
}

/// A compare-and-swap cursor stored in a cell.
#[derive(Clone)]
pub struct Pointer<K: Kind, D: Driver> {
    driver: D,
    queue: String,
    _kind: PhantomData<K>,
}

impl<K: Kind, D: Driver> Pointer<K, D> {
    /// Create a pointer for the queue with the given id.
    pub fn new(driver: D, queue: String) -> Self {
        Self {
            driver,
            queue,
            _kind: PhantomData,
        }
    }

    /// The current value.
    pub async fn get(&self) -> Result<i64, Error> {
        let value = self.driver.read_cell(&self.queue, K::CELL).await?;
        Ok(value.unwrap_or(K::DEFAULT))
    }

    /// Move the pointer to `desired` if it currently points at `expected`.
    ///
    /// Returns `desired` if the move was applied, otherwise the value the pointer holds.
    pub async fn move_if(&self, expected: i64, desired: i64) -> Result<i64, Error> {
        let swap = self
            .driver
            .swap_cell(&self.queue, K::CELL, Some(expected), desired)
            .await?;
        let actual = match swap {
            Swap::Swapped => return Ok(desired),
            // A pointer that was never written holds its default
            Swap::Conflict(None) if expected == K::DEFAULT => {
                match self
                    .driver
                    .swap_cell(&self.queue, K::CELL, None, desired)
                    .await?
                {
                    Swap::Swapped => return Ok(desired),
                    Swap::Conflict(actual) => actual,
                }
            }
            Swap::Conflict(actual) => actual,
        };
        Ok(actual.unwrap_or(K::DEFAULT))
    }
}
