//! Select and claim the next consumable message.
//!
//! Readers keep no state of their own: every call re-reads two pointers from the store and moves
//! them with compare-and-swap, so any number of readers (in any number of processes) can serve the
//! same queue concurrently.
//!
//! # Resurrection
//!
//! The [crate::pointer::Invisibility] pointer parks on the earliest message that was delivered but
//! not acknowledged. Each call first inspects that message: if its invisibility timeout expired it
//! is delivered again. Otherwise the pointer's bucket is scanned to find the next message to park
//! on (or to redeliver). The pointer only leaves a bucket once every message in it is acknowledged
//! and the allocator has moved past it, and it never moves past a message that has not been
//! delivered yet (such a message must first be claimed by forward consumption, after which it can
//! time out like any other).
//!
//! # Forward consumption
//!
//! If nothing needs to be resurrected, the [crate::pointer::ReaderBucket] pointer's bucket is
//! searched for a visible, unacknowledged message. A bucket in which every message is either
//! acknowledged or in flight is sealed (tombstoned) and skipped once it can no longer receive new
//! messages: either it is full or the allocator already handed out an index past it. Messages
//! written to a bucket after it was sealed are recovered by [crate::repair].
//!
//! # Contention
//!
//! Losing a compare-and-swap to another reader is expected. A lost claim simply causes the
//! bucket to be read again, and lost pointer moves are ignored (the winner moved the pointer
//! somewhere at least as useful).

use crate::{
    driver::Driver,
    index::Allocator,
    message::{Message, Messages},
    pointer::{Invisibility, Pointer, ReaderBucket},
    Error, QueueDefinition,
};
use commonware_runtime::Clock;
use rand::RngCore;
use std::{num::NonZeroUsize, time::Duration};
use tracing::{debug, warn};

mod metrics;
pub use metrics::{Metrics, QueueLabel};

/// Outcome of scanning the invisibility pointer's bucket.
enum Scan {
    /// A timed-out message was claimed.
    Claimed(Message),
    /// The pointer is (or should stay) in this bucket.
    Parked,
    /// Every message in the bucket is settled for good.
    Advance,
}

/// Selects and claims messages from one queue.
pub struct Reader<E: Clock + RngCore, D: Driver> {
    context: E,
    queue: QueueDefinition,
    label: QueueLabel,

    allocator: Allocator<D>,
    messages: Messages<E, D>,
    reader_bucket: Pointer<ReaderBucket, D>,
    invisibility: Pointer<Invisibility, D>,

    /// Maximum number of buckets each phase may move through in a single call.
    scan_limit: usize,

    metrics: Metrics,
}

impl<E: Clock + RngCore, D: Driver> Reader<E, D> {
    /// Create a reader for `queue`.
    pub fn new(
        context: E,
        driver: D,
        queue: QueueDefinition,
        scan_limit: NonZeroUsize,
        metrics: Metrics,
    ) -> Self {
        let id = queue.id();
        Self {
            label: QueueLabel::new(&id),
            allocator: Allocator::new(driver.clone(), id.clone()),
            messages: Messages::new(context.clone(), driver.clone(), queue.clone()),
            reader_bucket: Pointer::new(driver.clone(), id.clone()),
            invisibility: Pointer::new(driver, id),
            context,
            queue,
            scan_limit: scan_limit.get(),
            metrics,
        }
    }

    /// Claim the next consumable message, making it invisible for `invisibility`.
    ///
    /// Returns `None` if no message is currently consumable.
    pub async fn next_message(&self, invisibility: Duration) -> Result<Option<Message>, Error> {
        if let Some(message) = self.resurrect(invisibility).await? {
            self.metrics.resurrections.get_or_create(&self.label).inc();
            self.metrics.deliveries.get_or_create(&self.label).inc();
            return Ok(Some(message));
        }
        let message = self.consume_forward(invisibility).await?;
        if message.is_some() {
            self.metrics.deliveries.get_or_create(&self.label).inc();
        }
        Ok(message)
    }

    /// Claim `message`, or retire it if it reached the maximum delivery count.
    async fn claim(
        &self,
        message: &Message,
        invisibility: Duration,
    ) -> Result<Option<Message>, Error> {
        if self.queue.exhausted(message.delivery_count) {
            if self.messages.ack(message).await? {
                warn!(
                    queue = self.label.queue,
                    index = message.index,
                    delivery_count = message.delivery_count,
                    "retired message"
                );
                self.metrics.retired.get_or_create(&self.label).inc();
            }
            return Ok(None);
        }
        let consumed = self.messages.consume(message, invisibility).await?;
        if consumed.is_none() {
            debug!(
                queue = self.label.queue,
                index = message.index,
                "lost claim race"
            );
            self.metrics.races.get_or_create(&self.label).inc();
        }
        Ok(consumed)
    }

    /// Move the invisibility pointer (best effort).
    async fn park(&self, pointer: i64, target: u64) -> Result<(), Error> {
        let target = target as i64;
        if target != pointer {
            self.invisibility.move_if(pointer, target).await?;
        }
        Ok(())
    }

    /// Redeliver the earliest message whose invisibility timeout expired.
    async fn resurrect(&self, invisibility: Duration) -> Result<Option<Message>, Error> {
        let mut pointer = self.invisibility.get().await?;
        for _ in 0..self.scan_limit {
            // Inspect the message the pointer is parked on
            if let Ok(index) = u64::try_from(pointer) {
                if let Some(message) = self.messages.get(index).await? {
                    if !message.acked {
                        if !message.is_delivered() || !message.is_visible(self.context.current())
                        {
                            return Ok(None);
                        }
                        if let Some(consumed) = self.claim(&message, invisibility).await? {
                            return Ok(Some(consumed));
                        }
                    }
                }
            }

            // Look for the next message to park on
            let bucket = self.queue.bucket_of_pointer(pointer);
            match self.scan(pointer, bucket, invisibility).await? {
                Scan::Claimed(message) => return Ok(Some(message)),
                Scan::Parked => return Ok(None),
                Scan::Advance => {
                    let next = self.queue.bucket_start(bucket + 1) as i64;
                    pointer = self.invisibility.move_if(pointer, next).await?;
                }
            }
        }
        debug!(
            queue = self.label.queue,
            pointer, "resurrection scan limit reached"
        );
        Ok(None)
    }

    async fn scan(&self, pointer: i64, bucket: u64, invisibility: Duration) -> Result<Scan, Error> {
        let messages = self.messages.messages_in(bucket).await?;
        let now = self.context.current();
        let pending = messages
            .iter()
            .find(|m| !m.acked && !m.is_delivered())
            .map(|m| m.index);
        let waiting = messages
            .iter()
            .find(|m| !m.acked && m.is_delivered() && !m.is_visible(now))
            .map(|m| m.index);
        let expired = messages
            .iter()
            .find(|m| !m.acked && m.is_delivered() && m.is_visible(now));

        // Park on the earliest in-flight message (never past an undelivered or expired one)
        if let Some(waiting) = waiting {
            let target = [Some(waiting), expired.map(|m| m.index), pending]
                .into_iter()
                .flatten()
                .min()
                .unwrap_or(waiting);
            self.park(pointer, target).await?;
            return Ok(Scan::Parked);
        }

        // Redeliver the earliest expired message
        if let Some(expired) = expired {
            if let Some(consumed) = self.claim(expired, invisibility).await? {
                let target = pending.map_or(consumed.index, |p| p.min(consumed.index));
                self.park(pointer, target).await?;
                return Ok(Scan::Claimed(consumed));
            }
        }

        // Wait for forward consumption to deliver the earliest undelivered message
        if let Some(pending) = pending {
            self.park(pointer, pending).await?;
            return Ok(Scan::Parked);
        }
        if messages.iter().any(|m| !m.acked) {
            return Ok(Scan::Parked);
        }

        // Only leave buckets that can no longer receive messages
        let counter = self.allocator.current().await?;
        if bucket >= self.queue.bucket_of(counter) {
            return Ok(Scan::Parked);
        }
        Ok(Scan::Advance)
    }

    /// Claim the first visible message at or after the reader bucket, sealing settled buckets.
    async fn consume_forward(&self, invisibility: Duration) -> Result<Option<Message>, Error> {
        let mut sealed = 0;
        loop {
            let bucket = self.reader_bucket.get().await?;
            let messages = self.messages.messages_in(bucket as u64).await?;
            let now = self.context.current();
            if let Some(candidate) = messages.iter().find(|m| !m.acked && m.is_visible(now)) {
                if let Some(consumed) = self.claim(candidate, invisibility).await? {
                    return Ok(Some(consumed));
                }
                continue;
            }

            // Every message is acked or in flight: seal the bucket once nothing more can land in it
            let full = messages.len() as u64 == self.queue.bucket_size.get();
            let counter = self.allocator.current().await?;
            if !full && self.queue.bucket_of(counter) <= bucket as u64 {
                return Ok(None);
            }
            if sealed == self.scan_limit {
                debug!(
                    queue = self.label.queue,
                    bucket, "forward scan limit reached"
                );
                return Ok(None);
            }
            self.messages.tombstone(bucket as u64).await?;
            if self.reader_bucket.move_if(bucket, bucket + 1).await? == bucket + 1 {
                self.metrics.seals.get_or_create(&self.label).inc();
            }
            sealed += 1;
        }
    }
}
