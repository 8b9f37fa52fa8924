use crate::{
    driver::Driver,
    index::Allocator,
    message::{Message, Messages},
    reader::{self, Reader},
    receipt::PopReceipt,
    Error, QueueDefinition,
};
use bytes::Bytes;
use commonware_runtime::{Clock, Metrics};
use rand::RngCore;
use std::{
    num::NonZeroUsize,
    time::{Duration, SystemTime},
};
use tracing::debug;

const DEFAULT_SCAN_LIMIT: NonZeroUsize = match NonZeroUsize::new(128) {
    Some(limit) => limit,
    None => panic!("scan limit must be positive"),
};

/// Configuration for the [Engine].
#[derive(Clone, Debug)]
pub struct Config {
    /// Maximum number of buckets a single `next_message` call may scan (per phase) before giving
    /// up and returning `None`.
    pub scan_limit: NonZeroUsize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            scan_limit: DEFAULT_SCAN_LIMIT,
        }
    }
}

/// A message handed to a consumer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Delivery {
    pub index: u64,
    pub blob: Bytes,
    /// Required to ack or update this delivery.
    pub receipt: PopReceipt,
    /// Number of times the message has been delivered (including this one).
    pub delivery_count: u32,
    /// When the message becomes visible to other consumers unless acked.
    pub next_visible_at: SystemTime,
}

impl From<Message> for Delivery {
    fn from(message: Message) -> Self {
        Self {
            receipt: PopReceipt::of(&message),
            index: message.index,
            delivery_count: message.delivery_count,
            next_visible_at: message.next_visible_at,
            blob: message.blob,
        }
    }
}

/// Entry point for producers and consumers of any number of queues.
///
/// The engine is cheap to clone and holds no per-queue state: everything lives in the [Driver].
#[derive(Clone)]
pub struct Engine<E: Clock + Metrics + RngCore, D: Driver> {
    context: E,
    driver: D,
    cfg: Config,
    metrics: reader::Metrics,
}

impl<E: Clock + Metrics + RngCore, D: Driver> Engine<E, D> {
    /// Create an engine over `driver`.
    pub fn new(context: E, driver: D, cfg: Config) -> Self {
        let metrics = reader::Metrics::init(context.with_label("reader"));
        Self {
            context,
            driver,
            cfg,
            metrics,
        }
    }

    /// The message table of `queue`.
    pub fn messages(&self, queue: &QueueDefinition) -> Messages<E, D> {
        Messages::new(self.context.clone(), self.driver.clone(), queue.clone())
    }

    /// A reader for `queue`.
    pub fn reader(&self, queue: &QueueDefinition) -> Reader<E, D> {
        Reader::new(
            self.context.clone(),
            self.driver.clone(),
            queue.clone(),
            self.cfg.scan_limit,
            self.metrics.clone(),
        )
    }

    /// Append `blob` to `queue`, invisible for `initial_invisibility`.
    ///
    /// Returns the index assigned to the message.
    pub async fn put(
        &self,
        queue: &QueueDefinition,
        blob: Bytes,
        initial_invisibility: Duration,
    ) -> Result<u64, Error> {
        let index = Allocator::new(self.driver.clone(), queue.id())
            .next()
            .await?;
        self.messages(queue)
            .put(index, blob, initial_invisibility)
            .await?;
        Ok(index)
    }

    /// Claim the next consumable message of `queue`, hiding it for `invisibility`.
    pub async fn next_message(
        &self,
        queue: &QueueDefinition,
        invisibility: Duration,
    ) -> Result<Option<Delivery>, Error> {
        let message = self.reader(queue).next_message(invisibility).await?;
        Ok(message.map(Delivery::from))
    }

    /// Fetch the live message `receipt` was minted for, if the receipt is still valid.
    async fn authorize(
        &self,
        queue: &QueueDefinition,
        receipt: &PopReceipt,
    ) -> Result<Option<Message>, Error> {
        let message = self.messages(queue).get(receipt.index).await?;
        Ok(message.filter(|message| receipt.matches(message)))
    }

    /// Acknowledge the delivery `receipt` was issued for.
    ///
    /// Returns `false` if the receipt is stale (the message was redelivered, updated, or acked).
    pub async fn ack(&self, queue: &QueueDefinition, receipt: &PopReceipt) -> Result<bool, Error> {
        let Some(message) = self.authorize(queue, receipt).await? else {
            debug!(queue = queue.id(), index = receipt.index, "stale receipt");
            return Ok(false);
        };
        self.messages(queue).ack(&message).await
    }

    /// Replace the payload of the delivery `receipt` was issued for and hide it for
    /// `invisibility`.
    ///
    /// Returns a receipt for the updated message, or `None` if `receipt` is stale.
    pub async fn update(
        &self,
        queue: &QueueDefinition,
        receipt: &PopReceipt,
        blob: Bytes,
        invisibility: Duration,
    ) -> Result<Option<PopReceipt>, Error> {
        let Some(message) = self.authorize(queue, receipt).await? else {
            debug!(queue = queue.id(), index = receipt.index, "stale receipt");
            return Ok(None);
        };
        let updated = self
            .messages(queue)
            .update(&message, blob, invisibility)
            .await?;
        Ok(updated.as_ref().map(PopReceipt::of))
    }

    /// Remove every row belonging to `queue`.
    ///
    /// The repair worker of the queue should be stopped first.
    pub async fn delete_queue(&self, queue: &QueueDefinition) -> Result<(), Error> {
        self.driver.drop_queue(&queue.id()).await?;
        debug!(queue = queue.id(), "deleted queue");
        Ok(())
    }
}
