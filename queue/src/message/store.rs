use super::{Message, Tag};
use crate::{
    driver::{Condition, Driver},
    Error, QueueDefinition,
};
use bytes::Bytes;
use commonware_runtime::Clock;
use commonware_utils::SystemTimeExt;
use rand::RngCore;
use std::time::{Duration, SystemTime};
use tracing::{debug, error};

/// The messages (and bucket tombstones) of one queue.
#[derive(Clone)]
pub struct Messages<E: Clock + RngCore, D: Driver> {
    context: E,
    driver: D,
    queue: QueueDefinition,
    id: String,
}

impl<E: Clock + RngCore, D: Driver> Messages<E, D> {
    /// Create a store for `queue`.
    pub fn new(context: E, driver: D, queue: QueueDefinition) -> Self {
        let id = queue.id();
        Self {
            context,
            driver,
            queue,
            id,
        }
    }

    /// Write a new message at `index`, invisible for `initial_invisibility`.
    ///
    /// # Errors
    ///
    /// Returns [Error::IndexCollision] if a message already exists at `index`.
    pub async fn put(
        &self,
        index: u64,
        blob: Bytes,
        initial_invisibility: Duration,
    ) -> Result<Message, Error> {
        let now = self.context.current();
        let mut rng = self.context.clone();
        let message = Message {
            index,
            blob,
            version: 0,
            delivery_count: 0,
            acked: false,
            next_visible_at: now + initial_invisibility,
            tag: Tag::random(&mut rng),
            created_at: now,
        };
        let bucket = self.queue.bucket_of(index);
        if !self
            .driver
            .insert_message(&self.id, bucket, message.clone())
            .await?
        {
            error!(queue = self.id, index, "index collision");
            return Err(Error::IndexCollision(index));
        }
        debug!(queue = self.id, index, bucket, "put message");
        Ok(message)
    }

    /// Claim `message` for `invisibility`.
    ///
    /// Returns the claimed message, or `None` if `message` was modified (or acked) since it was
    /// read.
    pub async fn consume(
        &self,
        message: &Message,
        invisibility: Duration,
    ) -> Result<Option<Message>, Error> {
        let consumed = message.consumed(self.context.current(), invisibility);
        let condition = Condition {
            version: message.version,
            unacked: true,
        };
        self.conditional(consumed, condition).await
    }

    /// Acknowledge `message`.
    ///
    /// Returns `false` if `message` was modified since it was read.
    pub async fn ack(&self, message: &Message) -> Result<bool, Error> {
        let condition = Condition {
            version: message.version,
            unacked: false,
        };
        Ok(self
            .conditional(message.acknowledged(), condition)
            .await?
            .is_some())
    }

    /// Replace the payload of `message` and make it invisible for `invisibility`.
    ///
    /// Returns the updated message, or `None` if `message` was modified (or acked) since it was
    /// read.
    pub async fn update(
        &self,
        message: &Message,
        blob: Bytes,
        invisibility: Duration,
    ) -> Result<Option<Message>, Error> {
        let updated = message.updated(blob, self.context.current(), invisibility);
        let condition = Condition {
            version: message.version,
            unacked: true,
        };
        self.conditional(updated, condition).await
    }

    async fn conditional(
        &self,
        next: Message,
        condition: Condition,
    ) -> Result<Option<Message>, Error> {
        let bucket = self.queue.bucket_of(next.index);
        let applied = self
            .driver
            .update_message(&self.id, bucket, next.clone(), condition)
            .await?;
        Ok(applied.then_some(next))
    }

    /// Seal `bucket`.
    ///
    /// Idempotent: returns the time recorded by whoever sealed the bucket first.
    pub async fn tombstone(&self, bucket: u64) -> Result<SystemTime, Error> {
        let now = self.context.current();
        let sealed_at = self.driver.insert_tombstone(&self.id, bucket, now).await?;
        if sealed_at == now {
            debug!(
                queue = self.id,
                bucket,
                sealed_at = sealed_at.epoch_millis(),
                "sealed bucket"
            );
        }
        Ok(sealed_at)
    }

    /// When `bucket` was sealed, if it was.
    pub async fn tombstone_time(&self, bucket: u64) -> Result<Option<SystemTime>, Error> {
        Ok(self.driver.read_tombstone(&self.id, bucket).await?)
    }

    /// Every message in `bucket`, ordered by index.
    pub async fn messages_in(&self, bucket: u64) -> Result<Vec<Message>, Error> {
        Ok(self.driver.read_bucket(&self.id, bucket).await?)
    }

    /// The message at `index`, if one was written.
    pub async fn get(&self, index: u64) -> Result<Option<Message>, Error> {
        let bucket = self.queue.bucket_of(index);
        Ok(self.driver.read_message(&self.id, bucket, index).await?)
    }

    /// Remove every message in `bucket`.
    pub async fn delete_all(&self, bucket: u64) -> Result<(), Error> {
        self.driver.delete_bucket(&self.id, bucket).await?;
        debug!(queue = self.id, bucket, "deleted bucket");
        Ok(())
    }
}
