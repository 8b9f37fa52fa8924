use super::{Config, Metrics};
use crate::{
    driver::Driver,
    index::Allocator,
    message::{Message, Messages},
    pointer::{Pointer, RepairBucket},
    reader::QueueLabel,
    Error, QueueDefinition,
};
use commonware_macros::select;
use commonware_runtime::Clock;
use commonware_utils::SystemTimeExt;
use futures::channel::oneshot;
use rand::RngCore;
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

/// Outcome of a single repair pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Tick {
    /// No sealed bucket is waiting to be repaired.
    Idle,
    /// `bucket` was inspected after its grace period and `ghosts` messages were republished.
    Repaired { bucket: u64, ghosts: usize },
}

/// Repairs the sealed buckets of one queue.
pub struct Worker<E: Clock + RngCore, D: Driver> {
    context: E,
    queue: QueueDefinition,
    label: QueueLabel,
    cfg: Config,

    allocator: Allocator<D>,
    messages: Messages<E, D>,
    pointer: Pointer<RepairBucket, D>,

    metrics: Metrics,
}

impl<E: Clock + RngCore, D: Driver> Worker<E, D> {
    pub fn new(
        context: E,
        driver: D,
        queue: QueueDefinition,
        cfg: Config,
        metrics: Metrics,
    ) -> Self {
        let id = queue.id();
        Self {
            label: QueueLabel::new(&id),
            allocator: Allocator::new(driver.clone(), id.clone()),
            messages: Messages::new(context.clone(), driver.clone(), queue.clone()),
            pointer: Pointer::new(driver, id),
            context,
            queue,
            cfg,
            metrics,
        }
    }

    /// Repair the next sealed bucket, waiting out its grace period if needed.
    pub async fn tick(&self) -> Result<Tick, Error> {
        let mut bucket = self.pointer.get().await? as u64;
        loop {
            // Skip buckets that are full and settled
            let messages = self.messages.messages_in(bucket).await?;
            if messages.len() as u64 == self.queue.bucket_size.get()
                && messages.iter().all(|m| m.acked)
            {
                self.delete(bucket).await?;
                match self.advance(bucket).await? {
                    Some(next) if next > bucket => {
                        bucket = next;
                        continue;
                    }
                    _ => return Ok(Tick::Idle),
                }
            }

            // Only sealed buckets are repaired
            let Some(sealed_at) = self.messages.tombstone_time(bucket).await? else {
                return Ok(Tick::Idle);
            };
            return self.repair(bucket, sealed_at, messages).await;
        }
    }

    async fn repair(
        &self,
        bucket: u64,
        sealed_at: SystemTime,
        mut messages: Vec<Message>,
    ) -> Result<Tick, Error> {
        // Wait for in-flight writers (and delayed messages) to settle. Late writers may land
        // while we sleep, so the bucket is re-read until nothing undelivered is still invisible.
        let mut deadline = sealed_at + self.cfg.grace_period;
        loop {
            deadline = messages
                .iter()
                .filter(|m| !m.acked && !m.is_delivered())
                .map(|m| m.next_visible_at)
                .fold(deadline, |deadline, at| deadline.max(at));
            if deadline <= self.context.current() {
                break;
            }
            debug!(
                queue = self.label.queue,
                bucket,
                deadline = deadline.epoch_millis(),
                "waiting for grace period"
            );
            self.context.sleep_until(deadline).await;
            messages = self.messages.messages_in(bucket).await?;
        }

        // Republish messages that were never delivered
        let now = self.context.current();
        let mut ghosts = 0;
        let mut settled = true;
        for message in messages {
            if message.acked {
                continue;
            }
            if message.is_delivered() || !message.is_visible(now) {
                settled = false;
                continue;
            }
            let index = self.allocator.next().await?;
            self.messages
                .put(index, message.blob.clone(), Duration::ZERO)
                .await?;
            if !self.messages.ack(&message).await? {
                warn!(
                    queue = self.label.queue,
                    ghost = message.index,
                    index,
                    "ghost changed during repair"
                );
                settled = false;
            }
            info!(
                queue = self.label.queue,
                ghost = message.index,
                index,
                "republished ghost"
            );
            self.metrics.ghosts.get_or_create(&self.label).inc();
            ghosts += 1;
        }

        self.advance(bucket).await?;
        if settled {
            self.delete(bucket).await?;
        }
        Ok(Tick::Repaired { bucket, ghosts })
    }

    /// Move the pointer past `bucket`, never beyond the bucket the allocator is filling.
    ///
    /// Returns the value the pointer holds afterwards, or `None` if it may not move yet.
    async fn advance(&self, bucket: u64) -> Result<Option<u64>, Error> {
        let counter = self.allocator.current().await?;
        let next = (bucket + 1).min(self.queue.bucket_of(counter));
        if next <= bucket {
            return Ok(None);
        }
        let actual = self.pointer.move_if(bucket as i64, next as i64).await?;
        Ok(Some(actual as u64))
    }

    async fn delete(&self, bucket: u64) -> Result<(), Error> {
        if !self.cfg.delete_acked {
            return Ok(());
        }
        self.messages.delete_all(bucket).await?;
        self.metrics.deleted.get_or_create(&self.label).inc();
        Ok(())
    }

    /// Tick every [Config::interval] until `stop` resolves (or its sender is dropped).
    ///
    /// Failed ticks are logged and retried on the next interval.
    pub async fn run(self, mut stop: oneshot::Receiver<()>) {
        info!(queue = self.label.queue, "started repair");
        loop {
            select! {
                _ = &mut stop => {
                    break;
                },
                result = self.tick() => {
                    self.metrics.ticks.get_or_create(&self.label).inc();
                    match result {
                        Ok(Tick::Idle) => {}
                        Ok(Tick::Repaired { bucket, ghosts }) => {
                            debug!(queue = self.label.queue, bucket, ghosts, "repaired bucket");
                        }
                        Err(err) => {
                            warn!(queue = self.label.queue, ?err, "repair failed");
                            self.metrics.failures.get_or_create(&self.label).inc();
                        }
                    }
                },
            }
            select! {
                _ = &mut stop => {
                    break;
                },
                _ = self.context.sleep(self.cfg.interval) => {},
            }
        }
        info!(queue = self.label.queue, "stopped repair");
    }
}
