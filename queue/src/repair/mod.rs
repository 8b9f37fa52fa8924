//! Recover messages written into buckets that readers already sealed.
//!
//! # Ghosts
//!
//! A publisher allocates an index and then writes its message. If the write lands after readers
//! sealed the index's bucket (because the allocator had already moved past it), forward
//! consumption never looks at that bucket again and the message would sit there forever. Such a
//! message (never delivered, not acknowledged) is a "ghost".
//!
//! # Protocol
//!
//! Each [Worker::tick] starts at the [crate::pointer::RepairBucket] pointer:
//!
//! 1. Full buckets whose messages are all acknowledged are skipped (and deleted, if configured).
//! 2. If the bucket is not sealed yet, there is nothing to do.
//! 3. Otherwise, the worker sleeps until [Config::grace_period] has passed since the bucket was
//!    sealed (and until every undelivered message in it became visible). Writers that allocated an
//!    index in the bucket are assumed to have finished (or failed) by then.
//! 4. Every visible, undelivered, unacknowledged message is copied to a freshly allocated index
//!    and the original is acknowledged.
//! 5. The pointer advances to the next bucket (never past the bucket the allocator is filling),
//!    and the bucket is deleted if every message in it is now acknowledged.
//!
//! A republished ghost is delivered like any new message. If acknowledging the original fails
//! (it changed during repair), the copy is still delivered and the message may be seen twice.
//!
//! # Scheduling
//!
//! Exactly one worker should run per queue. The [Manager] owns the workers of one process and is
//! told which queues to repair through its [Mailbox] (deciding which process repairs which queue
//! is left to the caller). A worker never stops on its own: failed ticks are logged and retried
//! after [Config::interval].

use std::time::Duration;

mod ingress;
pub use ingress::Mailbox;
mod manager;
pub use manager::Manager;
mod metrics;
pub use metrics::Metrics;
mod worker;
pub use worker::{Tick, Worker};

/// Configuration for repair workers.
#[derive(Clone, Debug)]
pub struct Config {
    /// How long a bucket must have been sealed before it is repaired.
    pub grace_period: Duration,

    /// Pause between ticks.
    pub interval: Duration,

    /// Whether to delete buckets in which every message was acknowledged.
    pub delete_acked: bool,

    /// Capacity of the [Manager]'s mailbox.
    pub mailbox_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(30),
            interval: Duration::from_secs(5),
            delete_acked: true,
            mailbox_size: 64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        driver::memory::{self, Memory},
        index::Allocator,
        message::Messages,
        pointer::{Pointer, RepairBucket},
        reader::QueueLabel,
        Engine, QueueDefinition,
    };
    use bytes::Bytes;
    use commonware_macros::test_traced;
    use commonware_runtime::{deterministic, Clock, Metrics as _, Runner, Spawner};
    use futures::channel::oneshot;
    use std::num::NonZeroU64;

    const GRACE: Duration = Duration::from_secs(30);
    const INVISIBILITY: Duration = Duration::from_secs(60);

    fn queue(bucket_size: u64) -> QueueDefinition {
        QueueDefinition::new("acme", "orders", 1, NonZeroU64::new(bucket_size).unwrap())
    }

    fn config() -> Config {
        Config {
            grace_period: GRACE,
            interval: Duration::from_secs(1),
            ..Config::default()
        }
    }

    /// Deliver and ack everything currently consumable.
    async fn drain<E, D>(engine: &Engine<E, D>, queue: &QueueDefinition) -> Vec<Bytes>
    where
        E: Clock + commonware_runtime::Metrics + rand::RngCore,
        D: crate::driver::Driver,
    {
        let mut blobs = Vec::new();
        while let Some(delivery) = engine.next_message(queue, INVISIBILITY).await.unwrap() {
            assert!(engine.ack(queue, &delivery.receipt).await.unwrap());
            blobs.push(delivery.blob);
        }
        blobs
    }

    #[test_traced]
    fn test_unwritten_index_left_untouched() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let driver = Memory::new(context.clone(), memory::Config::default());
            let engine = Engine::new(context.clone(), driver.clone(), Default::default());
            let queue = queue(1);
            let allocator = Allocator::new(driver.clone(), queue.id());
            let messages = Messages::new(context.clone(), driver.clone(), queue.clone());
            let pointer = Pointer::<RepairBucket, _>::new(driver.clone(), queue.id());

            // Index 0 is allocated but never written
            assert_eq!(allocator.next().await.unwrap(), 0);
            engine
                .put(&queue, Bytes::from_static(b"one"), Duration::ZERO)
                .await
                .unwrap();
            assert_eq!(drain(&engine, &queue).await.len(), 1);
            let sealed_at = messages.tombstone_time(0).await.unwrap().unwrap();

            let worker = Worker::new(
                context.clone(),
                driver,
                queue.clone(),
                config(),
                Metrics::default(),
            );
            let tick = worker.tick().await.unwrap();
            assert_eq!(
                tick,
                Tick::Repaired {
                    bucket: 0,
                    ghosts: 0
                }
            );
            assert!(context.current() >= sealed_at + GRACE);
            assert!(messages.get(0).await.unwrap().is_none());
            assert_eq!(pointer.get().await.unwrap(), 1);

            // The settled bucket is skipped, and the allocator's bucket is never passed
            assert_eq!(worker.tick().await.unwrap(), Tick::Idle);
            assert_eq!(pointer.get().await.unwrap(), 2);
            assert!(messages.messages_in(1).await.unwrap().is_empty());
            assert_eq!(allocator.current().await.unwrap(), 2);
        });
    }

    #[test_traced]
    fn test_republishes_ghost() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let driver = Memory::new(context.clone(), memory::Config::default());
            let engine = Engine::new(context.clone(), driver.clone(), Default::default());
            let queue = queue(2);
            let allocator = Allocator::new(driver.clone(), queue.id());
            let messages = Messages::new(context.clone(), driver.clone(), queue.clone());

            // A slow publisher holds index 0 while others publish 1 and 2
            let slow = allocator.next().await.unwrap();
            for blob in [b"one", b"two"] {
                engine
                    .put(&queue, Bytes::from_static(blob), Duration::ZERO)
                    .await
                    .unwrap();
            }
            assert_eq!(
                drain(&engine, &queue).await,
                vec![Bytes::from_static(b"one"), Bytes::from_static(b"two")]
            );
            assert!(messages.tombstone_time(0).await.unwrap().is_some());

            // The late write lands in the sealed bucket and is invisible to readers
            messages
                .put(slow, Bytes::from_static(b"ghost"), Duration::ZERO)
                .await
                .unwrap();
            assert!(drain(&engine, &queue).await.is_empty());

            let metrics = Metrics::default();
            let worker = Worker::new(
                context.clone(),
                driver,
                queue.clone(),
                config(),
                metrics.clone(),
            );
            assert_eq!(
                worker.tick().await.unwrap(),
                Tick::Repaired {
                    bucket: 0,
                    ghosts: 1
                }
            );
            let label = QueueLabel::new(&queue.id());
            assert_eq!(metrics.ghosts.get_or_create(&label).get(), 1);

            // The copy is delivered under a new index and the settled bucket is gone
            let delivery = engine
                .next_message(&queue, INVISIBILITY)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(delivery.index, 3);
            assert_eq!(delivery.blob, Bytes::from_static(b"ghost"));
            assert_eq!(delivery.delivery_count, 1);
            assert!(messages.messages_in(0).await.unwrap().is_empty());
            assert_eq!(metrics.deleted.get_or_create(&label).get(), 1);
        });
    }

    #[test_traced]
    fn test_waits_for_delayed_message() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let driver = Memory::new(context.clone(), memory::Config::default());
            let engine = Engine::new(context.clone(), driver.clone(), Default::default());
            let queue = queue(2);
            let messages = Messages::new(context.clone(), driver.clone(), queue.clone());

            // The first message is delayed well past the grace period
            let delay = Duration::from_secs(120);
            engine
                .put(&queue, Bytes::from_static(b"delayed"), delay)
                .await
                .unwrap();
            for blob in [b"one", b"two"] {
                engine
                    .put(&queue, Bytes::from_static(blob), Duration::ZERO)
                    .await
                    .unwrap();
            }
            let start = context.current();
            assert_eq!(drain(&engine, &queue).await.len(), 2);
            assert!(messages.tombstone_time(0).await.unwrap().is_some());

            let worker = Worker::new(
                context.clone(),
                driver,
                queue.clone(),
                config(),
                Metrics::default(),
            );
            assert_eq!(
                worker.tick().await.unwrap(),
                Tick::Repaired {
                    bucket: 0,
                    ghosts: 1
                }
            );
            assert!(context.current() >= start + delay);
            assert_eq!(
                drain(&engine, &queue).await,
                vec![Bytes::from_static(b"delayed")]
            );
        });
    }

    #[test_traced]
    fn test_delayed_write_during_grace() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let driver = Memory::new(context.clone(), memory::Config::default());
            let engine = Engine::new(context.clone(), driver.clone(), Default::default());
            let queue = queue(2);
            let allocator = Allocator::new(driver.clone(), queue.id());
            let messages = Messages::new(context.clone(), driver.clone(), queue.clone());

            // Bucket 0 seals while index 0 is still held by a slow publisher
            let slow = allocator.next().await.unwrap();
            for blob in [b"one", b"two"] {
                engine
                    .put(&queue, Bytes::from_static(blob), Duration::ZERO)
                    .await
                    .unwrap();
            }
            assert_eq!(drain(&engine, &queue).await.len(), 2);
            assert!(messages.tombstone_time(0).await.unwrap().is_some());

            let worker = Worker::new(
                context.clone(),
                driver.clone(),
                queue.clone(),
                config(),
                Metrics::default(),
            );
            let (stop, stopped) = oneshot::channel();
            let handle = context.clone().spawn(|_| worker.run(stopped));

            // The late write lands mid-grace and stays invisible past the grace period
            context.sleep(Duration::from_secs(10)).await;
            messages
                .put(slow, Bytes::from_static(b"late"), Duration::from_secs(60))
                .await
                .unwrap();
            context.sleep(Duration::from_secs(600)).await;
            assert_eq!(
                drain(&engine, &queue).await,
                vec![Bytes::from_static(b"late")]
            );
            assert!(messages.messages_in(0).await.unwrap().is_empty());

            stop.send(()).unwrap();
            handle.await.unwrap();
        });
    }

    #[test_traced]
    fn test_in_flight_not_republished() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let driver = Memory::new(context.clone(), memory::Config::default());
            let engine = Engine::new(context.clone(), driver.clone(), Default::default());
            let queue = queue(1);
            let messages = Messages::new(context.clone(), driver.clone(), queue.clone());
            let pointer = Pointer::<RepairBucket, _>::new(driver.clone(), queue.id());
            for blob in [&b"zero"[..], &b"one"[..]] {
                engine
                    .put(&queue, Bytes::from_static(blob), Duration::ZERO)
                    .await
                    .unwrap();
            }

            // Index 0 is delivered but never acked
            let held = engine
                .next_message(&queue, Duration::from_secs(3600))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(held.index, 0);
            assert_eq!(drain(&engine, &queue).await.len(), 1);

            let worker = Worker::new(
                context.clone(),
                driver,
                queue.clone(),
                config(),
                Metrics::default(),
            );
            assert_eq!(
                worker.tick().await.unwrap(),
                Tick::Repaired {
                    bucket: 0,
                    ghosts: 0
                }
            );
            assert_eq!(pointer.get().await.unwrap(), 1);
            assert!(messages.get(0).await.unwrap().is_some());
        });
    }

    #[test_traced]
    fn test_run_survives_failures() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let driver = Memory::new(context.clone(), memory::Config::default());
            let queue = queue(4);
            let label = QueueLabel::new(&queue.id());
            let metrics = Metrics::default();
            let worker = Worker::new(
                context.clone(),
                driver.clone(),
                queue,
                config(),
                metrics.clone(),
            );

            driver.fail(3);
            let (stop, stopped) = oneshot::channel();
            let handle = context.clone().spawn(|_| worker.run(stopped));
            context.sleep(Duration::from_millis(5_500)).await;
            assert_eq!(metrics.failures.get_or_create(&label).get(), 3);
            assert!(metrics.ticks.get_or_create(&label).get() >= 5);

            stop.send(()).unwrap();
            handle.await.unwrap();
        });
    }

    #[test_traced]
    fn test_manager() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let driver = Memory::new(context.clone(), memory::Config::default());
            let engine = Engine::new(context.clone(), driver.clone(), Default::default());
            let (manager, mut mailbox) =
                Manager::new(context.with_label("repair"), driver.clone(), config());
            let handle = manager.start();

            let orders = queue(2);
            let mut invoices = queue(2);
            invoices.name = "invoices".into();
            assert!(mailbox.start(orders.clone()).await);
            assert!(!mailbox.start(orders.clone()).await);
            assert!(mailbox.start(invoices.clone()).await);
            assert_eq!(
                mailbox.running().await,
                vec![invoices.id(), orders.id()]
            );
            assert!(context.encode().contains("repair_running 2"));

            // A ghost is republished without further intervention
            let allocator = Allocator::new(driver.clone(), orders.id());
            let slow = allocator.next().await.unwrap();
            for blob in [b"one", b"two"] {
                engine
                    .put(&orders, Bytes::from_static(blob), Duration::ZERO)
                    .await
                    .unwrap();
            }
            assert_eq!(drain(&engine, &orders).await.len(), 2);
            Messages::new(context.clone(), driver.clone(), orders.clone())
                .put(slow, Bytes::from_static(b"ghost"), Duration::ZERO)
                .await
                .unwrap();
            context.sleep(GRACE * 2).await;
            assert_eq!(
                drain(&engine, &orders).await,
                vec![Bytes::from_static(b"ghost")]
            );

            assert!(mailbox.stop(orders.id()).await);
            assert!(!mailbox.stop(orders.id()).await);
            assert_eq!(mailbox.running().await, vec![invoices.id()]);
            assert!(context.encode().contains("repair_running 1"));

            // Dropping the mailbox stops the remaining workers
            drop(mailbox);
            handle.await.unwrap();
        });
    }
}
