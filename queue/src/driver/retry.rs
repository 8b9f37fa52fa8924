//! Retry transient [Driver] failures with exponential backoff.

use super::{Cell, Condition, Driver, Error, Swap};
use crate::message::Message;
use commonware_runtime::Clock;
use std::{
    future::Future,
    time::{Duration, SystemTime},
};
use tracing::{debug, warn};

/// Configuration for [Retrying].
#[derive(Clone, Debug)]
pub struct Config {
    /// Maximum number of retries after the first attempt.
    pub max_retries: u32,

    /// Delay before the first retry.
    pub initial_backoff: Duration,

    /// Upper bound on the delay between two attempts.
    pub max_backoff: Duration,

    /// Upper bound on the total time spent waiting between attempts of one operation.
    pub max_wait: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(2),
            max_wait: Duration::from_secs(10),
        }
    }
}

/// A [Driver] that retries operations failing with a transient error.
///
/// Backoff doubles after every failed attempt (capped at [Config::max_backoff]). Once either
/// [Config::max_retries] or [Config::max_wait] would be exceeded, the last error is returned
/// wrapped in [Error::Exhausted]. Non-transient errors are returned immediately.
#[derive(Clone)]
pub struct Retrying<E: Clock, D: Driver> {
    context: E,
    inner: D,
    cfg: Config,
}

impl<E: Clock, D: Driver> Retrying<E, D> {
    /// Wrap `inner`, sleeping on `context` between attempts.
    pub fn new(context: E, inner: D, cfg: Config) -> Self {
        Self {
            context,
            inner,
            cfg,
        }
    }

    /// The wrapped driver.
    pub fn inner(&self) -> &D {
        &self.inner
    }

    async fn attempt<T, F, Fut>(&self, operation: &'static str, f: F) -> Result<T, Error>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, Error>>,
    {
        let mut attempts = 0;
        let mut waited = Duration::ZERO;
        let mut backoff = self.cfg.initial_backoff;
        loop {
            let err = match f().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() => err,
                Err(err) => return Err(err),
            };
            attempts += 1;
            if attempts > self.cfg.max_retries || waited + backoff > self.cfg.max_wait {
                warn!(operation, attempts, ?waited, ?err, "storage retries exhausted");
                return Err(Error::Exhausted {
                    attempts,
                    source: Box::new(err),
                });
            }
            debug!(operation, attempts, ?backoff, ?err, "retrying storage operation");
            self.context.sleep(backoff).await;
            waited += backoff;
            backoff = backoff.saturating_mul(2).min(self.cfg.max_backoff);
        }
    }
}

impl<E: Clock, D: Driver> Driver for Retrying<E, D> {
    async fn read_cell(&self, queue: &str, cell: Cell) -> Result<Option<i64>, Error> {
        self.attempt("read_cell", || self.inner.read_cell(queue, cell))
            .await
    }

    async fn swap_cell(
        &self,
        queue: &str,
        cell: Cell,
        expected: Option<i64>,
        desired: i64,
    ) -> Result<Swap, Error> {
        self.attempt("swap_cell", || {
            self.inner.swap_cell(queue, cell, expected, desired)
        })
        .await
    }

    async fn insert_message(
        &self,
        queue: &str,
        bucket: u64,
        message: Message,
    ) -> Result<bool, Error> {
        self.attempt("insert_message", || {
            self.inner.insert_message(queue, bucket, message.clone())
        })
        .await
    }

    async fn read_message(
        &self,
        queue: &str,
        bucket: u64,
        index: u64,
    ) -> Result<Option<Message>, Error> {
        self.attempt("read_message", || {
            self.inner.read_message(queue, bucket, index)
        })
        .await
    }

    async fn read_bucket(&self, queue: &str, bucket: u64) -> Result<Vec<Message>, Error> {
        self.attempt("read_bucket", || self.inner.read_bucket(queue, bucket))
            .await
    }

    async fn update_message(
        &self,
        queue: &str,
        bucket: u64,
        message: Message,
        condition: Condition,
    ) -> Result<bool, Error> {
        self.attempt("update_message", || {
            self.inner
                .update_message(queue, bucket, message.clone(), condition)
        })
        .await
    }

    async fn insert_tombstone(
        &self,
        queue: &str,
        bucket: u64,
        sealed_at: SystemTime,
    ) -> Result<SystemTime, Error> {
        self.attempt("insert_tombstone", || {
            self.inner.insert_tombstone(queue, bucket, sealed_at)
        })
        .await
    }

    async fn read_tombstone(&self, queue: &str, bucket: u64) -> Result<Option<SystemTime>, Error> {
        self.attempt("read_tombstone", || self.inner.read_tombstone(queue, bucket))
            .await
    }

    async fn delete_bucket(&self, queue: &str, bucket: u64) -> Result<(), Error> {
        self.attempt("delete_bucket", || self.inner.delete_bucket(queue, bucket))
            .await
    }

    async fn drop_queue(&self, queue: &str) -> Result<(), Error> {
        self.attempt("drop_queue", || self.inner.drop_queue(queue))
            .await
    }
}
