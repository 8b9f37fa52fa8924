//! Run repair workers (and optionally a synthetic workload) against a `sluice-queue` engine.
//!
//! # Usage
//!
//! ```bash
//! cargo run --release --bin sluice-node -- --config node.yaml
//! ```
//!
//! # Configuration
//!
//! ```yaml
//! log_level: info
//! log_json: false
//! metrics_port: 9090
//! scan_limit: 128
//! storage:
//!   latency_ms: 2
//!   max_retries: 5
//!   initial_backoff_ms: 50
//!   max_backoff_ms: 2000
//!   max_wait_ms: 10000
//! repair:
//!   grace_period_ms: 30000
//!   interval_ms: 5000
//!   delete_acked: true
//! queues:
//!   - account: acme
//!     name: orders
//!     version: 1
//!     bucket_size: 1000
//!     max_delivery_count: 10
//! workload:
//!   publish_interval_ms: 10
//!   consume_interval_ms: 10
//!   message_size: 256
//!   invisibility_ms: 30000
//!   ack_probability: 0.9
//! ```
//!
//! The node keeps every row in memory, so state is lost when it exits. Metrics are served at
//! `http://<host>:<metrics_port>/metrics`.

use serde::{Deserialize, Serialize};
use sluice_queue::{
    driver::{memory, retry},
    repair, QueueDefinition,
};
use std::{
    num::{NonZeroU32, NonZeroU64, NonZeroUsize},
    time::Duration,
};
use thiserror::Error;

/// Errors that can occur when interpreting a [Config].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("queue {0}: bucket_size must be positive")]
    BucketSize(String),
    #[error("queue {0}: max_delivery_count must be positive")]
    MaxDeliveryCount(String),
    #[error("scan_limit must be positive")]
    ScanLimit,
    #[error("ack_probability must be within [0, 1]")]
    AckProbability,
}

/// Configuration for sluice-node.
#[derive(Clone, Deserialize, Serialize)]
pub struct Config {
    pub log_level: String,
    #[serde(default)]
    pub log_json: bool,
    pub metrics_port: u16,
    pub scan_limit: usize,
    pub storage: Storage,
    pub repair: Repair,
    pub queues: Vec<Queue>,
    pub workload: Option<Workload>,
}

impl Config {
    /// The engine configuration.
    pub fn engine(&self) -> Result<sluice_queue::Config, Error> {
        Ok(sluice_queue::Config {
            scan_limit: NonZeroUsize::new(self.scan_limit).ok_or(Error::ScanLimit)?,
        })
    }

    /// The definitions of every configured queue.
    pub fn definitions(&self) -> Result<Vec<QueueDefinition>, Error> {
        self.queues.iter().map(Queue::definition).collect()
    }
}

/// Storage settings.
#[derive(Clone, Deserialize, Serialize)]
pub struct Storage {
    /// Simulated latency of each storage call.
    pub latency_ms: Option<u64>,
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub max_wait_ms: u64,
}

impl Storage {
    pub fn memory(&self) -> memory::Config {
        memory::Config {
            latency: self.latency_ms.map(Duration::from_millis),
        }
    }

    pub fn retry(&self) -> retry::Config {
        retry::Config {
            max_retries: self.max_retries,
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
            max_wait: Duration::from_millis(self.max_wait_ms),
        }
    }
}

/// Repair settings.
#[derive(Clone, Deserialize, Serialize)]
pub struct Repair {
    pub grace_period_ms: u64,
    pub interval_ms: u64,
    pub delete_acked: bool,
}

impl Repair {
    pub fn config(&self) -> repair::Config {
        repair::Config {
            grace_period: Duration::from_millis(self.grace_period_ms),
            interval: Duration::from_millis(self.interval_ms),
            delete_acked: self.delete_acked,
            ..repair::Config::default()
        }
    }
}

/// A queue owned by this node.
#[derive(Clone, Deserialize, Serialize)]
pub struct Queue {
    pub account: String,
    pub name: String,
    pub version: u32,
    pub bucket_size: u64,
    pub max_delivery_count: Option<u32>,
}

impl Queue {
    pub fn definition(&self) -> Result<QueueDefinition, Error> {
        let id = format!("{}/{}", self.account, self.name);
        let bucket_size = NonZeroU64::new(self.bucket_size).ok_or(Error::BucketSize(id.clone()))?;
        let mut definition =
            QueueDefinition::new(&self.account, &self.name, self.version, bucket_size);
        if let Some(max) = self.max_delivery_count {
            let max = NonZeroU32::new(max).ok_or(Error::MaxDeliveryCount(id))?;
            definition = definition.with_max_delivery_count(max);
        }
        Ok(definition)
    }
}

/// A synthetic producer and consumer per queue.
#[derive(Clone, Deserialize, Serialize)]
pub struct Workload {
    pub publish_interval_ms: u64,
    pub consume_interval_ms: u64,
    pub message_size: usize,
    pub invisibility_ms: u64,
    /// Probability that a consumer acknowledges a delivery (instead of letting it time out).
    pub ack_probability: f64,
}

impl Workload {
    pub fn validate(&self) -> Result<(), Error> {
        if !(0.0..=1.0).contains(&self.ack_probability) {
            return Err(Error::AckProbability);
        }
        Ok(())
    }
}
