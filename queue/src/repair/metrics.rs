use crate::reader::QueueLabel;
use commonware_runtime::Metrics as RuntimeMetrics;
use prometheus_client::metrics::{counter::Counter, family::Family, gauge::Gauge};

/// Metrics for the [super::Manager] and its workers
#[derive(Clone, Default)]
pub struct Metrics {
    /// Number of completed repair ticks
    pub ticks: Family<QueueLabel, Counter>,
    /// Number of repair ticks that failed
    pub failures: Family<QueueLabel, Counter>,
    /// Number of ghost messages republished
    pub ghosts: Family<QueueLabel, Counter>,
    /// Number of buckets deleted after every message was acknowledged
    pub deleted: Family<QueueLabel, Counter>,
    /// Number of running repair workers
    pub running: Gauge,
}

impl Metrics {
    /// Create and return a new set of metrics, registered with the given context.
    pub fn init<E: RuntimeMetrics>(context: E) -> Self {
        let metrics = Self::default();
        context.register(
            "ticks",
            "Number of completed repair ticks",
            metrics.ticks.clone(),
        );
        context.register(
            "failures",
            "Number of repair ticks that failed",
            metrics.failures.clone(),
        );
        context.register(
            "ghosts",
            "Number of ghost messages republished",
            metrics.ghosts.clone(),
        );
        context.register(
            "deleted",
            "Number of buckets deleted after every message was acknowledged",
            metrics.deleted.clone(),
        );
        context.register(
            "running",
            "Number of running repair workers",
            metrics.running.clone(),
        );
        metrics
    }
}
