use commonware_runtime::Metrics as RuntimeMetrics;
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family},
};

/// Label identifying the queue a metric refers to.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct QueueLabel {
    /// The queue id.
    pub queue: String,
}

impl QueueLabel {
    pub fn new(queue: &str) -> Self {
        Self {
            queue: queue.to_string(),
        }
    }
}

/// Metrics for [super::Reader].
#[derive(Clone, Default)]
pub struct Metrics {
    /// Messages handed to consumers.
    pub deliveries: Family<QueueLabel, Counter>,
    /// Deliveries of messages whose invisibility timeout expired.
    pub resurrections: Family<QueueLabel, Counter>,
    /// Claims lost to a concurrent writer.
    pub races: Family<QueueLabel, Counter>,
    /// Buckets sealed by readers.
    pub seals: Family<QueueLabel, Counter>,
    /// Messages retired after reaching the maximum delivery count.
    pub retired: Family<QueueLabel, Counter>,
}

impl Metrics {
    /// Create and return a new set of metrics, registered with the given context.
    pub fn init<E: RuntimeMetrics>(context: E) -> Self {
        let metrics = Self::default();
        context.register(
            "deliveries",
            "Messages handed to consumers",
            metrics.deliveries.clone(),
        );
        context.register(
            "resurrections",
            "Deliveries of messages whose invisibility timeout expired",
            metrics.resurrections.clone(),
        );
        context.register(
            "races",
            "Claims lost to a concurrent writer",
            metrics.races.clone(),
        );
        context.register("seals", "Buckets sealed by readers", metrics.seals.clone());
        context.register(
            "retired",
            "Messages retired after reaching the maximum delivery count",
            metrics.retired.clone(),
        );
        metrics
    }
}
