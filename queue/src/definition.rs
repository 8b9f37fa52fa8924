use std::num::{NonZeroU32, NonZeroU64};

/// The immutable shape of a queue.
///
/// A definition is created alongside the queue and never mutated (status transitions are handled
/// by the request layer). All rows belonging to the queue are addressed by [QueueDefinition::id],
/// so bumping `version` yields an entirely fresh log.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct QueueDefinition {
    /// The account (tenant) that owns the queue.
    pub account: String,

    /// The name of the queue, unique within the account.
    pub name: String,

    /// The incarnation of the queue (incremented when a queue is deleted and recreated).
    pub version: u32,

    /// The number of indices in each bucket.
    ///
    /// Once messages have been written, this value cannot be changed.
    pub bucket_size: NonZeroU64,

    /// Deliveries after which a message is retired instead of being delivered again.
    ///
    /// If `None`, messages are redelivered until they are acknowledged.
    pub max_delivery_count: Option<NonZeroU32>,
}

impl QueueDefinition {
    /// Create a definition with unlimited deliveries.
    pub fn new(
        account: impl Into<String>,
        name: impl Into<String>,
        version: u32,
        bucket_size: NonZeroU64,
    ) -> Self {
        Self {
            account: account.into(),
            name: name.into(),
            version,
            bucket_size,
            max_delivery_count: None,
        }
    }

    /// Retire messages once they have been delivered `max` times.
    pub fn with_max_delivery_count(mut self, max: NonZeroU32) -> Self {
        self.max_delivery_count = Some(max);
        self
    }

    /// The key under which every row of this queue is stored.
    pub fn id(&self) -> String {
        format!("{}/{}/{}", self.account, self.name, self.version)
    }

    /// The bucket containing `index`.
    pub fn bucket_of(&self, index: u64) -> u64 {
        index / self.bucket_size.get()
    }

    /// The first index of `bucket`.
    pub fn bucket_start(&self, bucket: u64) -> u64 {
        bucket * self.bucket_size.get()
    }

    /// The bucket a (possibly negative) pointer value falls in.
    ///
    /// Values before index 0 belong to bucket 0.
    pub fn bucket_of_pointer(&self, pointer: i64) -> u64 {
        u64::try_from(pointer).map_or(0, |index| self.bucket_of(index))
    }

    /// Whether a message that has been delivered `count` times should be retired.
    pub fn exhausted(&self, count: u32) -> bool {
        self.max_delivery_count
            .is_some_and(|max| count >= max.get())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn definition(bucket_size: u64) -> QueueDefinition {
        QueueDefinition::new("acme", "orders", 1, NonZeroU64::new(bucket_size).unwrap())
    }

    #[test]
    fn test_bucket_arithmetic() {
        let queue = definition(5);
        assert_eq!(queue.bucket_of(0), 0);
        assert_eq!(queue.bucket_of(4), 0);
        assert_eq!(queue.bucket_of(5), 1);
        assert_eq!(queue.bucket_start(3), 15);
        assert_eq!(queue.bucket_of_pointer(-1), 0);
        assert_eq!(queue.bucket_of_pointer(12), 2);
    }

    #[test]
    fn test_id_includes_version() {
        let queue = definition(5);
        assert_eq!(queue.id(), "acme/orders/1");
        let mut recreated = queue.clone();
        recreated.version = 2;
        assert_ne!(queue.id(), recreated.id());
    }

    #[test]
    fn test_exhausted() {
        let queue = definition(5);
        assert!(!queue.exhausted(u32::MAX));
        let queue = queue.with_max_delivery_count(NonZeroU32::new(3).unwrap());
        assert!(!queue.exhausted(2));
        assert!(queue.exhausted(3));
    }
}
