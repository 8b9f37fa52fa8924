//! Messages and the table that stores them.
//!
//! A [Message] is written once by [Messages::put] and afterwards only changes through conditional
//! writes that check (and bump) its `version`:
//!
//! ```text
//!            put                 consume                ack
//!  (none) ---------> v=0,dc=0 -----------> v=1,dc=1 ---------> v=2,acked
//!                       |                  |      ^
//!                       |                  +------+ consume (after timeout)
//!                       +-------------------------------------> acked (repair)
//! ```
//!
//! Because every transition increments `version`, a stale [crate::receipt::PopReceipt] (minted
//! before the latest transition) can never be used to mutate the message.
//!
//! Messages are grouped by bucket. A bucket has no row of its own except for its tombstone,
//! written once when a reader seals it.

use bytes::Bytes;
use rand::RngCore;
use std::{
    fmt,
    str::FromStr,
    time::{Duration, SystemTime},
};

mod store;
pub use store::Messages;

/// Random token distinguishing incarnations of the same index.
///
/// Versions restart at zero whenever a message is (re)written, so the tag is what prevents a
/// receipt minted for a deleted message from matching a newer message at the same index.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Tag(u64);

impl Tag {
    /// Draw a fresh tag.
    pub fn random<R: RngCore>(rng: &mut R) -> Self {
        Self(rng.next_u64())
    }
}

impl From<u64> for Tag {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl FromStr for Tag {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        u64::from_str_radix(s, 16).map(Self)
    }
}

/// A message stored in a queue.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    /// Position of the message in the queue's log.
    pub index: u64,

    /// Opaque payload.
    pub blob: Bytes,

    /// Incremented by every successful conditional write.
    pub version: u64,

    /// Number of times the message has been handed to a consumer.
    pub delivery_count: u32,

    /// Whether a consumer (or repair) has acknowledged the message.
    pub acked: bool,

    /// The message may not be delivered before this instant.
    pub next_visible_at: SystemTime,

    /// Incarnation token (see [Tag]).
    pub tag: Tag,

    /// When the message was written.
    pub created_at: SystemTime,
}

impl Message {
    /// Whether the message may be delivered at `now`.
    pub fn is_visible(&self, now: SystemTime) -> bool {
        self.next_visible_at <= now
    }

    /// Whether the message has ever been delivered.
    pub fn is_delivered(&self) -> bool {
        self.delivery_count > 0
    }

    /// The message after a successful consume.
    pub(crate) fn consumed(&self, now: SystemTime, invisibility: Duration) -> Self {
        Self {
            version: self.version + 1,
            delivery_count: self.delivery_count.saturating_add(1),
            next_visible_at: now + invisibility,
            ..self.clone()
        }
    }

    /// The message after a successful ack.
    pub(crate) fn acknowledged(&self) -> Self {
        Self {
            version: self.version + 1,
            acked: true,
            ..self.clone()
        }
    }

    /// The message after a successful update.
    pub(crate) fn updated(&self, blob: Bytes, now: SystemTime, invisibility: Duration) -> Self {
        Self {
            blob,
            version: self.version + 1,
            next_visible_at: now + invisibility,
            ..self.clone()
        }
    }
}
