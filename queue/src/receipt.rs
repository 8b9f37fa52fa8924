//! Capabilities authorizing a consumer to ack or update one delivery of a message.
//!
//! A [PopReceipt] is never stored. It is derived from the message a consumer received and
//! checked against the live message when presented: it is accepted only while the message still
//! has the exact `version` and `tag` the receipt was minted with. Because every consume, update,
//! and ack increments the version, each of them invalidates all previously issued receipts.
//!
//! # Format
//!
//! Receipts are exchanged as the standard base64 encoding of `"<index>:<version>:<tag>"`, where
//! `index` and `version` are decimal and `tag` is hexadecimal.

use crate::message::{Message, Tag};
use base64::{engine::general_purpose::STANDARD, Engine};
use std::{fmt, str::FromStr};
use thiserror::Error;

/// Errors that can occur when decoding a [PopReceipt].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("invalid base64")]
    Base64,
    #[error("invalid utf-8")]
    Utf8,
    #[error("malformed receipt: expected 3 fields, found {0}")]
    Malformed(usize),
    #[error("invalid {0}")]
    Field(&'static str),
}

/// Authorizes an ack or update of one specific delivery of a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PopReceipt {
    pub index: u64,
    pub version: u64,
    pub tag: Tag,
}

impl PopReceipt {
    /// Mint a receipt for the current state of `message`.
    pub fn of(message: &Message) -> Self {
        Self {
            index: message.index,
            version: message.version,
            tag: message.tag,
        }
    }

    /// Whether the receipt still authorizes operations on `message`.
    pub fn matches(&self, message: &Message) -> bool {
        self.index == message.index && self.version == message.version && self.tag == message.tag
    }

    /// Encode the receipt for transport.
    pub fn encode(&self) -> String {
        STANDARD.encode(format!("{}:{}:{}", self.index, self.version, self.tag))
    }

    /// Decode a receipt produced by [PopReceipt::encode].
    pub fn decode(encoded: &str) -> Result<Self, Error> {
        let raw = STANDARD.decode(encoded).map_err(|_| Error::Base64)?;
        let raw = String::from_utf8(raw).map_err(|_| Error::Utf8)?;
        let fields: Vec<&str> = raw.split(':').collect();
        let [index, version, tag] = fields[..] else {
            return Err(Error::Malformed(fields.len()));
        };
        Ok(Self {
            index: digits(index, "index")?
                .parse()
                .map_err(|_| Error::Field("index"))?,
            version: digits(version, "version")?
                .parse()
                .map_err(|_| Error::Field("version"))?,
            tag: digits(tag, "tag")?.parse().map_err(|_| Error::Field("tag"))?,
        })
    }
}

/// Reject signs and other characters the integer parsers would tolerate.
fn digits<'a>(field: &'a str, name: &'static str) -> Result<&'a str, Error> {
    if field.bytes().all(|b| b.is_ascii_hexdigit()) {
        Ok(field)
    } else {
        Err(Error::Field(name))
    }
}

impl fmt::Display for PopReceipt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

impl FromStr for PopReceipt {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::decode(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::time::SystemTime;
    use test_case::test_case;

    #[test]
    fn test_round_trip() {
        let receipt = PopReceipt {
            index: 1_234_567,
            version: 3,
            tag: Tag::from(u64::MAX),
        };
        let encoded = receipt.encode();
        assert_eq!(PopReceipt::decode(&encoded).unwrap(), receipt);
        assert_eq!(encoded.parse::<PopReceipt>().unwrap(), receipt);
        assert_eq!(receipt.to_string(), encoded);
    }

    #[test]
    fn test_text_format() {
        let receipt = PopReceipt {
            index: 12,
            version: 2,
            tag: Tag::from(0xabc),
        };
        let raw = STANDARD.decode(receipt.encode()).unwrap();
        assert_eq!(raw, b"12:2:0000000000000abc");
    }

    #[test_case("!!!not base64!!!", Error::Base64; "bad base64")]
    #[test_case(&STANDARD.encode([0xff, 0xfe]), Error::Utf8; "bad utf8")]
    #[test_case(&STANDARD.encode("1:2"), Error::Malformed(2); "missing field")]
    #[test_case(&STANDARD.encode("1:2:3:4"), Error::Malformed(4); "extra field")]
    #[test_case(&STANDARD.encode("x:2:00"), Error::Field("index"); "bad index")]
    #[test_case(&STANDARD.encode("1:-2:00"), Error::Field("version"); "bad version")]
    #[test_case(&STANDARD.encode("1:2:zz"), Error::Field("tag"); "bad tag")]
    #[test_case(&STANDARD.encode("+1:2:ff"), Error::Field("index"); "signed index")]
    #[test_case(&STANDARD.encode("1:+2:ff"), Error::Field("version"); "signed version")]
    #[test_case(&STANDARD.encode("1:2:+ff"), Error::Field("tag"); "signed tag")]
    fn test_decode_errors(encoded: &str, expected: Error) {
        assert_eq!(PopReceipt::decode(encoded), Err(expected));
    }

    #[test]
    fn test_matches() {
        let message = Message {
            index: 4,
            blob: Bytes::new(),
            version: 1,
            delivery_count: 1,
            acked: false,
            next_visible_at: SystemTime::UNIX_EPOCH,
            tag: Tag::from(9),
            created_at: SystemTime::UNIX_EPOCH,
        };
        let receipt = PopReceipt::of(&message);
        assert!(receipt.matches(&message));

        let mut reconsumed = message.clone();
        reconsumed.version += 1;
        assert!(!receipt.matches(&reconsumed));

        let mut rewritten = message;
        rewritten.tag = Tag::from(10);
        assert!(!receipt.matches(&rewritten));
    }
}
