//! Wire format of stored items.
//!
//! ```text
//! [duration ticks: 8][expiration ticks: 8]   only if Sliding
//! [payload | shard id: 16 ...]               shard ids only if Split
//! ```
//!
//! Integers are big-endian. Shard ids use the GUID byte layout and are
//! rendered as hyphenated UUID strings when used as backend keys.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::clock::Ticks;
use crate::error::CorruptData;

/// Size of the sliding header.
pub const SLIDING_HEADER_LEN: usize = 16;

/// Size of one shard identifier.
pub const SHARD_ID_LEN: usize = 16;

/// Largest item the writer produces, header included.
pub const MAX_ITEM_SIZE: usize = 1020 * 1024;

/// Longest lifetime handed to the backend.
pub const MAX_EXPIRATION: Ticks = Ticks(30 * Ticks::PER_DAY);

/// Upper bound of the extend window.
pub const MAX_EXTEND: Ticks = Ticks::from_secs(10 * 60);

// ─── Flags ─────────────────────────────────────────────────────────────────

/// Encodings applied to a stored item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ValueFlags(u32);

impl ValueFlags {
    /// No special encoding.
    pub const ORIGINAL: ValueFlags = ValueFlags(0);
    /// The item starts with a sliding header.
    pub const SLIDING: ValueFlags = ValueFlags(1);
    /// The payload is compressed.
    pub const COMPRESS: ValueFlags = ValueFlags(2);
    /// The payload is a list of shard ids.
    pub const SPLIT: ValueFlags = ValueFlags(4);

    const ALL: u32 = 1 | 2 | 4;

    /// Parse backend flags, rejecting bits this crate never writes.
    pub fn from_bits(bits: u32) -> Result<Self, CorruptData> {
        if bits & !Self::ALL != 0 {
            return Err(CorruptData::UnknownFlags(bits));
        }
        Ok(ValueFlags(bits))
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: ValueFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn is_original(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for ValueFlags {
    type Output = ValueFlags;

    fn bitor(self, rhs: ValueFlags) -> ValueFlags {
        ValueFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for ValueFlags {
    fn bitor_assign(&mut self, rhs: ValueFlags) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for ValueFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_original() {
            return write!(f, "original");
        }
        let names: Vec<&str> = [
            (Self::SLIDING, "sliding"),
            (Self::COMPRESS, "compress"),
            (Self::SPLIT, "split"),
        ]
        .into_iter()
        .filter(|(flag, _)| self.contains(*flag))
        .map(|(_, name)| name)
        .collect();
        write!(f, "{}", names.join("|"))
    }
}

// ─── Sliding header ────────────────────────────────────────────────────────

/// Sliding duration and the absolute instant the item is valid until.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlidingHeader {
    pub duration: Ticks,
    pub expiration: Ticks,
}

impl SlidingHeader {
    pub fn encode(&self) -> [u8; SLIDING_HEADER_LEN] {
        let mut buf = [0u8; SLIDING_HEADER_LEN];
        buf[..8].copy_from_slice(&self.duration.as_i64().to_be_bytes());
        buf[8..].copy_from_slice(&self.expiration.as_i64().to_be_bytes());
        buf
    }

    pub fn decode(value: &[u8]) -> Result<Self, CorruptData> {
        if value.len() < SLIDING_HEADER_LEN {
            return Err(CorruptData::TruncatedHeader(value.len()));
        }
        let mut duration = [0u8; 8];
        let mut expiration = [0u8; 8];
        duration.copy_from_slice(&value[..8]);
        expiration.copy_from_slice(&value[8..16]);
        Ok(Self {
            duration: Ticks(i64::from_be_bytes(duration)),
            expiration: Ticks(i64::from_be_bytes(expiration)),
        })
    }

    /// Copy of `value` with the expiration field replaced.
    pub fn rewrite_expiration(value: &[u8], expiration: Ticks) -> Bytes {
        let mut buf = BytesMut::with_capacity(value.len());
        buf.put_slice(&value[..8]);
        buf.put_i64(expiration.as_i64());
        buf.put_slice(&value[SLIDING_HEADER_LEN..]);
        buf.freeze()
    }
}

/// Early-refresh margin for a sliding duration: half of it, capped at
/// [`MAX_EXTEND`], never below one second.
///
/// The reader applies the one-second floor as well as the writer, which
/// other clients of this format may not do. The difference shows only for
/// sliding durations under two seconds.
pub fn extend_window(duration: Ticks) -> Ticks {
    Ticks((duration.as_i64() / 2).min(MAX_EXTEND.as_i64())).max(Ticks::ONE_SECOND)
}

// ─── Shards ────────────────────────────────────────────────────────────────

/// Random identifier of one shard item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShardId(Uuid);

impl ShardId {
    pub fn new_random() -> Self {
        ShardId(Uuid::new_v4())
    }

    pub fn to_bytes(self) -> [u8; SHARD_ID_LEN] {
        self.0.to_bytes_le()
    }

    pub fn from_bytes(bytes: [u8; SHARD_ID_LEN]) -> Self {
        ShardId(Uuid::from_bytes_le(bytes))
    }

    /// Backend key the shard is stored under.
    pub fn key(&self) -> String {
        self.0.hyphenated().to_string()
    }
}

/// Parse a concatenated shard id list.
pub fn decode_shard_ids(list: &[u8]) -> Result<Vec<ShardId>, CorruptData> {
    if list.len() % SHARD_ID_LEN != 0 {
        return Err(CorruptData::ShardList(list.len()));
    }
    Ok(list
        .chunks_exact(SHARD_ID_LEN)
        .map(|chunk| {
            let mut bytes = [0u8; SHARD_ID_LEN];
            bytes.copy_from_slice(chunk);
            ShardId::from_bytes(bytes)
        })
        .collect())
}

// ─── Expiration ────────────────────────────────────────────────────────────

/// Caller-facing expiration options. When several are set, sliding wins
/// over absolute, which wins over relative.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntryOptions {
    pub absolute_expiration: Option<DateTime<Utc>>,
    pub absolute_expiration_relative_to_now: Option<Duration>,
    pub sliding_expiration: Option<Duration>,
}

impl EntryOptions {
    pub fn absolute(at: DateTime<Utc>) -> Self {
        Self {
            absolute_expiration: Some(at),
            ..Default::default()
        }
    }

    pub fn relative(after: Duration) -> Self {
        Self {
            absolute_expiration_relative_to_now: Some(after),
            ..Default::default()
        }
    }

    pub fn sliding(window: Duration) -> Self {
        Self {
            sliding_expiration: Some(window),
            ..Default::default()
        }
    }
}

/// Normalized expiration policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExpirationPolicy {
    /// Lives as long as the backend allows.
    #[default]
    None,
    Absolute(Ticks),
    Relative(Ticks),
    Sliding(Ticks),
}

impl From<Option<&EntryOptions>> for ExpirationPolicy {
    fn from(options: Option<&EntryOptions>) -> Self {
        let Some(options) = options else {
            return ExpirationPolicy::None;
        };
        if let Some(window) = options.sliding_expiration {
            ExpirationPolicy::Sliding(Ticks::from_duration(window))
        } else if let Some(at) = options.absolute_expiration {
            ExpirationPolicy::Absolute(Ticks::from_datetime(at))
        } else if let Some(after) = options.absolute_expiration_relative_to_now {
            ExpirationPolicy::Relative(Ticks::from_duration(after))
        } else {
            ExpirationPolicy::None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_combine_and_parse() {
        let flags = ValueFlags::SLIDING | ValueFlags::SPLIT;
        assert_eq!(flags.bits(), 5);
        assert!(flags.contains(ValueFlags::SPLIT));
        assert!(!flags.contains(ValueFlags::COMPRESS));
        assert_eq!(flags.to_string(), "sliding|split");
        assert_eq!(ValueFlags::from_bits(7).unwrap().bits(), 7);
        assert!(matches!(
            ValueFlags::from_bits(8),
            Err(CorruptData::UnknownFlags(8))
        ));
    }

    #[test]
    fn test_header_layout() {
        let header = SlidingHeader {
            duration: Ticks(1),
            expiration: Ticks(0x0102),
        };
        let bytes = header.encode();
        assert_eq!(bytes[7], 1);
        assert_eq!(&bytes[14..], &[1, 2]);
        assert_eq!(SlidingHeader::decode(&bytes).unwrap(), header);
        assert!(SlidingHeader::decode(&bytes[..15]).is_err());
    }

    #[test]
    fn test_rewrite_keeps_duration_and_payload() {
        let header = SlidingHeader {
            duration: Ticks::from_secs(5),
            expiration: Ticks(100),
        };
        let mut value = header.encode().to_vec();
        value.extend_from_slice(b"payload");

        let rewritten = SlidingHeader::rewrite_expiration(&value, Ticks(999));
        let parsed = SlidingHeader::decode(&rewritten).unwrap();
        assert_eq!(parsed.duration, Ticks::from_secs(5));
        assert_eq!(parsed.expiration, Ticks(999));
        assert_eq!(&rewritten[16..], b"payload");
    }

    #[test]
    fn test_extend_window_bounds() {
        assert_eq!(extend_window(Ticks::from_secs(10)), Ticks::from_secs(5));
        assert_eq!(extend_window(Ticks::from_secs(1)), Ticks::ONE_SECOND);
        assert_eq!(extend_window(Ticks::from_secs(86_400)), MAX_EXTEND);
    }

    #[test]
    fn test_shard_ids_roundtrip_through_list() {
        let ids = vec![ShardId::new_random(), ShardId::new_random()];
        let list: Vec<u8> = ids.iter().flat_map(|id| id.to_bytes()).collect();
        assert_eq!(decode_shard_ids(&list).unwrap(), ids);
        assert!(decode_shard_ids(&list[..17]).is_err());
        assert_eq!(ids[0].key().len(), 36);
    }

    #[test]
    fn test_policy_precedence() {
        let options = EntryOptions {
            absolute_expiration: Some(Utc::now()),
            absolute_expiration_relative_to_now: Some(Duration::from_secs(1)),
            sliding_expiration: Some(Duration::from_secs(2)),
        };
        assert_eq!(
            ExpirationPolicy::from(Some(&options)),
            ExpirationPolicy::Sliding(Ticks::from_secs(2))
        );

        let options = EntryOptions {
            sliding_expiration: None,
            ..options
        };
        assert!(matches!(
            ExpirationPolicy::from(Some(&options)),
            ExpirationPolicy::Absolute(_)
        ));
        assert_eq!(ExpirationPolicy::from(None), ExpirationPolicy::None);
    }
}
