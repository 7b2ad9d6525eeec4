//! Primitive value types shared by instructions, payloads and storage.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

/// An interned string: an index into a changeset's intern table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InternString(pub u32);

impl InternString {
    /// Sentinel for "no string".
    pub const NPOS: InternString = InternString(u32::MAX);

    /// Returns true if this is not the sentinel value.
    pub fn is_valid(&self) -> bool {
        *self != Self::NPOS
    }
}

/// A range of bytes inside a changeset's string buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StringBufferRange {
    /// Byte offset into the buffer.
    pub offset: u32,
    /// Length in bytes.
    pub size: u32,
}

/// Server-assigned object identity for tables without a primary key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GlobalKey {
    /// High 64 bits.
    pub hi: u64,
    /// Low 64 bits.
    pub lo: u64,
}

impl GlobalKey {
    /// Creates a global key from its two halves.
    pub fn new(hi: u64, lo: u64) -> Self {
        Self { hi, lo }
    }
}

impl fmt::Display for GlobalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{:04x}-{:04x}}}", self.hi, self.lo)
    }
}

/// A 12-byte object identifier (4 bytes of seconds, 5 random bytes, 3 bytes of counter).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectId(pub [u8; 12]);

fn object_id_seed() -> &'static ([u8; 5], AtomicU32) {
    static SEED: OnceLock<([u8; 5], AtomicU32)> = OnceLock::new();
    SEED.get_or_init(|| {
        let mut rng = rand::thread_rng();
        let random: [u8; 5] = rng.gen();
        (random, AtomicU32::new(rng.gen::<u32>() & 0x00FF_FFFF))
    })
}

impl ObjectId {
    /// Generates a new, process-unique object id.
    pub fn generate() -> Self {
        let (random, counter) = object_id_seed();
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as u32;
        let count = counter.fetch_add(1, Ordering::Relaxed) & 0x00FF_FFFF;

        let mut bytes = [0u8; 12];
        bytes[..4].copy_from_slice(&secs.to_be_bytes());
        bytes[4..9].copy_from_slice(random);
        bytes[9..].copy_from_slice(&count.to_be_bytes()[1..]);
        Self(bytes)
    }

    /// Returns the raw bytes.
    pub fn as_bytes(&self) -> &[u8; 12] {
        &self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl FromStr for ObjectId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 24 || !s.is_ascii() {
            return Err(format!("invalid ObjectId string: {s:?}"));
        }
        let mut bytes = [0u8; 12];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16)
                .map_err(|_| format!("invalid ObjectId string: {s:?}"))?;
        }
        Ok(Self(bytes))
    }
}

/// A point in time with nanosecond resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Timestamp {
    /// Seconds since the Unix epoch.
    pub seconds: i64,
    /// Nanoseconds within the second.
    pub nanoseconds: i32,
}

impl Timestamp {
    /// Creates a timestamp.
    pub fn new(seconds: i64, nanoseconds: i32) -> Self {
        Self {
            seconds,
            nanoseconds,
        }
    }

    /// Returns the current wall-clock time.
    pub fn now() -> Self {
        let elapsed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self {
            seconds: elapsed.as_secs() as i64,
            nanoseconds: elapsed.subsec_nanos() as i32,
        }
    }
}

/// A 128-bit IEEE 754 decimal, carried as raw bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Decimal128 {
    /// Low 64 bits.
    pub low: u64,
    /// High 64 bits.
    pub high: u64,
}

impl Decimal128 {
    /// Creates a decimal from its raw bits.
    pub fn from_bits(low: u64, high: u64) -> Self {
        Self { low, high }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_id_generate_is_unique_and_parses_back() {
        let a = ObjectId::generate();
        let b = ObjectId::generate();
        assert_ne!(a, b);

        let parsed: ObjectId = a.to_string().parse().unwrap();
        assert_eq!(parsed, a);
        assert!("zz".parse::<ObjectId>().is_err());
    }

    #[test]
    fn timestamps_order_by_seconds_then_nanos() {
        assert!(Timestamp::new(1, 500) < Timestamp::new(2, 0));
        assert!(Timestamp::new(2, 0) < Timestamp::new(2, 1));
    }

    #[test]
    fn intern_string_sentinel() {
        assert!(!InternString::NPOS.is_valid());
        assert!(InternString(0).is_valid());
    }
}
