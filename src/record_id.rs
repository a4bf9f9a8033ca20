//! # Record Identifiers
//!
//! A [`RecordId`] names one record within one record store. It is a signed
//! 64-bit integer with three reserved values carving the space into regions:
//!
//! ```text
//! i64::MIN                0                i64::MAX
//!    │                    │                    │
//!    MIN ──── normal ──── NULL ─── normal ──── MAX
//!  (before any        (absent / no          (after any
//!   real record)       record)               real record)
//! ```
//!
//! `MIN` and `MAX` are seek sentinels: a cursor positioned at `MIN` lands on
//! the first record, one positioned at `MAX` on the last. `NULL` means "no
//! record"; freshly allocated ids start at 1 and increase strictly, so every
//! id a store hands out is normal.
//!
//! ## Key encoding
//!
//! The stored form must be memcmp-ordered consistently with the signed
//! ordering, because the dictionary comparator is plain bytewise comparison.
//! Flipping the sign bit biases the value into unsigned space (equivalent to
//! adding 2^63), and big-endian byte order then makes lexicographic and
//! numeric order agree:
//!
//! ```text
//! -2  →  0x7FFF_FFFF_FFFF_FFFE
//! -1  →  0x7FFF_FFFF_FFFF_FFFF
//!  0  →  0x8000_0000_0000_0000
//!  1  →  0x8000_0000_0000_0001
//! ```

/// Identifier of a single record within one record store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RecordId(i64);

/// Width of the encoded form in bytes.
pub const RECORD_ID_KEY_LEN: usize = 8;

impl RecordId {
    /// Absent record.
    pub const NULL: RecordId = RecordId(0);
    /// Sorts before every normal id.
    pub const MIN: RecordId = RecordId(i64::MIN);
    /// Sorts after every normal id.
    pub const MAX: RecordId = RecordId(i64::MAX);

    pub const fn new(repr: i64) -> RecordId {
        RecordId(repr)
    }

    pub const fn repr(self) -> i64 {
        self.0
    }

    pub fn is_null(self) -> bool {
        self == Self::NULL
    }

    /// True for ids that can name an actual record (not a sentinel).
    pub fn is_normal(self) -> bool {
        self != Self::NULL && self != Self::MIN && self != Self::MAX
    }

    pub fn next(self) -> RecordId {
        RecordId(self.0 + 1)
    }

    /// Memcmp-ordered stored form: sign bit flipped, big-endian.
    pub fn to_key_bytes(self) -> [u8; RECORD_ID_KEY_LEN] {
        ((self.0 as u64) ^ (1 << 63)).to_be_bytes()
    }

    pub fn from_key_bytes(bytes: &[u8]) -> Option<RecordId> {
        let arr: [u8; RECORD_ID_KEY_LEN] = bytes.try_into().ok()?;
        Some(RecordId((u64::from_be_bytes(arr) ^ (1 << 63)) as i64))
    }
}

impl std::fmt::Display for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            RecordId::NULL => write!(f, "RecordId(null)"),
            RecordId::MIN => write!(f, "RecordId(min)"),
            RecordId::MAX => write!(f, "RecordId(max)"),
            RecordId(repr) => write!(f, "RecordId({})", repr),
        }
    }
}
