//! # Dictionary Encoding
//!
//! Every dictionary carries an [`Encoding`] tag in its descriptor telling
//! engine-side callbacks (comparator, updater) what its keys are:
//!
//! - [`Encoding::RecordStore`] — keys are record ids in their memcmp-ordered
//!   form, values are raw record bytes.
//! - [`Encoding::Index`] — keys are order-preserving field tuples with a
//!   record id suffix, values are type bits.
//! - [`Encoding::Empty`] — metadata dictionaries with opaque keys.
//!
//! The tag is stored inside the dictionary itself so cursors and comparators
//! can recover it without consulting a catalog; [`Encoding::serialize`] /
//! [`Encoding::parse`] round-trip it through the descriptor. The comparator
//! never consults the tag: ordering is always bytewise with a
//! shorter-is-smaller tiebreak ([`Encoding::cmp`]), which the key encodings
//! are designed to satisfy.

pub mod index_key;

pub use index_key::{
    decode_index_key, decode_record_id_at_end, encode_index_key, encode_query, BoundField,
    FieldValue, KeyOrdering, TypeBits,
};

use crate::error::{Error, Result};
use crate::record_id::RecordId;

const TAG_RECORD_STORE: u8 = 0;
const TAG_INDEX: u8 = 1;

/// Discriminator stored in a dictionary's descriptor. Read-only after
/// creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    RecordStore,
    Index { ordering: KeyOrdering },
    Empty,
}

impl Encoding {
    pub fn for_record_store() -> Encoding {
        Encoding::RecordStore
    }

    pub fn for_index(ordering: KeyOrdering) -> Encoding {
        Encoding::Index { ordering }
    }

    pub fn is_record_store(&self) -> bool {
        matches!(self, Encoding::RecordStore)
    }

    pub fn is_index(&self) -> bool {
        matches!(self, Encoding::Index { .. })
    }

    pub fn serialize(&self) -> Vec<u8> {
        match self {
            Encoding::RecordStore => vec![TAG_RECORD_STORE],
            Encoding::Index { ordering } => {
                let mut out = vec![TAG_INDEX];
                out.extend_from_slice(&ordering.mask().to_be_bytes());
                out
            }
            Encoding::Empty => Vec::new(),
        }
    }

    pub fn parse(serialized: &[u8]) -> Result<Encoding> {
        match serialized {
            [] => Ok(Encoding::Empty),
            [TAG_RECORD_STORE] => Ok(Encoding::RecordStore),
            [TAG_INDEX, mask @ ..] => {
                let mask: [u8; 4] = mask.try_into().map_err(|_| {
                    Error::BadValue("index encoding descriptor has a malformed ordering".into())
                })?;
                Ok(Encoding::Index {
                    ordering: KeyOrdering::from_mask(u32::from_be_bytes(mask)),
                })
            }
            other => Err(Error::BadValue(format!(
                "unknown encoding discriminator 0x{:02x}",
                other[0]
            ))),
        }
    }

    /// The dictionary comparator: bytewise with length tiebreak.
    pub fn cmp(a: &[u8], b: &[u8]) -> std::cmp::Ordering {
        a.cmp(b)
    }

    /// Recover the record id embedded in a key of this encoding.
    pub fn extract_record_id(&self, key: &[u8]) -> Result<RecordId> {
        match self {
            Encoding::RecordStore => RecordId::from_key_bytes(key)
                .ok_or_else(|| Error::BadValue("record store key of wrong width".into())),
            Encoding::Index { .. } => decode_record_id_at_end(key),
            Encoding::Empty => Err(Error::Internal(
                "empty encoding carries no record ids".into(),
            )),
        }
    }

    /// Reverse the index key encoding using this encoding's ordering and the
    /// type bits found in the entry's value.
    pub fn extract_index_key(&self, key: &[u8], value: &[u8]) -> Result<Vec<FieldValue>> {
        match self {
            Encoding::Index { ordering } => {
                decode_index_key(key, *ordering, &TypeBits::from_bytes(value))
            }
            _ => Err(Error::Internal(
                "extract_index_key on a non-index encoding".into(),
            )),
        }
    }
}
