//! # Order-Preserving Index Key Encoding
//!
//! This module turns a tuple of typed field values into a byte string whose
//! `memcmp` order equals the logical order of the tuple, so a dictionary that
//! only knows bytewise comparison can serve as an ordered secondary index.
//!
//! ## Type Prefix Scheme
//!
//! Each field starts with a class byte that fixes the order *between* types:
//!
//! ```text
//! 0x01  NULL
//! 0x02  FALSE
//! 0x03  TRUE
//! 0x10  NaN          ┐
//! 0x11  negative     │ one numeric class: NaN < negatives < 0 < positives
//! 0x12  zero         │ (ints and floats compare by numeric value)
//! 0x13  positive     ┘
//! 0x20  TEXT
//! 0x21  BYTES
//! ```
//!
//! ## Numeric Encoding
//!
//! Integers and floats share the numeric class so that `Int(2) < Float(2.5) <
//! Int(3)` holds bytewise. The payload is the IEEE-754 order-preserving
//! transform of the value's `f64` image:
//!
//! - negative: all bits inverted (`!bits`), big-endian
//! - positive: raw bits, big-endian (the sign bit is already 0)
//! - zero and NaN: no payload, the class byte is enough
//!
//! `Int(2)` and `Float(2.0)` encode to identical key bytes; the original
//! subtype lives in the [`TypeBits`] stored in the value position (one bit
//! per numeric field, 0 = Int, 1 = Float). Integer magnitudes beyond 2^53
//! are normalized to the nearest representable value.
//!
//! ## Text and Bytes
//!
//! Variable-length payloads escape embedded zeros (`0x00` → `0x00 0xFF`) and
//! close with a `0x00 0x00` terminator, so a string that is a prefix of
//! another sorts first and no field encoding is a prefix of a sibling's.
//!
//! ## Descending Fields and the RecordId Suffix
//!
//! A field indexed descending has every byte of its encoding inverted, class
//! byte included. The owning record's id is appended as its 8-byte
//! memcmp-ordered form, never inverted, so duplicate logical keys tie-break
//! by record id.

use crate::error::{Error, Result};
use crate::record_id::{RecordId, RECORD_ID_KEY_LEN};

const PREFIX_NULL: u8 = 0x01;
const PREFIX_FALSE: u8 = 0x02;
const PREFIX_TRUE: u8 = 0x03;
const PREFIX_NAN: u8 = 0x10;
const PREFIX_NEGATIVE: u8 = 0x11;
const PREFIX_ZERO: u8 = 0x12;
const PREFIX_POSITIVE: u8 = 0x13;
const PREFIX_TEXT: u8 = 0x20;
const PREFIX_BYTES: u8 = 0x21;

/// One field of an index key tuple.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
}

/// Per-field sort direction for up to 32 fields, packed as a bitmask.
///
/// Bit `i` set means field `i` is indexed descending. The mask serializes as
/// a fixed-width big-endian word inside the dictionary descriptor so that
/// engine-side callbacks can reconstruct the comparator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct KeyOrdering {
    descending: u32,
}

impl KeyOrdering {
    /// All fields ascending.
    pub const fn ascending() -> KeyOrdering {
        KeyOrdering { descending: 0 }
    }

    pub const fn from_mask(descending: u32) -> KeyOrdering {
        KeyOrdering { descending }
    }

    pub const fn mask(self) -> u32 {
        self.descending
    }

    pub fn is_descending(self, field: usize) -> bool {
        field < 32 && self.descending & (1 << field) != 0
    }
}

/// Lossy type information needed to reconstruct a tuple from its key bytes.
///
/// One bit per numeric field, in tuple order: 0 = the field was an `Int`,
/// 1 = a `Float`. Serializes to the empty slice when every bit is zero, which
/// keeps all-integer indexes valueless.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TypeBits {
    bytes: Vec<u8>,
    nbits: usize,
}

impl TypeBits {
    pub fn new() -> TypeBits {
        TypeBits::default()
    }

    pub fn from_bytes(bytes: &[u8]) -> TypeBits {
        TypeBits {
            nbits: bytes.len() * 8,
            bytes: bytes.to_vec(),
        }
    }

    fn push(&mut self, bit: bool) {
        let byte = self.nbits / 8;
        if byte == self.bytes.len() {
            self.bytes.push(0);
        }
        if bit {
            self.bytes[byte] |= 1 << (self.nbits % 8);
        }
        self.nbits += 1;
    }

    /// Bits beyond the serialized length read as zero.
    fn get(&self, index: usize) -> bool {
        self.bytes
            .get(index / 8)
            .is_some_and(|b| b & (1 << (index % 8)) != 0)
    }

    pub fn is_all_zeros(&self) -> bool {
        self.bytes.iter().all(|&b| b == 0)
    }

    /// Serialized form; empty when all bits are zero.
    pub fn as_bytes(&self) -> &[u8] {
        if self.is_all_zeros() {
            &[]
        } else {
            &self.bytes
        }
    }
}

struct FieldWriter<'a> {
    out: &'a mut Vec<u8>,
    invert: bool,
}

impl FieldWriter<'_> {
    fn put(&mut self, byte: u8) {
        self.out.push(if self.invert { !byte } else { byte });
    }

    fn put_all(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.put(b);
        }
    }

    fn put_escaped(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.put(b);
            if b == 0x00 {
                self.put(0xFF);
            }
        }
        self.put(0x00);
        self.put(0x00);
    }
}

fn encode_field(value: &FieldValue, invert: bool, out: &mut Vec<u8>, type_bits: &mut TypeBits) {
    let mut w = FieldWriter { out, invert };
    match value {
        FieldValue::Null => w.put(PREFIX_NULL),
        FieldValue::Bool(false) => w.put(PREFIX_FALSE),
        FieldValue::Bool(true) => w.put(PREFIX_TRUE),
        FieldValue::Int(i) => {
            type_bits.push(false);
            encode_numeric(*i as f64, &mut w);
        }
        FieldValue::Float(f) => {
            type_bits.push(true);
            encode_numeric(*f, &mut w);
        }
        FieldValue::Text(s) => {
            w.put(PREFIX_TEXT);
            w.put_escaped(s.as_bytes());
        }
        FieldValue::Bytes(b) => {
            w.put(PREFIX_BYTES);
            w.put_escaped(b);
        }
    }
}

fn encode_numeric(v: f64, w: &mut FieldWriter<'_>) {
    if v.is_nan() {
        w.put(PREFIX_NAN);
    } else if v == 0.0 {
        w.put(PREFIX_ZERO);
    } else if v < 0.0 {
        w.put(PREFIX_NEGATIVE);
        w.put_all(&(!v.to_bits()).to_be_bytes());
    } else {
        w.put(PREFIX_POSITIVE);
        w.put_all(&v.to_bits().to_be_bytes());
    }
}

/// Encode a full index entry key: the field tuple under `ordering` followed
/// by the record id suffix. Returns the key bytes and the type bits destined
/// for the value position.
pub fn encode_index_key(
    fields: &[FieldValue],
    ordering: KeyOrdering,
    id: RecordId,
) -> (Vec<u8>, TypeBits) {
    let mut out = Vec::with_capacity(fields.len() * 10 + RECORD_ID_KEY_LEN);
    let mut type_bits = TypeBits::new();
    for (i, field) in fields.iter().enumerate() {
        encode_field(field, ordering.is_descending(i), &mut out, &mut type_bits);
    }
    out.extend_from_slice(&id.to_key_bytes());
    (out, type_bits)
}

/// A query bound field with its inclusivity, used by cursor positioning.
#[derive(Debug, Clone)]
pub struct BoundField {
    pub value: FieldValue,
    pub inclusive: bool,
}

/// Build a seek key for cursor repositioning.
///
/// `prefix` fields are the part of the current key to keep; `after` makes the
/// whole prefix an exclusive bound (the trailing bound fields are then
/// irrelevant and dropped, since the bound already clears them). Otherwise
/// bound fields are appended until the first exclusive one, which truncates
/// the rest for the same reason. The record id suffix then places the key
/// before or after every real entry sharing those fields, depending on the
/// scan direction.
pub fn encode_query(
    prefix: &[FieldValue],
    after: bool,
    bounds: &[BoundField],
    ordering: KeyOrdering,
    forward: bool,
) -> Vec<u8> {
    let mut out = Vec::new();
    let mut type_bits = TypeBits::new();
    let mut exclusive = after;

    for (i, field) in prefix.iter().enumerate() {
        encode_field(field, ordering.is_descending(i), &mut out, &mut type_bits);
    }
    if !after {
        for (i, bound) in bounds.iter().enumerate() {
            let field_idx = prefix.len() + i;
            encode_field(
                &bound.value,
                ordering.is_descending(field_idx),
                &mut out,
                &mut type_bits,
            );
            if !bound.inclusive {
                exclusive = true;
                break;
            }
        }
    }

    // Forward scans seek to the first entry >= the key, backward scans to the
    // last entry <= it; the id suffix selects which side of the matching
    // entries the bound lands on.
    let suffix = if forward != exclusive {
        RecordId::MIN
    } else {
        RecordId::MAX
    };
    out.extend_from_slice(&suffix.to_key_bytes());
    out
}

/// Strip and decode the record id suffix of an index entry key.
pub fn decode_record_id_at_end(key: &[u8]) -> Result<RecordId> {
    if key.len() < RECORD_ID_KEY_LEN {
        return Err(Error::BadValue(format!(
            "index key too short for record id suffix: {} bytes",
            key.len()
        )));
    }
    let suffix = &key[key.len() - RECORD_ID_KEY_LEN..];
    RecordId::from_key_bytes(suffix)
        .ok_or_else(|| Error::Internal("record id suffix of wrong width".into()))
}

struct FieldReader<'a> {
    data: &'a [u8],
    pos: usize,
    invert: bool,
}

impl FieldReader<'_> {
    fn take(&mut self) -> Result<u8> {
        let b = *self
            .data
            .get(self.pos)
            .ok_or_else(|| Error::BadValue("truncated index key".into()))?;
        self.pos += 1;
        Ok(if self.invert { !b } else { b })
    }

    fn take_n<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut arr = [0u8; N];
        for slot in arr.iter_mut() {
            *slot = self.take()?;
        }
        Ok(arr)
    }

    fn take_escaped(&mut self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        loop {
            let b = self.take()?;
            if b != 0x00 {
                out.push(b);
                continue;
            }
            match self.take()? {
                0x00 => return Ok(out),
                0xFF => out.push(0x00),
                other => {
                    return Err(Error::BadValue(format!(
                        "bad escape byte 0x{:02x} in index key",
                        other
                    )))
                }
            }
        }
    }
}

/// Reverse [`encode_index_key`]: reconstruct the field tuple from the key
/// bytes (id suffix included) using the ordering and the entry's type bits.
pub fn decode_index_key(
    key: &[u8],
    ordering: KeyOrdering,
    type_bits: &TypeBits,
) -> Result<Vec<FieldValue>> {
    if key.len() < RECORD_ID_KEY_LEN {
        return Err(Error::BadValue("index key shorter than id suffix".into()));
    }
    let data = &key[..key.len() - RECORD_ID_KEY_LEN];
    let mut fields = Vec::new();
    let mut numeric_idx = 0usize;
    let mut pos = 0usize;

    while pos < data.len() {
        let mut reader = FieldReader {
            data,
            pos,
            invert: ordering.is_descending(fields.len()),
        };
        let prefix = reader.take()?;
        let field = match prefix {
            PREFIX_NULL => FieldValue::Null,
            PREFIX_FALSE => FieldValue::Bool(false),
            PREFIX_TRUE => FieldValue::Bool(true),
            PREFIX_NAN => numeric_field(f64::NAN, type_bits, &mut numeric_idx),
            PREFIX_ZERO => numeric_field(0.0, type_bits, &mut numeric_idx),
            PREFIX_NEGATIVE => {
                let bits = !u64::from_be_bytes(reader.take_n::<8>()?);
                numeric_field(f64::from_bits(bits), type_bits, &mut numeric_idx)
            }
            PREFIX_POSITIVE => {
                let bits = u64::from_be_bytes(reader.take_n::<8>()?);
                numeric_field(f64::from_bits(bits), type_bits, &mut numeric_idx)
            }
            PREFIX_TEXT => {
                let raw = reader.take_escaped()?;
                FieldValue::Text(String::from_utf8(raw).map_err(|_| {
                    Error::BadValue("index key text field is not valid utf-8".into())
                })?)
            }
            PREFIX_BYTES => FieldValue::Bytes(reader.take_escaped()?),
            other => {
                return Err(Error::BadValue(format!(
                    "unknown index key type prefix 0x{:02x}",
                    other
                )))
            }
        };
        pos = reader.pos;
        fields.push(field);
    }

    Ok(fields)
}

fn numeric_field(value: f64, type_bits: &TypeBits, numeric_idx: &mut usize) -> FieldValue {
    let is_float = type_bits.get(*numeric_idx);
    *numeric_idx += 1;
    if is_float || value.is_nan() {
        FieldValue::Float(value)
    } else {
        FieldValue::Int(value as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn enc(fields: &[FieldValue]) -> Vec<u8> {
        encode_index_key(fields, KeyOrdering::ascending(), RecordId::new(1)).0
    }

    fn round_trip(fields: &[FieldValue], ordering: KeyOrdering) -> Vec<FieldValue> {
        let (key, type_bits) = encode_index_key(fields, ordering, RecordId::new(7));
        decode_index_key(&key, ordering, &type_bits).unwrap()
    }

    #[test]
    fn class_order_null_bool_number_text_bytes() {
        let ordered = [
            enc(&[FieldValue::Null]),
            enc(&[FieldValue::Bool(false)]),
            enc(&[FieldValue::Bool(true)]),
            enc(&[FieldValue::Float(f64::NAN)]),
            enc(&[FieldValue::Int(-5)]),
            enc(&[FieldValue::Int(0)]),
            enc(&[FieldValue::Int(5)]),
            enc(&[FieldValue::Text("a".into())]),
            enc(&[FieldValue::Bytes(vec![b'a'])]),
        ];
        for pair in ordered.windows(2) {
            assert!(pair[0] < pair[1], "{:?} !< {:?}", pair[0], pair[1]);
        }
    }

    #[test]
    fn ints_and_floats_interleave_numerically() {
        let ordered = [
            enc(&[FieldValue::Float(-2.5)]),
            enc(&[FieldValue::Int(-2)]),
            enc(&[FieldValue::Float(-0.5)]),
            enc(&[FieldValue::Int(0)]),
            enc(&[FieldValue::Float(0.5)]),
            enc(&[FieldValue::Int(1)]),
            enc(&[FieldValue::Float(1.5)]),
            enc(&[FieldValue::Int(2)]),
        ];
        for pair in ordered.windows(2) {
            assert!(pair[0] < pair[1]);
        }
    }

    #[test]
    fn equal_numbers_of_different_subtype_share_key_bytes() {
        let (int_key, int_bits) =
            encode_index_key(&[FieldValue::Int(2)], KeyOrdering::ascending(), RecordId::new(1));
        let (float_key, float_bits) = encode_index_key(
            &[FieldValue::Float(2.0)],
            KeyOrdering::ascending(),
            RecordId::new(1),
        );
        assert_eq!(int_key, float_key);
        assert!(int_bits.is_all_zeros());
        assert!(!float_bits.is_all_zeros());
    }

    #[test]
    fn all_int_tuples_serialize_empty_type_bits() {
        let (_, bits) = encode_index_key(
            &[FieldValue::Int(1), FieldValue::Int(2)],
            KeyOrdering::ascending(),
            RecordId::new(1),
        );
        assert!(bits.as_bytes().is_empty());
    }

    #[test]
    fn type_bits_round_trip_through_serialization() {
        let fields = [
            FieldValue::Int(1),
            FieldValue::Float(2.0),
            FieldValue::Int(3),
            FieldValue::Float(4.0),
        ];
        let (key, bits) = encode_index_key(&fields, KeyOrdering::ascending(), RecordId::new(1));
        let reloaded = TypeBits::from_bytes(bits.as_bytes());
        let decoded = decode_index_key(&key, KeyOrdering::ascending(), &reloaded).unwrap();
        assert_eq!(decoded.as_slice(), &fields);
    }

    #[test]
    fn prefix_string_sorts_before_extension() {
        assert!(enc(&[FieldValue::Text("a".into())]) < enc(&[FieldValue::Text("ab".into())]));
    }

    #[test]
    fn embedded_zero_bytes_do_not_terminate_early() {
        let a = enc(&[FieldValue::Bytes(vec![1, 0, 2])]);
        let b = enc(&[FieldValue::Bytes(vec![1, 0, 3])]);
        let c = enc(&[FieldValue::Bytes(vec![1, 1])]);
        assert!(a < b);
        assert!(b < c);
        assert_eq!(
            round_trip(
                &[FieldValue::Bytes(vec![1, 0, 2])],
                KeyOrdering::ascending()
            ),
            vec![FieldValue::Bytes(vec![1, 0, 2])]
        );
    }

    #[test]
    fn descending_field_reverses_order() {
        let ordering = KeyOrdering::from_mask(0b1);
        let (lo, _) = encode_index_key(&[FieldValue::Int(1)], ordering, RecordId::new(1));
        let (hi, _) = encode_index_key(&[FieldValue::Int(2)], ordering, RecordId::new(1));
        assert!(hi < lo);
    }

    #[test]
    fn compound_descending_round_trips() {
        let ordering = KeyOrdering::from_mask(0b10);
        let fields = [
            FieldValue::Text("user".into()),
            FieldValue::Int(-42),
            FieldValue::Bool(true),
        ];
        assert_eq!(round_trip(&fields, ordering).as_slice(), &fields);
    }

    #[test]
    fn record_id_suffix_breaks_ties() {
        let fields = [FieldValue::Int(9)];
        let (a, _) = encode_index_key(&fields, KeyOrdering::ascending(), RecordId::new(3));
        let (b, _) = encode_index_key(&fields, KeyOrdering::ascending(), RecordId::new(4));
        assert!(a < b);
        assert_eq!(decode_record_id_at_end(&a).unwrap(), RecordId::new(3));
        assert_eq!(decode_record_id_at_end(&b).unwrap(), RecordId::new(4));
    }

    #[test]
    fn sentinel_ids_bracket_real_entries() {
        let fields = [FieldValue::Int(9)];
        let (lo, _) = encode_index_key(&fields, KeyOrdering::ascending(), RecordId::MIN);
        let (mid, _) = encode_index_key(&fields, KeyOrdering::ascending(), RecordId::new(5));
        let (hi, _) = encode_index_key(&fields, KeyOrdering::ascending(), RecordId::MAX);
        assert!(lo < mid);
        assert!(mid < hi);
    }

    #[test]
    fn query_key_inclusive_forward_lands_before_entries() {
        let fields = [FieldValue::Int(9)];
        let query = encode_query(&fields, false, &[], KeyOrdering::ascending(), true);
        let (entry, _) = encode_index_key(&fields, KeyOrdering::ascending(), RecordId::new(1));
        assert!(query < entry);
    }

    #[test]
    fn query_key_after_forward_lands_past_entries() {
        let fields = [FieldValue::Int(9)];
        let query = encode_query(&fields, true, &[], KeyOrdering::ascending(), true);
        let (entry, _) = encode_index_key(&fields, KeyOrdering::ascending(), RecordId::new(i64::MAX - 1));
        let (next, _) = encode_index_key(&[FieldValue::Int(10)], KeyOrdering::ascending(), RecordId::new(1));
        assert!(entry < query);
        assert!(query < next);
    }

    #[test]
    fn query_key_exclusive_bound_truncates_remaining_fields() {
        let bounds = [
            BoundField {
                value: FieldValue::Int(5),
                inclusive: false,
            },
            BoundField {
                value: FieldValue::Int(99),
                inclusive: true,
            },
        ];
        let query = encode_query(&[], false, &bounds, KeyOrdering::ascending(), true);
        let (five_anything, _) = encode_index_key(
            &[FieldValue::Int(5), FieldValue::Int(1_000_000)],
            KeyOrdering::ascending(),
            RecordId::new(1),
        );
        let (six, _) = encode_index_key(
            &[FieldValue::Int(6), FieldValue::Int(0)],
            KeyOrdering::ascending(),
            RecordId::new(1),
        );
        assert!(five_anything < query);
        assert!(query < six);
    }

    #[test]
    fn decode_rejects_truncated_key() {
        assert!(decode_record_id_at_end(&[0u8; 4]).is_err());
        let (key, bits) =
            encode_index_key(&[FieldValue::Text("abc".into())], KeyOrdering::ascending(), RecordId::new(1));
        assert!(decode_index_key(&key[..key.len() - 9], KeyOrdering::ascending(), &bits).is_err());
    }

    proptest! {
        #[test]
        fn int_keys_preserve_order(a in -(1i64 << 53)..(1i64 << 53), b in -(1i64 << 53)..(1i64 << 53)) {
            let (ka, kb) = (enc(&[FieldValue::Int(a)]), enc(&[FieldValue::Int(b)]));
            prop_assert_eq!(a.cmp(&b), ka.cmp(&kb));
        }

        #[test]
        fn finite_float_keys_preserve_order(a: f64, b: f64) {
            prop_assume!(a.is_finite() && b.is_finite());
            let (ka, kb) = (enc(&[FieldValue::Float(a)]), enc(&[FieldValue::Float(b)]));
            prop_assert_eq!(a.partial_cmp(&b).unwrap(), ka.cmp(&kb));
        }

        #[test]
        fn text_keys_preserve_order(a: String, b: String) {
            let (ka, kb) = (
                enc(&[FieldValue::Text(a.clone())]),
                enc(&[FieldValue::Text(b.clone())]),
            );
            prop_assert_eq!(a.as_bytes().cmp(b.as_bytes()), ka.cmp(&kb));
        }

        #[test]
        fn tuples_round_trip(a in -(1i64 << 53)..(1i64 << 53), s: String, desc in 0u32..8) {
            let ordering = KeyOrdering::from_mask(desc);
            let fields = [FieldValue::Int(a), FieldValue::Text(s), FieldValue::Null];
            let (key, bits) = encode_index_key(&fields, ordering, RecordId::new(12));
            prop_assert_eq!(decode_record_id_at_end(&key).unwrap(), RecordId::new(12));
            let decoded = decode_index_key(&key, ordering, &bits).unwrap();
            prop_assert_eq!(decoded.as_slice(), &fields);
        }
    }
}
