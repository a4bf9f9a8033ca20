//! # Sorted Index
//!
//! A [`SortedIndex`] stores index entries `(encoded field tuple ‖ record id)
//! → type bits` in one dictionary. Because keys carry the record id suffix,
//! duplicate logical keys coexist as distinct dictionary keys and sort by
//! record id; uniqueness is enforced by a range probe at insert time, not by
//! the dictionary.
//!
//! ## Unique inserts and write conflicts
//!
//! On a unique index, a write conflict during the duplicate probe or the
//! insert itself is reported as [`DuplicateKey`](crate::Error::DuplicateKey)
//! rather than surfaced: the conflicting writer may well be inserting the
//! same key, and a false duplicate that makes the caller re-check is far
//! cheaper than a missed one.
//!
//! ## The cursor's caches
//!
//! Index traversal is hot, and decoding a tuple is much more expensive than
//! comparing bytes, so [`IndexCursor`] keeps four independently valid
//! caches: the raw key bytes, the decoded field tuple, the type bits, and
//! the record id. Everything is populated lazily and invalidated on every
//! move; [`IndexCursor::points_to_same_place_as`] goes out of its way to
//! compare whichever representation both sides already have.

use std::sync::Arc;

use crate::dictionary::{Cursor, Dictionary, Direction};
use crate::encoding::{
    decode_record_id_at_end, encode_index_key, encode_query, BoundField, FieldValue, KeyOrdering,
    TypeBits,
};
use crate::error::{Error, Result};
use crate::record_id::{RecordId, RECORD_ID_KEY_LEN};
use crate::recovery::OperationContext;

/// Encoded field tuples above this size are rejected with `KeyTooLong`.
pub const MAX_KEY_SIZE: usize = 1024;

fn dup_key_error(fields: &[FieldValue]) -> Error {
    Error::DuplicateKey {
        message: format!("duplicate key in unique index: {:?}", fields),
    }
}

pub struct SortedIndex {
    dict: Arc<dyn Dictionary>,
    ordering: KeyOrdering,
}

impl SortedIndex {
    pub fn new(dict: Arc<dyn Dictionary>, ordering: KeyOrdering) -> SortedIndex {
        SortedIndex { dict, ordering }
    }

    pub fn ordering(&self) -> KeyOrdering {
        self.ordering
    }

    pub fn insert(
        &self,
        ctx: &mut OperationContext,
        fields: &[FieldValue],
        id: RecordId,
        dups_allowed: bool,
    ) -> Result<()> {
        debug_assert!(id.is_normal());
        let (key, type_bits) = encode_index_key(fields, self.ordering, id);
        let field_bytes = key.len() - RECORD_ID_KEY_LEN;
        if field_bytes >= MAX_KEY_SIZE {
            return Err(Error::KeyTooLong {
                size: field_bytes,
                limit: MAX_KEY_SIZE,
            });
        }

        if !dups_allowed {
            let (lo, _) = encode_index_key(fields, self.ordering, RecordId::MIN);
            let (hi, _) = encode_index_key(fields, self.ordering, RecordId::MAX);
            match self.dict.dup_key_check(ctx, &lo, &hi, id) {
                Ok(()) => {}
                Err(Error::DuplicateKey { .. }) => return Err(dup_key_error(fields)),
                // A conflict here may be masking a concurrent insert of the
                // same key; reporting a duplicate is the safe reading.
                Err(Error::WriteConflict) => return Err(dup_key_error(fields)),
                Err(err) => return Err(err),
            }
        }

        match self.dict.insert(ctx, &key, type_bits.as_bytes(), false) {
            Err(Error::WriteConflict) if !dups_allowed => Err(dup_key_error(fields)),
            other => other,
        }
    }

    pub fn unindex(
        &self,
        ctx: &mut OperationContext,
        fields: &[FieldValue],
        id: RecordId,
    ) -> Result<()> {
        debug_assert!(id.is_normal());
        let (key, _) = encode_index_key(fields, self.ordering, id);
        self.dict.remove(ctx, &key)
    }

    pub fn is_empty(&self, ctx: &mut OperationContext) -> Result<bool> {
        let cursor = self.dict.cursor(ctx, None, Direction::Forward)?;
        Ok(!cursor.ok())
    }

    /// Count entries by scanning. Doubles as a cache warmer.
    pub fn full_validate(&self, ctx: &mut OperationContext) -> Result<i64> {
        let mut num_keys = 0i64;
        let mut cursor = self.dict.cursor(ctx, None, Direction::Forward)?;
        while cursor.ok() {
            num_keys += 1;
            cursor.advance(ctx)?;
        }
        Ok(num_keys)
    }

    pub fn num_entries(&self, ctx: &mut OperationContext) -> Result<i64> {
        self.full_validate(ctx)
    }

    pub fn space_used(&self) -> i64 {
        self.dict.stats().storage_size
    }

    pub fn cursor(&self, ctx: &mut OperationContext, direction: Direction) -> Result<IndexCursor> {
        Ok(IndexCursor {
            dict: Arc::clone(&self.dict),
            ordering: self.ordering,
            direction,
            cursor: Some(self.dict.cursor(ctx, None, direction)?),
            key_bytes: Vec::new(),
            key_bytes_valid: false,
            key_fields: None,
            type_bits: None,
            record_id: RecordId::NULL,
        })
    }
}

/// Bidirectional index cursor with save/restore; see the module docs.
pub struct IndexCursor {
    dict: Arc<dyn Dictionary>,
    ordering: KeyOrdering,
    direction: Direction,
    cursor: Option<Box<dyn Cursor>>,
    key_bytes: Vec<u8>,
    key_bytes_valid: bool,
    key_fields: Option<Vec<FieldValue>>,
    type_bits: Option<TypeBits>,
    record_id: RecordId,
}

impl IndexCursor {
    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn is_eof(&self) -> bool {
        !self.cursor.as_ref().is_some_and(|c| c.ok())
    }

    fn invalidate_cache(&mut self) {
        self.key_bytes_valid = false;
        self.key_fields = None;
        self.type_bits = None;
        self.record_id = RecordId::NULL;
    }

    fn load_key_if_needed(&mut self) {
        if self.key_bytes_valid {
            debug_assert!(self
                .cursor
                .as_ref()
                .is_some_and(|c| c.key() == self.key_bytes.as_slice()));
            return;
        }
        if let Some(cursor) = self.cursor.as_ref().filter(|c| c.ok()) {
            self.key_bytes.clear();
            self.key_bytes.extend_from_slice(cursor.key());
            self.key_bytes_valid = true;
        }
    }

    fn load_type_bits(&mut self) {
        if self.type_bits.is_none() {
            let raw = self
                .cursor
                .as_ref()
                .filter(|c| c.ok())
                .map(|c| c.value())
                .unwrap_or(&[]);
            self.type_bits = Some(TypeBits::from_bytes(raw));
        }
    }

    fn locate_bytes(&mut self, ctx: &mut OperationContext, target: &[u8]) -> Result<bool> {
        self.invalidate_cache();
        match self.cursor.as_mut() {
            Some(cursor) => cursor.seek(ctx, target)?,
            None => {
                self.cursor = Some(self.dict.cursor(ctx, Some(target), self.direction)?);
            }
        }
        Ok(!self.is_eof()
            && self
                .cursor
                .as_ref()
                .is_some_and(|c| c.key() == target))
    }

    /// Seek to `(fields, id)`. True iff the cursor landed exactly there.
    pub fn locate(
        &mut self,
        ctx: &mut OperationContext,
        fields: &[FieldValue],
        id: RecordId,
    ) -> Result<bool> {
        let id = if id.is_null() {
            if self.direction.is_forward() {
                RecordId::MIN
            } else {
                RecordId::MAX
            }
        } else {
            id
        };
        let (key, _) = encode_index_key(fields, self.ordering, id);
        self.locate_bytes(ctx, &key)
    }

    /// Reposition at a query bound built from a kept prefix and trailing
    /// bound fields; see [`encode_query`] for the bound construction.
    pub fn advance_to(
        &mut self,
        ctx: &mut OperationContext,
        prefix: &[FieldValue],
        after: bool,
        bounds: &[BoundField],
    ) -> Result<()> {
        let query = encode_query(
            prefix,
            after,
            bounds,
            self.ordering,
            self.direction.is_forward(),
        );
        self.locate_bytes(ctx, &query)?;
        Ok(())
    }

    pub fn advance(&mut self, ctx: &mut OperationContext) -> Result<()> {
        if self.is_eof() {
            return Ok(());
        }
        self.invalidate_cache();
        if let Some(cursor) = self.cursor.as_mut() {
            cursor.advance(ctx)?;
        }
        Ok(())
    }

    /// The decoded field tuple under the cursor, `None` at EOF.
    pub fn get_key(&mut self) -> Result<Option<Vec<FieldValue>>> {
        if self.is_eof() {
            return Ok(None);
        }
        if let Some(fields) = &self.key_fields {
            return Ok(Some(fields.clone()));
        }
        self.load_key_if_needed();
        self.load_type_bits();
        let type_bits = self.type_bits.clone().unwrap_or_default();
        let fields =
            crate::encoding::decode_index_key(&self.key_bytes, self.ordering, &type_bits)?;
        self.key_fields = Some(fields.clone());
        Ok(Some(fields))
    }

    /// The record id under the cursor, `None` at EOF.
    pub fn get_record_id(&mut self) -> Result<Option<RecordId>> {
        if self.is_eof() {
            return Ok(None);
        }
        if self.record_id.is_null() {
            self.load_key_if_needed();
            self.record_id = decode_record_id_at_end(&self.key_bytes)?;
            debug_assert!(!self.record_id.is_null());
        }
        Ok(Some(self.record_id))
    }

    /// Positional equality without forcing either side to decode a tuple:
    /// compare cached bytes where available, raw cursor bytes otherwise.
    pub fn points_to_same_place_as(&self, other: &IndexCursor) -> bool {
        match (self.is_eof(), other.is_eof()) {
            (true, true) => return true,
            (true, false) | (false, true) => return false,
            (false, false) => {}
        }
        let mine: &[u8] = match (self.key_bytes_valid, self.cursor.as_ref()) {
            (true, _) => &self.key_bytes,
            (false, Some(cursor)) => cursor.key(),
            (false, None) => return false,
        };
        let theirs: &[u8] = match (other.key_bytes_valid, other.cursor.as_ref()) {
            (true, _) => &other.key_bytes,
            (false, Some(cursor)) => cursor.key(),
            (false, None) => return false,
        };
        // The id suffix rides in the key bytes, so one comparison covers
        // both the tuple and the record id.
        mine == theirs
    }

    /// Cache the position and drop the engine cursor; the object survives
    /// outside any unit of work.
    pub fn save_position(&mut self) -> Result<()> {
        if !self.is_eof() {
            self.load_key_if_needed();
            self.get_record_id()?;
        } else {
            self.record_id = RecordId::NULL;
        }
        self.cursor = None;
        Ok(())
    }

    /// Reseek by the saved key bytes under a fresh context. A position saved
    /// at EOF restores to EOF.
    pub fn restore_position(&mut self, ctx: &mut OperationContext) -> Result<()> {
        assert!(self.cursor.is_none(), "restore_position on a live cursor");
        if self.record_id.is_null() {
            // Saved at EOF; staying without a cursor is exactly EOF.
            debug_assert!(self.is_eof());
            return Ok(());
        }
        let target = std::mem::take(&mut self.key_bytes);
        self.locate_bytes(ctx, &target)?;
        Ok(())
    }
}
