//! # Update Messages
//!
//! A self-describing patch carried inside the dictionary's `update` call.
//! Two variants:
//!
//! - [`UpdateMessage::Overwrite`] replaces the old value wholesale.
//! - [`UpdateMessage::Damages`] applies a list of byte patches to the old
//!   value, each copying `len` bytes from the shared source buffer into the
//!   old value at a target offset.
//!
//! [`UpdateMessage::apply`] is deterministic and side-effect free, which is
//! the contract that lets an engine with server-side updaters ship the
//! serialized message into the page instead of doing read-modify-write. The
//! wire form is a tag byte followed by big-endian lengths:
//!
//! ```text
//! Overwrite:  [0x00][value bytes...]
//! Damages:    [0x01][u32 source len][source bytes]
//!             [u32 event count][u32 src_off, u32 dst_off, u32 len]...
//! ```

use crate::error::{Error, Result};
use smallvec::SmallVec;

const TAG_OVERWRITE: u8 = 0;
const TAG_DAMAGES: u8 = 1;

/// One byte-range patch: copy `len` bytes from the source buffer at
/// `source_offset` over the old value at `target_offset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DamageEvent {
    pub source_offset: u32,
    pub target_offset: u32,
    pub len: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum UpdateMessage {
    Overwrite {
        value: Vec<u8>,
    },
    Damages {
        source: Vec<u8>,
        events: SmallVec<[DamageEvent; 4]>,
    },
}

impl UpdateMessage {
    pub fn overwrite(value: Vec<u8>) -> UpdateMessage {
        UpdateMessage::Overwrite { value }
    }

    pub fn damages(source: Vec<u8>, events: impl IntoIterator<Item = DamageEvent>) -> UpdateMessage {
        UpdateMessage::Damages {
            source,
            events: events.into_iter().collect(),
        }
    }

    /// Produce the new value from the old one. Every damage must land inside
    /// the old value and read inside the source buffer.
    pub fn apply(&self, old: &[u8]) -> Result<Vec<u8>> {
        match self {
            UpdateMessage::Overwrite { value } => Ok(value.clone()),
            UpdateMessage::Damages { source, events } => {
                let mut new = old.to_vec();
                for event in events {
                    let (src, dst, len) = (
                        event.source_offset as usize,
                        event.target_offset as usize,
                        event.len as usize,
                    );
                    if src + len > source.len() {
                        return Err(Error::BadValue(format!(
                            "damage reads past source buffer: {}..{} of {}",
                            src,
                            src + len,
                            source.len()
                        )));
                    }
                    if dst + len > new.len() {
                        return Err(Error::BadValue(format!(
                            "damage writes past old value: {}..{} of {}",
                            dst,
                            dst + len,
                            new.len()
                        )));
                    }
                    new[dst..dst + len].copy_from_slice(&source[src..src + len]);
                }
                Ok(new)
            }
        }
    }

    pub fn serialize(&self) -> Vec<u8> {
        match self {
            UpdateMessage::Overwrite { value } => {
                let mut out = Vec::with_capacity(1 + value.len());
                out.push(TAG_OVERWRITE);
                out.extend_from_slice(value);
                out
            }
            UpdateMessage::Damages { source, events } => {
                let mut out = Vec::with_capacity(9 + source.len() + events.len() * 12);
                out.push(TAG_DAMAGES);
                out.extend_from_slice(&(source.len() as u32).to_be_bytes());
                out.extend_from_slice(source);
                out.extend_from_slice(&(events.len() as u32).to_be_bytes());
                for event in events {
                    out.extend_from_slice(&event.source_offset.to_be_bytes());
                    out.extend_from_slice(&event.target_offset.to_be_bytes());
                    out.extend_from_slice(&event.len.to_be_bytes());
                }
                out
            }
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<UpdateMessage> {
        let (&tag, rest) = bytes
            .split_first()
            .ok_or_else(|| Error::BadValue("empty update message".into()))?;
        match tag {
            TAG_OVERWRITE => Ok(UpdateMessage::Overwrite {
                value: rest.to_vec(),
            }),
            TAG_DAMAGES => {
                let mut reader = Reader { data: rest, pos: 0 };
                let source_len = reader.read_u32()? as usize;
                let source = reader.read_bytes(source_len)?.to_vec();
                let count = reader.read_u32()? as usize;
                let mut events = SmallVec::new();
                for _ in 0..count {
                    events.push(DamageEvent {
                        source_offset: reader.read_u32()?,
                        target_offset: reader.read_u32()?,
                        len: reader.read_u32()?,
                    });
                }
                Ok(UpdateMessage::Damages { source, events })
            }
            other => Err(Error::BadValue(format!(
                "unknown update message tag 0x{:02x}",
                other
            ))),
        }
    }
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.data.len())
            .ok_or_else(|| Error::BadValue("truncated update message".into()))?;
        let out = &self.data[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn read_u32(&mut self) -> Result<u32> {
        let bytes = self.read_bytes(4)?;
        let mut word = [0u8; 4];
        word.copy_from_slice(bytes);
        Ok(u32::from_be_bytes(word))
    }
}
