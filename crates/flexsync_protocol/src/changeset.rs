//! Changesets: ordered instruction sequences with their string tables.

use crate::codec::{from_cbor, to_cbor};
use crate::error::{ProtocolError, ProtocolResult};
use crate::instruction::{Instruction, InstructionSlot};
use crate::payload::PrimaryKey;
use crate::types::{InternString, StringBufferRange};
use serde::{Deserialize, Serialize};

/// The effect of one transaction, as an ordered sequence of instructions.
///
/// Identifiers used by instructions (tables, fields, string primary keys) are
/// interned in the changeset's intern table. String and binary payloads are
/// byte ranges into the changeset's string buffer, so an instruction never
/// owns heap memory for its strings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Changeset {
    /// Version produced by this changeset in its origin history.
    pub version: u64,
    /// Last remote version integrated by the origin before this changeset.
    pub last_integrated_remote_version: u64,
    /// Origin timestamp, milliseconds since the Unix epoch.
    pub origin_timestamp: u64,
    /// File ident of the originating client (0 = local).
    pub origin_file_ident: u64,
    instructions: Vec<InstructionSlot>,
    interned: Vec<StringBufferRange>,
    string_buffer: Vec<u8>,
}

impl Changeset {
    /// Creates an empty changeset.
    pub fn new() -> Self {
        Self::default()
    }

    /// Interns a string, reusing an existing entry when present.
    pub fn intern_string(&mut self, s: &str) -> InternString {
        if let Some(existing) = self.find_string(s) {
            return existing;
        }
        let range = self.add_string_range(s);
        self.interned.push(range);
        InternString((self.interned.len() - 1) as u32)
    }

    /// Looks up an already interned string.
    pub fn find_string(&self, s: &str) -> Option<InternString> {
        self.interned
            .iter()
            .position(|range| self.range_bytes(*range) == Some(s.as_bytes()))
            .map(|i| InternString(i as u32))
    }

    /// Resolves an interned string.
    pub fn get_string(&self, s: InternString) -> ProtocolResult<&str> {
        let range = self
            .interned
            .get(s.0 as usize)
            .copied()
            .ok_or(ProtocolError::UnknownInternString(s.0))?;
        self.get_string_range(range)
    }

    /// Appends a string to the buffer and returns its range.
    pub fn add_string_range(&mut self, s: &str) -> StringBufferRange {
        self.add_binary_range(s.as_bytes())
    }

    /// Appends bytes to the buffer and returns their range.
    pub fn add_binary_range(&mut self, bytes: &[u8]) -> StringBufferRange {
        let offset = self.string_buffer.len() as u32;
        self.string_buffer.extend_from_slice(bytes);
        StringBufferRange {
            offset,
            size: bytes.len() as u32,
        }
    }

    /// Resolves a string range.
    pub fn get_string_range(&self, range: StringBufferRange) -> ProtocolResult<&str> {
        std::str::from_utf8(self.get_binary_range(range)?).map_err(|_| ProtocolError::InvalidUtf8)
    }

    /// Resolves a binary range.
    pub fn get_binary_range(&self, range: StringBufferRange) -> ProtocolResult<&[u8]> {
        self.range_bytes(range).ok_or(ProtocolError::BadStringRange {
            offset: range.offset,
            size: range.size,
            buffer_len: self.string_buffer.len(),
        })
    }

    fn range_bytes(&self, range: StringBufferRange) -> Option<&[u8]> {
        let start = range.offset as usize;
        let end = start.checked_add(range.size as usize)?;
        self.string_buffer.get(start..end)
    }

    /// Builds a string primary key, interning the string.
    pub fn string_key(&mut self, s: &str) -> PrimaryKey {
        PrimaryKey::String(self.intern_string(s))
    }

    /// Appends an instruction.
    pub fn push(&mut self, instr: impl Into<Instruction>) {
        self.instructions.push(InstructionSlot::Single(instr.into()));
    }

    /// Number of slots (an edited slot may hold zero or several instructions).
    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    /// Returns true if the changeset holds no instructions at all.
    pub fn is_empty(&self) -> bool {
        self.instructions.iter().all(InstructionSlot::is_empty)
    }

    /// Total number of instructions across all slots.
    pub fn instruction_count(&self) -> usize {
        self.instructions.iter().map(InstructionSlot::size).sum()
    }

    /// Slots of the changeset.
    pub fn slots(&self) -> &[InstructionSlot] {
        &self.instructions
    }

    /// Mutable access to a slot, for in-place editing.
    pub fn slot_mut(&mut self, index: usize) -> Option<&mut InstructionSlot> {
        self.instructions.get_mut(index)
    }

    /// Iterates every instruction in order, flattening vector slots.
    pub fn iter(&self) -> impl Iterator<Item = &Instruction> + '_ {
        self.instructions.iter().flat_map(InstructionSlot::iter)
    }

    /// Size of the string buffer in bytes.
    pub fn string_buffer_len(&self) -> usize {
        self.string_buffer.len()
    }

    /// Encodes the changeset to CBOR.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        to_cbor(self)
    }

    /// Decodes a changeset from CBOR.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        from_cbor(bytes)
    }

    /// Size of the encoded changeset in bytes.
    pub fn encoded_size(&self) -> ProtocolResult<usize> {
        Ok(self.encode()?.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruction::{CreateObject, EraseObject, Update};
    use crate::path::Path;
    use crate::payload::Payload;

    #[test]
    fn intern_reuses_entries() {
        let mut changeset = Changeset::new();
        let a = changeset.intern_string("Person");
        let b = changeset.intern_string("age");
        let c = changeset.intern_string("Person");

        assert_eq!(a, c);
        assert_ne!(a, b);
        assert_eq!(changeset.get_string(a).unwrap(), "Person");
        assert_eq!(changeset.get_string(b).unwrap(), "age");
        assert!(changeset.get_string(InternString(99)).is_err());
    }

    #[test]
    fn string_ranges() {
        let mut changeset = Changeset::new();
        let hello = changeset.add_string_range("hello");
        let blob = changeset.add_binary_range(&[0xFF, 0x00]);

        assert_eq!(changeset.get_string_range(hello).unwrap(), "hello");
        assert_eq!(changeset.get_binary_range(blob).unwrap(), &[0xFF, 0x00]);
        assert_eq!(
            changeset.get_string_range(blob),
            Err(ProtocolError::InvalidUtf8)
        );

        let bad = StringBufferRange {
            offset: 5,
            size: 100,
        };
        assert!(matches!(
            changeset.get_binary_range(bad),
            Err(ProtocolError::BadStringRange { .. })
        ));
    }

    #[test]
    fn iteration_flattens_edited_slots() {
        let mut changeset = Changeset::new();
        let table = changeset.intern_string("Dog");
        let name = changeset.intern_string("name");
        let value = changeset.add_string_range("Rex");

        changeset.push(CreateObject {
            table,
            object: PrimaryKey::Int(1),
        });
        changeset.push(Update {
            table,
            object: PrimaryKey::Int(1),
            field: name,
            path: Path::new(),
            value: Payload::String(value),
            is_default: false,
            prior_size: 0,
        });

        changeset.slot_mut(0).unwrap().insert(
            1,
            Instruction::EraseObject(EraseObject {
                table,
                object: PrimaryKey::Int(2),
            }),
        );

        assert_eq!(changeset.len(), 2);
        assert_eq!(changeset.instruction_count(), 3);
        let kinds: Vec<_> = changeset.iter().map(Instruction::instruction_type).collect();
        assert_eq!(kinds.len(), 3);
        assert!(changeset.iter().nth(1).unwrap().is::<EraseObject>());

        changeset.slot_mut(0).unwrap().erase(0);
        changeset.slot_mut(0).unwrap().erase(0);
        changeset.slot_mut(1).unwrap().erase(0);
        assert!(changeset.is_empty());
    }

    #[test]
    fn encode_decode_preserves_everything() {
        let mut changeset = Changeset::new();
        changeset.version = 7;
        changeset.origin_file_ident = 3;
        let table = changeset.intern_string("Cat");
        let object = changeset.string_key("tom");
        changeset.push(CreateObject { table, object });

        let bytes = changeset.encode().unwrap();
        assert_eq!(changeset.encoded_size().unwrap(), bytes.len());
        assert_eq!(Changeset::decode(&bytes).unwrap(), changeset);
    }
}
