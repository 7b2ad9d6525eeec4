//! Replication instructions.
//!
//! An [`Instruction`] is one mutation of the local database expressed in a
//! portable form. The set of instruction kinds is closed: every consumer
//! matches exhaustively, and the numeric [`InstructionType`] codes are part of
//! the changeset format.
//!
//! Instructions fall into three nested groups, exposed as view traits so that
//! generic code does not have to enumerate every kind:
//!
//! - [`TableInstruction`]: everything (names a table)
//! - [`ObjectInstruction`]: names a table and an object
//! - [`PathInstruction`]: names a table, an object, a field and a path

use crate::error::{ProtocolError, ProtocolResult};
use crate::path::Path;
use crate::payload::{CollectionType, Payload, PayloadType, PrimaryKey};
use crate::types::InternString;
use serde::{Deserialize, Serialize};

/// Numeric tag of an instruction kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum InstructionType {
    /// [`AddTable`]
    AddTable = 0,
    /// [`EraseTable`]
    EraseTable = 1,
    /// [`AddColumn`]
    AddColumn = 2,
    /// [`EraseColumn`]
    EraseColumn = 3,
    /// [`CreateObject`]
    CreateObject = 4,
    /// [`EraseObject`]
    EraseObject = 5,
    /// [`Update`]
    Update = 6,
    /// [`AddInteger`]
    AddInteger = 7,
    /// [`ArrayInsert`]
    ArrayInsert = 8,
    /// [`ArrayMove`]
    ArrayMove = 9,
    /// [`ArrayErase`]
    ArrayErase = 10,
    /// [`Clear`]
    Clear = 11,
    /// [`SetInsert`]
    SetInsert = 12,
    /// [`SetErase`]
    SetErase = 13,
}

impl InstructionType {
    /// Converts to the numeric code.
    pub fn to_code(self) -> u8 {
        self as u8
    }

    /// Converts from a numeric code.
    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => InstructionType::AddTable,
            1 => InstructionType::EraseTable,
            2 => InstructionType::AddColumn,
            3 => InstructionType::EraseColumn,
            4 => InstructionType::CreateObject,
            5 => InstructionType::EraseObject,
            6 => InstructionType::Update,
            7 => InstructionType::AddInteger,
            8 => InstructionType::ArrayInsert,
            9 => InstructionType::ArrayMove,
            10 => InstructionType::ArrayErase,
            11 => InstructionType::Clear,
            12 => InstructionType::SetInsert,
            13 => InstructionType::SetErase,
            _ => return None,
        })
    }
}

/// Primary key declaration of a top-level table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrimaryKeySpec {
    /// Primary key column name.
    pub field: InternString,
    /// Primary key type.
    pub pk_type: PayloadType,
    /// Whether null is a valid key.
    pub nullable: bool,
}

/// Kind of table created by [`AddTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TableType {
    /// Top-level table with a primary key.
    TopLevel(PrimaryKeySpec),
    /// Table of embedded objects.
    Embedded,
}

/// Creates a table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddTable {
    /// Table name.
    pub table: InternString,
    /// Table kind.
    pub table_type: TableType,
    /// Whether objects only flow client to server.
    pub is_asymmetric: bool,
}

/// Removes a table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EraseTable {
    /// Table name.
    pub table: InternString,
}

/// Adds a column to a table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddColumn {
    /// Table name.
    pub table: InternString,
    /// Column name.
    pub field: InternString,
    /// Element type.
    pub value_type: PayloadType,
    /// Whether elements may be null.
    pub nullable: bool,
    /// Column shape.
    pub collection_type: CollectionType,
    /// Key type for dictionaries (`Null` otherwise).
    pub key_type: PayloadType,
    /// Target table of link columns (`NPOS` otherwise).
    pub link_target_table: InternString,
}

/// Removes a column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EraseColumn {
    /// Table name.
    pub table: InternString,
    /// Column name.
    pub field: InternString,
}

/// Creates an object (idempotent for an existing key).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateObject {
    /// Table name.
    pub table: InternString,
    /// Object key.
    pub object: PrimaryKey,
}

/// Removes an object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EraseObject {
    /// Table name.
    pub table: InternString,
    /// Object key.
    pub object: PrimaryKey,
}

/// Sets a field, list element or dictionary entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Update {
    /// Table name.
    pub table: InternString,
    /// Object key.
    pub object: PrimaryKey,
    /// Field name.
    pub field: InternString,
    /// Path below the field.
    pub path: Path,
    /// New value.
    pub value: Payload,
    /// Whether this sets a default value.
    pub is_default: bool,
    /// List size before the update; only meaningful for list element updates.
    pub prior_size: u32,
}

impl Update {
    /// Returns true if this updates a list element.
    pub fn is_array_update(&self) -> bool {
        self.path.last_index().is_some()
    }
}

/// Adds to an integer field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddInteger {
    /// Table name.
    pub table: InternString,
    /// Object key.
    pub object: PrimaryKey,
    /// Field name.
    pub field: InternString,
    /// Path below the field.
    pub path: Path,
    /// Amount to add (wrapping).
    pub value: i64,
}

/// Inserts into a list; the last path element is the insertion index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArrayInsert {
    /// Table name.
    pub table: InternString,
    /// Object key.
    pub object: PrimaryKey,
    /// Field name.
    pub field: InternString,
    /// Path below the field.
    pub path: Path,
    /// Inserted value.
    pub value: Payload,
    /// List size before the insert.
    pub prior_size: u32,
}

/// Moves a list element; the last path element is the source index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArrayMove {
    /// Table name.
    pub table: InternString,
    /// Object key.
    pub object: PrimaryKey,
    /// Field name.
    pub field: InternString,
    /// Path below the field.
    pub path: Path,
    /// Destination index.
    pub ndx_2: u32,
    /// List size before the move.
    pub prior_size: u32,
}

/// Removes a list element; the last path element is the index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArrayErase {
    /// Table name.
    pub table: InternString,
    /// Object key.
    pub object: PrimaryKey,
    /// Field name.
    pub field: InternString,
    /// Path below the field.
    pub path: Path,
    /// List size before the erase.
    pub prior_size: u32,
}

/// Empties a collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Clear {
    /// Table name.
    pub table: InternString,
    /// Object key.
    pub object: PrimaryKey,
    /// Field name.
    pub field: InternString,
    /// Path below the field.
    pub path: Path,
    /// Shape of the cleared collection.
    pub collection_type: CollectionType,
}

/// Adds a value to a set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetInsert {
    /// Table name.
    pub table: InternString,
    /// Object key.
    pub object: PrimaryKey,
    /// Field name.
    pub field: InternString,
    /// Path below the field.
    pub path: Path,
    /// Inserted value.
    pub value: Payload,
}

/// Removes a value from a set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetErase {
    /// Table name.
    pub table: InternString,
    /// Object key.
    pub object: PrimaryKey,
    /// Field name.
    pub field: InternString,
    /// Path below the field.
    pub path: Path,
    /// Removed value.
    pub value: Payload,
}

/// One replication instruction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Instruction {
    /// Create a table.
    AddTable(AddTable),
    /// Remove a table.
    EraseTable(EraseTable),
    /// Add a column.
    AddColumn(AddColumn),
    /// Remove a column.
    EraseColumn(EraseColumn),
    /// Create an object.
    CreateObject(CreateObject),
    /// Remove an object.
    EraseObject(EraseObject),
    /// Set a value.
    Update(Update),
    /// Add to an integer.
    AddInteger(AddInteger),
    /// Insert into a list.
    ArrayInsert(ArrayInsert),
    /// Move within a list.
    ArrayMove(ArrayMove),
    /// Remove from a list.
    ArrayErase(ArrayErase),
    /// Empty a collection.
    Clear(Clear),
    /// Add to a set.
    SetInsert(SetInsert),
    /// Remove from a set.
    SetErase(SetErase),
}

/// Anything that names a table. Every instruction is one.
pub trait TableInstruction {
    /// The table this instruction targets.
    fn table(&self) -> InternString;
}

/// Instructions that name a table and an object.
pub trait ObjectInstruction: TableInstruction {
    /// The object this instruction targets.
    fn object(&self) -> &PrimaryKey;
}

/// Instructions that address a field and a path below it.
pub trait PathInstruction: ObjectInstruction {
    /// The field.
    fn field(&self) -> InternString;
    /// The path below the field.
    fn path(&self) -> &Path;
    /// Mutable access to the path.
    fn path_mut(&mut self) -> &mut Path;
}

/// Typed access to one instruction kind, used by [`Instruction::get_if`].
pub trait InstructionKind: Sized {
    /// The tag of this kind.
    const TYPE: InstructionType;

    /// Borrows the kind out of an instruction if the tags match.
    fn from_instruction(instr: &Instruction) -> Option<&Self>;

    /// Mutably borrows the kind out of an instruction if the tags match.
    fn from_instruction_mut(instr: &mut Instruction) -> Option<&mut Self>;
}

macro_rules! instruction_kind {
    ($($kind:ident),* $(,)?) => {
        $(
            impl InstructionKind for $kind {
                const TYPE: InstructionType = InstructionType::$kind;

                fn from_instruction(instr: &Instruction) -> Option<&Self> {
                    match instr {
                        Instruction::$kind(inner) => Some(inner),
                        _ => None,
                    }
                }

                fn from_instruction_mut(instr: &mut Instruction) -> Option<&mut Self> {
                    match instr {
                        Instruction::$kind(inner) => Some(inner),
                        _ => None,
                    }
                }
            }

            impl From<$kind> for Instruction {
                fn from(inner: $kind) -> Self {
                    Instruction::$kind(inner)
                }
            }

            impl TableInstruction for $kind {
                fn table(&self) -> InternString {
                    self.table
                }
            }
        )*
    };
}

macro_rules! object_instruction {
    ($($kind:ident),* $(,)?) => {
        $(
            impl ObjectInstruction for $kind {
                fn object(&self) -> &PrimaryKey {
                    &self.object
                }
            }
        )*
    };
}

macro_rules! path_instruction {
    ($($kind:ident),* $(,)?) => {
        $(
            impl PathInstruction for $kind {
                fn field(&self) -> InternString {
                    self.field
                }

                fn path(&self) -> &Path {
                    &self.path
                }

                fn path_mut(&mut self) -> &mut Path {
                    &mut self.path
                }
            }
        )*
    };
}

instruction_kind!(
    AddTable, EraseTable, AddColumn, EraseColumn, CreateObject, EraseObject, Update, AddInteger,
    ArrayInsert, ArrayMove, ArrayErase, Clear, SetInsert, SetErase,
);
object_instruction!(
    CreateObject, EraseObject, Update, AddInteger, ArrayInsert, ArrayMove, ArrayErase, Clear,
    SetInsert, SetErase,
);
path_instruction!(
    Update, AddInteger, ArrayInsert, ArrayMove, ArrayErase, Clear, SetInsert, SetErase,
);

impl Instruction {
    /// Returns the tag of this instruction.
    pub fn instruction_type(&self) -> InstructionType {
        match self {
            Instruction::AddTable(_) => InstructionType::AddTable,
            Instruction::EraseTable(_) => InstructionType::EraseTable,
            Instruction::AddColumn(_) => InstructionType::AddColumn,
            Instruction::EraseColumn(_) => InstructionType::EraseColumn,
            Instruction::CreateObject(_) => InstructionType::CreateObject,
            Instruction::EraseObject(_) => InstructionType::EraseObject,
            Instruction::Update(_) => InstructionType::Update,
            Instruction::AddInteger(_) => InstructionType::AddInteger,
            Instruction::ArrayInsert(_) => InstructionType::ArrayInsert,
            Instruction::ArrayMove(_) => InstructionType::ArrayMove,
            Instruction::ArrayErase(_) => InstructionType::ArrayErase,
            Instruction::Clear(_) => InstructionType::Clear,
            Instruction::SetInsert(_) => InstructionType::SetInsert,
            Instruction::SetErase(_) => InstructionType::SetErase,
        }
    }

    /// Borrows the instruction as kind `T`, if it is one.
    pub fn get_if<T: InstructionKind>(&self) -> Option<&T> {
        T::from_instruction(self)
    }

    /// Mutably borrows the instruction as kind `T`, if it is one.
    pub fn get_if_mut<T: InstructionKind>(&mut self) -> Option<&mut T> {
        T::from_instruction_mut(self)
    }

    /// Returns true if this instruction is of kind `T`.
    pub fn is<T: InstructionKind>(&self) -> bool {
        self.instruction_type() == T::TYPE
    }

    /// The table named by this instruction.
    pub fn table(&self) -> InternString {
        self.as_table_instruction().table()
    }

    /// Views the instruction as a table instruction.
    pub fn as_table_instruction(&self) -> &dyn TableInstruction {
        match self {
            Instruction::AddTable(i) => i,
            Instruction::EraseTable(i) => i,
            Instruction::AddColumn(i) => i,
            Instruction::EraseColumn(i) => i,
            Instruction::CreateObject(i) => i,
            Instruction::EraseObject(i) => i,
            Instruction::Update(i) => i,
            Instruction::AddInteger(i) => i,
            Instruction::ArrayInsert(i) => i,
            Instruction::ArrayMove(i) => i,
            Instruction::ArrayErase(i) => i,
            Instruction::Clear(i) => i,
            Instruction::SetInsert(i) => i,
            Instruction::SetErase(i) => i,
        }
    }

    /// Views the instruction as an object instruction, if it names an object.
    pub fn as_object_instruction(&self) -> Option<&dyn ObjectInstruction> {
        match self {
            Instruction::CreateObject(i) => Some(i),
            Instruction::EraseObject(i) => Some(i),
            Instruction::Update(i) => Some(i),
            Instruction::AddInteger(i) => Some(i),
            Instruction::ArrayInsert(i) => Some(i),
            Instruction::ArrayMove(i) => Some(i),
            Instruction::ArrayErase(i) => Some(i),
            Instruction::Clear(i) => Some(i),
            Instruction::SetInsert(i) => Some(i),
            Instruction::SetErase(i) => Some(i),
            _ => None,
        }
    }

    /// Views the instruction as a path instruction, if it addresses a field.
    pub fn as_path_instruction(&self) -> Option<&dyn PathInstruction> {
        match self {
            Instruction::Update(i) => Some(i),
            Instruction::AddInteger(i) => Some(i),
            Instruction::ArrayInsert(i) => Some(i),
            Instruction::ArrayMove(i) => Some(i),
            Instruction::ArrayErase(i) => Some(i),
            Instruction::Clear(i) => Some(i),
            Instruction::SetInsert(i) => Some(i),
            Instruction::SetErase(i) => Some(i),
            _ => None,
        }
    }

    /// Mutable path-instruction view.
    pub fn as_path_instruction_mut(&mut self) -> Option<&mut dyn PathInstruction> {
        match self {
            Instruction::Update(i) => Some(i),
            Instruction::AddInteger(i) => Some(i),
            Instruction::ArrayInsert(i) => Some(i),
            Instruction::ArrayMove(i) => Some(i),
            Instruction::ArrayErase(i) => Some(i),
            Instruction::Clear(i) => Some(i),
            Instruction::SetInsert(i) => Some(i),
            Instruction::SetErase(i) => Some(i),
            _ => None,
        }
    }

    /// Length of the full address of this instruction.
    ///
    /// Tables have length 1, columns (table, field) and objects (table, object)
    /// have length 2, and path instructions have length 3 plus the length of
    /// their path (table, object, field, path...). Two instructions can only
    /// affect each other's nested data when one address is a prefix of the other.
    pub fn path_length(&self) -> usize {
        match self {
            Instruction::AddTable(_) | Instruction::EraseTable(_) => 1,
            Instruction::AddColumn(_) | Instruction::EraseColumn(_) => 2,
            Instruction::CreateObject(_) | Instruction::EraseObject(_) => 2,
            other => other
                .as_path_instruction()
                .map(|p| 3 + p.path().len())
                .unwrap_or(2),
        }
    }
}

/// A changeset entry: either one instruction or, once edited in place, a vector of them.
///
/// Converting to vector form lets callers insert and erase instructions at a
/// position without shifting the indices of the surrounding changeset entries.
/// An erased single instruction becomes an empty vector rather than a hole.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum InstructionSlot {
    /// One instruction.
    Single(Instruction),
    /// Zero or more instructions.
    Vector(Vec<Instruction>),
}

impl InstructionSlot {
    /// Number of instructions in this slot.
    pub fn size(&self) -> usize {
        match self {
            InstructionSlot::Single(_) => 1,
            InstructionSlot::Vector(v) => v.len(),
        }
    }

    /// Returns true if the slot holds no instructions.
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Returns the instruction at `index`.
    pub fn at(&self, index: usize) -> Option<&Instruction> {
        match self {
            InstructionSlot::Single(instr) if index == 0 => Some(instr),
            InstructionSlot::Single(_) => None,
            InstructionSlot::Vector(v) => v.get(index),
        }
    }

    /// Mutably returns the instruction at `index`.
    pub fn at_mut(&mut self, index: usize) -> Option<&mut Instruction> {
        match self {
            InstructionSlot::Single(instr) if index == 0 => Some(instr),
            InstructionSlot::Single(_) => None,
            InstructionSlot::Vector(v) => v.get_mut(index),
        }
    }

    /// Converts to vector form (a no-op if already a vector).
    pub fn convert_to_vector(&mut self) -> &mut Vec<Instruction> {
        if let InstructionSlot::Single(_) = self {
            if let InstructionSlot::Single(instr) =
                std::mem::replace(self, InstructionSlot::Vector(Vec::new()))
            {
                *self = InstructionSlot::Vector(vec![instr]);
            }
        }
        match self {
            InstructionSlot::Vector(v) => v,
            InstructionSlot::Single(_) => unreachable!("slot was converted to vector form"),
        }
    }

    /// Inserts an instruction at `pos`, which may equal `size()`.
    pub fn insert(&mut self, pos: usize, instr: Instruction) -> ProtocolResult<()> {
        let size = self.size();
        if pos > size {
            return Err(ProtocolError::SlotPositionOutOfRange { pos, size });
        }
        self.convert_to_vector().insert(pos, instr);
        Ok(())
    }

    /// Removes and returns the instruction at `pos`.
    pub fn erase(&mut self, pos: usize) -> ProtocolResult<Instruction> {
        let size = self.size();
        if pos >= size {
            return Err(ProtocolError::SlotPositionOutOfRange { pos, size });
        }
        Ok(self.convert_to_vector().remove(pos))
    }

    /// Iterates the instructions in this slot.
    pub fn iter(&self) -> std::slice::Iter<'_, Instruction> {
        match self {
            InstructionSlot::Single(instr) => std::slice::from_ref(instr).iter(),
            InstructionSlot::Vector(v) => v.iter(),
        }
    }
}

impl From<Instruction> for InstructionSlot {
    fn from(instr: Instruction) -> Self {
        InstructionSlot::Single(instr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(path: Path) -> Instruction {
        Instruction::Update(Update {
            table: InternString(0),
            object: PrimaryKey::Int(1),
            field: InternString(1),
            path,
            value: Payload::Int(5),
            is_default: false,
            prior_size: 0,
        })
    }

    #[test]
    fn type_codes_are_stable() {
        for code in 0u8..=13 {
            let ty = InstructionType::from_code(code).unwrap();
            assert_eq!(ty.to_code(), code);
        }
        assert_eq!(InstructionType::from_code(14), None);
        assert_eq!(InstructionType::SetErase.to_code(), 13);
    }

    #[test]
    fn path_lengths() {
        let add_table = Instruction::EraseTable(EraseTable {
            table: InternString(0),
        });
        assert_eq!(add_table.path_length(), 1);

        let erase_column = Instruction::EraseColumn(EraseColumn {
            table: InternString(0),
            field: InternString(1),
        });
        assert_eq!(erase_column.path_length(), 2);

        let create = Instruction::CreateObject(CreateObject {
            table: InternString(0),
            object: PrimaryKey::Int(7),
        });
        assert_eq!(create.path_length(), 2);

        assert_eq!(update(Path::new()).path_length(), 3);
        let mut nested = Path::new();
        nested.push_field(InternString(2));
        nested.push_index(4);
        assert_eq!(update(nested).path_length(), 5);
    }

    #[test]
    fn views_and_get_if() {
        let instr = update(Path::new());
        assert!(instr.is::<Update>());
        assert_eq!(instr.get_if::<Update>().unwrap().value, Payload::Int(5));
        assert!(instr.get_if::<ArrayInsert>().is_none());

        let obj = instr.as_object_instruction().unwrap();
        assert_eq!(obj.object(), &PrimaryKey::Int(1));
        assert_eq!(obj.table(), InternString(0));
        assert_eq!(instr.as_path_instruction().unwrap().field(), InternString(1));

        let erase_table = Instruction::EraseTable(EraseTable {
            table: InternString(3),
        });
        assert!(erase_table.as_object_instruction().is_none());
        assert_eq!(erase_table.table(), InternString(3));
    }

    #[test]
    fn get_if_mut_edits_in_place() {
        let mut instr = update(Path::new());
        instr.get_if_mut::<Update>().unwrap().value = Payload::Bool(true);
        assert_eq!(instr.get_if::<Update>().unwrap().value, Payload::Bool(true));

        instr
            .as_path_instruction_mut()
            .unwrap()
            .path_mut()
            .push_index(2);
        assert!(instr.get_if::<Update>().unwrap().is_array_update());
    }

    #[test]
    fn slot_vector_form() {
        let mut slot = InstructionSlot::from(update(Path::new()));
        assert_eq!(slot.size(), 1);

        let erase = Instruction::EraseObject(EraseObject {
            table: InternString(0),
            object: PrimaryKey::Int(1),
        });
        slot.insert(0, erase.clone()).unwrap();
        assert_eq!(slot.size(), 2);
        assert_eq!(slot.at(0), Some(&erase));
        assert!(slot.at(1).unwrap().is::<Update>());

        assert_eq!(slot.erase(0).unwrap(), erase);
        slot.erase(0).unwrap();
        assert!(slot.is_empty());
        assert!(matches!(slot, InstructionSlot::Vector(_)));
        assert_eq!(slot.iter().count(), 0);
    }

    #[test]
    fn slot_positions_are_checked() {
        let mut slot = InstructionSlot::from(update(Path::new()));
        assert_eq!(
            slot.insert(2, update(Path::new())),
            Err(ProtocolError::SlotPositionOutOfRange { pos: 2, size: 1 })
        );
        assert_eq!(
            slot.erase(1),
            Err(ProtocolError::SlotPositionOutOfRange { pos: 1, size: 1 })
        );
        assert!(matches!(slot, InstructionSlot::Single(_)));

        slot.insert(1, update(Path::new())).unwrap();
        assert_eq!(slot.size(), 2);
    }
}
