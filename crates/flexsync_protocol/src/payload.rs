//! Instruction payloads and primary keys.

use crate::types::{Decimal128, GlobalKey, InternString, ObjectId, StringBufferRange, Timestamp};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Type tag of a [`Payload`].
///
/// The integer values are part of the changeset format and never change.
/// Negative values are sentinels that carry no data of their own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i8)]
pub enum PayloadType {
    /// Server-assigned identity of an object without a primary key.
    GlobalKey = -1,
    /// Null.
    Null = 0,
    /// 64-bit integer.
    Int = 1,
    /// Boolean.
    Bool = 2,
    /// UTF-8 string.
    String = 3,
    /// Binary blob.
    Binary = 4,
    /// Timestamp.
    Timestamp = 5,
    /// 32-bit float.
    Float = 6,
    /// 64-bit float.
    Double = 7,
    /// 128-bit decimal.
    Decimal = 8,
    /// Link to another object.
    Link = 9,
    /// ObjectId.
    ObjectId = 10,
    /// UUID.
    Uuid = 11,
    /// Remove a dictionary entry.
    Erased = -2,
    /// Create an empty dictionary in place.
    Dictionary = -3,
    /// Create an embedded object in place.
    ObjectValue = -4,
}

impl PayloadType {
    /// Converts to the numeric code.
    pub fn to_code(self) -> i8 {
        self as i8
    }

    /// Converts from a numeric code.
    pub fn from_code(code: i8) -> Option<Self> {
        Some(match code {
            -4 => PayloadType::ObjectValue,
            -3 => PayloadType::Dictionary,
            -2 => PayloadType::Erased,
            -1 => PayloadType::GlobalKey,
            0 => PayloadType::Null,
            1 => PayloadType::Int,
            2 => PayloadType::Bool,
            3 => PayloadType::String,
            4 => PayloadType::Binary,
            5 => PayloadType::Timestamp,
            6 => PayloadType::Float,
            7 => PayloadType::Double,
            8 => PayloadType::Decimal,
            9 => PayloadType::Link,
            10 => PayloadType::ObjectId,
            11 => PayloadType::Uuid,
            _ => return None,
        })
    }

    /// Returns true for the sentinel types that carry no value.
    pub fn is_sentinel(self) -> bool {
        (self as i8) < 0
    }
}

/// Primary key of an object addressed by an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PrimaryKey {
    /// Null primary key.
    Null,
    /// Integer primary key.
    Int(i64),
    /// Server-assigned global key.
    GlobalKey(GlobalKey),
    /// String primary key, interned in the owning changeset.
    String(InternString),
    /// ObjectId primary key.
    ObjectId(ObjectId),
    /// UUID primary key.
    Uuid(Uuid),
}

/// A link value: the target table and the target object's primary key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjLink {
    /// Target table.
    pub target_table: InternString,
    /// Target object.
    pub target: PrimaryKey,
}

/// Value carried by data-bearing instructions.
///
/// Strings and binaries are ranges into the owning changeset's string buffer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    /// Server-assigned identity.
    GlobalKey(GlobalKey),
    /// Null.
    Null,
    /// Integer.
    Int(i64),
    /// Boolean.
    Bool(bool),
    /// String range.
    String(StringBufferRange),
    /// Binary range.
    Binary(StringBufferRange),
    /// Timestamp.
    Timestamp(Timestamp),
    /// Float.
    Float(f32),
    /// Double.
    Double(f64),
    /// Decimal.
    Decimal(Decimal128),
    /// Link.
    Link(ObjLink),
    /// ObjectId.
    ObjectId(ObjectId),
    /// UUID.
    Uuid(Uuid),
    /// Remove a dictionary entry.
    Erased,
    /// Create an empty dictionary in place.
    Dictionary,
    /// Create an embedded object in place.
    ObjectValue,
}

impl Payload {
    /// Returns the type tag.
    pub fn payload_type(&self) -> PayloadType {
        match self {
            Payload::GlobalKey(_) => PayloadType::GlobalKey,
            Payload::Null => PayloadType::Null,
            Payload::Int(_) => PayloadType::Int,
            Payload::Bool(_) => PayloadType::Bool,
            Payload::String(_) => PayloadType::String,
            Payload::Binary(_) => PayloadType::Binary,
            Payload::Timestamp(_) => PayloadType::Timestamp,
            Payload::Float(_) => PayloadType::Float,
            Payload::Double(_) => PayloadType::Double,
            Payload::Decimal(_) => PayloadType::Decimal,
            Payload::Link(_) => PayloadType::Link,
            Payload::ObjectId(_) => PayloadType::ObjectId,
            Payload::Uuid(_) => PayloadType::Uuid,
            Payload::Erased => PayloadType::Erased,
            Payload::Dictionary => PayloadType::Dictionary,
            Payload::ObjectValue => PayloadType::ObjectValue,
        }
    }

    /// Returns true if this is `Null`.
    pub fn is_null(&self) -> bool {
        matches!(self, Payload::Null)
    }
}

impl Default for Payload {
    fn default() -> Self {
        Payload::Null
    }
}

/// Shape of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CollectionType {
    /// A single value.
    Single,
    /// An ordered list.
    List,
    /// A string-keyed dictionary.
    Dictionary,
    /// An unordered set of unique values.
    Set,
}
