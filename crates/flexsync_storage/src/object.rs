//! Object model: tables, objects and values.

use flexsync_protocol::{
    CollectionType, Decimal128, GlobalKey, ObjectId, PayloadType, Timestamp, Uuid,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Primary key of an object, owning its string.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ObjKey {
    /// Null key.
    Null,
    /// Integer key.
    Int(i64),
    /// String key.
    String(String),
    /// ObjectId key.
    ObjectId(ObjectId),
    /// UUID key.
    Uuid(Uuid),
    /// Server-assigned identity for tables without a primary key.
    GlobalKey(GlobalKey),
}

impl fmt::Display for ObjKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjKey::Null => write!(f, "null"),
            ObjKey::Int(v) => write!(f, "{v}"),
            ObjKey::String(s) => write!(f, "'{s}'"),
            ObjKey::ObjectId(oid) => write!(f, "oid({oid})"),
            ObjKey::Uuid(u) => write!(f, "uuid({u})"),
            ObjKey::GlobalKey(k) => write!(f, "{k}"),
        }
    }
}

impl From<i64> for ObjKey {
    fn from(v: i64) -> Self {
        ObjKey::Int(v)
    }
}

impl From<&str> for ObjKey {
    fn from(s: &str) -> Self {
        ObjKey::String(s.to_string())
    }
}

impl From<ObjectId> for ObjKey {
    fn from(oid: ObjectId) -> Self {
        ObjKey::ObjectId(oid)
    }
}

/// A link to an object in another table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Link {
    /// Target table.
    pub table: String,
    /// Target key.
    pub key: ObjKey,
}

/// A stored value.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub enum Value {
    /// Null.
    #[default]
    Null,
    /// 64-bit integer.
    Int(i64),
    /// Boolean.
    Bool(bool),
    /// UTF-8 string.
    String(String),
    /// Bytes.
    Binary(Vec<u8>),
    /// Timestamp.
    Timestamp(Timestamp),
    /// 32-bit float.
    Float(f32),
    /// 64-bit float.
    Double(f64),
    /// Decimal.
    Decimal(Decimal128),
    /// Link.
    Link(Link),
    /// ObjectId.
    ObjectId(ObjectId),
    /// UUID.
    Uuid(Uuid),
    /// Ordered list.
    List(Vec<Value>),
    /// Set of distinct values, in insertion order.
    Set(Vec<Value>),
    /// String-keyed dictionary.
    Dictionary(BTreeMap<String, Value>),
    /// Embedded object.
    Object(Object),
}

impl Value {
    /// Returns the integer if this is an `Int`.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns the string if this is a `String`.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the timestamp if this is a `Timestamp`.
    pub fn as_timestamp(&self) -> Option<Timestamp> {
        match self {
            Value::Timestamp(t) => Some(*t),
            _ => None,
        }
    }

    /// Returns the ObjectId if this is an `ObjectId`.
    pub fn as_object_id(&self) -> Option<ObjectId> {
        match self {
            Value::ObjectId(oid) => Some(*oid),
            _ => None,
        }
    }

    /// Returns the list elements if this is a `List`.
    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    /// Returns the set elements if this is a `Set`.
    pub fn as_set(&self) -> Option<&[Value]> {
        match self {
            Value::Set(items) => Some(items),
            _ => None,
        }
    }

    /// Returns the entries if this is a `Dictionary`.
    pub fn as_dictionary(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Dictionary(entries) => Some(entries),
            _ => None,
        }
    }

    /// Returns the embedded object if this is an `Object`.
    pub fn as_object(&self) -> Option<&Object> {
        match self {
            Value::Object(obj) => Some(obj),
            _ => None,
        }
    }

    /// Returns true for `Null`.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Short name of the variant, for error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Int(_) => "int",
            Value::Bool(_) => "bool",
            Value::String(_) => "string",
            Value::Binary(_) => "binary",
            Value::Timestamp(_) => "timestamp",
            Value::Float(_) => "float",
            Value::Double(_) => "double",
            Value::Decimal(_) => "decimal",
            Value::Link(_) => "link",
            Value::ObjectId(_) => "objectId",
            Value::Uuid(_) => "uuid",
            Value::List(_) => "list",
            Value::Set(_) => "set",
            Value::Dictionary(_) => "dictionary",
            Value::Object(_) => "object",
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<Timestamp> for Value {
    fn from(t: Timestamp) -> Self {
        Value::Timestamp(t)
    }
}

impl From<ObjectId> for Value {
    fn from(oid: ObjectId) -> Self {
        Value::ObjectId(oid)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

/// An object's field values.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Object {
    fields: BTreeMap<String, Value>,
}

impl Object {
    /// Creates an object with no fields set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a field value.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Returns a mutable field value.
    pub fn get_mut(&mut self, field: &str) -> Option<&mut Value> {
        self.fields.get_mut(field)
    }

    /// Sets a field value.
    pub fn set(&mut self, field: impl Into<String>, value: Value) {
        self.fields.insert(field.into(), value);
    }

    /// Removes a field.
    pub fn remove(&mut self, field: &str) -> Option<Value> {
        self.fields.remove(field)
    }

    /// Iterates over the fields in name order.
    pub fn fields(&self) -> impl Iterator<Item = (&str, &Value)> + '_ {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Returns true if no field is set.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Column definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSpec {
    /// Element type.
    pub value_type: PayloadType,
    /// Whether elements may be null.
    pub nullable: bool,
    /// Column shape.
    pub collection_type: CollectionType,
    /// Dictionary key type.
    pub key_type: PayloadType,
    /// Target table of link columns.
    pub link_target: Option<String>,
}

impl ColumnSpec {
    /// A single-valued column.
    pub fn single(value_type: PayloadType, nullable: bool) -> Self {
        Self {
            value_type,
            nullable,
            collection_type: CollectionType::Single,
            key_type: PayloadType::Null,
            link_target: None,
        }
    }

    /// A collection column.
    pub fn collection(value_type: PayloadType, collection_type: CollectionType) -> Self {
        Self {
            value_type,
            nullable: false,
            collection_type,
            key_type: if collection_type == CollectionType::Dictionary {
                PayloadType::String
            } else {
                PayloadType::Null
            },
            link_target: None,
        }
    }

    /// Sets the link target.
    #[must_use]
    pub fn with_link_target(mut self, table: impl Into<String>) -> Self {
        self.value_type = PayloadType::Link;
        self.link_target = Some(table.into());
        self
    }

    /// Value a freshly created object holds for this column.
    pub fn default_value(&self) -> Value {
        match self.collection_type {
            CollectionType::Single if self.nullable => Value::Null,
            CollectionType::Single => match self.value_type {
                PayloadType::Int => Value::Int(0),
                PayloadType::Bool => Value::Bool(false),
                PayloadType::String => Value::String(String::new()),
                PayloadType::Binary => Value::Binary(Vec::new()),
                PayloadType::Float => Value::Float(0.0),
                PayloadType::Double => Value::Double(0.0),
                PayloadType::Timestamp => Value::Timestamp(Timestamp::default()),
                _ => Value::Null,
            },
            CollectionType::List => Value::List(Vec::new()),
            CollectionType::Set => Value::Set(Vec::new()),
            CollectionType::Dictionary => Value::Dictionary(BTreeMap::new()),
        }
    }
}

/// Kind of table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TableKind {
    /// Top-level table keyed by a primary key column.
    TopLevel {
        /// Primary key column.
        pk_field: String,
        /// Primary key type.
        pk_type: PayloadType,
        /// Whether null keys are allowed.
        nullable: bool,
    },
    /// Table of embedded objects; has no objects of its own.
    Embedded,
}

/// A table of objects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Table {
    name: String,
    kind: TableKind,
    is_asymmetric: bool,
    columns: BTreeMap<String, ColumnSpec>,
    objects: BTreeMap<ObjKey, Object>,
}

impl Table {
    pub(crate) fn new(name: &str, kind: TableKind, is_asymmetric: bool) -> Self {
        Self {
            name: name.to_string(),
            kind,
            is_asymmetric,
            columns: BTreeMap::new(),
            objects: BTreeMap::new(),
        }
    }

    /// Table name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Table kind.
    pub fn kind(&self) -> &TableKind {
        &self.kind
    }

    /// Whether objects only flow from client to server.
    pub fn is_asymmetric(&self) -> bool {
        self.is_asymmetric
    }

    /// Column definition.
    pub fn column(&self, name: &str) -> Option<&ColumnSpec> {
        self.columns.get(name)
    }

    /// Iterates over the columns in name order.
    pub fn columns(&self) -> impl Iterator<Item = (&str, &ColumnSpec)> + '_ {
        self.columns.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Looks up an object.
    pub fn get(&self, key: &ObjKey) -> Option<&Object> {
        self.objects.get(key)
    }

    /// Iterates over the objects in key order.
    pub fn objects(&self) -> impl Iterator<Item = (&ObjKey, &Object)> + '_ {
        self.objects.iter()
    }

    /// Number of objects.
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// Returns true if the table holds no objects.
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub(crate) fn add_column(&mut self, name: &str, spec: ColumnSpec) {
        let default = spec.default_value();
        for obj in self.objects.values_mut() {
            obj.set(name, default.clone());
        }
        self.columns.insert(name.to_string(), spec);
    }

    pub(crate) fn erase_column(&mut self, name: &str) -> bool {
        for obj in self.objects.values_mut() {
            obj.remove(name);
        }
        self.columns.remove(name).is_some()
    }

    pub(crate) fn new_object(&self, key: &ObjKey) -> Object {
        let mut obj = Object::new();
        for (name, spec) in &self.columns {
            obj.set(name.as_str(), spec.default_value());
        }
        if let TableKind::TopLevel { pk_field, .. } = &self.kind {
            obj.set(pk_field.as_str(), key_to_value(key));
        }
        obj
    }

    pub(crate) fn insert_object(&mut self, key: ObjKey, obj: Object) {
        self.objects.insert(key, obj);
    }

    pub(crate) fn get_mut(&mut self, key: &ObjKey) -> Option<&mut Object> {
        self.objects.get_mut(key)
    }

    pub(crate) fn remove(&mut self, key: &ObjKey) -> Option<Object> {
        self.objects.remove(key)
    }
}

/// Value stored in the primary key column for a key.
pub fn key_to_value(key: &ObjKey) -> Value {
    match key {
        ObjKey::Null | ObjKey::GlobalKey(_) => Value::Null,
        ObjKey::Int(v) => Value::Int(*v),
        ObjKey::String(s) => Value::String(s.clone()),
        ObjKey::ObjectId(oid) => Value::ObjectId(*oid),
        ObjKey::Uuid(u) => Value::Uuid(*u),
    }
}
