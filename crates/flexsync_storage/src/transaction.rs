//! Read and write transactions.

use crate::apply::{apply_changeset, apply_instruction};
use crate::database::Database;
use crate::error::{StorageError, StorageResult};
use crate::history::HistoryEntry;
use crate::object::{ColumnSpec, ObjKey, Value};
use crate::snapshot::Snapshot;
use flexsync_protocol::{
    AddColumn, AddInteger, AddTable, ArrayErase, ArrayInsert, ArrayMove, Changeset, Clear,
    CollectionType, CreateObject, EraseColumn, EraseObject, EraseTable, Instruction, InternString,
    ObjLink, Path, PathElement, Payload, PayloadType, PrimaryKey, PrimaryKeySpec, SetErase,
    SetInsert, TableType, Timestamp, Update,
};
use parking_lot::MutexGuard;
use std::ops::Deref;
use std::sync::Arc;

/// A consistent read-only view of the database.
#[derive(Debug, Clone)]
pub struct ReadTransaction {
    snapshot: Arc<Snapshot>,
}

impl ReadTransaction {
    pub(crate) fn new(snapshot: Arc<Snapshot>) -> Self {
        Self { snapshot }
    }
}

impl Deref for ReadTransaction {
    type Target = Snapshot;

    fn deref(&self) -> &Snapshot {
        &self.snapshot
    }
}

/// Capability to write without recording the changes for upload.
///
/// Used when integrating changesets received from the server and when
/// maintaining sync metadata. Only valid for the database that issued it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplicationOverride {
    pub(crate) database_id: u64,
}

/// One step of a path into a nested collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathStep {
    /// Dictionary key or embedded object field.
    Field(String),
    /// List index.
    Index(u32),
}

impl From<&str> for PathStep {
    fn from(s: &str) -> Self {
        PathStep::Field(s.to_string())
    }
}

impl From<u32> for PathStep {
    fn from(i: u32) -> Self {
        PathStep::Index(i)
    }
}

/// The single active writer.
///
/// Every mutation is expressed as an [`Instruction`] and applied to a private
/// copy of the latest snapshot. Unless replication was overridden, the
/// instructions are collected into a changeset that becomes a history entry on
/// commit. Dropping the transaction without committing discards it.
pub struct WriteTransaction<'db> {
    db: &'db Database,
    _guard: MutexGuard<'db, ()>,
    snapshot: Snapshot,
    changeset: Changeset,
    replicate: bool,
}

impl<'db> WriteTransaction<'db> {
    pub(crate) fn new(
        db: &'db Database,
        guard: MutexGuard<'db, ()>,
        snapshot: Snapshot,
        replicate: bool,
    ) -> Self {
        Self {
            db,
            _guard: guard,
            snapshot,
            changeset: Changeset::new(),
            replicate,
        }
    }

    /// Returns true if changes will be recorded for upload.
    pub fn is_replicated(&self) -> bool {
        self.replicate
    }

    /// The changeset recorded so far.
    pub fn changeset(&self) -> &Changeset {
        &self.changeset
    }

    /// Applies one instruction whose strings live in `changeset`.
    ///
    /// The instruction is not recorded, so this is meant for integrating
    /// changesets from elsewhere.
    pub fn apply_instruction(
        &mut self,
        changeset: &Changeset,
        instr: &Instruction,
    ) -> StorageResult<()> {
        apply_instruction(&mut self.snapshot, changeset, instr)
    }

    /// Applies every instruction of a foreign changeset without recording it.
    pub fn integrate(&mut self, changeset: &Changeset) -> StorageResult<()> {
        apply_changeset(&mut self.snapshot, changeset)
    }

    /// Commits and returns the new database version.
    pub fn commit(mut self) -> StorageResult<u64> {
        let version = self.snapshot.version() + 1;
        self.snapshot.set_version(version);
        let entry = if self.replicate && !self.changeset.is_empty() {
            self.changeset.version = version;
            self.changeset.origin_timestamp = now_millis();
            Some(HistoryEntry {
                version,
                changeset: std::mem::take(&mut self.changeset),
            })
        } else {
            None
        };
        self.db.publish(std::mem::take(&mut self.snapshot), entry)?;
        Ok(version)
    }

    fn record(&mut self, instr: Instruction) -> StorageResult<()> {
        apply_instruction(&mut self.snapshot, &self.changeset, &instr)?;
        if self.replicate {
            self.changeset.push(instr);
        }
        Ok(())
    }

    fn primary_key(&mut self, key: &ObjKey) -> PrimaryKey {
        match key {
            ObjKey::Null => PrimaryKey::Null,
            ObjKey::Int(v) => PrimaryKey::Int(*v),
            ObjKey::String(s) => self.changeset.string_key(s),
            ObjKey::ObjectId(oid) => PrimaryKey::ObjectId(*oid),
            ObjKey::Uuid(u) => PrimaryKey::Uuid(*u),
            ObjKey::GlobalKey(k) => PrimaryKey::GlobalKey(*k),
        }
    }

    fn path(&mut self, steps: &[PathStep]) -> Path {
        let mut path = Path::new();
        for step in steps {
            match step {
                PathStep::Field(name) => path.push_field(self.changeset.intern_string(name)),
                PathStep::Index(i) => path.push_index(*i),
            }
        }
        path
    }

    /// Converts a value that fits in a single payload.
    fn payload(&mut self, value: &Value) -> StorageResult<Payload> {
        Ok(match value {
            Value::Null => Payload::Null,
            Value::Int(v) => Payload::Int(*v),
            Value::Bool(v) => Payload::Bool(*v),
            Value::String(s) => Payload::String(self.changeset.add_string_range(s)),
            Value::Binary(b) => Payload::Binary(self.changeset.add_binary_range(b)),
            Value::Timestamp(t) => Payload::Timestamp(*t),
            Value::Float(v) => Payload::Float(*v),
            Value::Double(v) => Payload::Double(*v),
            Value::Decimal(d) => Payload::Decimal(*d),
            Value::ObjectId(oid) => Payload::ObjectId(*oid),
            Value::Uuid(u) => Payload::Uuid(*u),
            Value::Link(link) => Payload::Link(ObjLink {
                target_table: self.changeset.intern_string(&link.table),
                target: self.primary_key(&link.key),
            }),
            Value::Object(_) => Payload::ObjectValue,
            Value::Dictionary(_) => Payload::Dictionary,
            Value::List(_) | Value::Set(_) => {
                return Err(StorageError::invalid_value(
                    "lists and sets are modified element by element",
                ))
            }
        })
    }

    /// Writes `value` at `field`/`path`, expanding embedded objects and
    /// dictionaries into one instruction per nested value.
    fn put(
        &mut self,
        target: &Target,
        path: Path,
        value: &Value,
        insert: Option<u32>,
    ) -> StorageResult<()> {
        let payload = self.payload(value)?;
        let instr: Instruction = match insert {
            Some(prior_size) => ArrayInsert {
                table: target.table,
                object: target.object,
                field: target.field,
                path: path.clone(),
                value: payload,
                prior_size,
            }
            .into(),
            None => Update {
                table: target.table,
                object: target.object,
                field: target.field,
                path: path.clone(),
                value: payload,
                is_default: false,
                prior_size: 0,
            }
            .into(),
        };
        self.record(instr)?;

        let children: Vec<(&str, &Value)> = match value {
            Value::Object(obj) => obj.fields().collect(),
            Value::Dictionary(entries) => entries.iter().map(|(k, v)| (k.as_str(), v)).collect(),
            _ => Vec::new(),
        };
        for (name, child) in children {
            let mut child_path = path.clone();
            child_path.push_field(self.changeset.intern_string(name));
            self.put(target, child_path, child, None)?;
        }
        Ok(())
    }

    fn target(&mut self, table: &str, key: &ObjKey, field: &str) -> Target {
        Target {
            table: self.changeset.intern_string(table),
            object: self.primary_key(key),
            field: self.changeset.intern_string(field),
        }
    }

    /// Looks up a value inside a nested collection.
    pub fn get_at(&self, table: &str, key: &ObjKey, field: &str, steps: &[PathStep]) -> Option<&Value> {
        let mut value = self.snapshot.get_value(table, key, field)?;
        for step in steps {
            value = match (value, step) {
                (Value::List(items), PathStep::Index(i)) => items.get(*i as usize)?,
                (Value::Dictionary(entries), PathStep::Field(k)) => entries.get(k)?,
                (Value::Object(obj), PathStep::Field(k)) => obj.get(k)?,
                _ => return None,
            };
        }
        Some(value)
    }

    fn list_len(&self, table: &str, key: &ObjKey, field: &str, steps: &[PathStep]) -> u32 {
        self.get_at(table, key, field, steps)
            .and_then(Value::as_list)
            .map_or(0, |items| items.len() as u32)
    }

    /// Creates a top-level table keyed by `pk_field`.
    pub fn add_table(&mut self, name: &str, pk_field: &str, pk_type: PayloadType) -> StorageResult<()> {
        let table = self.changeset.intern_string(name);
        let field = self.changeset.intern_string(pk_field);
        self.record(
            AddTable {
                table,
                table_type: TableType::TopLevel(PrimaryKeySpec {
                    field,
                    pk_type,
                    nullable: false,
                }),
                is_asymmetric: false,
            }
            .into(),
        )
    }

    /// Creates a table of embedded objects.
    pub fn add_embedded_table(&mut self, name: &str) -> StorageResult<()> {
        let table = self.changeset.intern_string(name);
        self.record(
            AddTable {
                table,
                table_type: TableType::Embedded,
                is_asymmetric: false,
            }
            .into(),
        )
    }

    /// Removes a table.
    pub fn erase_table(&mut self, name: &str) -> StorageResult<()> {
        let table = self.changeset.intern_string(name);
        self.record(EraseTable { table }.into())
    }

    /// Adds a column.
    pub fn add_column(&mut self, table: &str, field: &str, spec: ColumnSpec) -> StorageResult<()> {
        let link_target_table = match &spec.link_target {
            Some(target) => self.changeset.intern_string(target),
            None => InternString::NPOS,
        };
        let table = self.changeset.intern_string(table);
        let field = self.changeset.intern_string(field);
        self.record(
            AddColumn {
                table,
                field,
                value_type: spec.value_type,
                nullable: spec.nullable,
                collection_type: spec.collection_type,
                key_type: spec.key_type,
                link_target_table,
            }
            .into(),
        )
    }

    /// Removes a column.
    pub fn erase_column(&mut self, table: &str, field: &str) -> StorageResult<()> {
        let table = self.changeset.intern_string(table);
        let field = self.changeset.intern_string(field);
        self.record(EraseColumn { table, field }.into())
    }

    /// Creates an object unless one with the key exists. Returns true if created.
    pub fn create_object(&mut self, table: &str, key: impl Into<ObjKey>) -> StorageResult<bool> {
        let key = key.into();
        let existed = self.snapshot.get_object(table, &key).is_some();
        let t = self.changeset.intern_string(table);
        let object = self.primary_key(&key);
        self.record(CreateObject { table: t, object }.into())?;
        Ok(!existed)
    }

    /// Removes an object. Returns true if it existed.
    pub fn erase_object(&mut self, table: &str, key: &ObjKey) -> StorageResult<bool> {
        if self.snapshot.get_object(table, key).is_none() {
            return Ok(false);
        }
        let t = self.changeset.intern_string(table);
        let object = self.primary_key(key);
        self.record(EraseObject { table: t, object }.into())?;
        Ok(true)
    }

    /// Sets a field.
    pub fn set(
        &mut self,
        table: &str,
        key: &ObjKey,
        field: &str,
        value: impl Into<Value>,
    ) -> StorageResult<()> {
        self.set_at(table, key, field, &[], value)
    }

    /// Sets a list element, dictionary entry or embedded object field.
    pub fn set_at(
        &mut self,
        table: &str,
        key: &ObjKey,
        field: &str,
        steps: &[PathStep],
        value: impl Into<Value>,
    ) -> StorageResult<()> {
        let target = self.target(table, key, field);
        let path = self.path(steps);
        self.put(&target, path, &value.into(), None)
    }

    /// Adds to an integer field.
    pub fn add_integer(&mut self, table: &str, key: &ObjKey, field: &str, delta: i64) -> StorageResult<()> {
        let target = self.target(table, key, field);
        self.record(
            AddInteger {
                table: target.table,
                object: target.object,
                field: target.field,
                path: Path::new(),
                value: delta,
            }
            .into(),
        )
    }

    /// Inserts into a list field.
    pub fn list_insert(
        &mut self,
        table: &str,
        key: &ObjKey,
        field: &str,
        index: u32,
        value: impl Into<Value>,
    ) -> StorageResult<()> {
        let prior_size = self.list_len(table, key, field, &[]);
        let target = self.target(table, key, field);
        let path = Path::from(vec![PathElement::Index(index)]);
        self.put(&target, path, &value.into(), Some(prior_size))
    }

    /// Appends to a list field.
    pub fn list_push(
        &mut self,
        table: &str,
        key: &ObjKey,
        field: &str,
        value: impl Into<Value>,
    ) -> StorageResult<u32> {
        let index = self.list_len(table, key, field, &[]);
        self.list_insert(table, key, field, index, value)?;
        Ok(index)
    }

    /// Moves a list element.
    pub fn list_move(&mut self, table: &str, key: &ObjKey, field: &str, from: u32, to: u32) -> StorageResult<()> {
        let prior_size = self.list_len(table, key, field, &[]);
        let target = self.target(table, key, field);
        self.record(
            ArrayMove {
                table: target.table,
                object: target.object,
                field: target.field,
                path: Path::from(vec![PathElement::Index(from)]),
                ndx_2: to,
                prior_size,
            }
            .into(),
        )
    }

    /// Removes a list element.
    pub fn list_erase(&mut self, table: &str, key: &ObjKey, field: &str, index: u32) -> StorageResult<()> {
        let prior_size = self.list_len(table, key, field, &[]);
        let target = self.target(table, key, field);
        self.record(
            ArrayErase {
                table: target.table,
                object: target.object,
                field: target.field,
                path: Path::from(vec![PathElement::Index(index)]),
                prior_size,
            }
            .into(),
        )
    }

    /// Adds a value to a set field.
    pub fn set_insert(&mut self, table: &str, key: &ObjKey, field: &str, value: impl Into<Value>) -> StorageResult<()> {
        let target = self.target(table, key, field);
        let value = self.payload(&value.into())?;
        self.record(
            SetInsert {
                table: target.table,
                object: target.object,
                field: target.field,
                path: Path::new(),
                value,
            }
            .into(),
        )
    }

    /// Removes a value from a set field.
    pub fn set_erase(&mut self, table: &str, key: &ObjKey, field: &str, value: impl Into<Value>) -> StorageResult<()> {
        let target = self.target(table, key, field);
        let value = self.payload(&value.into())?;
        self.record(
            SetErase {
                table: target.table,
                object: target.object,
                field: target.field,
                path: Path::new(),
                value,
            }
            .into(),
        )
    }

    /// Inserts or replaces a dictionary entry.
    pub fn dictionary_insert(
        &mut self,
        table: &str,
        key: &ObjKey,
        field: &str,
        entry: &str,
        value: impl Into<Value>,
    ) -> StorageResult<()> {
        self.set_at(table, key, field, &[PathStep::from(entry)], value)
    }

    /// Removes a dictionary entry.
    pub fn dictionary_erase(&mut self, table: &str, key: &ObjKey, field: &str, entry: &str) -> StorageResult<()> {
        let target = self.target(table, key, field);
        let path = self.path(&[PathStep::from(entry)]);
        self.record(
            Update {
                table: target.table,
                object: target.object,
                field: target.field,
                path,
                value: Payload::Erased,
                is_default: false,
                prior_size: 0,
            }
            .into(),
        )
    }

    /// Empties a collection field.
    pub fn clear(&mut self, table: &str, key: &ObjKey, field: &str) -> StorageResult<()> {
        let collection_type = match self.snapshot.get_value(table, key, field) {
            Some(Value::List(_)) => CollectionType::List,
            Some(Value::Set(_)) => CollectionType::Set,
            Some(Value::Dictionary(_)) => CollectionType::Dictionary,
            Some(other) => {
                return Err(StorageError::invalid_value(format!(
                    "cannot clear {}",
                    other.type_name()
                )))
            }
            None => return Err(StorageError::no_such_column(table, field)),
        };
        let target = self.target(table, key, field);
        self.record(
            Clear {
                table: target.table,
                object: target.object,
                field: target.field,
                path: Path::new(),
                collection_type,
            }
            .into(),
        )
    }
}

impl Deref for WriteTransaction<'_> {
    type Target = Snapshot;

    fn deref(&self) -> &Snapshot {
        &self.snapshot
    }
}

/// Interned addressing of one field of one object.
struct Target {
    table: InternString,
    object: PrimaryKey,
    field: InternString,
}

fn now_millis() -> u64 {
    let now = Timestamp::now();
    (now.seconds.max(0) as u64) * 1000 + (now.nanoseconds.max(0) as u64) / 1_000_000
}
