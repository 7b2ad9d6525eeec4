//! Immutable views of committed database state.

use crate::error::{StorageError, StorageResult};
use crate::object::{ObjKey, Object, Table, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The full contents of the database at one version.
///
/// Readers hold a snapshot behind an `Arc`; a write transaction works on a
/// private copy that replaces the shared one on commit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    version: u64,
    tables: BTreeMap<String, Table>,
}

impl Snapshot {
    /// Version of the snapshot. Every commit produces a new version.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Returns true if the table exists.
    pub fn has_table(&self, name: &str) -> bool {
        self.tables.contains_key(name)
    }

    /// Looks up a table.
    pub fn table(&self, name: &str) -> Option<&Table> {
        self.tables.get(name)
    }

    /// Names of all tables in name order.
    pub fn table_names(&self) -> impl Iterator<Item = &str> + '_ {
        self.tables.keys().map(String::as_str)
    }

    /// Looks up an object.
    pub fn get_object(&self, table: &str, key: &ObjKey) -> Option<&Object> {
        self.tables.get(table)?.get(key)
    }

    /// Looks up a field of an object.
    pub fn get_value(&self, table: &str, key: &ObjKey, field: &str) -> Option<&Value> {
        self.get_object(table, key)?.get(field)
    }

    /// Number of objects in a table (0 if the table does not exist).
    pub fn object_count(&self, table: &str) -> usize {
        self.tables.get(table).map_or(0, Table::len)
    }

    pub(crate) fn set_version(&mut self, version: u64) {
        self.version = version;
    }

    pub(crate) fn insert_table(&mut self, table: Table) {
        self.tables.insert(table.name().to_string(), table);
    }

    pub(crate) fn remove_table(&mut self, name: &str) -> Option<Table> {
        self.tables.remove(name)
    }

    pub(crate) fn table_mut(&mut self, name: &str) -> StorageResult<&mut Table> {
        self.tables
            .get_mut(name)
            .ok_or_else(|| StorageError::NoSuchTable(name.to_string()))
    }

    pub(crate) fn object_mut(&mut self, table: &str, key: &ObjKey) -> StorageResult<&mut Object> {
        self.table_mut(table)?
            .get_mut(key)
            .ok_or_else(|| StorageError::NoSuchObject {
                table: table.to_string(),
                key: key.to_string(),
            })
    }
}
