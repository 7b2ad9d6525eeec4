//! # FlexSync Storage
//!
//! The local database a sync session keeps consistent with the server.
//!
//! This crate provides:
//! - [`Database`], a handle with snapshot reads and a single writer
//! - Tables of objects whose fields may hold lists, sets, dictionaries and
//!   embedded objects
//! - Instruction application, shared by local writes and downloaded changesets
//! - A local history of replicated commits, queried for upload
//! - [`ReplicationOverride`], the capability to write without recording history
//!
//! ## Example
//!
//! ```rust,ignore
//! use flexsync_storage::{Database, ObjKey};
//! use flexsync_protocol::PayloadType;
//!
//! let db = Database::open_in_memory();
//! db.transaction(|txn| {
//!     txn.add_table("Person", "_id", PayloadType::Int)?;
//!     txn.create_object("Person", 1i64)?;
//!     Ok(())
//! })?;
//! assert_eq!(db.begin_read().object_count("Person"), 1);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod apply;
mod database;
mod error;
mod history;
mod object;
mod snapshot;
mod transaction;

pub use database::Database;
pub use error::{StorageError, StorageResult};
pub use history::HistoryEntry;
pub use object::{key_to_value, ColumnSpec, Link, ObjKey, Object, Table, TableKind, Value};
pub use snapshot::Snapshot;
pub use transaction::{PathStep, ReadTransaction, ReplicationOverride, WriteTransaction};
