//! The database handle.

use crate::error::{StorageError, StorageResult};
use crate::history::{History, HistoryEntry};
use crate::snapshot::Snapshot;
use crate::transaction::{ReadTransaction, ReplicationOverride, WriteTransaction};
use flexsync_protocol::{from_cbor, to_cbor};
use fs2::FileExt;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

static NEXT_DATABASE_ID: AtomicU64 = AtomicU64::new(1);

/// A transactional object database with a local history of replicated commits.
///
/// Cloning the handle is cheap; clones share the same data.
///
/// # Concurrency
///
/// Readers see immutable snapshots and never block. Only one
/// [`WriteTransaction`] can exist at a time; `begin_write` blocks until the
/// previous writer commits or is dropped.
#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
}

struct DatabaseInner {
    id: u64,
    state: RwLock<Arc<Snapshot>>,
    history: RwLock<History>,
    write_lock: Mutex<()>,
    file: Option<DatabaseFile>,
}

/// Backing file plus the advisory lock held for its lifetime.
struct DatabaseFile {
    path: PathBuf,
    temp_path: PathBuf,
    _lock: File,
}

#[derive(Serialize)]
struct PersistedRef<'a> {
    snapshot: &'a Snapshot,
    history: &'a History,
}

#[derive(Deserialize)]
struct Persisted {
    snapshot: Snapshot,
    history: History,
}

impl Database {
    /// Creates an empty database that lives only in memory.
    pub fn open_in_memory() -> Self {
        Self::from_parts(Snapshot::default(), History::default(), None)
    }

    /// Opens or creates a database file.
    ///
    /// The whole database is loaded into memory and rewritten atomically on
    /// every commit.
    ///
    /// # Errors
    ///
    /// Returns `DatabaseLocked` if another process has the file open.
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        let path = path.as_ref().to_path_buf();
        let lock_path = sibling(&path, "lock");
        let lock = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)?;
        if lock.try_lock_exclusive().is_err() {
            return Err(StorageError::DatabaseLocked);
        }

        let (snapshot, history) = if path.exists() {
            let mut data = Vec::new();
            File::open(&path)?.read_to_end(&mut data)?;
            if data.is_empty() {
                (Snapshot::default(), History::default())
            } else {
                let persisted: Persisted =
                    from_cbor(&data).map_err(|e| StorageError::Corrupted(e.to_string()))?;
                (persisted.snapshot, persisted.history)
            }
        } else {
            (Snapshot::default(), History::default())
        };
        debug!(path = %path.display(), version = snapshot.version(), "opened database");

        let file = DatabaseFile {
            temp_path: sibling(&path, "tmp"),
            path,
            _lock: lock,
        };
        Ok(Self::from_parts(snapshot, history, Some(file)))
    }

    fn from_parts(snapshot: Snapshot, history: History, file: Option<DatabaseFile>) -> Self {
        Self {
            inner: Arc::new(DatabaseInner {
                id: NEXT_DATABASE_ID.fetch_add(1, Ordering::Relaxed),
                state: RwLock::new(Arc::new(snapshot)),
                history: RwLock::new(history),
                write_lock: Mutex::new(()),
                file,
            }),
        }
    }

    /// Path of the backing file, if any.
    pub fn path(&self) -> Option<&Path> {
        self.inner.file.as_ref().map(|f| f.path.as_path())
    }

    /// Version of the latest commit (0 for a new database).
    pub fn latest_version(&self) -> u64 {
        self.inner.state.read().version()
    }

    /// Begins a read transaction on the latest snapshot.
    pub fn begin_read(&self) -> ReadTransaction {
        ReadTransaction::new(Arc::clone(&*self.inner.state.read()))
    }

    /// Begins a write transaction whose changes are recorded for upload.
    pub fn begin_write(&self) -> WriteTransaction<'_> {
        let guard = self.inner.write_lock.lock();
        let snapshot = Snapshot::clone(&**self.inner.state.read());
        WriteTransaction::new(self, guard, snapshot, true)
    }

    /// Begins a write transaction whose changes are not recorded for upload.
    pub fn begin_write_without_replication(
        &self,
        capability: &ReplicationOverride,
    ) -> StorageResult<WriteTransaction<'_>> {
        if capability.database_id != self.inner.id {
            return Err(StorageError::ForeignOverride);
        }
        let guard = self.inner.write_lock.lock();
        let snapshot = Snapshot::clone(&**self.inner.state.read());
        Ok(WriteTransaction::new(self, guard, snapshot, false))
    }

    /// Issues the capability needed by [`Self::begin_write_without_replication`].
    pub fn replication_override(&self) -> ReplicationOverride {
        ReplicationOverride {
            database_id: self.inner.id,
        }
    }

    /// Runs `f` in a write transaction, committing if it succeeds.
    ///
    /// Returns the closure's result and the committed version.
    pub fn transaction<F, T>(&self, f: F) -> StorageResult<(T, u64)>
    where
        F: FnOnce(&mut WriteTransaction<'_>) -> StorageResult<T>,
    {
        let mut txn = self.begin_write();
        let result = f(&mut txn)?;
        let version = txn.commit()?;
        Ok((result, version))
    }

    /// Replicated changesets with `after < version <= up_to`, in order.
    pub fn uploadable_changesets(&self, after: u64, up_to: u64) -> Vec<HistoryEntry> {
        self.inner.history.read().range(after, up_to)
    }

    /// Encoded size of the replicated changesets with `after < version <= up_to`.
    pub fn uploadable_bytes(&self, after: u64, up_to: u64) -> u64 {
        self.inner.history.read().byte_size(after, up_to)
    }

    /// Forgets history entries the server has acknowledged.
    pub fn trim_history(&self, up_to: u64) {
        self.inner.history.write().trim(up_to);
    }

    /// Number of history entries retained.
    pub fn history_len(&self) -> usize {
        self.inner.history.read().len()
    }

    /// Installs a committed snapshot. Called with the write lock held.
    pub(crate) fn publish(&self, snapshot: Snapshot, entry: Option<HistoryEntry>) -> StorageResult<()> {
        let version = snapshot.version();
        if let Some(file) = &self.inner.file {
            let mut history = self.inner.history.read().clone();
            if let Some(entry) = &entry {
                history.push(entry.clone());
            }
            file.save(&snapshot, &history)?;
        }
        if let Some(entry) = entry {
            self.inner.history.write().push(entry);
        }
        *self.inner.state.write() = Arc::new(snapshot);
        debug!(version, "committed");
        Ok(())
    }
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database")
            .field("id", &self.inner.id)
            .field("path", &self.path())
            .field("version", &self.latest_version())
            .finish()
    }
}

impl DatabaseFile {
    /// Write-then-rename so a crash never leaves a partial file.
    fn save(&self, snapshot: &Snapshot, history: &History) -> StorageResult<()> {
        let data = to_cbor(&PersistedRef { snapshot, history })?;
        let mut file = File::create(&self.temp_path)?;
        file.write_all(&data)?;
        file.sync_all()?;
        drop(file);
        fs::rename(&self.temp_path, &self.path)?;
        Ok(())
    }
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{ObjKey, Value};
    use flexsync_protocol::PayloadType;
    use tempfile::tempdir;

    fn add_person_table(db: &Database) {
        db.transaction(|txn| {
            txn.add_table("Person", "_id", PayloadType::Int)?;
            txn.add_column(
                "Person",
                "name",
                crate::object::ColumnSpec::single(PayloadType::String, true),
            )
        })
        .unwrap();
    }

    #[test]
    fn readers_keep_their_snapshot() {
        let db = Database::open_in_memory();
        add_person_table(&db);
        let before = db.begin_read();

        db.transaction(|txn| txn.create_object("Person", 1i64)).unwrap();

        assert_eq!(before.object_count("Person"), 0);
        assert_eq!(db.begin_read().object_count("Person"), 1);
        assert_eq!(db.latest_version(), 2);
    }

    #[test]
    fn dropped_transaction_rolls_back() {
        let db = Database::open_in_memory();
        add_person_table(&db);
        {
            let mut txn = db.begin_write();
            txn.create_object("Person", 1i64).unwrap();
        }
        assert_eq!(db.begin_read().object_count("Person"), 0);
        assert_eq!(db.latest_version(), 1);
    }

    #[test]
    fn history_records_only_replicated_commits() {
        let db = Database::open_in_memory();
        add_person_table(&db);

        let capability = db.replication_override();
        let mut txn = db.begin_write_without_replication(&capability).unwrap();
        txn.create_object("Person", 5i64).unwrap();
        assert_eq!(txn.commit().unwrap(), 2);

        db.transaction(|txn| txn.create_object("Person", 6i64)).unwrap();
        // Empty replicated commits leave no entry.
        db.transaction(|_| Ok(())).unwrap();

        let versions: Vec<_> = db
            .uploadable_changesets(0, db.latest_version())
            .iter()
            .map(|e| e.version)
            .collect();
        assert_eq!(versions, vec![1, 3]);
        assert!(db.uploadable_bytes(0, 4) > 0);

        db.trim_history(1);
        assert_eq!(db.history_len(), 1);
    }

    #[test]
    fn foreign_override_is_rejected() {
        let a = Database::open_in_memory();
        let b = Database::open_in_memory();
        assert!(matches!(
            a.begin_write_without_replication(&b.replication_override()),
            Err(StorageError::ForeignOverride)
        ));
    }

    #[test]
    fn file_roundtrip_and_lock() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");
        {
            let db = Database::open(&path).unwrap();
            add_person_table(&db);
            db.transaction(|txn| {
                txn.create_object("Person", 1i64)?;
                txn.set("Person", &ObjKey::Int(1), "name", "Ann")
            })
            .unwrap();

            assert!(matches!(
                Database::open(&path),
                Err(StorageError::DatabaseLocked)
            ));
        }

        let db = Database::open(&path).unwrap();
        assert_eq!(db.latest_version(), 2);
        assert_eq!(
            db.begin_read().get_value("Person", &ObjKey::Int(1), "name"),
            Some(&Value::String("Ann".into()))
        );
        assert_eq!(db.history_len(), 2);
    }
}
