//! Database-backed integration of downloaded changesets.
//!
//! Sync metadata (file ident, download and upload cursors, byte counters)
//! lives in a single object of the `sync_metadata` table. It is written in
//! the same non-replicated transaction that integrates server changesets, so
//! a crash never leaves data and cursors out of step.
//!
//! A complete FLX bootstrap is first stored in `sync_pending_bootstrap`.
//! Each transaction that integrates part of it also deletes those rows, and
//! the download cursor only moves with the last one. An interrupted
//! bootstrap resumes from the rows left over.

use crate::error::SyncResult;
use flexsync_protocol::{
    from_cbor, to_cbor, DownloadCursor, PayloadType, QueryVersion, RemoteChangeset,
    SaltedFileIdent, SyncProgress, UploadCursor,
};
use flexsync_storage::{
    ColumnSpec, Database, ObjKey, ReplicationOverride, Snapshot, Value, WriteTransaction,
};

const METADATA_TABLE: &str = "sync_metadata";
const METADATA_KEY: i64 = 0;

const BOOTSTRAP_TABLE: &str = "sync_pending_bootstrap";
// Holds the query version and the progress to store once applied.
const BOOTSTRAP_HEADER_KEY: i64 = 0;

const INT_COLUMNS: [&str; 9] = [
    "client_file_ident",
    "client_file_salt",
    "download_server_version",
    "download_client_version",
    "upload_client_version",
    "upload_server_version",
    "downloaded_bytes",
    "uploaded_bytes",
    "latest_server_version",
];

/// Persisted synchronization progress of a database.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncMetadata {
    /// File ident assigned by the server (ident 0 until assigned).
    pub client_file_ident: SaltedFileIdent,
    /// Download position.
    pub download: DownloadCursor,
    /// Last upload acknowledged by the server.
    pub upload: UploadCursor,
    /// Total bytes of server changesets integrated.
    pub downloaded_bytes: u64,
    /// Total bytes of local changesets acknowledged.
    pub uploaded_bytes: u64,
    /// Latest server version seen.
    pub latest_server_version: u64,
}

impl SyncMetadata {
    /// Reads the metadata of `db`, or defaults if none was stored yet.
    pub fn load(db: &Database) -> Self {
        let read = db.begin_read();
        Self::read(&read)
    }

    fn read(snapshot: &Snapshot) -> Self {
        let key = ObjKey::Int(METADATA_KEY);
        let int = |field: &str| {
            snapshot
                .get_value(METADATA_TABLE, &key, field)
                .and_then(Value::as_int)
                .unwrap_or(0)
        };
        Self {
            client_file_ident: SaltedFileIdent {
                ident: int("client_file_ident") as u64,
                salt: int("client_file_salt"),
            },
            download: DownloadCursor {
                server_version: int("download_server_version") as u64,
                last_integrated_client_version: int("download_client_version") as u64,
            },
            upload: UploadCursor {
                client_version: int("upload_client_version") as u64,
                last_integrated_server_version: int("upload_server_version") as u64,
            },
            downloaded_bytes: int("downloaded_bytes") as u64,
            uploaded_bytes: int("uploaded_bytes") as u64,
            latest_server_version: int("latest_server_version") as u64,
        }
    }

    fn write(&self, txn: &mut WriteTransaction<'_>) -> SyncResult<()> {
        if !txn.has_table(METADATA_TABLE) {
            txn.add_table(METADATA_TABLE, "id", PayloadType::Int)?;
            for column in INT_COLUMNS {
                txn.add_column(METADATA_TABLE, column, ColumnSpec::single(PayloadType::Int, false))?;
            }
        }
        txn.create_object(METADATA_TABLE, METADATA_KEY)?;
        let key = ObjKey::Int(METADATA_KEY);
        let values = [
            self.client_file_ident.ident as i64,
            self.client_file_ident.salt,
            self.download.server_version as i64,
            self.download.last_integrated_client_version as i64,
            self.upload.client_version as i64,
            self.upload.last_integrated_server_version as i64,
            self.downloaded_bytes as i64,
            self.uploaded_bytes as i64,
            self.latest_server_version as i64,
        ];
        for (column, value) in INT_COLUMNS.into_iter().zip(values) {
            txn.set(METADATA_TABLE, &key, column, value)?;
        }
        Ok(())
    }
}

/// A fully received bootstrap that is not yet integrated.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct PendingBootstrap {
    pub(crate) query_version: QueryVersion,
    pub(crate) progress: SyncProgress,
    /// Changesets left to integrate, in order, with their row keys.
    pub(crate) changesets: Vec<(i64, RemoteChangeset)>,
}

/// Applies server changesets to a local database.
pub(crate) struct DatabaseApplier {
    db: Database,
    replication: ReplicationOverride,
}

impl DatabaseApplier {
    pub(crate) fn new(db: Database) -> Self {
        let replication = db.replication_override();
        Self { db, replication }
    }

    pub(crate) fn database(&self) -> &Database {
        &self.db
    }

    /// Stores `metadata` on its own. Returns the new database version.
    pub(crate) fn save(&self, metadata: &SyncMetadata) -> SyncResult<u64> {
        let mut txn = self.db.begin_write_without_replication(&self.replication)?;
        metadata.write(&mut txn)?;
        Ok(txn.commit()?)
    }

    /// Integrates `changesets` and stores `metadata` in one transaction.
    ///
    /// Returns the database versions before and after.
    pub(crate) fn integrate(
        &self,
        changesets: &[RemoteChangeset],
        metadata: &SyncMetadata,
    ) -> SyncResult<(u64, u64)> {
        let mut txn = self.db.begin_write_without_replication(&self.replication)?;
        let old_version = txn.version();
        for remote in changesets {
            txn.integrate(&remote.changeset)?;
        }
        metadata.write(&mut txn)?;
        let new_version = txn.commit()?;
        Ok((old_version, new_version))
    }

    /// Stores a received bootstrap, replacing any unfinished one.
    pub(crate) fn store_bootstrap(
        &self,
        query_version: QueryVersion,
        progress: SyncProgress,
        changesets: Vec<RemoteChangeset>,
    ) -> SyncResult<PendingBootstrap> {
        let mut txn = self.db.begin_write_without_replication(&self.replication)?;
        if txn.has_table(BOOTSTRAP_TABLE) {
            txn.erase_table(BOOTSTRAP_TABLE)?;
        }
        txn.add_table(BOOTSTRAP_TABLE, "id", PayloadType::Int)?;
        txn.add_column(BOOTSTRAP_TABLE, "query_version", ColumnSpec::single(PayloadType::Int, false))?;
        txn.add_column(BOOTSTRAP_TABLE, "payload", ColumnSpec::single(PayloadType::Binary, false))?;

        let header = ObjKey::Int(BOOTSTRAP_HEADER_KEY);
        txn.create_object(BOOTSTRAP_TABLE, BOOTSTRAP_HEADER_KEY)?;
        txn.set(BOOTSTRAP_TABLE, &header, "query_version", query_version)?;
        txn.set(BOOTSTRAP_TABLE, &header, "payload", Value::Binary(to_cbor(&progress)?))?;

        let mut keyed = Vec::with_capacity(changesets.len());
        for (key, changeset) in (BOOTSTRAP_HEADER_KEY + 1..).zip(changesets) {
            txn.create_object(BOOTSTRAP_TABLE, key)?;
            txn.set(BOOTSTRAP_TABLE, &ObjKey::Int(key), "payload", Value::Binary(to_cbor(&changeset)?))?;
            keyed.push((key, changeset));
        }
        txn.commit()?;
        Ok(PendingBootstrap {
            query_version,
            progress,
            changesets: keyed,
        })
    }

    /// Reads a bootstrap left unfinished by an earlier session.
    pub(crate) fn pending_bootstrap(&self) -> SyncResult<Option<PendingBootstrap>> {
        let read = self.db.begin_read();
        let Some(table) = read.table(BOOTSTRAP_TABLE) else {
            return Ok(None);
        };
        let mut header = None;
        let mut changesets = Vec::new();
        for (key, obj) in table.objects() {
            let (ObjKey::Int(key), Some(Value::Binary(payload))) = (key, obj.get("payload")) else {
                continue;
            };
            if *key == BOOTSTRAP_HEADER_KEY {
                let query_version = obj.get("query_version").and_then(Value::as_int).unwrap_or(0);
                header = Some((query_version, from_cbor::<SyncProgress>(payload)?));
            } else {
                changesets.push((*key, from_cbor::<RemoteChangeset>(payload)?));
            }
        }
        Ok(header.map(|(query_version, progress)| PendingBootstrap {
            query_version,
            progress,
            changesets,
        }))
    }

    /// Integrates part of a stored bootstrap and removes it from the store,
    /// together with `metadata`. The last part also removes the bootstrap.
    pub(crate) fn integrate_bootstrap(
        &self,
        part: &[(i64, RemoteChangeset)],
        metadata: &SyncMetadata,
        last: bool,
    ) -> SyncResult<(u64, u64)> {
        let mut txn = self.db.begin_write_without_replication(&self.replication)?;
        let old_version = txn.version();
        for (key, remote) in part {
            txn.integrate(&remote.changeset)?;
            txn.erase_object(BOOTSTRAP_TABLE, &ObjKey::Int(*key))?;
        }
        if last && txn.has_table(BOOTSTRAP_TABLE) {
            txn.erase_table(BOOTSTRAP_TABLE)?;
        }
        metadata.write(&mut txn)?;
        let new_version = txn.commit()?;
        Ok((old_version, new_version))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flexsync_protocol::{Changeset, CreateObject, PrimaryKey};

    fn remote(version: u64, changeset: Changeset) -> RemoteChangeset {
        RemoteChangeset {
            remote_version: version,
            last_integrated_local_version: 0,
            origin_timestamp: 0,
            origin_file_ident: 2,
            original_changeset_size: 16,
            changeset,
        }
    }

    #[test]
    fn metadata_defaults_to_zero() {
        let db = Database::open_in_memory();
        assert_eq!(SyncMetadata::load(&db), SyncMetadata::default());
    }

    #[test]
    fn save_and_reload() {
        let db = Database::open_in_memory();
        let applier = DatabaseApplier::new(db.clone());
        let meta = SyncMetadata {
            client_file_ident: SaltedFileIdent { ident: 4, salt: 99 },
            downloaded_bytes: 1234,
            latest_server_version: 7,
            ..Default::default()
        };
        let version = applier.save(&meta).unwrap();
        assert_eq!(version, db.latest_version());
        assert_eq!(SyncMetadata::load(&db), meta);
        assert_eq!(db.history_len(), 0);
    }

    fn cat(object: i64) -> Changeset {
        let mut changeset = Changeset::new();
        let table = changeset.intern_string("Cat");
        changeset.push(CreateObject {
            table,
            object: PrimaryKey::Int(object),
        });
        changeset
    }

    #[test]
    fn interrupted_bootstrap_resumes_from_stored_rows() {
        let db = Database::open_in_memory();
        db.transaction(|txn| txn.add_table("Cat", "_id", PayloadType::Int))
            .unwrap();
        let history_before = db.history_len();
        let applier = DatabaseApplier::new(db.clone());
        assert_eq!(applier.pending_bootstrap().unwrap(), None);

        let progress = SyncProgress {
            download: DownloadCursor {
                server_version: 9,
                last_integrated_client_version: 0,
            },
            latest_server_version: 9,
            ..Default::default()
        };
        let changesets: Vec<_> = (1..=3).map(|i| remote(i, cat(i as i64))).collect();
        let stored = applier.store_bootstrap(2, progress, changesets).unwrap();
        assert_eq!(applier.pending_bootstrap().unwrap().as_ref(), Some(&stored));

        let meta = SyncMetadata::default();
        applier
            .integrate_bootstrap(&stored.changesets[..1], &meta, false)
            .unwrap();
        assert_eq!(SyncMetadata::load(&db).download.server_version, 0);

        // Only the rows not yet integrated are left.
        let left = applier.pending_bootstrap().unwrap().unwrap();
        assert_eq!(left.query_version, 2);
        assert_eq!(left.progress, progress);
        assert_eq!(left.changesets, stored.changesets[1..].to_vec());

        let meta = SyncMetadata {
            download: progress.download,
            ..Default::default()
        };
        applier
            .integrate_bootstrap(&left.changesets, &meta, true)
            .unwrap();
        assert_eq!(applier.pending_bootstrap().unwrap(), None);
        assert_eq!(SyncMetadata::load(&db).download.server_version, 9);
        let read = db.begin_read();
        assert_eq!(read.object_count("Cat"), 3);
        assert_eq!(db.history_len(), history_before);
    }

    #[test]
    fn integrates_without_replicating() {
        let db = Database::open_in_memory();
        db.transaction(|txn| txn.add_table("Cat", "_id", PayloadType::Int))
            .unwrap();
        let history_before = db.history_len();

        let mut changeset = Changeset::new();
        let table = changeset.intern_string("Cat");
        changeset.push(CreateObject {
            table,
            object: PrimaryKey::Int(5),
        });

        let applier = DatabaseApplier::new(db.clone());
        let meta = SyncMetadata {
            download: DownloadCursor {
                server_version: 3,
                last_integrated_client_version: 0,
            },
            ..Default::default()
        };
        let (old, new) = applier.integrate(&[remote(3, changeset)], &meta).unwrap();
        assert!(new > old);

        let read = db.begin_read();
        assert!(read.get_object("Cat", &ObjKey::Int(5)).is_some());
        assert_eq!(SyncMetadata::load(&db).download.server_version, 3);
        assert_eq!(db.history_len(), history_before);
    }
}
