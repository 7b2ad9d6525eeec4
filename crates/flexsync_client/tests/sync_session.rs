//! Sessions driven end to end against the mock transport.

use flexsync_client::{
    Client, ClientConfig, ConnectOutcome, ConnectionState, ErrorCode, MockTransport,
    ProgressReport, ReconnectMode, Session, SessionConfig, Status, SyncMetadata,
};
use flexsync_protocol::{
    AddTable, Changeset, ClientMessage, CreateObject, DownloadBatchState, DownloadCursor,
    DownloadMessage, ErrorMessage, PayloadType, PrimaryKey, PrimaryKeySpec, ProtocolErrorCode,
    RemoteChangeset, SaltedFileIdent, ServerMessage, SyncProgress, TableType,
};
use flexsync_storage::{ColumnSpec, Database, ObjKey};
use parking_lot::Mutex;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const TIMEOUT: Duration = Duration::from_secs(10);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A client whose event loop runs on its own thread.
struct Harness {
    client: Client,
    mock: MockTransport,
    runner: Option<JoinHandle<()>>,
}

impl Harness {
    fn new(mock: MockTransport, config: ClientConfig) -> Self {
        init_tracing();
        let client = Client::new(config, Arc::new(mock.clone()));
        let looping = client.clone();
        let runner = thread::spawn(move || looping.run().unwrap());
        Self {
            client,
            mock,
            runner: Some(runner),
        }
    }

    fn start() -> Self {
        Self::new(MockTransport::new(), ClientConfig::new())
    }

    fn session(&self, db: &Database) -> Session {
        Session::new(
            &self.client,
            db.clone(),
            SessionConfig::new("localhost", "/app/tasks").with_signed_user_token("token-1"),
        )
    }

    fn stop(&mut self) {
        self.client.shutdown_and_wait();
        if let Some(runner) = self.runner.take() {
            runner.join().unwrap();
        }
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.stop();
    }
}

fn local_write(db: &Database, id: i64) -> u64 {
    let (_, version) = db
        .transaction(|txn| {
            if !txn.has_table("Task") {
                txn.add_table("Task", "_id", PayloadType::Int)?;
                txn.add_column("Task", "done", ColumnSpec::single(PayloadType::Bool, false))?;
            }
            txn.create_object("Task", id)?;
            txn.set("Task", &ObjKey::Int(id), "done", true)
        })
        .unwrap();
    version
}

fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + TIMEOUT;
    while !condition() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        thread::sleep(Duration::from_millis(5));
    }
}

fn record_states(session: &mut Session) -> mpsc::Receiver<(ConnectionState, Option<ErrorCode>)> {
    let (tx, rx) = mpsc::channel();
    session
        .set_connection_state_change_listener(move |state, error| {
            let _ = tx.send((state, error.map(|e| e.status.code())));
        })
        .unwrap();
    rx
}

#[test]
fn upload_and_download_complete() {
    let harness = Harness::start();
    let db = Database::open_in_memory();
    let reports: Arc<Mutex<Vec<ProgressReport>>> = Arc::default();

    let mut session = harness.session(&db);
    let sink = Arc::clone(&reports);
    session
        .set_progress_handler(move |report| sink.lock().push(*report))
        .unwrap();
    session.bind().unwrap();

    let version = local_write(&db, 1);
    session.nonsync_transact_notify(version).unwrap();
    assert!(session.wait_for_upload_complete_or_client_stopped().unwrap());
    assert!(session.wait_for_download_complete_or_client_stopped().unwrap());

    let uploads: Vec<_> = harness
        .mock
        .sent_messages()
        .into_iter()
        .filter_map(|m| match m {
            ClientMessage::Upload(upload) => Some(upload),
            _ => None,
        })
        .collect();
    assert_eq!(uploads.len(), 1);
    assert_eq!(uploads[0].progress_client_version, version);
    assert_eq!(uploads[0].changesets.len(), 1);

    let metadata = SyncMetadata::load(&db);
    assert_eq!(metadata.client_file_ident.ident, 1);
    assert_eq!(metadata.upload.client_version, version);
    assert_eq!(db.history_len(), 0);

    let reports = reports.lock();
    assert!(reports
        .iter()
        .any(|r| r.uploaded_bytes > 0 && r.uploaded_bytes == r.uploadable_bytes));
}

#[test]
fn changes_made_before_bind_are_uploaded() {
    let harness = Harness::start();
    let db = Database::open_in_memory();
    let version = local_write(&db, 7);

    let mut session = harness.session(&db);
    session.bind().unwrap();
    assert!(session.wait_for_upload_complete_or_client_stopped().unwrap());
    assert_eq!(SyncMetadata::load(&db).upload.client_version, version);
}

#[test]
fn sync_completion_waits_for_both_directions() {
    let harness = Harness::start();
    let db = Database::open_in_memory();
    let mut session = harness.session(&db);
    session.bind().unwrap();

    let version = local_write(&db, 3);
    session.nonsync_transact_notify(version).unwrap();
    let (tx, rx) = mpsc::channel();
    session
        .async_wait_for_sync_completion(move |status| tx.send(status).unwrap())
        .unwrap();
    assert!(rx.recv_timeout(TIMEOUT).unwrap().is_ok());

    let sent = harness.mock.sent_messages();
    let upload_at = sent
        .iter()
        .position(|m| matches!(m, ClientMessage::Upload(_)))
        .unwrap();
    let mark_at = sent
        .iter()
        .rposition(|m| matches!(m, ClientMessage::Mark { .. }))
        .unwrap();
    assert!(mark_at > upload_at);
}

#[test]
fn detach_aborts_pending_wait_exactly_once() {
    let mut harness = Harness::new(
        MockTransport::new().with_auto_respond(false),
        ClientConfig::new(),
    );
    let db = Database::open_in_memory();
    local_write(&db, 1);

    let mut session = harness.session(&db);
    session.bind().unwrap();
    let (tx, rx) = mpsc::channel();
    session
        .async_wait_for_upload_completion(move |status| tx.send(status).unwrap())
        .unwrap();
    drop(session);

    assert!(harness.client.wait_for_session_terminations_or_client_stopped());
    let status = rx.recv_timeout(TIMEOUT).unwrap();
    assert_eq!(status.code(), ErrorCode::OperationAborted);

    harness.stop();
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
}

#[test]
fn waits_after_shutdown_are_aborted() {
    let mut harness = Harness::new(
        MockTransport::new().with_auto_respond(false),
        ClientConfig::new(),
    );
    let db = Database::open_in_memory();
    let mut session = harness.session(&db);
    session.bind().unwrap();
    let handle = session.handle();
    harness.stop();

    assert!(!handle.wait_for_download_complete_or_client_stopped().unwrap());
    let (tx, rx) = mpsc::channel::<Status>();
    handle
        .async_wait_for_upload_completion(move |status| tx.send(status).unwrap())
        .unwrap();
    assert_eq!(
        rx.recv_timeout(TIMEOUT).unwrap().code(),
        ErrorCode::OperationAborted
    );
}

#[test]
fn reconnects_after_failed_connect() {
    let mock = MockTransport::new();
    mock.script_connects([ConnectOutcome::Fail("connection refused".into())]);
    let harness = Harness::new(
        mock,
        ClientConfig::new().with_reconnect_mode(ReconnectMode::Testing),
    );
    let db = Database::open_in_memory();

    let mut session = harness.session(&db);
    let states = record_states(&mut session);
    session.bind().unwrap();

    assert_eq!(states.recv_timeout(TIMEOUT).unwrap(), (ConnectionState::Connecting, None));
    assert_eq!(
        states.recv_timeout(TIMEOUT).unwrap(),
        (ConnectionState::Disconnected, Some(ErrorCode::ConnectFailed))
    );
    // Automatic reconnect is off in testing mode.
    assert!(states.recv_timeout(Duration::from_millis(200)).is_err());
    assert_eq!(harness.mock.connect_attempts(), 1);

    harness.client.cancel_reconnect_delay();
    assert_eq!(states.recv_timeout(TIMEOUT).unwrap(), (ConnectionState::Connecting, None));
    assert_eq!(states.recv_timeout(TIMEOUT).unwrap(), (ConnectionState::Connected, None));
    assert!(session.wait_for_download_complete_or_client_stopped().unwrap());
    assert_eq!(harness.mock.connect_attempts(), 2);
}

#[test]
fn sessions_share_one_connection_per_endpoint() {
    let harness = Harness::start();
    let first_db = Database::open_in_memory();
    let second_db = Database::open_in_memory();

    let mut first = harness.session(&first_db);
    let mut second = harness.session(&second_db);
    first.bind().unwrap();
    second.bind().unwrap();
    assert!(first.wait_for_download_complete_or_client_stopped().unwrap());
    assert!(second.wait_for_download_complete_or_client_stopped().unwrap());

    assert_eq!(harness.mock.connect_attempts(), 1);
    assert_ne!(
        SyncMetadata::load(&first_db).client_file_ident,
        SyncMetadata::load(&second_db).client_file_ident
    );

    drop(first);
    assert!(harness.client.wait_for_session_terminations_or_client_stopped());
    assert_eq!(harness.mock.live_connections(), 1);
    drop(second);
    assert!(harness.client.wait_for_session_terminations_or_client_stopped());
    assert_eq!(harness.mock.live_connections(), 0);
}

#[test]
fn dedicated_connections_per_session() {
    let harness = Harness::new(
        MockTransport::new(),
        ClientConfig::new().with_one_connection_per_session(true),
    );
    let first_db = Database::open_in_memory();
    let second_db = Database::open_in_memory();
    let mut first = harness.session(&first_db);
    let mut second = harness.session(&second_db);
    first.bind().unwrap();
    second.bind().unwrap();
    assert!(first.wait_for_download_complete_or_client_stopped().unwrap());
    assert!(second.wait_for_download_complete_or_client_stopped().unwrap());
    assert_eq!(harness.mock.connect_attempts(), 2);
}

#[test]
fn expired_token_suspends_until_refresh() {
    let harness = Harness::start();
    let db = Database::open_in_memory();
    let mut session = harness.session(&db);
    let states = record_states(&mut session);
    session.bind().unwrap();
    assert!(session.wait_for_download_complete_or_client_stopped().unwrap());
    assert_eq!(states.recv_timeout(TIMEOUT).unwrap().0, ConnectionState::Connecting);
    assert_eq!(states.recv_timeout(TIMEOUT).unwrap().0, ConnectionState::Connected);

    assert!(harness.mock.deliver(token_expired(session.ident())));
    assert_eq!(
        states.recv_timeout(TIMEOUT).unwrap(),
        (ConnectionState::Disconnected, Some(ErrorCode::TokenExpired))
    );
    assert!(harness
        .mock
        .sent_messages()
        .iter()
        .any(|m| matches!(m, ClientMessage::Unbind { .. })));

    harness.mock.take_sent_messages();
    session.refresh("token-2").unwrap();
    assert_eq!(states.recv_timeout(TIMEOUT).unwrap().0, ConnectionState::Connecting);
    assert_eq!(states.recv_timeout(TIMEOUT).unwrap().0, ConnectionState::Connected);
    assert!(session.wait_for_download_complete_or_client_stopped().unwrap());

    let rebind = harness
        .mock
        .sent_messages()
        .into_iter()
        .find_map(|m| match m {
            ClientMessage::Bind(bind) => Some(bind),
            _ => None,
        })
        .unwrap();
    assert_eq!(rebind.signed_user_token, "token-2");
    assert!(!rebind.need_client_file_ident);
}

fn token_expired(session_ident: u64) -> ServerMessage {
    ServerMessage::Error(ErrorMessage::session(
        session_ident,
        ProtocolErrorCode::TokenExpired,
        "access token expired",
    ))
}

fn create_comment(id: i64) -> RemoteChangeset {
    let mut changeset = Changeset::new();
    let table = changeset.intern_string("Comment");
    let field = changeset.intern_string("_id");
    changeset.push(AddTable {
        table,
        table_type: TableType::TopLevel(PrimaryKeySpec {
            field,
            pk_type: PayloadType::Int,
            nullable: false,
        }),
        is_asymmetric: false,
    });
    changeset.push(CreateObject {
        table,
        object: PrimaryKey::Int(id),
    });
    RemoteChangeset {
        remote_version: id as u64,
        last_integrated_local_version: 0,
        origin_timestamp: 0,
        origin_file_ident: 2,
        original_changeset_size: 8,
        changeset,
    }
}

fn steady_download(
    session_ident: u64,
    server_version: u64,
    changesets: Vec<RemoteChangeset>,
) -> ServerMessage {
    ServerMessage::Download(DownloadMessage {
        session_ident,
        progress: SyncProgress {
            download: DownloadCursor {
                server_version,
                last_integrated_client_version: 0,
            },
            latest_server_version: server_version,
            ..Default::default()
        },
        downloadable_bytes: 0,
        query_version: 0,
        batch_state: DownloadBatchState::SteadyState,
        changesets,
    })
}

#[test]
fn downloaded_changesets_are_integrated() {
    let harness = Harness::new(
        MockTransport::new().with_auto_respond(false),
        ClientConfig::new(),
    );
    let db = Database::open_in_memory();
    local_write(&db, 1);

    let mut session = harness.session(&db);
    let reports: Arc<Mutex<Vec<ProgressReport>>> = Arc::default();
    let transacts: Arc<Mutex<Vec<(u64, u64)>>> = Arc::default();
    let sink = Arc::clone(&reports);
    session
        .set_progress_handler(move |report| sink.lock().push(*report))
        .unwrap();
    let sink = Arc::clone(&transacts);
    session
        .set_sync_transact_callback(move |old, new| sink.lock().push((old, new)))
        .unwrap();
    session.bind().unwrap();

    wait_until(|| !harness.mock.sent_messages().is_empty());
    assert!(harness.mock.deliver(ServerMessage::Ident {
        session_ident: session.ident(),
        client_file_ident: SaltedFileIdent { ident: 5, salt: 1 },
    }));
    // The pending local change is uploaded before anything is downloaded.
    wait_until(|| !reports.lock().is_empty());
    assert_eq!(reports.lock()[0].progress_version, 0);
    assert!(transacts.lock().is_empty());

    let before = db.latest_version();
    assert!(harness
        .mock
        .deliver(steady_download(session.ident(), 4, vec![create_comment(9), create_comment(10)])));
    wait_until(|| !transacts.lock().is_empty());

    let (old, new) = transacts.lock()[0];
    assert_eq!(old, before);
    assert!(new > old);
    assert_eq!(transacts.lock().len(), 1);
    let read = db.begin_read();
    assert!(read.get_object("Comment", &ObjKey::Int(9)).is_some());
    assert!(read.get_object("Comment", &ObjKey::Int(10)).is_some());
    assert_eq!(SyncMetadata::load(&db).download.server_version, 4);

    wait_until(|| reports.lock().iter().any(|r| r.progress_version == new));
    let report = *reports.lock().last().unwrap();
    assert_eq!(report.progress_version, new);
    assert_eq!(report.downloaded_bytes, 16);
}

#[test]
fn dropped_connections_cycle_through_states() {
    let harness = Harness::new(
        MockTransport::new(),
        ClientConfig::new().with_reconnect_mode(ReconnectMode::Testing),
    );
    let db = Database::open_in_memory();
    let mut session = harness.session(&db);
    let states = record_states(&mut session);
    session.bind().unwrap();

    for cycle in 0..3 {
        if cycle > 0 {
            harness.client.cancel_reconnect_delay();
        }
        assert_eq!(states.recv_timeout(TIMEOUT).unwrap(), (ConnectionState::Connecting, None));
        assert_eq!(states.recv_timeout(TIMEOUT).unwrap(), (ConnectionState::Connected, None));
        assert!(session.wait_for_download_complete_or_client_stopped().unwrap());

        harness
            .mock
            .disconnect_all(Status::new(ErrorCode::ConnectionClosed, "server restarted"));
        assert_eq!(
            states.recv_timeout(TIMEOUT).unwrap(),
            (ConnectionState::Disconnected, Some(ErrorCode::ConnectionClosed))
        );
        assert!(states.recv_timeout(Duration::from_millis(100)).is_err());
    }
    assert_eq!(harness.mock.connect_attempts(), 3);
    assert_eq!(harness.mock.live_connections(), 0);
}

#[test]
fn hung_connect_times_out() {
    let mock = MockTransport::new();
    mock.script_connects([ConnectOutcome::Hang]);
    let harness = Harness::new(
        mock,
        ClientConfig::new()
            .with_reconnect_mode(ReconnectMode::Testing)
            .with_connect_timeout(Duration::from_millis(50)),
    );
    let db = Database::open_in_memory();
    let mut session = harness.session(&db);
    let states = record_states(&mut session);
    session.bind().unwrap();

    assert_eq!(states.recv_timeout(TIMEOUT).unwrap(), (ConnectionState::Connecting, None));
    assert_eq!(
        states.recv_timeout(TIMEOUT).unwrap(),
        (ConnectionState::Disconnected, Some(ErrorCode::ConnectTimeout))
    );
    assert_eq!(harness.mock.live_connections(), 0);

    harness.client.cancel_reconnect_delay();
    assert_eq!(states.recv_timeout(TIMEOUT).unwrap(), (ConnectionState::Connecting, None));
    assert_eq!(states.recv_timeout(TIMEOUT).unwrap(), (ConnectionState::Connected, None));
    assert!(session.wait_for_download_complete_or_client_stopped().unwrap());
    assert_eq!(harness.mock.connect_attempts(), 2);
}

#[test]
fn failed_integration_stops_the_session() {
    let harness = Harness::start();
    let db = Database::open_in_memory();
    let mut session = Session::new(
        &harness.client,
        db.clone(),
        SessionConfig::new("localhost", "/app/tasks").with_simulate_integration_error(true),
    );
    let states = record_states(&mut session);
    session.bind().unwrap();
    assert_eq!(states.recv_timeout(TIMEOUT).unwrap().0, ConnectionState::Connecting);
    assert_eq!(states.recv_timeout(TIMEOUT).unwrap().0, ConnectionState::Connected);

    // Wait until the session is enlisted before feeding it a changeset.
    assert!(session.wait_for_download_complete_or_client_stopped().unwrap());

    assert!(harness
        .mock
        .deliver(steady_download(session.ident(), 1, vec![create_comment(9)])));
    assert_eq!(
        states.recv_timeout(TIMEOUT).unwrap(),
        (ConnectionState::Disconnected, Some(ErrorCode::BadChangeset))
    );
}

#[test]
fn sync_metadata_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tasks.db");
    let file_ident = {
        let mut harness = Harness::start();
        let db = Database::open(&path).unwrap();
        let mut session = harness.session(&db);
        session.bind().unwrap();
        assert!(session.wait_for_download_complete_or_client_stopped().unwrap());
        drop(session);
        harness.stop();
        SyncMetadata::load(&db).client_file_ident
    };
    assert_ne!(file_ident.ident, 0);

    let harness = Harness::new(
        MockTransport::new().with_auto_respond(false),
        ClientConfig::new(),
    );
    let db = Database::open(&path).unwrap();
    assert_eq!(SyncMetadata::load(&db).client_file_ident, file_ident);

    let mut session = harness.session(&db);
    let states = record_states(&mut session);
    session.bind().unwrap();
    assert_eq!(states.recv_timeout(TIMEOUT).unwrap().0, ConnectionState::Connecting);
    assert_eq!(states.recv_timeout(TIMEOUT).unwrap().0, ConnectionState::Connected);

    // BIND and IDENT go out together when the ident is already known.
    wait_until(|| harness.mock.sent_messages().len() >= 2);
    let sent = harness.mock.sent_messages();
    match &sent[..2] {
        [ClientMessage::Bind(bind), ClientMessage::Ident(ident)] => {
            assert!(!bind.need_client_file_ident);
            assert_eq!(ident.client_file_ident, file_ident);
        }
        other => panic!("unexpected messages {other:?}"),
    }
}
