//! Transport layer abstraction for sync connections.

use crate::endpoint::ServerEndpoint;
use crate::event_loop::{Command, ConnectionId};
use crate::status::{ErrorCode, Status};
use flexsync_protocol::{
    ClientMessage, DownloadBatchState, DownloadCursor, DownloadMessage, SaltedFileIdent,
    ServerMessage, SessionIdent, SyncProgress, UploadCursor,
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;

/// Opens connections to sync servers.
///
/// `connect` must not block. The outcome is reported later through the
/// [`ConnectionEvents`] handle, which is also how the connection delivers
/// server messages and reports loss.
pub trait SyncTransport: Send + Sync {
    /// Starts connecting to `endpoint`.
    fn connect(&self, endpoint: &ServerEndpoint, events: ConnectionEvents) -> Box<dyn Connection>;
}

/// One connection, used only from the event loop thread.
pub trait Connection: Send {
    /// Queues a message for sending.
    fn send(&mut self, message: ClientMessage);

    /// Closes the connection. No further events are reported.
    fn close(&mut self);
}

/// What a connection reports to the event loop.
#[derive(Debug)]
pub(crate) enum ConnectionEvent {
    Connected,
    Message(ServerMessage),
    Closed(Status),
}

/// Handle through which a connection reports to the event loop.
#[derive(Clone)]
pub struct ConnectionEvents {
    connection_id: ConnectionId,
    tx: UnboundedSender<Command>,
}

impl ConnectionEvents {
    pub(crate) fn new(connection_id: ConnectionId, tx: UnboundedSender<Command>) -> Self {
        Self { connection_id, tx }
    }

    /// Identifies the connection within its client.
    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    /// The connection was established.
    pub fn connected(&self) {
        self.emit(ConnectionEvent::Connected);
    }

    /// A message arrived.
    pub fn message(&self, message: ServerMessage) {
        self.emit(ConnectionEvent::Message(message));
    }

    /// The connection failed or was closed by the peer.
    pub fn closed(&self, reason: Status) {
        self.emit(ConnectionEvent::Closed(reason));
    }

    fn emit(&self, event: ConnectionEvent) {
        // A closed channel means the event loop has exited.
        let _ = self.tx.send(Command::Connection {
            connection: self.connection_id,
            event,
        });
    }
}

impl std::fmt::Debug for ConnectionEvents {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionEvents")
            .field("connection_id", &self.connection_id)
            .finish()
    }
}

/// Scripted result of a connect attempt on [`MockTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// The connection is established.
    Succeed,
    /// The attempt fails with the given reason.
    Fail(String),
    /// The attempt never completes.
    Hang,
}

/// An in-process fake server for testing.
///
/// Connect attempts follow a script (succeeding once the script runs out).
/// Every client message is recorded. With auto-respond enabled (the default)
/// the mock answers like a minimal server: it assigns client file idents,
/// echoes MARK, acknowledges UPLOAD and bootstraps subscription sets with
/// empty DOWNLOADs.
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

#[derive(Default)]
struct MockState {
    script: VecDeque<ConnectOutcome>,
    manual: bool,
    attempts: usize,
    sent: Vec<ClientMessage>,
    live: BTreeMap<ConnectionId, ConnectionEvents>,
    bindings: HashMap<SessionIdent, Binding>,
    last_file_ident: u64,
    server_version: u64,
}

#[derive(Clone, Copy)]
struct Binding {
    connection: ConnectionId,
    is_flx: bool,
}

impl MockTransport {
    /// Creates a mock that connects successfully and auto-responds.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enables or disables automatic responses.
    pub fn with_auto_respond(self, enabled: bool) -> Self {
        self.state.lock().manual = !enabled;
        self
    }

    /// Appends outcomes for upcoming connect attempts.
    pub fn script_connects(&self, outcomes: impl IntoIterator<Item = ConnectOutcome>) {
        self.state.lock().script.extend(outcomes);
    }

    /// Number of connect attempts so far.
    pub fn connect_attempts(&self) -> usize {
        self.state.lock().attempts
    }

    /// Number of open connections.
    pub fn live_connections(&self) -> usize {
        self.state.lock().live.len()
    }

    /// Every message sent so far.
    pub fn sent_messages(&self) -> Vec<ClientMessage> {
        self.state.lock().sent.clone()
    }

    /// Returns and forgets the messages sent so far.
    pub fn take_sent_messages(&self) -> Vec<ClientMessage> {
        std::mem::take(&mut self.state.lock().sent)
    }

    /// Delivers a message to the connection the addressed session is bound
    /// on. Returns false if the session is not bound.
    pub fn deliver(&self, message: ServerMessage) -> bool {
        let state = self.state.lock();
        let events = state
            .bindings
            .get(&message.session_ident())
            .and_then(|b| state.live.get(&b.connection))
            .cloned();
        drop(state);
        match events {
            Some(events) => {
                events.message(message);
                true
            }
            None => false,
        }
    }

    /// Drops every open connection with `reason`.
    pub fn disconnect_all(&self, reason: Status) {
        let live = {
            let mut state = self.state.lock();
            state.bindings.clear();
            std::mem::take(&mut state.live)
        };
        for events in live.into_values() {
            events.closed(reason.clone());
        }
    }
}

impl SyncTransport for MockTransport {
    fn connect(&self, _endpoint: &ServerEndpoint, events: ConnectionEvents) -> Box<dyn Connection> {
        let outcome = {
            let mut state = self.state.lock();
            state.attempts += 1;
            state.script.pop_front().unwrap_or(ConnectOutcome::Succeed)
        };
        match &outcome {
            ConnectOutcome::Succeed => {
                self.state
                    .lock()
                    .live
                    .insert(events.connection_id(), events.clone());
                events.connected();
            }
            ConnectOutcome::Fail(reason) => {
                events.closed(Status::new(ErrorCode::ConnectFailed, reason.clone()));
            }
            ConnectOutcome::Hang => {}
        }
        Box::new(MockConnection {
            state: Arc::clone(&self.state),
            events,
        })
    }
}

struct MockConnection {
    state: Arc<Mutex<MockState>>,
    events: ConnectionEvents,
}

impl Connection for MockConnection {
    fn send(&mut self, message: ClientMessage) {
        let replies = {
            let mut state = self.state.lock();
            state.sent.push(message.clone());
            state.track(self.events.connection_id(), &message);
            if state.manual {
                Vec::new()
            } else {
                state.respond(&message)
            }
        };
        for reply in replies {
            self.events.message(reply);
        }
    }

    fn close(&mut self) {
        let mut state = self.state.lock();
        let id = self.events.connection_id();
        state.live.remove(&id);
        state.bindings.retain(|_, b| b.connection != id);
    }
}

impl MockState {
    /// Keeps track of which connection each session is bound on.
    fn track(&mut self, connection: ConnectionId, message: &ClientMessage) {
        match message {
            ClientMessage::Bind(bind) => {
                self.bindings.insert(
                    bind.session_ident,
                    Binding {
                        connection,
                        is_flx: bind.is_flx,
                    },
                );
            }
            ClientMessage::Unbind { session_ident } => {
                self.bindings.remove(session_ident);
            }
            _ => {}
        }
    }

    fn respond(&mut self, message: &ClientMessage) -> Vec<ServerMessage> {
        match message {
            ClientMessage::Bind(bind) => {
                if !bind.need_client_file_ident {
                    return Vec::new();
                }
                self.last_file_ident += 1;
                vec![ServerMessage::Ident {
                    session_ident: bind.session_ident,
                    client_file_ident: SaltedFileIdent {
                        ident: self.last_file_ident,
                        salt: 0x5A17 + self.last_file_ident as i64,
                    },
                }]
            }
            ClientMessage::Ident(ident) => {
                let is_flx = self
                    .bindings
                    .get(&ident.session_ident)
                    .is_some_and(|b| b.is_flx);
                let batch_state = if is_flx {
                    DownloadBatchState::LastInBatch
                } else {
                    DownloadBatchState::SteadyState
                };
                vec![self.download(
                    ident.session_ident,
                    ident.latest_query_version,
                    batch_state,
                    ident.download.last_integrated_client_version,
                )]
            }
            ClientMessage::Mark {
                session_ident,
                request_ident,
            } => vec![ServerMessage::Mark {
                session_ident: *session_ident,
                request_ident: *request_ident,
            }],
            ClientMessage::Upload(upload) => {
                self.server_version += upload.changesets.len() as u64;
                vec![self.download(
                    upload.session_ident,
                    0,
                    DownloadBatchState::SteadyState,
                    upload.progress_client_version,
                )]
            }
            ClientMessage::Query {
                session_ident,
                query_version,
                ..
            } => vec![self.download(
                *session_ident,
                *query_version,
                DownloadBatchState::LastInBatch,
                0,
            )],
            ClientMessage::Unbind { session_ident } => {
                vec![ServerMessage::Unbound {
                    session_ident: *session_ident,
                }]
            }
            ClientMessage::Refresh { .. } => Vec::new(),
        }
    }

    fn download(
        &self,
        session_ident: SessionIdent,
        query_version: i64,
        batch_state: DownloadBatchState,
        acked_client_version: u64,
    ) -> ServerMessage {
        ServerMessage::Download(DownloadMessage {
            session_ident,
            progress: SyncProgress {
                download: DownloadCursor {
                    server_version: self.server_version,
                    last_integrated_client_version: acked_client_version,
                },
                upload: UploadCursor {
                    client_version: acked_client_version,
                    last_integrated_server_version: self.server_version,
                },
                latest_server_version: self.server_version,
            },
            downloadable_bytes: 0,
            query_version,
            batch_state,
            changesets: Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flexsync_protocol::{BindMessage, ProtocolEnvelope, SessionReason};
    use tokio::sync::mpsc;

    fn endpoint() -> ServerEndpoint {
        ServerEndpoint {
            envelope: ProtocolEnvelope::Realm,
            address: "localhost".into(),
            port: 7800,
        }
    }

    fn events(rx_id: ConnectionId) -> (ConnectionEvents, mpsc::UnboundedReceiver<Command>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ConnectionEvents::new(rx_id, tx), rx)
    }

    fn next_event(rx: &mut mpsc::UnboundedReceiver<Command>) -> ConnectionEvent {
        match rx.try_recv().unwrap() {
            Command::Connection { event, .. } => event,
            _ => panic!("expected a connection event"),
        }
    }

    #[test]
    fn scripted_connects() {
        let mock = MockTransport::new();
        mock.script_connects([ConnectOutcome::Fail("refused".into())]);

        let (ev, mut rx) = events(1);
        let _failed = mock.connect(&endpoint(), ev);
        assert!(matches!(next_event(&mut rx), ConnectionEvent::Closed(s) if s.code() == ErrorCode::ConnectFailed));

        let (ev, mut rx) = events(2);
        let _conn = mock.connect(&endpoint(), ev);
        assert!(matches!(next_event(&mut rx), ConnectionEvent::Connected));
        assert_eq!(mock.connect_attempts(), 2);
        assert_eq!(mock.live_connections(), 1);
    }

    #[test]
    fn answers_bind_and_mark() {
        let mock = MockTransport::new();
        let (ev, mut rx) = events(1);
        let mut conn = mock.connect(&endpoint(), ev);
        assert!(matches!(next_event(&mut rx), ConnectionEvent::Connected));

        conn.send(ClientMessage::Bind(BindMessage {
            session_ident: 7,
            path: "/data".into(),
            signed_user_token: String::new(),
            need_client_file_ident: true,
            is_flx: false,
            session_reason: SessionReason::Sync,
        }));
        match next_event(&mut rx) {
            ConnectionEvent::Message(ServerMessage::Ident {
                session_ident,
                client_file_ident,
            }) => {
                assert_eq!(session_ident, 7);
                assert_eq!(client_file_ident.ident, 1);
            }
            other => panic!("unexpected {other:?}"),
        }

        conn.send(ClientMessage::Mark {
            session_ident: 7,
            request_ident: 3,
        });
        assert!(matches!(
            next_event(&mut rx),
            ConnectionEvent::Message(ServerMessage::Mark { request_ident: 3, .. })
        ));
        assert_eq!(mock.sent_messages().len(), 2);

        assert!(mock.deliver(ServerMessage::Unbound { session_ident: 7 }));
        assert!(!mock.deliver(ServerMessage::Unbound { session_ident: 8 }));
        conn.close();
        assert_eq!(mock.live_connections(), 0);
    }
}
